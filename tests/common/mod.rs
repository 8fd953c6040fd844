#![allow(dead_code)]

use camino::{Utf8Path, Utf8PathBuf};
use mod_syncer_lib::core::archive::ZipArchiveCodec;
use mod_syncer_lib::core::clock::ManualClock;
use mod_syncer_lib::core::filesystem::{Filesystem, LocalFilesystem, WalkEntry};
use mod_syncer_lib::core::transport::{ByteStream, MemoryStream, Transport};
use mod_syncer_lib::models::event::ModManagementEvent;
use mod_syncer_lib::models::ids::{ModId, UserId};
use mod_syncer_lib::models::profile::{ModProfile, ModfileInfo};
use mod_syncer_lib::utils::thread::LocalBoxFuture;
use mod_syncer_lib::{Collaborators, ManagementConfig, ModService, SyncError};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::poll_fn;
use std::io::{Cursor, Write};
use std::rc::Rc;
use std::task::{Poll, Waker};
use std::time::Duration;
use tempfile::TempDir;

pub const USER_A: UserId = UserId(1);
pub const USER_B: UserId = UserId(2);

pub type Reply<T> = Box<dyn FnOnce(Result<T, SyncError>)>;

/// Builds a zip archive in memory.
pub fn zip_bytes(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for (name, content) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Profile,
    Subscriptions,
    Subscribe,
    Unsubscribe,
    Download,
    Upload,
}

/// Holds mock requests until opened.
#[derive(Default)]
pub struct Gate {
    closed: Cell<bool>,
    waiters: RefCell<Vec<Waker>>,
}

impl Gate {
    pub fn close(&self) {
        self.closed.set(true);
    }

    pub fn open(&self) {
        self.closed.set(false);
        for waker in self.waiters.borrow_mut().drain(..) {
            waker.wake();
        }
    }

    async fn pass(&self) {
        poll_fn(|cx| {
            if self.closed.get() {
                self.waiters.borrow_mut().push(cx.waker().clone());
                Poll::Pending
            } else {
                Poll::Ready(())
            }
        })
        .await
    }
}

struct GatedStream {
    inner: MemoryStream,
    gate: Rc<Gate>,
}

impl ByteStream for GatedStream {
    fn content_length(&self) -> Option<u64> {
        self.inner.content_length()
    }

    fn next_chunk(&mut self) -> LocalBoxFuture<'_, Result<Option<Vec<u8>>, SyncError>> {
        let gate = self.gate.clone();
        Box::pin(async move {
            gate.pass().await;
            self.inner.next_chunk().await
        })
    }
}

/// In-memory mod server.
#[derive(Default)]
pub struct MockServer {
    profiles: RefCell<BTreeMap<ModId, ModProfile>>,
    /// Release archives keyed by download URL.
    archives: RefCell<BTreeMap<String, Vec<u8>>>,
    subscriptions: RefCell<BTreeMap<UserId, BTreeSet<ModId>>>,
    failures: RefCell<VecDeque<(Call, SyncError)>>,
    pub gate: Rc<Gate>,
    /// Holds subscription list requests.
    pub sync_gate: Rc<Gate>,
    pub downloads: Cell<usize>,
    pub unsubscribe_calls: Cell<usize>,
    pub uploaded: RefCell<Vec<(ModId, u64)>>,
}

impl MockServer {
    /// Publishes a release of `id` with the given files.
    pub fn publish(&self, id: u64, release: u64, files: &[(&str, &str)]) -> ModProfile {
        self.publish_bytes(id, release, zip_bytes(files))
    }

    pub fn publish_bytes(&self, id: u64, release: u64, bytes: Vec<u8>) -> ModProfile {
        let profile = ModProfile {
            id: ModId(id),
            name: format!("Mod {id}"),
            modfile: ModfileInfo {
                id: release,
                filename: format!("mod_{id}_{release}.zip"),
                file_size: bytes.len() as u64,
                download_url: format!("https://mods.invalid/{id}/{release}"),
                hash: Some(blake3::hash(&bytes).to_hex().to_string()),
            },
        };
        self.archives
            .borrow_mut()
            .insert(profile.modfile.download_url.clone(), bytes);
        self.profiles.borrow_mut().insert(ModId(id), profile.clone());
        profile
    }

    /// Subscribes on the server side only, as another device would.
    pub fn subscribe_remotely(&self, user: UserId, id: u64) {
        self.subscriptions
            .borrow_mut()
            .entry(user)
            .or_default()
            .insert(ModId(id));
    }

    pub fn unsubscribe_remotely(&self, user: UserId, id: u64) {
        if let Some(set) = self.subscriptions.borrow_mut().get_mut(&user) {
            set.remove(&ModId(id));
        }
    }

    pub fn is_subscribed(&self, user: UserId, id: u64) -> bool {
        self.subscriptions
            .borrow()
            .get(&user)
            .is_some_and(|set| set.contains(&ModId(id)))
    }

    /// The next call of the given kind fails with `err`.
    pub fn fail_next(&self, call: Call, err: SyncError) {
        self.failures.borrow_mut().push_back((call, err));
    }

    /// Replaces the advertised hash of the current release.
    pub fn corrupt_hash(&self, id: u64) {
        if let Some(profile) = self.profiles.borrow_mut().get_mut(&ModId(id)) {
            profile.modfile.hash = Some("00".repeat(32));
        }
    }

    fn take_failure(&self, call: Call) -> Result<(), SyncError> {
        let mut failures = self.failures.borrow_mut();
        match failures.iter().position(|(c, _)| *c == call) {
            Some(index) => Err(failures.remove(index).map(|(_, e)| e).unwrap()),
            None => Ok(()),
        }
    }

    fn profile(&self, id: ModId) -> Result<ModProfile, SyncError> {
        self.profiles
            .borrow()
            .get(&id)
            .cloned()
            .ok_or(SyncError::ModNotFound)
    }
}

impl Transport for MockServer {
    fn fetch_mod_profile(&self, id: ModId) -> LocalBoxFuture<'_, Result<ModProfile, SyncError>> {
        let result = self.take_failure(Call::Profile).and_then(|_| self.profile(id));
        Box::pin(async move { result })
    }

    fn fetch_user_subscriptions(
        &self,
        user: UserId,
    ) -> LocalBoxFuture<'_, Result<Vec<ModProfile>, SyncError>> {
        let gate = self.sync_gate.clone();
        Box::pin(async move {
            gate.pass().await;
            self.take_failure(Call::Subscriptions)?;
            let ids = self.subscriptions.borrow().get(&user).cloned().unwrap_or_default();
            Ok(ids.into_iter().filter_map(|id| self.profile(id).ok()).collect())
        })
    }

    fn subscribe(&self, user: UserId, id: ModId) -> LocalBoxFuture<'_, Result<ModProfile, SyncError>> {
        let result = self.take_failure(Call::Subscribe).and_then(|_| {
            let profile = self.profile(id)?;
            let added = self
                .subscriptions
                .borrow_mut()
                .entry(user)
                .or_default()
                .insert(id);
            if added {
                Ok(profile)
            } else {
                Err(SyncError::AlreadySubscribed)
            }
        });
        Box::pin(async move { result })
    }

    fn unsubscribe(&self, user: UserId, id: ModId) -> LocalBoxFuture<'_, Result<(), SyncError>> {
        self.unsubscribe_calls.set(self.unsubscribe_calls.get() + 1);
        let result = self.take_failure(Call::Unsubscribe).map(|_| {
            if let Some(set) = self.subscriptions.borrow_mut().get_mut(&user) {
                set.remove(&id);
            }
        });
        Box::pin(async move { result })
    }

    fn open_download(
        &self,
        modfile: &ModfileInfo,
    ) -> LocalBoxFuture<'_, Result<Box<dyn ByteStream>, SyncError>> {
        self.downloads.set(self.downloads.get() + 1);
        let result = self.take_failure(Call::Download).and_then(|_| {
            let bytes = self
                .archives
                .borrow()
                .get(&modfile.download_url)
                .cloned()
                .ok_or(SyncError::ModfileNotFound)?;
            let stream: Box<dyn ByteStream> = Box::new(GatedStream {
                inner: MemoryStream::new(bytes, 16),
                gate: self.gate.clone(),
            });
            Ok(stream)
        });
        Box::pin(async move { result })
    }

    fn upload_modfile(&self, id: ModId, archive: &Utf8Path) -> LocalBoxFuture<'_, Result<(), SyncError>> {
        let result = self.take_failure(Call::Upload).and_then(|_| {
            let size = std::fs::metadata(archive)?.len();
            self.uploaded.borrow_mut().push((id, size));
            Ok(())
        });
        Box::pin(async move { result })
    }
}

/// Local filesystem with a configurable free space figure, a log of removals and
/// injectable removal failures.
pub struct TestFilesystem {
    inner: LocalFilesystem,
    pub free_space: Cell<Option<u64>>,
    pub removals: RefCell<Vec<Utf8PathBuf>>,
    pub appends: Cell<usize>,
    removal_failure: RefCell<Option<(Utf8PathBuf, SyncError)>>,
}

impl Default for TestFilesystem {
    fn default() -> Self {
        Self {
            inner: LocalFilesystem::shared().unwrap(),
            free_space: Cell::new(None),
            removals: RefCell::new(Vec::new()),
            appends: Cell::new(0),
            removal_failure: RefCell::new(None),
        }
    }
}

impl TestFilesystem {
    pub fn fail_removals_under(&self, path: &Utf8Path, err: SyncError) {
        *self.removal_failure.borrow_mut() = Some((path.to_owned(), err));
    }

    pub fn clear_failures(&self) {
        *self.removal_failure.borrow_mut() = None;
    }

    fn check_removal(&self, path: &Utf8Path) -> Result<(), SyncError> {
        match &*self.removal_failure.borrow() {
            Some((prefix, err)) if path.starts_with(prefix) => Err(err.clone()),
            _ => Ok(()),
        }
    }

    pub fn removals_under(&self, root: &Utf8Path) -> Vec<Utf8PathBuf> {
        self.removals
            .borrow()
            .iter()
            .filter(|p| p.starts_with(root))
            .cloned()
            .collect()
    }
}

impl Filesystem for TestFilesystem {
    fn exists(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<bool, SyncError>> {
        self.inner.exists(path)
    }

    fn is_empty(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<bool, SyncError>> {
        self.inner.is_empty(path)
    }

    fn file_size(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<Option<u64>, SyncError>> {
        self.inner.file_size(path)
    }

    fn free_space(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<u64, SyncError>> {
        match self.free_space.get() {
            Some(space) => Box::pin(async move { Ok(space) }),
            None => self.inner.free_space(path),
        }
    }

    fn create_dir_all(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<(), SyncError>> {
        self.inner.create_dir_all(path)
    }

    fn remove_file(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<(), SyncError>> {
        if let Err(e) = self.check_removal(path) {
            return Box::pin(async move { Err(e) });
        }
        self.removals.borrow_mut().push(path.to_owned());
        self.inner.remove_file(path)
    }

    fn remove_dir(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<(), SyncError>> {
        if let Err(e) = self.check_removal(path) {
            return Box::pin(async move { Err(e) });
        }
        self.removals.borrow_mut().push(path.to_owned());
        self.inner.remove_dir(path)
    }

    fn walk(&self, root: &Utf8Path) -> LocalBoxFuture<'_, Result<Vec<WalkEntry>, SyncError>> {
        self.inner.walk(root)
    }

    fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> LocalBoxFuture<'_, Result<(), SyncError>> {
        self.inner.rename(from, to)
    }

    fn append(&self, path: &Utf8Path, bytes: Vec<u8>) -> LocalBoxFuture<'_, Result<(), SyncError>> {
        self.appends.set(self.appends.get() + 1);
        self.inner.append(path, bytes)
    }

    fn read(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<Vec<u8>, SyncError>> {
        self.inner.read(path)
    }

    fn write_atomic(&self, path: &Utf8Path, bytes: Vec<u8>) -> LocalBoxFuture<'_, Result<(), SyncError>> {
        self.inner.write_atomic(path, bytes)
    }

    fn hash_file(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<String, SyncError>> {
        self.inner.hash_file(path)
    }

    fn dir_size(&self, path: &Utf8Path) -> LocalBoxFuture<'_, Result<u64, SyncError>> {
        self.inner.dir_size(path)
    }
}

/// A service wired to the mocks, initialized, with `USER_A` registered and management
/// enabled.
pub struct Harness {
    pub dir: Rc<TempDir>,
    pub root: Utf8PathBuf,
    pub server: Rc<MockServer>,
    pub fs: Rc<TestFilesystem>,
    pub clock: Rc<ManualClock>,
    pub service: Rc<ModService>,
    pub events: Rc<RefCell<Vec<ModManagementEvent>>>,
}

impl Harness {
    pub fn new() -> Self {
        let harness = Self::uninitialized();
        harness.start();
        harness
    }

    pub fn uninitialized() -> Self {
        mod_syncer_lib::utils::logging::init_logging(None);
        let dir = Rc::new(tempfile::tempdir().unwrap());
        let root = Utf8PathBuf::from_path_buf(dir.path().join("root")).unwrap();
        Self::build(dir, root, Rc::new(MockServer::default()))
    }

    fn build(dir: Rc<TempDir>, root: Utf8PathBuf, server: Rc<MockServer>) -> Self {
        let fs = Rc::new(TestFilesystem::default());
        let clock = Rc::new(ManualClock::new());
        let deps = Collaborators {
            transport: server.clone(),
            filesystem: fs.clone(),
            archive: Rc::new(ZipArchiveCodec::shared().unwrap()),
            clock: clock.clone(),
        };
        let service = Rc::new(ModService::new(ManagementConfig::with_root(root.clone()), deps));
        Self {
            dir,
            root,
            server,
            fs,
            clock,
            service,
            events: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Initializes, registers `USER_A` and enables management.
    pub fn start(&self) {
        self.wait(|s, done| s.initialize_async(done)).unwrap();
        self.service.add_local_user(USER_A).unwrap();
        self.enable();
    }

    pub fn enable(&self) {
        let events = self.events.clone();
        self.service
            .enable_mod_management(move |event| events.borrow_mut().push(event))
            .unwrap();
    }

    /// Shuts the service down and brings up a new one over the same root and server.
    pub fn restart(self) -> Self {
        self.wait(|s, done| s.shutdown_async(done)).unwrap();
        let next = Self::build(self.dir.clone(), self.root.clone(), self.server.clone());
        next.start();
        next
    }

    pub fn pump(&self) {
        self.service.run_pending_handlers().unwrap();
    }

    /// Pumps until `done` holds. Worker threads need real time to finish, so this sleeps
    /// briefly between pumps.
    pub fn pump_until(&self, done: impl Fn() -> bool) -> bool {
        for _ in 0..2500 {
            self.pump();
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    /// Starts an asynchronous call and pumps until its callback fires.
    pub fn wait<T: 'static>(&self, start: impl FnOnce(&ModService, Reply<T>)) -> Result<T, SyncError> {
        let slot: Rc<RefCell<Option<Result<T, SyncError>>>> = Rc::new(RefCell::new(None));
        let sink = slot.clone();
        start(&self.service, Box::new(move |result| *sink.borrow_mut() = Some(result)));
        assert!(
            self.pump_until(|| slot.borrow().is_some()),
            "callback never fired"
        );
        let result = slot.borrow_mut().take().unwrap();
        result
    }

    /// Pumps until the management loop has emitted `count` events in total.
    pub fn wait_for_events(&self, count: usize) -> Vec<ModManagementEvent> {
        assert!(
            self.pump_until(|| self.events.borrow().len() >= count),
            "expected {count} events, got {:?}",
            self.events.borrow()
        );
        self.events.borrow().clone()
    }

    /// Pumps until nothing is in flight and no new event shows up for a while.
    pub fn settle(&self) {
        let mut quiet = 0;
        let mut seen = self.events.borrow().len();
        for _ in 0..2500 {
            self.pump();
            let now = self.events.borrow().len();
            if now == seen && !self.service.is_mod_management_busy() {
                quiet += 1;
                if quiet >= 25 {
                    return;
                }
            } else {
                quiet = 0;
                seen = now;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("service never settled");
    }

    pub fn subscribe(&self, user: UserId, id: u64) -> Result<(), SyncError> {
        self.wait(|s, done| s.subscribe_to_mod_async(user, ModId(id), done))
    }

    pub fn unsubscribe(&self, user: UserId, id: u64) -> Result<(), SyncError> {
        self.wait(|s, done| s.unsubscribe_from_mod_async(user, ModId(id), done))
    }

    pub fn fetch_updates(&self, user: UserId) -> Result<(), SyncError> {
        self.wait(|s, done| s.fetch_external_updates_async(user, done))
    }

    pub fn mod_dir(&self, id: u64) -> Utf8PathBuf {
        self.root.join("mods").join(id.to_string())
    }

    pub fn temp_dir(&self, id: u64) -> Utf8PathBuf {
        self.root.join("temp").join(id.to_string())
    }
}

use crate::models::error::SyncError;
use crate::models::ids::{ModId, UserId};
use crate::models::profile::{ModProfile, ModfileInfo};
use crate::utils::thread::LocalBoxFuture;
use camino::Utf8Path;

/// Server access used by the engine. Implementations own their connection state and
/// resolve every call on the scheduler thread once the platform request completes.
pub trait Transport {
    fn fetch_mod_profile(&self, id: ModId) -> LocalBoxFuture<'_, Result<ModProfile, SyncError>>;

    fn fetch_user_subscriptions(
        &self,
        user: UserId,
    ) -> LocalBoxFuture<'_, Result<Vec<ModProfile>, SyncError>>;

    /// Returns the subscribed mod's profile. A server reply meaning "already subscribed"
    /// is reported as `AlreadySubscribed`.
    fn subscribe(&self, user: UserId, id: ModId)
        -> LocalBoxFuture<'_, Result<ModProfile, SyncError>>;

    fn unsubscribe(&self, user: UserId, id: ModId) -> LocalBoxFuture<'_, Result<(), SyncError>>;

    fn open_download(
        &self,
        modfile: &ModfileInfo,
    ) -> LocalBoxFuture<'_, Result<Box<dyn ByteStream>, SyncError>>;

    fn upload_modfile(&self, id: ModId, archive: &Utf8Path)
        -> LocalBoxFuture<'_, Result<(), SyncError>>;
}

/// Body of a download. Each chunk is one suspension point.
pub trait ByteStream {
    fn content_length(&self) -> Option<u64>;

    /// `None` marks the end of the stream.
    fn next_chunk(&mut self) -> LocalBoxFuture<'_, Result<Option<Vec<u8>>, SyncError>>;
}

/// A stream over bytes that are already in memory, handed out in fixed size chunks.
pub struct MemoryStream {
    data: Vec<u8>,
    offset: usize,
    chunk_size: usize,
}

impl MemoryStream {
    pub fn new(data: Vec<u8>, chunk_size: usize) -> Self {
        Self {
            data,
            offset: 0,
            chunk_size: chunk_size.max(1),
        }
    }
}

impl ByteStream for MemoryStream {
    fn content_length(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn next_chunk(&mut self) -> LocalBoxFuture<'_, Result<Option<Vec<u8>>, SyncError>> {
        let end = (self.offset + self.chunk_size).min(self.data.len());
        let chunk = (self.offset < end).then(|| self.data[self.offset..end].to_vec());
        self.offset = end;
        Box::pin(async move { Ok(chunk) })
    }
}

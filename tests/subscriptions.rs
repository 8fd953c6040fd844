mod common;

use common::{Call, Harness, USER_A, USER_B};
use mod_syncer_lib::models::collection::ModState;
use mod_syncer_lib::models::event::EventType;
use mod_syncer_lib::models::ids::ModId;
use mod_syncer_lib::models::subscription::ChangeType;
use mod_syncer_lib::SyncError;

#[test]
fn subscribe_installs_and_unsubscribe_removes() {
    let h = Harness::new();
    h.server
        .publish(10, 100, &[("readme.txt", "hello"), ("data/a.bin", "xyz")]);

    h.subscribe(USER_A, 10).unwrap();
    let events = h.wait_for_events(1);
    assert_eq!(events[0].event, EventType::Installed);
    assert_eq!(events[0].mod_id, ModId(10));
    assert_eq!(events[0].status, None);

    let dir = h.mod_dir(10);
    assert_eq!(std::fs::read_to_string(dir.join("readme.txt")).unwrap(), "hello");
    assert_eq!(std::fs::read_to_string(dir.join("data/a.bin")).unwrap(), "xyz");

    let installed = h.service.query_user_installations(USER_A, false);
    let entry = &installed[&ModId(10)];
    assert_eq!(entry.state, ModState::Installed);
    assert_eq!(entry.installed_release, Some(100));
    assert_eq!(entry.size_on_disk, Some(8));
    assert!(h.service.query_system_installations().contains_key(&ModId(10)));

    // The downloaded archive is not kept once the install is committed.
    assert!(!h.root.join("downloads/10_100.zip").exists());

    h.unsubscribe(USER_A, 10).unwrap();
    let events = h.wait_for_events(2);
    assert_eq!(events[1].event, EventType::Uninstalled);
    assert_eq!(events[1].status, None);
    assert!(!dir.exists());
    assert!(h.service.query_system_installations().is_empty());
    assert!(h.service.query_user_subscriptions(USER_A).is_empty());
}

#[test]
fn shared_mod_stays_until_last_subscriber_leaves() {
    let h = Harness::new();
    h.service.add_local_user(USER_B).unwrap();
    h.server.publish(20, 1, &[("mod.txt", "shared")]);

    h.subscribe(USER_A, 20).unwrap();
    h.wait_for_events(1);
    h.subscribe(USER_B, 20).unwrap();
    h.settle();

    let entry = &h.service.query_user_subscriptions(USER_B)[&ModId(20)];
    assert_eq!(entry.subscribers.len(), 2);
    assert_eq!(h.server.downloads.get(), 1);

    h.unsubscribe(USER_A, 20).unwrap();
    h.settle();
    assert_eq!(h.events.borrow().len(), 1);
    assert!(h.mod_dir(20).exists());
    assert_eq!(
        h.service.query_user_installations(USER_B, false)[&ModId(20)].state,
        ModState::Installed
    );

    h.unsubscribe(USER_B, 20).unwrap();
    let events = h.wait_for_events(2);
    assert_eq!(events[1].event, EventType::Uninstalled);
    assert_eq!(events[1].mod_id, ModId(20));
    assert!(!h.mod_dir(20).exists());
}

#[test]
fn subscription_already_known_to_server_still_installs() {
    let h = Harness::new();
    h.server.publish(12, 1, &[("a.txt", "a")]);
    h.server.subscribe_remotely(USER_A, 12);

    h.subscribe(USER_A, 12).unwrap();
    let events = h.wait_for_events(1);
    assert_eq!(events[0].event, EventType::Installed);
    assert!(h.service.query_user_subscriptions(USER_A).contains_key(&ModId(12)));
}

#[test]
fn unknown_user_is_rejected() {
    let h = Harness::new();
    h.server.publish(13, 1, &[("a.txt", "a")]);
    assert_eq!(h.subscribe(USER_B, 13), Err(SyncError::UnknownUser));
    assert_eq!(h.fetch_updates(USER_B), Err(SyncError::UnknownUser));
}

#[test]
fn external_changes_are_added_updated_and_removed() {
    let h = Harness::new();
    h.server.publish(30, 1, &[("version.txt", "one")]);
    h.server.subscribe_remotely(USER_A, 30);

    h.fetch_updates(USER_A).unwrap();
    let events = h.wait_for_events(1);
    assert_eq!(events[0].event, EventType::Installed);
    assert_eq!(
        std::fs::read_to_string(h.mod_dir(30).join("version.txt")).unwrap(),
        "one"
    );

    h.server.publish(30, 2, &[("version.txt", "two")]);
    h.fetch_updates(USER_A).unwrap();
    let events = h.wait_for_events(2);
    assert_eq!(events[1].event, EventType::Updated);
    assert_eq!(events[1].status, None);
    assert_eq!(
        std::fs::read_to_string(h.mod_dir(30).join("version.txt")).unwrap(),
        "two"
    );
    assert_eq!(
        h.service.query_system_installations()[&ModId(30)].installed_release,
        Some(2)
    );

    h.server.unsubscribe_remotely(USER_A, 30);
    h.fetch_updates(USER_A).unwrap();
    let events = h.wait_for_events(3);
    assert_eq!(events[2].event, EventType::Uninstalled);
    assert!(!h.mod_dir(30).exists());
}

#[test]
fn preview_reports_changes_without_applying_them() {
    let h = Harness::new();
    h.server.publish(40, 1, &[("a.txt", "a")]);
    h.server.subscribe_remotely(USER_A, 40);

    let changes = h
        .wait(|s, done| s.preview_external_updates_async(USER_A, done))
        .unwrap();
    assert_eq!(changes.get(&ModId(40)), Some(&ChangeType::Added));

    h.settle();
    assert!(h.service.query_user_subscriptions(USER_A).is_empty());
    assert_eq!(h.server.downloads.get(), 0);
}

#[test]
fn concurrent_sync_is_refused() {
    let h = Harness::new();
    h.server.publish(41, 1, &[("a.txt", "a")]);
    h.server.subscribe_remotely(USER_A, 41);
    h.server.sync_gate.close();

    let first = std::rc::Rc::new(std::cell::RefCell::new(None));
    let sink = first.clone();
    h.service
        .fetch_external_updates_async(USER_A, move |r| *sink.borrow_mut() = Some(r));

    let second = h.wait(|s, done| s.fetch_external_updates_async(USER_A, done));
    assert_eq!(second, Err(SyncError::RequestInProgress));
    assert!(first.borrow().is_none());

    h.server.sync_gate.open();
    assert!(h.pump_until(|| first.borrow().is_some()));
    assert_eq!(first.borrow_mut().take().unwrap(), Ok(()));
    h.wait_for_events(1);
}

#[test]
fn failed_unsubscribe_is_replayed_on_next_sync() {
    let h = Harness::new();
    h.server.publish(50, 1, &[("a.txt", "a")]);
    h.subscribe(USER_A, 50).unwrap();
    h.wait_for_events(1);

    h.server.fail_next(Call::Unsubscribe, SyncError::ConnectionFailed);
    h.unsubscribe(USER_A, 50).unwrap();
    h.wait_for_events(2);
    assert!(h.server.is_subscribed(USER_A, 50));

    h.fetch_updates(USER_A).unwrap();
    h.settle();
    assert!(!h.server.is_subscribed(USER_A, 50));
    assert_eq!(h.events.borrow().len(), 2);
    assert!(h.service.query_user_subscriptions(USER_A).is_empty());
}

#[test]
fn mod_with_pending_unsubscribe_is_not_added_back() {
    let h = Harness::new();
    h.server.publish(51, 1, &[("a.txt", "a")]);
    h.subscribe(USER_A, 51).unwrap();
    h.wait_for_events(1);

    h.server.fail_next(Call::Unsubscribe, SyncError::ConnectionFailed);
    h.server.fail_next(Call::Unsubscribe, SyncError::Timeout);
    h.unsubscribe(USER_A, 51).unwrap();
    h.wait_for_events(2);

    h.fetch_updates(USER_A).unwrap();
    h.settle();
    assert!(h.server.is_subscribed(USER_A, 51));
    assert_eq!(h.events.borrow().len(), 2);
    assert!(!h.mod_dir(51).exists());
    assert!(h.service.query_user_subscriptions(USER_A).is_empty());
}

#[test]
fn failed_resubscribe_keeps_the_pending_unsubscribe() {
    let h = Harness::new();
    h.server.publish(52, 1, &[("a.txt", "a")]);
    h.subscribe(USER_A, 52).unwrap();
    h.wait_for_events(1);

    h.server.fail_next(Call::Unsubscribe, SyncError::ConnectionFailed);
    h.unsubscribe(USER_A, 52).unwrap();
    h.wait_for_events(2);

    h.server.fail_next(Call::Subscribe, SyncError::ConnectionFailed);
    assert_eq!(h.subscribe(USER_A, 52), Err(SyncError::ConnectionFailed));

    h.fetch_updates(USER_A).unwrap();
    h.settle();
    assert!(!h.server.is_subscribed(USER_A, 52));
    assert!(h.service.query_user_subscriptions(USER_A).is_empty());
    assert!(!h.mod_dir(52).exists());
    assert_eq!(h.events.borrow().len(), 2);
}

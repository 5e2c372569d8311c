//! Integration tests for the lease engine.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use labelq::config::Config;
use labelq::model::*;
use labelq::{Engine, Error};
use tempfile::TempDir;

fn test_engine(files: &[&str]) -> (TempDir, Engine) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let images = dir.path().join("images");
    std::fs::create_dir(&images).unwrap();
    for name in files {
        std::fs::write(images.join(name), b"img").unwrap();
    }
    let config = Config::default()
        .with_database_path(dir.path().join("labels.db"))
        .with_image_directory(images)
        .with_lease_timeout(Duration::from_secs(300));
    let engine = Engine::open(config).expect("failed to open engine");
    (dir, engine)
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 9, 30, 0).unwrap()
}

fn cat_labels() -> Labels {
    Labels::new().with("subject", ["cat"]).with("quality", ["sharp"])
}

// ---------------------------------------------------------------------------
// Reservation order
// ---------------------------------------------------------------------------

#[test]
fn sequential_reservations_follow_registration_order() {
    let (_dir, engine) = test_engine(&["a.jpg", "b.jpg", "c.jpg"]);

    let first = engine.reserve_next_at(t0()).unwrap().expect("item 1");
    let second = engine.reserve_next_at(t0()).unwrap().expect("item 2");
    let third = engine.reserve_next_at(t0()).unwrap().expect("item 3");

    assert_eq!(
        [first.id, second.id, third.id],
        [ItemId(1), ItemId(2), ItemId(3)]
    );
    assert_eq!(first.source_ref, "a.jpg");
    assert_ne!(first.token, second.token);
    assert_ne!(second.token, third.token);
    assert_ne!(first.token, third.token);
    assert!(!first.reclaimed);

    assert!(engine.reserve_next_at(t0()).unwrap().is_none());
}

#[test]
fn reserve_on_empty_directory_returns_none() {
    let (_dir, engine) = test_engine(&[]);
    assert!(engine.reserve_next().unwrap().is_none());
}

#[test]
fn reservation_marks_item_in_progress_with_lease() {
    let (_dir, engine) = test_engine(&["a.jpg"]);
    let r = engine.reserve_next_at(t0()).unwrap().unwrap();

    let item = engine.get(r.id).unwrap();
    assert_eq!(item.state, ItemState::InProgress);
    let lease = item.lease.expect("lease present while in progress");
    assert_eq!(lease.token, r.token);
    assert_eq!(lease.granted_at, t0());
    assert_eq!(item.updated_at, Some(t0()));
    assert!(item.payload.is_none());
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

#[test]
fn wrong_token_is_a_mismatch_and_keeps_the_lease() {
    let (_dir, engine) = test_engine(&["a.jpg"]);
    let r = engine.reserve_next_at(t0()).unwrap().unwrap();

    let err = engine
        .finalize(r.id, &LeaseToken::from("wrong-token"), cat_labels())
        .unwrap_err();
    assert!(matches!(err, Error::ReservationMismatch(ItemId(1))));
    assert!(err.is_conflict());

    let item = engine.get(r.id).unwrap();
    assert_eq!(item.state, ItemState::InProgress);
    assert_eq!(item.lease.unwrap().token, r.token);

    engine.finalize(r.id, &r.token, cat_labels()).unwrap();
}

#[test]
fn finalize_succeeds_once_then_reports_mismatch() {
    let (_dir, engine) = test_engine(&["a.jpg"]);
    let r = engine.reserve_next_at(t0()).unwrap().unwrap();
    let done_at = t0() + TimeDelta::seconds(20);

    engine.finalize_at(r.id, &r.token, cat_labels(), done_at).unwrap();

    let item = engine.get(r.id).unwrap();
    assert_eq!(item.state, ItemState::Done);
    assert!(item.lease.is_none());
    assert!(!item.skipped);
    assert_eq!(item.payload, Some(Payload::Labels(cat_labels())));
    assert_eq!(item.updated_at, Some(done_at));

    let retry = engine.finalize(r.id, &r.token, cat_labels()).unwrap_err();
    assert!(matches!(retry, Error::ReservationMismatch(_)));

    // The first outcome is untouched by the failed retry.
    assert_eq!(engine.get(r.id).unwrap().payload, Some(Payload::Labels(cat_labels())));
}

#[test]
fn skip_records_empty_payload_and_flag() {
    let (_dir, engine) = test_engine(&["a.jpg"]);
    let r = engine.reserve_next_at(t0()).unwrap().unwrap();

    engine.skip(r.id, &r.token).unwrap();

    let item = engine.get(r.id).unwrap();
    assert_eq!(item.state, ItemState::Done);
    assert!(item.skipped);
    assert_eq!(item.payload, Some(Payload::Labels(Labels::new())));
    assert!(matches!(
        engine.skip(r.id, &r.token),
        Err(Error::ReservationMismatch(_))
    ));
}

#[test]
fn finalize_unknown_item_is_not_found() {
    let (_dir, engine) = test_engine(&["a.jpg"]);
    let err = engine
        .finalize(ItemId(99), &LeaseToken::from("anything"), cat_labels())
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(ItemId(99))));
    assert!(!err.is_conflict());
}

#[test]
fn finalize_on_never_leased_item_is_a_mismatch() {
    let (_dir, engine) = test_engine(&["a.jpg"]);
    engine.sync_catalog().unwrap();
    assert!(matches!(
        engine.skip(ItemId(1), &LeaseToken::from("guess")),
        Err(Error::ReservationMismatch(_))
    ));
    assert_eq!(engine.get(ItemId(1)).unwrap().state, ItemState::Pending);
}

#[test]
fn done_items_are_never_handed_out_again() {
    let (_dir, engine) = test_engine(&["a.jpg"]);
    let r = engine.reserve_next_at(t0()).unwrap().unwrap();
    engine.finalize_at(r.id, &r.token, cat_labels(), t0()).unwrap();

    let much_later = t0() + TimeDelta::days(30);
    assert!(engine.reserve_next_at(much_later).unwrap().is_none());
    assert_eq!(engine.release_all_leases().unwrap(), 0);
    assert_eq!(engine.get(r.id).unwrap().state, ItemState::Done);
}

// ---------------------------------------------------------------------------
// Reclaim
// ---------------------------------------------------------------------------

#[test]
fn expired_lease_is_reclaimed_with_a_new_token() {
    let (_dir, engine) = test_engine(&["a.jpg"]);
    let original = engine.reserve_next_at(t0()).unwrap().unwrap();

    let later = t0() + TimeDelta::seconds(301);
    let again = engine.reserve_next_at(later).unwrap().expect("expired lease reclaimed");

    assert_eq!(again.id, original.id);
    assert_ne!(again.token, original.token);
    assert!(again.reclaimed);

    let item = engine.get(again.id).unwrap();
    assert_eq!(item.lease.unwrap().granted_at, later);

    // The abandoned worker's token no longer works; the new one does.
    assert!(matches!(
        engine.finalize(original.id, &original.token, cat_labels()),
        Err(Error::ReservationMismatch(_))
    ));
    engine.finalize(again.id, &again.token, cat_labels()).unwrap();
}

#[test]
fn lease_is_exclusive_until_the_timeout_elapses() {
    let (_dir, engine) = test_engine(&["a.jpg"]);
    engine.reserve_next_at(t0()).unwrap().unwrap();

    assert!(engine.reserve_next_at(t0() + TimeDelta::seconds(299)).unwrap().is_none());
    assert!(
        engine
            .reserve_next_at(t0() + TimeDelta::milliseconds(299_999))
            .unwrap()
            .is_none()
    );
    assert!(engine.reserve_next_at(t0() + TimeDelta::seconds(300)).unwrap().is_some());
}

#[test]
fn pending_items_come_before_expired_leases() {
    let (dir, engine) = test_engine(&["a.jpg"]);
    let first = engine.reserve_next_at(t0()).unwrap().unwrap();
    assert_eq!(first.id, ItemId(1));

    std::fs::write(dir.path().join("images/b.jpg"), b"img").unwrap();

    let later = t0() + TimeDelta::seconds(600);
    let next = engine.reserve_next_at(later).unwrap().unwrap();
    assert_eq!(next.id, ItemId(2));
    assert!(!next.reclaimed);

    let reclaimed = engine.reserve_next_at(later).unwrap().unwrap();
    assert_eq!(reclaimed.id, ItemId(1));
    assert!(reclaimed.reclaimed);
}

#[test]
fn expired_leases_reclaim_in_id_order() {
    let (_dir, engine) = test_engine(&["a.jpg", "b.jpg"]);
    engine.reserve_next_at(t0()).unwrap().unwrap();
    engine.reserve_next_at(t0() + TimeDelta::seconds(10)).unwrap().unwrap();

    let later = t0() + TimeDelta::seconds(1000);
    assert_eq!(engine.reserve_next_at(later).unwrap().unwrap().id, ItemId(1));
    assert_eq!(engine.reserve_next_at(later).unwrap().unwrap().id, ItemId(2));
    assert!(engine.reserve_next_at(later).unwrap().is_none());
}

#[test]
fn stale_token_still_finalizes_until_someone_reclaims() {
    // Reclaim is demand-driven: an expired lease stays valid until another
    // reservation takes the item over.
    let (_dir, engine) = test_engine(&["a.jpg"]);
    let r = engine.reserve_next_at(t0()).unwrap().unwrap();

    engine
        .finalize_at(r.id, &r.token, cat_labels(), t0() + TimeDelta::hours(2))
        .unwrap();
    assert_eq!(engine.get(r.id).unwrap().state, ItemState::Done);
}

#[test]
fn oversized_timeout_never_expires_a_lease() {
    let dir = tempfile::tempdir().unwrap();
    let images = dir.path().join("images");
    std::fs::create_dir(&images).unwrap();
    std::fs::write(images.join("a.jpg"), b"img").unwrap();
    let config = Config::default()
        .with_database_path(dir.path().join("labels.db"))
        .with_image_directory(images)
        .with_lease_timeout(Duration::from_secs(10_000_000_000_000));
    let engine = Engine::open(config).unwrap();

    let first = engine.reserve_next_at(t0()).unwrap().unwrap();
    assert!(engine.reserve_next_at(t0() + TimeDelta::days(3650)).unwrap().is_none());
    engine.finalize(first.id, &first.token, cat_labels()).unwrap();
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[test]
fn open_rejects_zero_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::default()
        .with_database_path(dir.path().join("labels.db"))
        .with_lease_timeout(Duration::ZERO);
    let err = Engine::open(config).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert!(!dir.path().join("labels.db").exists());
}

#[test]
fn open_rejects_empty_extension_list() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::default()
        .with_database_path(dir.path().join("labels.db"))
        .with_extensions(Vec::<String>::new());
    assert!(matches!(Engine::open(config), Err(Error::Config(_))));
}

// ---------------------------------------------------------------------------
// Source failures and reporting
// ---------------------------------------------------------------------------

#[test]
fn reservation_proceeds_when_image_directory_disappears() {
    let (dir, engine) = test_engine(&["a.jpg"]);
    engine.sync_catalog().unwrap();
    std::fs::remove_dir_all(dir.path().join("images")).unwrap();

    assert!(matches!(
        engine.sync_catalog(),
        Err(Error::SourceUnavailable { .. })
    ));
    let r = engine.reserve_next_at(t0()).unwrap().expect("known row still served");
    assert_eq!(r.source_ref, "a.jpg");
}

#[test]
fn list_items_filters_by_state_and_limit() {
    let (_dir, engine) = test_engine(&["a.jpg", "b.jpg", "c.jpg", "d.jpg"]);
    let r1 = engine.reserve_next_at(t0()).unwrap().unwrap();
    let r2 = engine.reserve_next_at(t0()).unwrap().unwrap();
    engine.skip(r1.id, &r1.token).unwrap();

    let all = engine.list_items(ItemFilter::all()).unwrap();
    let ids: Vec<i64> = all.iter().map(|i| i.id.0).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);

    let pending = engine.list_items(ItemFilter::all().state(ItemState::Pending)).unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|i| i.state == ItemState::Pending && i.lease.is_none()));

    let in_progress = engine
        .list_items(ItemFilter::all().state(ItemState::InProgress))
        .unwrap();
    assert_eq!(in_progress.len(), 1);
    assert_eq!(in_progress[0].id, r2.id);

    let first_two = engine.list_items(ItemFilter::all().limit(2)).unwrap();
    assert_eq!(first_two.len(), 2);
    let unlimited = engine.list_items(ItemFilter::all().limit(0)).unwrap();
    assert_eq!(unlimited.len(), 4);

    let counts = engine.counts().unwrap();
    assert_eq!(
        counts,
        StateCounts {
            pending: 2,
            in_progress: 1,
            done: 1,
            skipped: 1,
        }
    );
    assert_eq!(counts.total(), 4);
}

#[test]
fn get_unknown_item_is_not_found() {
    let (_dir, engine) = test_engine(&[]);
    assert!(matches!(engine.get(ItemId(7)), Err(Error::NotFound(ItemId(7)))));
}

use chrono::NaiveDate;

use super::*;
use crate::limits::*;

fn d(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("staybook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn stay_request(property_id: Ulid, check_in: &str, check_out: &str) -> NewReservation {
    NewReservation {
        id: Ulid::new(),
        property_id,
        check_in: d(check_in),
        check_out: d(check_out),
        guest_count: 2,
        email: "guest@example.com".into(),
        total_price: 45_000,
        special_requests: None,
    }
}

async fn engine_with_property(wal: &str) -> (Engine, Ulid) {
    let engine = Engine::new(test_wal_path(wal)).unwrap();
    let pid = Ulid::new();
    engine
        .create_property(pid, Some("Harbour Loft".into()), Some(4))
        .await
        .unwrap();
    (engine, pid)
}

/// Request then confirm in one go.
async fn book(engine: &Engine, pid: Ulid, check_in: &str, check_out: &str) -> Ulid {
    let req = stay_request(pid, check_in, check_out);
    let id = req.id;
    engine.request_reservation(req).await.unwrap();
    engine.confirm_reservation(id).await.unwrap();
    id
}

// ── Properties ───────────────────────────────────────────

#[tokio::test]
async fn engine_create_and_list_property() {
    let (engine, pid) = engine_with_property("create_property.wal").await;

    let props = engine.list_properties().await;
    assert_eq!(props.len(), 1);
    assert_eq!(props[0].id, pid);
    assert_eq!(props[0].name.as_deref(), Some("Harbour Loft"));
    assert_eq!(props[0].max_guests, Some(4));
    assert_eq!(props[0].active_reservations, 0);
}

#[tokio::test]
async fn engine_duplicate_property_rejected() {
    let (engine, pid) = engine_with_property("dup_property.wal").await;
    let result = engine.create_property(pid, None, None).await;
    assert!(matches!(result, Err(EngineError::AlreadyExists(id)) if id == pid));
}

#[tokio::test]
async fn engine_update_property() {
    let (engine, pid) = engine_with_property("update_property.wal").await;
    engine
        .update_property(
            pid,
            PropertyPatch { name: Some(Some("Harbour Loft II".into())), max_guests: Some(Some(6)) },
        )
        .await
        .unwrap();
    {
        let ps = engine.get_property(&pid).unwrap();
        let guard = ps.read().await;
        assert_eq!(guard.name.as_deref(), Some("Harbour Loft II"));
        assert_eq!(guard.max_guests, Some(6));
    }

    // Untouched fields keep their value; `Some(None)` clears.
    engine
        .update_property(pid, PropertyPatch { name: None, max_guests: Some(None) })
        .await
        .unwrap();
    let ps = engine.get_property(&pid).unwrap();
    let guard = ps.read().await;
    assert_eq!(guard.name.as_deref(), Some("Harbour Loft II"));
    assert_eq!(guard.max_guests, None);
}

#[tokio::test]
async fn engine_update_unknown_property() {
    let engine = Engine::new(test_wal_path("update_unknown.wal")).unwrap();
    let id = Ulid::new();
    assert!(matches!(
        engine.update_property(id, PropertyPatch::default()).await,
        Err(EngineError::NotFound(got)) if got == id
    ));
}

#[tokio::test]
async fn engine_property_name_too_long() {
    let engine = Engine::new(test_wal_path("long_name.wal")).unwrap();
    let name = "x".repeat(MAX_NAME_LEN + 1);
    let result = engine.create_property(Ulid::new(), Some(name), None).await;
    assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
}

#[tokio::test]
async fn engine_delete_property_with_active_reservations_fails() {
    let (engine, pid) = engine_with_property("delete_property_active.wal").await;
    let rid = book(&engine, pid, "2024-03-10", "2024-03-13").await;

    let result = engine.delete_property(pid).await;
    assert!(matches!(result, Err(EngineError::HasActiveReservations(_))));

    // Once every reservation is cancelled the property can go.
    engine.cancel_reservation(rid).await.unwrap();
    engine.delete_property(pid).await.unwrap();
    assert!(engine.get_property(&pid).is_none());
    assert!(engine.get_property_for_reservation(&rid).is_none());
}

#[tokio::test]
async fn engine_delete_unknown_property() {
    let engine = Engine::new(test_wal_path("delete_unknown.wal")).unwrap();
    let result = engine.delete_property(Ulid::new()).await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

// ── Reservation lifecycle ────────────────────────────────

#[tokio::test]
async fn engine_request_confirm_cancel() {
    let (engine, pid) = engine_with_property("lifecycle.wal").await;

    let req = stay_request(pid, "2024-03-10", "2024-03-13");
    let rid = req.id;
    engine.request_reservation(req).await.unwrap();

    let r = engine.get_reservation(rid).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Requested);
    assert_eq!(r.stay.nights(), 3);
    assert!(r.confirmed_at.is_none());

    assert_eq!(engine.confirm_reservation(rid).await.unwrap(), pid);
    let r = engine.get_reservation(rid).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Confirmed);
    assert!(r.confirmed_at.is_some());

    engine.cancel_reservation(rid).await.unwrap();
    let r = engine.get_reservation(rid).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Cancelled);
    assert!(r.cancelled_at.is_some());
}

#[tokio::test]
async fn engine_delete_reservation() {
    let (engine, pid) = engine_with_property("delete_reservation.wal").await;
    let rid = book(&engine, pid, "2024-03-10", "2024-03-13").await;

    engine.delete_reservation(rid).await.unwrap();
    assert!(matches!(
        engine.get_reservation(rid).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.delete_reservation(rid).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn engine_unknown_property_rejects_reservation() {
    let engine = Engine::new(test_wal_path("unknown_property.wal")).unwrap();
    let result = engine
        .request_reservation(stay_request(Ulid::new(), "2024-03-10", "2024-03-13"))
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn engine_duplicate_reservation_id_rejected() {
    let (engine, pid) = engine_with_property("dup_reservation.wal").await;
    let req = stay_request(pid, "2024-03-10", "2024-03-13");
    let mut again = stay_request(pid, "2024-04-10", "2024-04-13");
    again.id = req.id;

    engine.request_reservation(req).await.unwrap();
    let result = engine.request_reservation(again).await;
    assert!(matches!(result, Err(EngineError::AlreadyExists(_))));
}

#[tokio::test]
async fn engine_confirm_twice_is_invalid_transition() {
    let (engine, pid) = engine_with_property("confirm_twice.wal").await;
    let rid = book(&engine, pid, "2024-03-10", "2024-03-13").await;

    let result = engine.confirm_reservation(rid).await;
    assert!(matches!(
        result,
        Err(EngineError::InvalidTransition {
            from: ReservationStatus::Confirmed,
            to: ReservationStatus::Confirmed,
            ..
        })
    ));
}

#[tokio::test]
async fn engine_cancelled_cannot_be_confirmed_or_recancelled() {
    let (engine, pid) = engine_with_property("cancelled_terminal.wal").await;
    let req = stay_request(pid, "2024-03-10", "2024-03-13");
    let rid = req.id;
    engine.request_reservation(req).await.unwrap();
    engine.cancel_reservation(rid).await.unwrap();

    assert!(matches!(
        engine.confirm_reservation(rid).await,
        Err(EngineError::InvalidTransition { .. })
    ));
    assert!(matches!(
        engine.cancel_reservation(rid).await,
        Err(EngineError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn engine_create_cancelled_is_rejected() {
    let (engine, pid) = engine_with_property("create_cancelled.wal").await;
    let result = engine
        .create_reservation(
            stay_request(pid, "2024-03-10", "2024-03-13"),
            ReservationStatus::Cancelled,
        )
        .await;
    assert!(matches!(result, Err(EngineError::InvalidTransition { .. })));
}

#[tokio::test]
async fn engine_admin_creates_confirmed_directly() {
    let (engine, pid) = engine_with_property("admin_confirmed.wal").await;
    let req = stay_request(pid, "2024-03-10", "2024-03-13");
    let rid = req.id;
    engine
        .create_reservation(req, ReservationStatus::Confirmed)
        .await
        .unwrap();

    let r = engine.get_reservation(rid).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Confirmed);
    assert_eq!(r.confirmed_at, Some(r.created_at));
}

// ── Validation ───────────────────────────────────────────

#[tokio::test]
async fn engine_rejects_inverted_and_empty_stays() {
    let (engine, pid) = engine_with_property("invalid_dates.wal").await;

    let same_day = stay_request(pid, "2024-03-10", "2024-03-10");
    assert!(matches!(
        engine.request_reservation(same_day).await,
        Err(EngineError::InvalidDates { .. })
    ));

    let inverted = stay_request(pid, "2024-03-13", "2024-03-10");
    let err = engine.request_reservation(inverted).await.unwrap_err();
    assert_eq!(err.status_code(), 400);
    assert_eq!(err.kind(), "invalid_dates");
}

#[tokio::test]
async fn engine_guest_count_over_property_max() {
    let (engine, pid) = engine_with_property("guest_max.wal").await;
    let mut req = stay_request(pid, "2024-03-10", "2024-03-13");
    req.guest_count = 5;

    let err = engine.request_reservation(req).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::GuestCountExceeded {
            requested: 5,
            max: 4
        }
    ));
    assert_eq!(err.status_code(), 422);
}

#[tokio::test]
async fn engine_zero_guests_rejected() {
    let (engine, pid) = engine_with_property("zero_guests.wal").await;
    let mut req = stay_request(pid, "2024-03-10", "2024-03-13");
    req.guest_count = 0;
    assert!(matches!(
        engine.request_reservation(req).await,
        Err(EngineError::LimitExceeded(_))
    ));
}

#[tokio::test]
async fn engine_stay_too_long_rejected() {
    let (engine, pid) = engine_with_property("stay_too_long.wal").await;
    let req = stay_request(pid, "2024-01-01", "2025-06-01");
    assert!(matches!(
        engine.request_reservation(req).await,
        Err(EngineError::LimitExceeded("stay too long"))
    ));
}

#[tokio::test]
async fn engine_long_special_requests_rejected() {
    let (engine, pid) = engine_with_property("long_requests.wal").await;
    let mut req = stay_request(pid, "2024-03-10", "2024-03-13");
    req.special_requests = Some("a".repeat(MAX_SPECIAL_REQUESTS_LEN + 1));
    assert!(matches!(
        engine.request_reservation(req).await,
        Err(EngineError::LimitExceeded(_))
    ));
}

// ── Overlap rules ────────────────────────────────────────

#[tokio::test]
async fn engine_request_over_confirmed_conflicts() {
    let (engine, pid) = engine_with_property("request_conflict.wal").await;
    let existing = book(&engine, pid, "2024-03-10", "2024-03-13").await;

    let err = engine
        .request_reservation(stay_request(pid, "2024-03-12", "2024-03-15"))
        .await
        .unwrap_err();
    match &err {
        EngineError::Conflict(conflicts) => {
            assert_eq!(conflicts.len(), 1);
            assert_eq!(conflicts[0].reservation_id, existing);
            assert_eq!(conflicts[0].check_in, d("2024-03-10"));
            assert_eq!(conflicts[0].check_out, d("2024-03-13"));
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(err.status_code(), 409);
    assert_eq!(err.to_json()["conflicts"][0]["check_in"], "2024-03-10");
}

#[tokio::test]
async fn engine_back_to_back_allowed() {
    let (engine, pid) = engine_with_property("back_to_back.wal").await;
    book(&engine, pid, "2024-03-10", "2024-03-13").await;
    // Checkout morning is the next guest's check-in.
    book(&engine, pid, "2024-03-13", "2024-03-15").await;
    book(&engine, pid, "2024-03-08", "2024-03-10").await;

    let confirmed = engine
        .list_reservations(Some(pid), Some(ReservationStatus::Confirmed))
        .await;
    assert_eq!(confirmed.len(), 3);
}

#[tokio::test]
async fn engine_requested_do_not_block_each_other() {
    let (engine, pid) = engine_with_property("requested_overlap.wal").await;
    engine
        .request_reservation(stay_request(pid, "2024-03-10", "2024-03-13"))
        .await
        .unwrap();
    engine
        .request_reservation(stay_request(pid, "2024-03-11", "2024-03-12"))
        .await
        .unwrap();
    assert_eq!(engine.list_reservations(Some(pid), None).await.len(), 2);
}

#[tokio::test]
async fn engine_confirm_rechecks_overlap() {
    let (engine, pid) = engine_with_property("confirm_recheck.wal").await;

    let first = stay_request(pid, "2024-03-10", "2024-03-13");
    let second = stay_request(pid, "2024-03-11", "2024-03-14");
    let (a, b) = (first.id, second.id);
    engine.request_reservation(first).await.unwrap();
    engine.request_reservation(second).await.unwrap();

    engine.confirm_reservation(a).await.unwrap();
    let result = engine.confirm_reservation(b).await;
    assert!(matches!(result, Err(EngineError::Conflict(ref c)) if c[0].reservation_id == a));

    // The loser stays requested.
    let r = engine.get_reservation(b).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Requested);
}

#[tokio::test]
async fn engine_cancel_frees_dates() {
    let (engine, pid) = engine_with_property("cancel_frees.wal").await;
    let rid = book(&engine, pid, "2024-03-10", "2024-03-13").await;
    engine.cancel_reservation(rid).await.unwrap();
    book(&engine, pid, "2024-03-10", "2024-03-13").await;
}

#[tokio::test]
async fn engine_check_conflicts_query() {
    let (engine, pid) = engine_with_property("check_conflicts.wal").await;
    let a = book(&engine, pid, "2024-03-01", "2024-03-05").await;
    let b = book(&engine, pid, "2024-03-08", "2024-03-12").await;
    engine
        .request_reservation(stay_request(pid, "2024-03-05", "2024-03-08"))
        .await
        .unwrap();

    let conflicts = engine
        .check_conflicts(pid, d("2024-03-04"), d("2024-03-09"))
        .await
        .unwrap();
    let ids: Vec<Ulid> = conflicts.iter().map(|c| c.reservation_id).collect();
    assert_eq!(ids, vec![a, b]);

    let free = engine
        .check_conflicts(pid, d("2024-03-05"), d("2024-03-08"))
        .await
        .unwrap();
    assert!(free.is_empty());

    let unknown = engine
        .check_conflicts(Ulid::new(), d("2024-03-01"), d("2024-03-05"))
        .await
        .unwrap();
    assert!(unknown.is_empty());
}

#[tokio::test]
async fn engine_properties_are_independent() {
    let engine = Engine::new(test_wal_path("independent.wal")).unwrap();
    let p1 = Ulid::new();
    let p2 = Ulid::new();
    engine.create_property(p1, None, None).await.unwrap();
    engine.create_property(p2, None, None).await.unwrap();

    book(&engine, p1, "2024-03-10", "2024-03-13").await;
    book(&engine, p2, "2024-03-10", "2024-03-13").await;
}

#[tokio::test]
async fn engine_concurrent_confirms_admit_one() {
    let (engine, pid) = engine_with_property("concurrent_confirm.wal").await;
    let engine = Arc::new(engine);

    let mut ids = Vec::new();
    for _ in 0..10 {
        let req = stay_request(pid, "2024-07-01", "2024-07-08");
        ids.push(req.id);
        engine.request_reservation(req).await.unwrap();
    }

    let mut handles = Vec::new();
    for id in ids {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move { eng.confirm_reservation(id).await }));
    }
    let mut confirmed = 0;
    for h in handles {
        if h.await.unwrap().is_ok() {
            confirmed += 1;
        }
    }
    assert_eq!(confirmed, 1);
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn engine_list_reservations_filters_and_orders() {
    let (engine, pid) = engine_with_property("list_reservations.wal").await;
    let late = book(&engine, pid, "2024-05-01", "2024-05-03").await;
    let early = book(&engine, pid, "2024-03-01", "2024-03-03").await;
    let req = stay_request(pid, "2024-04-01", "2024-04-03");
    let pending = req.id;
    engine.request_reservation(req).await.unwrap();

    let all: Vec<Ulid> = engine
        .list_reservations(Some(pid), None)
        .await
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(all, vec![early, pending, late]);

    let requested = engine
        .list_reservations(None, Some(ReservationStatus::Requested))
        .await;
    assert_eq!(requested.len(), 1);
    assert_eq!(requested[0].id, pending);

    assert!(engine.list_reservations(Some(Ulid::new()), None).await.is_empty());
}

#[tokio::test]
async fn engine_month_calendar() {
    let (engine, pid) = engine_with_property("month_calendar.wal").await;
    book(&engine, pid, "2024-03-10", "2024-03-13").await;
    book(&engine, pid, "2024-03-13", "2024-03-15").await;
    engine
        .request_reservation(stay_request(pid, "2024-03-20", "2024-03-22"))
        .await
        .unwrap();
    // Ends on the 1st, so only its checkout shows up.
    book(&engine, pid, "2024-02-27", "2024-03-01").await;

    let cal = engine.month_calendar(Some(pid), 2024, 3).await.unwrap();
    assert_eq!(cal["2024-03-01"].check_out_count, 1);
    assert_eq!(cal["2024-03-10"].check_in_count, 1);
    assert_eq!(cal["2024-03-11"].staying_count, 1);
    assert_eq!(cal["2024-03-13"].check_in_count, 1);
    assert_eq!(cal["2024-03-13"].check_out_count, 1);
    assert!(cal["2024-03-13"].has_confirmed);
    assert_eq!(cal["2024-03-20"].requested_count, 1);
    assert!(!cal["2024-03-20"].has_confirmed);
    assert!(!cal.contains_key("2024-03-16"));
    assert!(cal.keys().all(|k| k.starts_with("2024-03-")));
}

#[tokio::test]
async fn engine_month_calendar_all_properties() {
    let engine = Engine::new(test_wal_path("month_calendar_all.wal")).unwrap();
    let p1 = Ulid::new();
    let p2 = Ulid::new();
    engine.create_property(p1, None, None).await.unwrap();
    engine.create_property(p2, None, None).await.unwrap();
    book(&engine, p1, "2024-03-10", "2024-03-12").await;
    book(&engine, p2, "2024-03-10", "2024-03-12").await;

    let cal = engine.month_calendar(None, 2024, 3).await.unwrap();
    assert_eq!(cal["2024-03-10"].check_in_count, 2);
    assert_eq!(cal["2024-03-11"].staying_count, 2);
    assert_eq!(cal["2024-03-12"].check_out_count, 2);
}

#[tokio::test]
async fn engine_month_calendar_rejects_bad_month() {
    let engine = Engine::new(test_wal_path("month_calendar_bad.wal")).unwrap();
    assert!(matches!(
        engine.month_calendar(None, 2024, 13).await,
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(
        engine.month_calendar(None, 1850, 1).await,
        Err(EngineError::LimitExceeded(_))
    ));
}

#[tokio::test]
async fn engine_open_ranges() {
    let (engine, pid) = engine_with_property("open_ranges.wal").await;
    book(&engine, pid, "2024-03-05", "2024-03-08").await;
    book(&engine, pid, "2024-03-08", "2024-03-09").await;
    book(&engine, pid, "2024-03-20", "2024-03-22").await;
    engine
        .request_reservation(stay_request(pid, "2024-03-12", "2024-03-14"))
        .await
        .unwrap();

    let open = engine
        .open_ranges(pid, d("2024-03-01"), d("2024-04-01"), None)
        .await
        .unwrap();
    assert_eq!(
        open,
        vec![
            StayRange::new(d("2024-03-01"), d("2024-03-05")),
            StayRange::new(d("2024-03-09"), d("2024-03-20")),
            StayRange::new(d("2024-03-22"), d("2024-04-01")),
        ]
    );

    let week = engine
        .open_ranges(pid, d("2024-03-01"), d("2024-04-01"), Some(7))
        .await
        .unwrap();
    assert_eq!(
        week,
        vec![
            StayRange::new(d("2024-03-09"), d("2024-03-20")),
            StayRange::new(d("2024-03-22"), d("2024-04-01")),
        ]
    );
}

#[tokio::test]
async fn engine_open_ranges_validates_window() {
    let (engine, pid) = engine_with_property("open_ranges_window.wal").await;
    assert!(matches!(
        engine.open_ranges(pid, d("2024-03-10"), d("2024-03-10"), None).await,
        Err(EngineError::InvalidDates { .. })
    ));
    assert!(matches!(
        engine.open_ranges(pid, d("2024-01-01"), d("2030-01-01"), None).await,
        Err(EngineError::LimitExceeded("query window too wide"))
    ));
}

// ── WAL replay ───────────────────────────────────────────

#[tokio::test]
async fn engine_wal_replay() {
    let path = test_wal_path("replay.wal");
    let pid = Ulid::new();
    let (confirmed, cancelled, pending);
    {
        let engine = Engine::new(path.clone()).unwrap();
        engine
            .create_property(pid, Some("Cabin".into()), Some(2))
            .await
            .unwrap();
        confirmed = book(&engine, pid, "2024-03-10", "2024-03-13").await;
        cancelled = book(&engine, pid, "2024-03-20", "2024-03-23").await;
        engine.cancel_reservation(cancelled).await.unwrap();
        let req = stay_request(pid, "2024-03-25", "2024-03-27");
        pending = req.id;
        engine.request_reservation(req).await.unwrap();
        let gone = book(&engine, pid, "2024-04-01", "2024-04-02").await;
        engine.delete_reservation(gone).await.unwrap();
    }

    let engine = Engine::new(path).unwrap();
    let props = engine.list_properties().await;
    assert_eq!(props.len(), 1);
    assert_eq!(props[0].name.as_deref(), Some("Cabin"));
    assert_eq!(props[0].active_reservations, 2);

    let all = engine.list_reservations(Some(pid), None).await;
    assert_eq!(all.len(), 3);
    assert_eq!(
        engine.get_reservation(confirmed).await.unwrap().status,
        ReservationStatus::Confirmed
    );
    assert_eq!(
        engine.get_reservation(cancelled).await.unwrap().status,
        ReservationStatus::Cancelled
    );
    assert_eq!(
        engine.get_reservation(pending).await.unwrap().status,
        ReservationStatus::Requested
    );

    // Replayed confirmations still block.
    assert!(matches!(
        engine
            .request_reservation(stay_request(pid, "2024-03-11", "2024-03-12"))
            .await,
        Err(EngineError::Conflict(_))
    ));
}

#[tokio::test]
async fn engine_replay_drops_deleted_property() {
    let path = test_wal_path("replay_deleted_property.wal");
    let pid = Ulid::new();
    {
        let engine = Engine::new(path.clone()).unwrap();
        engine.create_property(pid, None, None).await.unwrap();
        engine.delete_property(pid).await.unwrap();
    }
    let engine = Engine::new(path).unwrap();
    assert!(engine.get_property(&pid).is_none());
    assert!(engine.list_properties().await.is_empty());
}

#[tokio::test]
async fn group_commit_batches_appends() {
    let path = test_wal_path("group_commit_batch.wal");
    let engine = Arc::new(Engine::new(path.clone()).unwrap());

    let n = 20;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.create_property(Ulid::new(), Some(format!("Unit {i}")), None)
                .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.list_properties().await.len(), n);

    let engine2 = Engine::new(path).unwrap();
    assert_eq!(engine2.list_properties().await.len(), n);
}

// ── WAL compaction ───────────────────────────────────────

#[tokio::test]
async fn compact_wal_preserves_state() {
    let path = test_wal_path("compact_state.wal");
    let (engine, pid) = {
        let engine = Engine::new(path.clone()).unwrap();
        let pid = Ulid::new();
        engine
            .create_property(pid, Some("Dune House".into()), Some(6))
            .await
            .unwrap();
        (engine, pid)
    };

    // Churn that compaction should fold away.
    for _ in 0..10 {
        let rid = book(&engine, pid, "2024-06-01", "2024-06-05").await;
        engine.delete_reservation(rid).await.unwrap();
    }
    let kept = book(&engine, pid, "2024-06-10", "2024-06-14").await;
    let req = stay_request(pid, "2024-06-20", "2024-06-22");
    let pending = req.id;
    engine.request_reservation(req).await.unwrap();

    let before = engine.list_reservations(Some(pid), None).await;
    let calendar_before = engine.month_calendar(Some(pid), 2024, 6).await.unwrap();
    let size_before = std::fs::metadata(&path).unwrap().len();

    engine.compact_wal().await.unwrap();

    let size_after = std::fs::metadata(&path).unwrap().len();
    assert!(
        size_after < size_before,
        "compacted WAL ({size_after}) should be smaller than original ({size_before})"
    );

    let after = engine.list_reservations(Some(pid), None).await;
    assert_eq!(before, after);
    assert_eq!(
        calendar_before,
        engine.month_calendar(Some(pid), 2024, 6).await.unwrap()
    );
    assert_eq!(after[0].id, kept);
    assert_eq!(after[1].id, pending);
}

#[tokio::test]
async fn compact_wal_survives_restart() {
    let path = test_wal_path("compact_restart.wal");
    let pid = Ulid::new();
    let (confirmed, cancelled, later);
    let confirmed_at;
    {
        let engine = Engine::new(path.clone()).unwrap();
        engine
            .create_property(pid, Some("Cabin".into()), None)
            .await
            .unwrap();
        confirmed = book(&engine, pid, "2024-03-10", "2024-03-13").await;
        cancelled = book(&engine, pid, "2024-03-20", "2024-03-23").await;
        engine.cancel_reservation(cancelled).await.unwrap();
        confirmed_at = engine.get_reservation(confirmed).await.unwrap().confirmed_at;

        engine.compact_wal().await.unwrap();

        // Append after compaction lands in the new file.
        later = book(&engine, pid, "2024-04-01", "2024-04-05").await;
    }

    let engine = Engine::new(path).unwrap();
    let r = engine.get_reservation(confirmed).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Confirmed);
    assert_eq!(r.confirmed_at, confirmed_at);

    let c = engine.get_reservation(cancelled).await.unwrap();
    assert_eq!(c.status, ReservationStatus::Cancelled);
    assert!(c.confirmed_at.is_some());
    assert!(c.cancelled_at.is_some());

    assert_eq!(
        engine.get_reservation(later).await.unwrap().status,
        ReservationStatus::Confirmed
    );
}

#[tokio::test]
async fn booking_queued_behind_delete_is_rejected() {
    let (engine, pid) = engine_with_property("delete_vs_booking.wal").await;
    let engine = Arc::new(engine);

    // Park both writers on the property lock: the delete first, then the booking.
    let lock = engine.get_property(&pid).unwrap().write_owned().await;
    let deleter = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.delete_property(pid).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let req = stay_request(pid, "2024-03-10", "2024-03-13");
    let rid = req.id;
    let booker = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.request_reservation(req).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    drop(lock);

    deleter.await.unwrap().unwrap();
    assert!(matches!(
        booker.await.unwrap(),
        Err(EngineError::NotFound(id)) if id == pid
    ));
    assert!(engine.get_property(&pid).is_none());
    assert!(engine.get_property_for_reservation(&rid).is_none());
}

#[tokio::test]
async fn compaction_racing_delete_keeps_property_gone() {
    let path = test_wal_path("compact_vs_delete.wal");
    let pid = Ulid::new();
    {
        let engine = Arc::new(Engine::new(path.clone()).unwrap());
        engine.create_property(pid, None, None).await.unwrap();

        let lock = engine.get_property(&pid).unwrap().write_owned().await;
        let deleter = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.delete_property(pid).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let compactor = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.compact_wal().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(lock);

        deleter.await.unwrap().unwrap();
        compactor.await.unwrap().unwrap();
        assert!(engine.get_property(&pid).is_none());
    }

    let engine = Engine::new(path).unwrap();
    assert!(engine.get_property(&pid).is_none());
}

#[tokio::test]
async fn properties_created_during_compaction_survive_restart() {
    let path = test_wal_path("compact_vs_create.wal");
    let mut ids = Vec::new();
    {
        let engine = Arc::new(Engine::new(path.clone()).unwrap());
        let seeded = Ulid::new();
        engine.create_property(seeded, None, None).await.unwrap();
        book(&engine, seeded, "2024-03-10", "2024-03-13").await;
        ids.push(seeded);

        let mut handles = Vec::new();
        for _ in 0..20 {
            let id = Ulid::new();
            ids.push(id);
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine.create_property(id, None, None).await
            }));
        }
        let compactor = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.compact_wal().await })
        };
        for h in handles {
            h.await.unwrap().unwrap();
        }
        compactor.await.unwrap().unwrap();
    }

    let engine = Engine::new(path).unwrap();
    for id in &ids {
        assert!(engine.get_property(id).is_some(), "property {id} lost");
    }
}

#[tokio::test]
async fn wal_appends_since_compact_through_channel() {
    let path = test_wal_path("appends_counter.wal");
    let engine = Engine::new(path).unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 0);

    let pid = Ulid::new();
    engine.create_property(pid, None, None).await.unwrap();
    let rid = book(&engine, pid, "2024-03-10", "2024-03-13").await;
    engine.cancel_reservation(rid).await.unwrap();

    assert_eq!(engine.wal_appends_since_compact().await, 4);
}

#[tokio::test]
async fn compact_resets_append_counter() {
    let path = test_wal_path("compact_counter.wal");
    let (engine, pid) = {
        let engine = Engine::new(path).unwrap();
        let pid = Ulid::new();
        engine.create_property(pid, None, None).await.unwrap();
        (engine, pid)
    };
    book(&engine, pid, "2024-03-10", "2024-03-13").await;
    assert!(engine.wal_appends_since_compact().await > 0);

    engine.compact_wal().await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 0);
}

// ── Limits ───────────────────────────────────────────────

#[tokio::test]
async fn engine_email_too_long() {
    let (engine, pid) = engine_with_property("email_too_long.wal").await;
    let mut req = stay_request(pid, "2024-03-10", "2024-03-13");
    req.email = format!("{}@example.com", "a".repeat(MAX_EMAIL_LEN));
    assert!(matches!(
        engine.request_reservation(req).await,
        Err(EngineError::LimitExceeded("email too long"))
    ));
}

#[tokio::test]
async fn engine_dates_out_of_range() {
    let (engine, pid) = engine_with_property("dates_out_of_range.wal").await;
    let req = stay_request(pid, "1999-12-30", "2000-01-02");
    assert!(matches!(
        engine.request_reservation(req).await,
        Err(EngineError::LimitExceeded("date out of range"))
    ));
}

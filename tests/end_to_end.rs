use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveTime;
use tokio::sync::broadcast;
use ulid::Ulid;

use bayline::clock::Clock;
use bayline::limits::*;
use bayline::model::*;
use bayline::{Config, DurableStore, Engine, LogChannel, ManualClock, MemoryStore, Orchestrator, Store};

// ── Test infrastructure ──────────────────────────────────────

/// 2024-01-01T00:00:00Z
const T0: Ms = 1_704_067_200_000;

fn at(hours: i64) -> Ms {
    T0 + hours * HOUR_MS
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("bayline_e2e_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(name)
}

fn build(store: Arc<dyn Store>, clock: Arc<ManualClock>) -> (Arc<Engine>, Orchestrator) {
    let engine = Arc::new(Engine::new(store, clock, Arc::new(LogChannel), Config::default()));
    let orchestrator = Orchestrator::new(engine.clone());
    (engine, orchestrator)
}

/// Units held by CONFIRMED or ACTIVE reservations overlapping `span`, one entry per reservation.
async fn held_units(engine: &Engine, resource_id: Ulid, span: Span) -> Vec<u32> {
    engine
        .reservations_for_resource(resource_id, span)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.status.holds_capacity())
        .map(|r| r.unit)
        .collect()
}

fn drain(rx: &mut broadcast::Receiver<LiveEvent>) -> Vec<LiveEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ── Scenarios ────────────────────────────────────────────────

#[tokio::test]
async fn cancellation_hands_the_unit_to_the_waitlist() {
    let clock = Arc::new(ManualClock::new(T0));
    let store = Arc::new(DurableStore::open(&test_wal_path("handoff.wal"), 1000).unwrap());
    let (engine, orch) = build(store, clock.clone());

    let resource = engine.create_resource(Some("Level 2".into()), 1, 300).await.unwrap();
    let mut live = engine.live.subscribe(resource.id);
    // Tomorrow 09:00 to 10:00.
    let window = Span::new(at(33), at(34));
    let (alice, bob) = (Ulid::new(), Ulid::new());

    let a = engine
        .create_reservation(ReservationRequest {
            resource_id: resource.id,
            user_id: alice,
            span: window,
            vehicle: Some(VehicleInfo { plate: "KA-123".into(), description: None }),
        })
        .await
        .unwrap();
    assert_eq!(a.status, ReservationStatus::Confirmed);

    let err = engine
        .create_reservation(ReservationRequest {
            resource_id: resource.id,
            user_id: bob,
            span: window,
            vehicle: None,
        })
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(held_units(&engine, resource.id, window).await, vec![1]);

    let entry = engine.join_waitlist(resource.id, bob, window, 1).await.unwrap();
    assert_eq!(entry.position, 1);

    let cancelled = engine.cancel_reservation(a.id, "trip cancelled").await.unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
    assert_eq!(cancelled.refund.as_ref().unwrap().percent, 100);
    assert!(held_units(&engine, resource.id, window).await.is_empty());

    let report = orch.trigger_waitlist_tick().await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(
        engine.waitlist_entry(entry.id).await.unwrap().status,
        WaitlistStatus::Notified
    );
    // Re-running the tick is harmless.
    assert_eq!(orch.trigger_waitlist_tick().await.unwrap().processed, 0);

    clock.advance(2 * MINUTE_MS);
    let converted = engine.convert_waitlist_entry(entry.id, None).await.unwrap();
    assert_eq!(converted.len(), 1);
    let b = &converted[0];
    assert_eq!(b.user_id, bob);
    assert_eq!(b.status, ReservationStatus::Confirmed);
    assert_eq!(held_units(&engine, resource.id, window).await, vec![1]);

    // Confirmation A, cancellation A, offer B, confirmation B.
    let report = orch.trigger_notification_dispatch().await.unwrap();
    assert_eq!(report.processed, 4);
    assert_eq!(report.failed, 0);
    let bobs = engine.notifications_for_user(bob).await.unwrap();
    assert_eq!(bobs.len(), 2);
    assert!(bobs.iter().all(|j| j.status == NotificationStatus::Sent));

    let reservation_statuses: Vec<_> = drain(&mut live)
        .into_iter()
        .filter_map(|e| match e {
            LiveEvent::ReservationChanged { reservation_id, status, .. } => Some((reservation_id, status)),
            _ => None,
        })
        .collect();
    assert_eq!(
        reservation_statuses,
        vec![
            (a.id, ReservationStatus::Confirmed),
            (a.id, ReservationStatus::Cancelled),
            (b.id, ReservationStatus::Confirmed),
        ]
    );
}

#[tokio::test]
async fn state_survives_restart() {
    let path = test_wal_path("restart.wal");
    let clock = Arc::new(ManualClock::new(T0));

    let (resource_id, reservation_id, rule_id) = {
        let store = Arc::new(DurableStore::open(&path, 1000).unwrap());
        let (engine, _) = build(store, clock.clone());
        let resource = engine.create_resource(None, 2, 100).await.unwrap();
        let res = engine
            .create_reservation(ReservationRequest {
                resource_id: resource.id,
                user_id: Ulid::new(),
                span: Span::new(at(10), at(12)),
                vehicle: None,
            })
            .await
            .unwrap();
        let rule = engine
            .create_recurrence_rule(RuleRequest {
                resource_id: resource.id,
                user_id: Ulid::new(),
                pattern: Pattern::Weekdays,
                interval: 1,
                start_time: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
                duration_minutes: 90,
                start_date: clock.today(),
                end_date: None,
                max_occurrences: Some(5),
                vehicle: None,
            })
            .await
            .unwrap();
        (resource.id, res.id, rule.id)
    };

    let store = Arc::new(DurableStore::open(&path, 1000).unwrap());
    let (engine, orch) = build(store, clock.clone());
    assert_eq!(engine.resource(resource_id).await.unwrap().capacity, 2);
    let res = engine.reservation(reservation_id).await.unwrap();
    assert_eq!(res.amount_cents, 200);
    assert_eq!(engine.rule(rule_id).await.unwrap().next_occurrence, clock.today());

    // The recovered rule keeps working.
    let report = orch.trigger_recurrence_tick().await.unwrap();
    assert_eq!(report.processed, 1);
    let rule = engine.rule(rule_id).await.unwrap();
    assert_eq!(rule.occurrence_count, 1);
    assert_eq!(rule.next_occurrence, clock.today().succ_opt().unwrap());
}

#[tokio::test]
async fn ticks_drive_recurrence_reminders_and_no_shows() {
    let clock = Arc::new(ManualClock::new(T0));
    let (engine, orch) = build(Arc::new(MemoryStore::new()), clock.clone());
    let resource = engine.create_resource(None, 1, 0).await.unwrap();
    let user = Ulid::new();

    let rule = engine
        .create_recurrence_rule(RuleRequest {
            resource_id: resource.id,
            user_id: user,
            pattern: Pattern::Daily,
            interval: 1,
            start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            duration_minutes: 60,
            start_date: clock.today(),
            end_date: None,
            max_occurrences: Some(3),
            vehicle: None,
        })
        .await
        .unwrap();

    assert_eq!(orch.trigger_recurrence_tick().await.unwrap().processed, 1);
    assert_eq!(orch.trigger_recurrence_tick().await.unwrap().processed, 0);

    // 08:40, inside the reminder lead.
    clock.set(at(9) - 20 * MINUTE_MS);
    assert_eq!(orch.trigger_reminder_tick().await.unwrap().processed, 1);
    assert_eq!(orch.trigger_reminder_tick().await.unwrap().processed, 0);

    // Nobody showed up.
    clock.set(at(11));
    let report = orch.trigger_cleanup().await.unwrap();
    assert_eq!(report.processed, 1);
    let occurrence = engine.rule(rule.id).await.unwrap().occurrences[0].reservation_id;
    assert_eq!(
        engine.reservation(occurrence).await.unwrap().status,
        ReservationStatus::NoShow
    );

    let kinds: Vec<_> = engine
        .notifications_for_user(user)
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.payload.kind())
        .collect();
    assert_eq!(
        kinds,
        vec!["recurring_booking_created", "reservation_reminder", "reservation_no_show"]
    );
}

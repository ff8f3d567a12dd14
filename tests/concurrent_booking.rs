use std::collections::HashSet;
use std::sync::Arc;

use tokio_test::assert_ok;
use ulid::Ulid;

use vaxslot::config::SchedulerConfig;
use vaxslot::engine::{Clock, Engine, EngineError, ScheduleOutcome, ScheduleRequest};
use vaxslot::model::*;
use vaxslot::store::{MemoryStore, SlotStore};

// ── Test infrastructure ──────────────────────────────────────

const T0: Ms = 20_700 * DAY;
const NOW: Ms = T0 + 8 * HOUR;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

struct Harness {
    store: Arc<MemoryStore>,
    engine: Arc<Engine>,
    sites: Vec<Ulid>,
}

/// `sites` sites, each with `per_site` ten-minute slots from 09:00 tomorrow.
async fn harness(sites: usize, per_site: i64) -> Harness {
    init_tracing();
    let dir = std::env::temp_dir().join(format!("vaxslot_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let store = Arc::new(MemoryStore::open(dir.join("slots.wal")).unwrap());

    let mut ids = Vec::new();
    for i in 0..sites {
        let id = Ulid::new();
        assert_ok!(
            store
                .create_site(Site {
                    id,
                    name: format!("UBS {i:02}"),
                    active: true,
                    enabled_for_reschedule: true,
                })
                .await
        );
        for j in 0..per_site {
            let start = T0 + DAY + 9 * HOUR + j * 10 * MINUTE;
            assert_ok!(
                store
                    .create_slot(Ulid::new(), id, Span::new(start, start + 10 * MINUTE), false)
                    .await
            );
        }
        ids.push(id);
    }

    let engine = Engine::with_clock(store.clone(), SchedulerConfig::default(), Clock::fixed(NOW))
        .unwrap();
    Harness {
        store,
        engine: Arc::new(engine),
        sites: ids,
    }
}

fn patient(sites: &[Ulid]) -> Patient {
    let mut p = Patient::new(Ulid::new());
    p.conditions.push(Condition {
        id: Ulid::new(),
        name: "grupo prioritario".into(),
        site_ids: sites.to_vec(),
    });
    p
}

async fn assigned(store: &MemoryStore, sites: &[Ulid]) -> Vec<Slot> {
    let mut out = Vec::new();
    for site in sites {
        out.extend(
            store
                .list_slots(*site)
                .await
                .into_iter()
                .filter(|s| s.patient_id.is_some()),
        );
    }
    out
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn oversubscribed_sites_never_double_book() {
    let h = harness(3, 4).await;
    let mut handles = Vec::new();
    for _ in 0..60 {
        let engine = h.engine.clone();
        let sites = h.sites.clone();
        handles.push(tokio::spawn(async move {
            let p = patient(&sites);
            let outcome = engine
                .schedule(&p, &ScheduleRequest::new(sites))
                .await
                .unwrap();
            (p.id, outcome)
        }));
    }

    let mut winners = HashSet::new();
    let mut slots = HashSet::new();
    for handle in handles {
        let (patient_id, outcome) = handle.await.unwrap();
        match outcome {
            ScheduleOutcome::Success(b) => {
                assert!(winners.insert(patient_id));
                assert!(slots.insert(b.slot.id), "slot {} booked twice", b.slot.id);
            }
            ScheduleOutcome::NoSlots => {}
            ScheduleOutcome::ConditionsUnmet => panic!("eligible patient refused"),
        }
    }
    assert!(slots.len() <= 12);

    let held = assigned(&h.store, &h.sites).await;
    assert_eq!(held.len(), slots.len());
    for slot in held {
        assert!(winners.contains(&slot.patient_id.unwrap()));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn churn_keeps_one_current_slot_per_patient() {
    let h = harness(2, 10).await;
    let patients: Vec<Patient> = (0..8).map(|_| patient(&h.sites)).collect();

    let mut handles = Vec::new();
    for p in patients.clone() {
        let engine = h.engine.clone();
        let sites = h.sites.clone();
        handles.push(tokio::spawn(async move {
            for round in 0..7 {
                let desired = T0 + DAY + 9 * HOUR + (round * 25) * MINUTE;
                let request = ScheduleRequest::new(sites.clone()).desired(desired);
                let outcome = engine.schedule(&p, &request).await.unwrap();
                if round % 3 == 2
                    && let Some(b) = outcome.booking()
                {
                    match engine.cancel(&p, b.slot.id).await {
                        Ok(_) | Err(EngineError::NotCancelable(_)) => {}
                        Err(e) => panic!("cancel failed: {e}"),
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    for p in &patients {
        let current = assert_ok!(h.engine.current_slot(p.id).await);
        let held = h.store.held_slots(p.id).await.unwrap();
        assert!(held.len() <= 1, "patient {} holds {} slots", p.id, held.len());
        assert_eq!(current.map(|s| s.id), held.first().map(|s| s.id));
    }

    let mut seen = HashSet::new();
    for slot in assigned(&h.store, &h.sites).await {
        assert!(seen.insert(slot.patient_id));
    }
}

#[tokio::test]
async fn listing_then_booking_flow() {
    let h = harness(2, 3).await;
    let p = patient(&h.sites);
    let allowed = assert_ok!(h.engine.allowed_site_ids(&p).await);

    let day = assert_ok!(h.engine.visible_day(None, &allowed, false).await);
    assert_eq!(day, 1);
    let listing = assert_ok!(h.engine.open_slots_for_day(day, &allowed, false).await);
    assert_eq!(listing.len(), 2);
    let pick = listing[1].slots[2].clone();

    let request = ScheduleRequest::new(allowed)
        .at_site(pick.site_id)
        .desired(pick.start());
    let outcome = assert_ok!(h.engine.schedule(&p, &request).await);
    let booking = outcome.booking().unwrap();
    assert_eq!(booking.slot.id, pick.id);
    assert!(!booking.time_changed);

    let released = assert_ok!(h.engine.cancel(&p, pick.id).await);
    assert_eq!(released.patient_id, None);
    assert_eq!(
        h.store.slot(pick.id).await.unwrap().unwrap().patient_id,
        None
    );
}

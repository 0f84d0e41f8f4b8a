use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use slotmap::SlotMap;

use remote_lab_coordinator::domain::coordinator::catalog::resource_catalog::ResourceInstanceKey;
use remote_lab_coordinator::domain::coordinator::id::ReservationId;
use remote_lab_coordinator::domain::coordinator::slot::slot_lock::SlotLockLayer;
use remote_lab_coordinator::error::Error;

fn resource_key() -> ResourceInstanceKey {
    let mut map: SlotMap<ResourceInstanceKey, ()> = SlotMap::with_key();
    map.insert(())
}

#[test]
fn concurrent_acquires_grant_the_slot_to_exactly_one_reservation() {
    let layer = SlotLockLayer::new();
    let resource = resource_key();
    let successes = Arc::new(AtomicUsize::new(0));
    let busy = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for worker in 0..16 {
        let layer = layer.clone();
        let successes = successes.clone();
        let busy = busy.clone();

        handles.push(thread::spawn(move || {
            match layer.acquire(resource, ReservationId::new(format!("res-{}", worker))) {
                Ok(()) => {
                    successes.fetch_add(1, Ordering::SeqCst);
                }
                Err(Error::SlotBusy) => {
                    busy.fetch_add(1, Ordering::SeqCst);
                }
                Err(other) => panic!("unexpected error: {}", other),
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(successes.load(Ordering::SeqCst), 1);
    assert_eq!(busy.load(Ordering::SeqCst), 15);

    // Exactly one hold record exists, for exactly one reservation.
    let hold = layer.hold_of(resource).expect("a hold must exist");
    assert!(!hold.disposing);
}

#[test]
fn released_slots_can_be_acquired_again() {
    let layer = SlotLockLayer::new();
    let resource = resource_key();

    layer.acquire(resource, ReservationId::new("first")).unwrap();
    assert!(!layer.is_free(resource));

    assert!(layer.release(resource));
    assert!(layer.is_free(resource));

    layer.acquire(resource, ReservationId::new("second")).unwrap();
    assert_eq!(layer.hold_of(resource).unwrap().reservation_id, ReservationId::new("second"));
}

#[test]
fn repeated_acquire_release_cycles_stay_consistent_under_contention() {
    let layer = SlotLockLayer::new();
    let resource = resource_key();
    let granted = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for worker in 0..8 {
        let layer = layer.clone();
        let granted = granted.clone();

        handles.push(thread::spawn(move || {
            for round in 0..50 {
                let reservation = ReservationId::new(format!("res-{}-{}", worker, round));
                if layer.acquire(resource, reservation.clone()).is_ok() {
                    // While held, the hold must name us and nobody else.
                    assert_eq!(layer.hold_of(resource).unwrap().reservation_id, reservation);
                    granted.fetch_add(1, Ordering::SeqCst);
                    layer.release(resource);
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(granted.load(Ordering::SeqCst) >= 1);
    assert!(layer.is_free(resource));
}

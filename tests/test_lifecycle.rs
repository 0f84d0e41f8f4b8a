mod support;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use remote_lab_coordinator::domain::coordinator::coordinator::worker_identity;
use remote_lab_coordinator::domain::coordinator::reservation_status::ReservationStatus;

use support::{MockClock, ScriptedLab, deployment, reserve, tick_all, wait_for_confirmed};

#[test]
fn initialization_polls_honor_the_server_requested_delay() {
    let (clock, shared) = MockClock::shared(1_000);
    let lab = Arc::new(ScriptedLab::with_retries(2, 500, 0, 0));
    let consumer = deployment("http://consumer/weblab/", shared, lab.clone(), &[("dummy2", 1)]);

    let id = reserve(&consumer, "dummy2");

    tick_all(&[&consumer]);
    assert_eq!(lab.init_calls.load(Ordering::SeqCst), 1);
    assert!(matches!(consumer.coordinator.get_reservation_status(&id).unwrap(), ReservationStatus::WaitingConfirmation));

    // The server asked for 500 ms; polling earlier must not call it.
    tick_all(&[&consumer]);
    tick_all(&[&consumer]);
    assert_eq!(lab.init_calls.load(Ordering::SeqCst), 1);

    clock.advance(500);
    tick_all(&[&consumer]);
    assert_eq!(lab.init_calls.load(Ordering::SeqCst), 2);

    clock.advance(500);
    tick_all(&[&consumer]);
    assert_eq!(lab.init_calls.load(Ordering::SeqCst), 3);
    assert!(matches!(consumer.coordinator.get_reservation_status(&id).unwrap(), ReservationStatus::Confirmed { .. }));
}

#[test]
fn at_most_one_worker_polls_a_reservation_at_a_time() {
    let (_, shared) = MockClock::shared(0);
    let mut lab = ScriptedLab::with_retries(20, 0, 0, 0);
    // A slow hardware call: overlapping polls would be observed.
    lab.call_delay = Duration::from_millis(20);
    let lab = Arc::new(lab);
    let consumer = deployment("http://consumer/weblab/", shared, lab.clone(), &[("dummy2", 1)]);

    let id = reserve(&consumer, "dummy2");

    let mut handles = Vec::new();
    for index in 0..8 {
        let coordinator = consumer.coordinator.clone();
        handles.push(thread::spawn(move || {
            let worker = worker_identity(index);
            for _ in 0..10 {
                coordinator.tick(&worker);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(lab.max_concurrent_init.load(Ordering::SeqCst), 1, "two workers polled the same reservation concurrently");
    assert!(lab.init_calls.load(Ordering::SeqCst) >= 1);

    // Drive it to completion to make sure the claim protocol did not wedge.
    wait_for_confirmed(&consumer, &id, &[&consumer]);
}

#[test]
fn disposal_polls_until_the_server_reports_completion() {
    let (clock, shared) = MockClock::shared(0);
    let lab = Arc::new(ScriptedLab::with_retries(0, 0, 2, 300));
    let consumer = deployment("http://consumer/weblab/", shared, lab.clone(), &[("dummy2", 1)]);

    let id = reserve(&consumer, "dummy2");
    wait_for_confirmed(&consumer, &id, &[&consumer]);

    consumer.coordinator.finished_experiment(&id).unwrap();
    tick_all(&[&consumer]);
    assert_eq!(lab.dispose_calls.load(Ordering::SeqCst), 1);

    // Still tearing down: the status says so, and the slot stays held.
    assert!(matches!(
        consumer.coordinator.get_reservation_status(&id).unwrap(),
        ReservationStatus::PostReservation { finished: false, .. }
    ));
    let blocked = reserve(&consumer, "dummy2");
    tick_all(&[&consumer]);
    assert!(matches!(consumer.coordinator.get_reservation_status(&blocked).unwrap(), ReservationStatus::Waiting { .. }));

    clock.advance(300);
    tick_all(&[&consumer]);
    clock.advance(300);
    tick_all(&[&consumer]);
    assert_eq!(lab.dispose_calls.load(Ordering::SeqCst), 3);
    assert!(matches!(
        consumer.coordinator.get_reservation_status(&id).unwrap(),
        ReservationStatus::PostReservation { finished: true, .. }
    ));

    // The freed slot serves the queued reservation.
    wait_for_confirmed(&consumer, &blocked, &[&consumer]);
}

#[test]
fn broken_hardware_during_disposal_releases_and_breaks_the_slot() {
    let (_, shared) = MockClock::shared(0);
    let lab = ScriptedLab::instant();
    lab.broken_dispose.store(true, Ordering::SeqCst);
    let consumer = deployment("http://consumer/weblab/", shared, lab.clone(), &[("dummy2", 1)]);

    let id = reserve(&consumer, "dummy2");
    wait_for_confirmed(&consumer, &id, &[&consumer]);

    consumer.coordinator.finished_experiment(&id).unwrap();
    tick_all(&[&consumer]);

    // Forced to FINISHED with the failure recorded.
    match consumer.coordinator.get_reservation_status(&id).unwrap() {
        ReservationStatus::PostReservation { finished, end_data, .. } => {
            assert!(finished);
            assert!(end_data.get("error").is_some());
        }
        other => panic!("expected POST_RESERVATION, got {:?}", other),
    }

    // The broken resource is out of rotation: new requests keep waiting.
    let stuck = reserve(&consumer, "dummy2");
    for _ in 0..5 {
        tick_all(&[&consumer]);
    }
    assert!(matches!(consumer.coordinator.get_reservation_status(&stuck).unwrap(), ReservationStatus::Waiting { position: 0 }));

    // An operator repairing the device brings the slot back.
    lab.broken_dispose.store(false, Ordering::SeqCst);
    let resources = &consumer.coordinator.resources;
    let board = resources
        .lookup(
            &remote_lab_coordinator::domain::coordinator::id::ResourceTypeName::new("dummy2-board"),
            &remote_lab_coordinator::domain::coordinator::id::ResourceInstanceName::new("board1"),
        )
        .unwrap();
    resources.mark_slot_operational(board).unwrap();
    wait_for_confirmed(&consumer, &stuck, &[&consumer]);
}

#[test]
fn broken_hardware_during_initialization_finishes_the_reservation_with_an_error() {
    let (_, shared) = MockClock::shared(0);
    let lab = ScriptedLab::instant();
    lab.broken_init.store(true, Ordering::SeqCst);
    let consumer = deployment("http://consumer/weblab/", shared, lab.clone(), &[("dummy2", 1)]);

    let id = reserve(&consumer, "dummy2");
    // Promotion, the failing poll, then the disposal that follows it.
    for _ in 0..5 {
        tick_all(&[&consumer]);
    }

    assert!(matches!(
        consumer.coordinator.get_reservation_status(&id).unwrap(),
        ReservationStatus::PostReservation { finished: true, .. }
    ));
}

mod support;

use std::collections::HashSet;

use remote_lab_coordinator::domain::coordinator::reservation_status::ReservationStatus;

use support::{ScriptedLab, deployment, reserve, tick_all, wait_for_confirmed, wait_for_finished};

#[test]
fn waiting_positions_are_a_contiguous_permutation() {
    let (_, clock) = support::MockClock::shared(0);
    let lab = ScriptedLab::instant();
    let consumer = deployment("http://consumer/weblab/", clock, lab, &[("dummy2", 1)]);

    // One slot: the first reservation is promoted, the rest queue.
    let first = reserve(&consumer, "dummy2");
    wait_for_confirmed(&consumer, &first, &[&consumer]);

    let queued: Vec<_> = (0..4).map(|_| reserve(&consumer, "dummy2")).collect();
    tick_all(&[&consumer]);

    let mut positions = HashSet::new();
    for id in &queued {
        match consumer.coordinator.get_reservation_status(id).unwrap() {
            ReservationStatus::Waiting { position } => {
                assert!(positions.insert(position), "duplicate position {}", position);
            }
            other => panic!("expected WAITING, got {:?}", other),
        }
    }
    assert_eq!(positions, (0..4).collect::<HashSet<_>>());
}

#[test]
fn removing_a_waiting_reservation_compacts_the_positions() {
    let (_, clock) = support::MockClock::shared(0);
    let lab = ScriptedLab::instant();
    let consumer = deployment("http://consumer/weblab/", clock, lab, &[("dummy2", 1)]);

    let first = reserve(&consumer, "dummy2");
    wait_for_confirmed(&consumer, &first, &[&consumer]);

    let queued: Vec<_> = (0..3).map(|_| reserve(&consumer, "dummy2")).collect();
    tick_all(&[&consumer]);

    // Cancel the middle one; the later reservation moves up.
    consumer.coordinator.finished_experiment(&queued[1]).unwrap();

    let position_of = |id| match consumer.coordinator.get_reservation_status(id).unwrap() {
        ReservationStatus::Waiting { position } => position,
        other => panic!("expected WAITING, got {:?}", other),
    };
    assert_eq!(position_of(&queued[0]), 0);
    assert_eq!(position_of(&queued[2]), 1);

    match consumer.coordinator.get_reservation_status(&queued[1]).unwrap() {
        ReservationStatus::PostReservation { finished, .. } => assert!(finished),
        other => panic!("expected POST_RESERVATION, got {:?}", other),
    }
}

#[test]
fn queued_reservations_are_promoted_in_fifo_order_as_slots_free_up() {
    let (_, clock) = support::MockClock::shared(0);
    let lab = ScriptedLab::instant();
    let consumer = deployment("http://consumer/weblab/", clock, lab, &[("dummy2", 1)]);

    let first = reserve(&consumer, "dummy2");
    wait_for_confirmed(&consumer, &first, &[&consumer]);

    let second = reserve(&consumer, "dummy2");
    let third = reserve(&consumer, "dummy2");
    tick_all(&[&consumer]);

    // Finishing the running session promotes the head of the queue, not
    // the newest entry.
    consumer.coordinator.finished_experiment(&first).unwrap();
    wait_for_confirmed(&consumer, &second, &[&consumer]);
    assert!(matches!(consumer.coordinator.get_reservation_status(&third).unwrap(), ReservationStatus::Waiting { position: 0 }));

    consumer.coordinator.finished_experiment(&second).unwrap();
    wait_for_confirmed(&consumer, &third, &[&consumer]);

    consumer.coordinator.finished_experiment(&third).unwrap();
    wait_for_finished(&consumer, &third, &[&consumer]);
}

#[test]
fn a_reservation_never_stays_waiting_while_a_compatible_slot_is_free() {
    let (_, clock) = support::MockClock::shared(0);
    let lab = ScriptedLab::instant();
    let consumer = deployment("http://consumer/weblab/", clock, lab, &[("dummy2", 2)]);

    let first = reserve(&consumer, "dummy2");
    let second = reserve(&consumer, "dummy2");

    // Two slots, two reservations: both must be running after the passes.
    wait_for_confirmed(&consumer, &first, &[&consumer]);
    wait_for_confirmed(&consumer, &second, &[&consumer]);
}

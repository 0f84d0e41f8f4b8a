use std::fmt::Debug;

use crate::domain::coordinator::id::{ReservationId, WorkerId};
use crate::error::Result;

/// Per-schema lifecycle of one reservation. The only transitions are
/// WAITING -> WAITING_CONFIRMATION -> CONFIRMED -> FINISHED, plus a side
/// exit to FINISHED (with the error flag) from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingState {
    Waiting,
    WaitingConfirmation,
    Confirmed,
    Finished { error: bool },
}

/// The contract every scheduling schema must satisfy. The system ships one
/// implementation (the priority queue); alternative schedulers plug in
/// here.
///
/// A schema instance is scoped to a single experiment type. Several worker
/// threads may drive `tick` concurrently; implementations must rely on the
/// slot mutual-exclusion layer, not on being the only caller.
pub trait SchedulingSchema: Debug + Send + Sync {
    /// Adds the reservation to the WAITING set of its experiment type.
    /// Higher priority is served first; equal priorities are FIFO.
    fn enqueue(&self, reservation_id: ReservationId, priority: i32) -> Result<()>;

    /// 0-based rank among currently WAITING reservations of the same
    /// experiment type. `None` once the reservation left WAITING.
    fn position(&self, reservation_id: &ReservationId) -> Option<usize>;

    fn state_of(&self, reservation_id: &ReservationId) -> Option<SchedulingState>;

    /// One promotion pass: while a compatible free slot exists, promote the
    /// highest-ranked WAITING reservation onto it. A lost acquisition race
    /// leaves the reservation at the head for the next tick.
    fn tick(&self, worker: &WorkerId);

    /// Client-driven exit, legal in any state. WAITING reservations are
    /// removed from the queue (positions stay contiguous); promoted ones go
    /// through the disposal handshake before their slot is released.
    fn finish(&self, reservation_id: &ReservationId, error: bool) -> Result<()>;

    /// Initialization completed: WAITING_CONFIRMATION -> CONFIRMED.
    fn apply_confirmed(&self, reservation_id: &ReservationId);

    /// Disposal completed; the schema drops its state for the reservation.
    fn apply_disposed(&self, reservation_id: &ReservationId);

    /// Number of reservations currently counted against this schema for
    /// load-balancing purposes (WAITING + promoted, not yet disposed).
    fn load(&self) -> usize;

    /// Free slots not yet spoken for by the WAITING queue. The federation
    /// gateway dispatches into this capacity.
    fn free_capacity(&self) -> usize;
}

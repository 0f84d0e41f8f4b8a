use serde_json::Value;

use crate::domain::coordinator::catalog::experiment_catalog::ExperimentInstanceKey;
use crate::domain::coordinator::catalog::resource_catalog::ResourceInstanceKey;
use crate::domain::coordinator::id::{ExperimentId, ReservationId, WorkerId};

/// One student's request. Immutable after creation except `latest_access`,
/// which an external reaper uses for idle-session expiry.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: ReservationId,
    pub experiment_type: ExperimentId,
    pub latest_access: i64,

    /// Provided by the client; sent to the experiment server as a first command.
    pub client_initial_data: Value,
    /// Provided by the server side of the requesting deployment.
    pub server_initial_data: Value,
    /// Serialized request context: user agent, ip address, and similar.
    pub request_info: Value,
}

/// Promotion record: the reservation is active under some scheduling
/// schema. Keyed by the reservation id, so a second promotion attempt
/// fails on insertion.
///
/// The initialization handshake is polled, never blocked on: the hosting
/// server answers "ask me again in N milliseconds" until it is ready.
/// `latest_initialization`/`next_initialization_millis` both `None` means
/// initialization has finished.
#[derive(Debug, Clone)]
pub struct CurrentReservation {
    pub id: ReservationId,
    pub experiment_instance: ExperimentInstanceKey,
    pub resource: ResourceInstanceKey,
    pub promoted_at: i64,

    pub latest_initialization: Option<i64>,
    pub next_initialization_millis: Option<i64>,

    /// An is_initializing() call is in flight right now. Two workers could
    /// both observe this as false and decide to poll; the `initializer`
    /// identity is the tie-breaker: only the worker whose identity is
    /// recorded may perform the call and write back the result.
    pub currently_calling_initialization: bool,
    pub initializer: Option<WorkerId>,
    /// When the current claim was taken. Claims older than the configured
    /// lease may be reclaimed by another worker (crashed claimant).
    pub claim_timestamp: Option<i64>,

    /// Data returned by the experiment server when initialization finished.
    pub initial_data: Option<Value>,
}

impl CurrentReservation {
    pub fn new(id: ReservationId, experiment_instance: ExperimentInstanceKey, resource: ResourceInstanceKey, now: i64) -> Self {
        CurrentReservation {
            id,
            experiment_instance,
            resource,
            promoted_at: now,
            // Poll immediately on the first pass.
            latest_initialization: Some(now),
            next_initialization_millis: Some(0),
            currently_calling_initialization: false,
            initializer: None,
            claim_timestamp: None,
            initial_data: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.latest_initialization.is_none() || self.next_initialization_millis.is_none()
    }

    /// Records the server's "ask me again in `millis` ms" answer.
    pub fn next_initialization(&mut self, now: i64, millis: i64) {
        self.latest_initialization = Some(now);
        self.next_initialization_millis = Some(millis);
    }

    /// The next poll is due once the server-requested delay has elapsed.
    pub fn initialization_due(&self, now: i64) -> bool {
        match (self.latest_initialization, self.next_initialization_millis) {
            (Some(latest), Some(next)) => now >= latest + next,
            _ => false,
        }
    }
}

/// Archived outcome kept after a reservation leaves the active tables, for
/// clients that ask about it later. Retained until `expiration_date`.
#[derive(Debug, Clone)]
pub struct PostReservationRetrievedData {
    pub reservation_id: ReservationId,
    /// False while disposal is still running.
    pub finished: bool,
    pub date: i64,
    pub expiration_date: i64,
    /// Returned by the experiment server when initializing (useful for batch).
    pub initial_data: Value,
    /// Returned by the experiment server when disposing.
    pub end_data: Value,
}

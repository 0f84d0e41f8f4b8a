use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::coordinator::id::ReservationId;

/// Externally visible state of a reservation, as returned by
/// `get_reservation_status` and proxied 1:1 across federated deployments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    /// Queued. `position` is the 0-based rank among waiting reservations of
    /// the same experiment type.
    Waiting { position: usize },

    /// A slot was granted; the hosting server is still initializing.
    WaitingConfirmation,

    /// The session is running. `url` names the deployment actually hosting
    /// it (through any subcontracting chain) and `remote_reservation_id`
    /// the id under which that deployment knows the session; absent for
    /// locally hosted sessions.
    Confirmed {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remote_reservation_id: Option<ReservationId>,
    },

    /// The reservation left the active tables. `finished` is false while
    /// disposal is still running.
    PostReservation { finished: bool, initial_data: Value, end_data: Value },
}

impl ReservationStatus {
    pub fn is_active(&self) -> bool {
        !matches!(self, ReservationStatus::PostReservation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_round_trips_through_the_wire_encoding() {
        let status = ReservationStatus::Confirmed { url: "http://provider1/weblab/".to_string(), remote_reservation_id: Some(ReservationId::new("abc")) };

        let encoded = serde_json::to_string(&status).unwrap();
        let decoded: ReservationStatus = serde_json::from_str(&encoded).unwrap();
        assert_eq!(status, decoded);
    }

    #[test]
    fn waiting_status_carries_its_queue_position() {
        let encoded = serde_json::to_value(ReservationStatus::Waiting { position: 2 }).unwrap();
        assert_eq!(encoded, json!({"status": "WAITING", "position": 2}));
    }
}

use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::coordinator::id::{ExperimentId, ProviderId, ReservationId, SessionId};
use crate::domain::coordinator::reservation_status::ReservationStatus;
use crate::error::{Error, Result};

/// Outcome of a remote reserve call: the id under which the provider knows
/// the reservation, and the URL of the deployment serving it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteReservation {
    pub reservation_id: ReservationId,
    pub url: String,
}

/// Reservation API of a cooperating deployment, as consumed by the
/// federation gateway. The HTTP implementation talks to real remote
/// deployments; tests chain coordinators in-process through the same
/// trait.
pub trait DeploymentApi: std::fmt::Debug + Send + Sync {
    fn login(&self, username: &str, password: &str) -> Result<SessionId>;

    fn reserve_experiment(
        &self,
        session: &SessionId,
        experiment: &ExperimentId,
        client_initial_data: &Value,
        server_initial_data: &Value,
    ) -> Result<RemoteReservation>;

    fn get_reservation_status(&self, reservation_id: &ReservationId) -> Result<ReservationStatus>;

    fn finished_experiment(&self, reservation_id: &ReservationId) -> Result<()>;
}

/// One configured remote provider: credentials plus the session cached
/// across calls. Authentication happens once; a failed call drops the
/// cached session so the next attempt logs in again.
pub struct RemoteDeployment {
    pub provider_id: ProviderId,
    api: std::sync::Arc<dyn DeploymentApi>,
    username: String,
    password: String,
    session: RwLock<Option<SessionId>>,
}

impl std::fmt::Debug for RemoteDeployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteDeployment").field("provider_id", &self.provider_id).field("username", &self.username).finish()
    }
}

impl RemoteDeployment {
    pub fn new(provider_id: ProviderId, api: std::sync::Arc<dyn DeploymentApi>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { provider_id, api, username: username.into(), password: password.into(), session: RwLock::new(None) }
    }

    fn session(&self) -> Result<SessionId> {
        {
            let guard = self.session.read().expect("RwLock poisoned");
            if let Some(session) = guard.as_ref() {
                return Ok(session.clone());
            }
        }

        let session = self.api.login(&self.username, &self.password)?;
        let mut guard = self.session.write().expect("RwLock poisoned");
        *guard = Some(session.clone());
        Ok(session)
    }

    fn invalidate_session(&self) {
        let mut guard = self.session.write().expect("RwLock poisoned");
        *guard = None;
    }

    pub fn reserve(&self, experiment: &ExperimentId, client_initial_data: &Value, server_initial_data: &Value) -> Result<RemoteReservation> {
        let session = self.session()?;
        match self.api.reserve_experiment(&session, experiment, client_initial_data, server_initial_data) {
            Ok(reservation) => Ok(reservation),
            Err(Error::RemoteUnavailable { provider, message }) => {
                self.invalidate_session();
                Err(Error::RemoteUnavailable { provider, message })
            }
            Err(other) => Err(other),
        }
    }

    pub fn get_reservation_status(&self, reservation_id: &ReservationId) -> Result<ReservationStatus> {
        self.api.get_reservation_status(reservation_id)
    }

    pub fn finished_experiment(&self, reservation_id: &ReservationId) -> Result<()> {
        self.api.finished_experiment(reservation_id)
    }
}

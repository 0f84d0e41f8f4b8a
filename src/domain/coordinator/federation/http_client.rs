use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::coordinator::federation::deployment_api::{DeploymentApi, RemoteReservation};
use crate::domain::coordinator::id::{ExperimentId, ReservationId, SessionId};
use crate::domain::coordinator::reservation_status::ReservationStatus;
use crate::error::{Error, Result};

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    session_id: SessionId,
}

#[derive(Debug, Serialize)]
struct ReserveRequest<'a> {
    session_id: &'a SessionId,
    experiment_id: &'a ExperimentId,
    client_initial_data: &'a Value,
    server_initial_data: &'a Value,
}

/// Reservation API of a remote WebLab-compatible deployment over HTTP.
/// The async reqwest client is driven from the synchronous gateway
/// through a dedicated runtime.
#[derive(Debug)]
pub struct HttpDeploymentClient {
    base_url: String,
    runtime: tokio::runtime::Runtime,
    client: reqwest::Client,
}

impl HttpDeploymentClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into();
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let client = reqwest::Client::builder().build().map_err(|e| Error::RemoteUnavailable { provider: base_url.clone(), message: e.to_string() })?;

        Ok(Self { base_url, runtime, client })
    }

    fn unavailable(&self, error: impl std::fmt::Display) -> Error {
        Error::RemoteUnavailable { provider: self.base_url.clone(), message: error.to_string() }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn post_json<Req: Serialize, Resp: serde::de::DeserializeOwned>(&self, path: &str, body: &Req) -> Result<Resp> {
        let url = self.url(path);
        self.runtime.block_on(async {
            let response = self.client.post(&url).json(body).send().await.map_err(|e| self.unavailable(e))?;
            if !response.status().is_success() {
                return Err(self.unavailable(format!("{} returned {}", url, response.status())));
            }
            response.json::<Resp>().await.map_err(|e| self.unavailable(e))
        })
    }

    fn get_json<Resp: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Resp> {
        let url = self.url(path);
        self.runtime.block_on(async {
            let response = self.client.get(&url).send().await.map_err(|e| self.unavailable(e))?;
            if !response.status().is_success() {
                return Err(self.unavailable(format!("{} returned {}", url, response.status())));
            }
            response.json::<Resp>().await.map_err(|e| self.unavailable(e))
        })
    }
}

impl DeploymentApi for HttpDeploymentClient {
    fn login(&self, username: &str, password: &str) -> Result<SessionId> {
        let response: LoginResponse = self.post_json("/login", &LoginRequest { username, password })?;
        Ok(response.session_id)
    }

    fn reserve_experiment(
        &self,
        session: &SessionId,
        experiment: &ExperimentId,
        client_initial_data: &Value,
        server_initial_data: &Value,
    ) -> Result<RemoteReservation> {
        self.post_json(
            "/reservations",
            &ReserveRequest { session_id: session, experiment_id: experiment, client_initial_data, server_initial_data },
        )
    }

    fn get_reservation_status(&self, reservation_id: &ReservationId) -> Result<ReservationStatus> {
        self.get_json(&format!("/reservations/{}", reservation_id))
    }

    fn finished_experiment(&self, reservation_id: &ReservationId) -> Result<()> {
        let _: Value = self.post_json(&format!("/reservations/{}/finished", reservation_id), &Value::Null)?;
        Ok(())
    }
}

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use serde_json::json;

use remote_lab_coordinator::domain::clock::{SharedClock, SystemClock};
use remote_lab_coordinator::domain::coordinator::coordinator::{Coordinator, CoordinatorConfig, worker_identity};
use remote_lab_coordinator::domain::coordinator::federation::deployment_api::{DeploymentApi, RemoteReservation};
use remote_lab_coordinator::domain::coordinator::id::{
    ExperimentId, ExperimentInstanceName, LabAddress, ReservationId, ResourceInstanceName, ResourceTypeName, SessionId,
};
use remote_lab_coordinator::domain::coordinator::lab_server::{LabPoll, LaboratoryServer};
use remote_lab_coordinator::domain::coordinator::reservation_status::ReservationStatus;
use remote_lab_coordinator::error::{Error, Result};

/// Deterministic clock shared by every component of a test deployment.
#[derive(Debug, Clone)]
pub struct MockClock {
    millis: Arc<AtomicI64>,
}

impl MockClock {
    pub fn new(start: i64) -> Self {
        Self { millis: Arc::new(AtomicI64::new(start)) }
    }

    pub fn shared(start: i64) -> (Self, SharedClock) {
        let clock = Self::new(start);
        let shared = SharedClock(Arc::new(clock.clone()));
        (clock, shared)
    }

    pub fn advance(&self, ms: i64) {
        self.millis.fetch_add(ms, Ordering::SeqCst);
    }
}

impl SystemClock for MockClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }

    fn clone_box(&self) -> SharedClock {
        SharedClock(Arc::new(self.clone()))
    }
}

/// Laboratory server with scripted answers: a configurable number of
/// "ask me again" responses before completion, optional permanent
/// failures, and counters for the concurrency assertions.
#[derive(Debug)]
pub struct ScriptedLab {
    pub init_retries: AtomicUsize,
    pub init_retry_ms: i64,
    pub dispose_retries: AtomicUsize,
    pub dispose_retry_ms: i64,

    pub broken_init: AtomicBool,
    pub broken_dispose: AtomicBool,

    /// Widens the race window so claim violations would actually overlap.
    pub call_delay: Duration,

    pub init_calls: AtomicUsize,
    pub dispose_calls: AtomicUsize,
    concurrent_init: AtomicUsize,
    pub max_concurrent_init: AtomicUsize,
}

impl ScriptedLab {
    pub fn instant() -> Arc<Self> {
        Arc::new(Self::with_retries(0, 0, 0, 0))
    }

    pub fn with_retries(init_retries: usize, init_retry_ms: i64, dispose_retries: usize, dispose_retry_ms: i64) -> Self {
        Self {
            init_retries: AtomicUsize::new(init_retries),
            init_retry_ms,
            dispose_retries: AtomicUsize::new(dispose_retries),
            dispose_retry_ms,
            broken_init: AtomicBool::new(false),
            broken_dispose: AtomicBool::new(false),
            call_delay: Duration::ZERO,
            init_calls: AtomicUsize::new(0),
            dispose_calls: AtomicUsize::new(0),
            concurrent_init: AtomicUsize::new(0),
            max_concurrent_init: AtomicUsize::new(0),
        }
    }
}

impl LaboratoryServer for ScriptedLab {
    fn is_initializing(&self, _reservation_id: &ReservationId) -> Result<LabPoll> {
        let in_flight = self.concurrent_init.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_init.fetch_max(in_flight, Ordering::SeqCst);

        if !self.call_delay.is_zero() {
            thread::sleep(self.call_delay);
        }
        self.init_calls.fetch_add(1, Ordering::SeqCst);

        let result = if self.broken_init.load(Ordering::SeqCst) {
            Err(Error::HardwareBroken("device did not answer".to_string()))
        } else if self.init_retries.load(Ordering::SeqCst) > 0 {
            self.init_retries.fetch_sub(1, Ordering::SeqCst);
            Ok(LabPoll::RetryAfterMs(self.init_retry_ms))
        } else {
            Ok(LabPoll::Done(json!({ "batch": false })))
        };

        self.concurrent_init.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn dispose(&self, _reservation_id: &ReservationId) -> Result<LabPoll> {
        self.dispose_calls.fetch_add(1, Ordering::SeqCst);

        if self.broken_dispose.load(Ordering::SeqCst) {
            return Err(Error::HardwareBroken("device stuck during teardown".to_string()));
        }
        if self.dispose_retries.load(Ordering::SeqCst) > 0 {
            self.dispose_retries.fetch_sub(1, Ordering::SeqCst);
            return Ok(LabPoll::RetryAfterMs(self.dispose_retry_ms));
        }
        Ok(LabPoll::Done(json!({ "end": "ok" })))
    }
}

/// In-process implementation of the federation API: calls go straight into
/// another coordinator, which lets tests chain deployments the way remote
/// HTTP providers are chained in production.
#[derive(Debug)]
pub struct LoopbackDeployment {
    coordinator: Arc<Coordinator>,
}

impl LoopbackDeployment {
    pub fn new(coordinator: Arc<Coordinator>) -> Arc<Self> {
        Arc::new(Self { coordinator })
    }
}

impl DeploymentApi for LoopbackDeployment {
    fn login(&self, username: &str, _password: &str) -> Result<SessionId> {
        Ok(SessionId::new(format!("session-{}", username)))
    }

    fn reserve_experiment(
        &self,
        _session: &SessionId,
        experiment: &ExperimentId,
        client_initial_data: &serde_json::Value,
        server_initial_data: &serde_json::Value,
    ) -> Result<RemoteReservation> {
        let reservation_id = self.coordinator.reserve(experiment, client_initial_data.clone(), server_initial_data.clone(), json!({ "via": "federation" }))?;
        Ok(RemoteReservation { reservation_id, url: self.coordinator.deployment_url().to_string() })
    }

    fn get_reservation_status(&self, reservation_id: &ReservationId) -> Result<ReservationStatus> {
        self.coordinator.get_reservation_status(reservation_id)
    }

    fn finished_experiment(&self, reservation_id: &ReservationId) -> Result<()> {
        self.coordinator.finished_experiment(reservation_id)
    }
}

/// Deployment that is always unreachable. Lets tests exercise the
/// next-candidate fallback of the gateway.
#[derive(Debug)]
pub struct UnreachableDeployment {
    pub name: String,
}

impl DeploymentApi for UnreachableDeployment {
    fn login(&self, _username: &str, _password: &str) -> Result<SessionId> {
        Err(Error::RemoteUnavailable { provider: self.name.clone(), message: "connection refused".to_string() })
    }

    fn reserve_experiment(
        &self,
        _session: &SessionId,
        _experiment: &ExperimentId,
        _client_initial_data: &serde_json::Value,
        _server_initial_data: &serde_json::Value,
    ) -> Result<RemoteReservation> {
        Err(Error::RemoteUnavailable { provider: self.name.clone(), message: "connection refused".to_string() })
    }

    fn get_reservation_status(&self, _reservation_id: &ReservationId) -> Result<ReservationStatus> {
        Err(Error::RemoteUnavailable { provider: self.name.clone(), message: "connection refused".to_string() })
    }

    fn finished_experiment(&self, _reservation_id: &ReservationId) -> Result<()> {
        Err(Error::RemoteUnavailable { provider: self.name.clone(), message: "connection refused".to_string() })
    }
}

/// One assembled test deployment: a coordinator plus the scripted lab
/// behind all of its experiment instances.
pub struct TestDeployment {
    pub coordinator: Arc<Coordinator>,
    pub lab: Arc<ScriptedLab>,
}

pub fn experiment(name: &str) -> ExperimentId {
    ExperimentId::new(name, "Dummy experiments")
}

/// Builds a deployment hosting the given experiments, one dedicated
/// resource instance per (experiment, slot).
pub fn deployment(url: &str, clock: SharedClock, lab: Arc<ScriptedLab>, experiments: &[(&str, usize)]) -> TestDeployment {
    let coordinator = Coordinator::new(CoordinatorConfig::new(url), clock);
    let lab_address = LabAddress::new(format!("lab:{}", url));
    coordinator.register_lab_server(lab_address.clone(), lab.clone());

    for (name, slots) in experiments.iter().copied() {
        let resource_type = ResourceTypeName::new(format!("{}-board", name));
        coordinator.register_resource_type(resource_type.clone());

        for index in 0..slots {
            let resource = coordinator.register_resource_instance(resource_type.clone(), ResourceInstanceName::new(format!("board{}", index + 1))).unwrap();
            coordinator
                .register_experiment_instance(
                    experiment(name),
                    lab_address.clone(),
                    ExperimentInstanceName::new(format!("exp{}", index + 1)),
                    resource,
                )
                .unwrap();
        }
    }

    TestDeployment { coordinator, lab }
}

/// Runs one scheduling pass on every deployment.
pub fn tick_all(deployments: &[&TestDeployment]) {
    let worker = worker_identity(0);
    for deployment in deployments {
        deployment.coordinator.tick(&worker);
    }
}

/// Ticks the deployments until the reservation is CONFIRMED, and returns
/// the confirmed status.
pub fn wait_for_confirmed(consumer: &TestDeployment, reservation_id: &ReservationId, deployments: &[&TestDeployment]) -> ReservationStatus {
    for _ in 0..50 {
        tick_all(deployments);
        let status = consumer.coordinator.get_reservation_status(reservation_id).unwrap();
        if let ReservationStatus::Confirmed { .. } = status {
            return status;
        }
    }
    panic!(
        "reservation {} never reached CONFIRMED; last status: {:?}",
        reservation_id,
        consumer.coordinator.get_reservation_status(reservation_id)
    );
}

/// Ticks the deployments until the reservation reports a finished
/// post-reservation status.
pub fn wait_for_finished(consumer: &TestDeployment, reservation_id: &ReservationId, deployments: &[&TestDeployment]) {
    for _ in 0..50 {
        tick_all(deployments);
        if let Ok(ReservationStatus::PostReservation { finished: true, .. }) = consumer.coordinator.get_reservation_status(reservation_id) {
            return;
        }
    }
    panic!(
        "reservation {} never finished; last status: {:?}",
        reservation_id,
        consumer.coordinator.get_reservation_status(reservation_id)
    );
}

pub fn reserve(deployment: &TestDeployment, name: &str) -> ReservationId {
    deployment.coordinator.reserve(&experiment(name), json!({}), json!({}), json!({ "user_agent": "test" })).unwrap()
}

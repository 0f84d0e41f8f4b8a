use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use lazy_static::lazy_static;
use serde_json::Value;
use uuid::Uuid;

use crate::api::deployment_dto::DeploymentDto;
use crate::domain::clock::SharedClock;
use crate::domain::coordinator::catalog::experiment_catalog::{ExperimentCatalog, ExperimentInstanceKey};
use crate::domain::coordinator::catalog::resource_catalog::{ResourceCatalog, ResourceInstanceKey};
use crate::domain::coordinator::federation::deployment_api::{DeploymentApi, RemoteDeployment};
use crate::domain::coordinator::federation::gateway::FederationGateway;
use crate::domain::coordinator::federation::http_client::HttpDeploymentClient;
use crate::domain::coordinator::id::{
    ExperimentId, ExperimentInstanceName, LabAddress, ProviderId, ReservationId, ResourceInstanceName, ResourceTypeName, WorkerId,
};
use crate::domain::coordinator::lab_server::{LabServerRegistry, LaboratoryServer, NullLaboratoryServer};
use crate::domain::coordinator::lifecycle::lifecycle_manager::{LifecycleConfig, LifecycleEvent, LifecycleManager};
use crate::domain::coordinator::reservation::reservation_store::ReservationStore;
use crate::domain::coordinator::reservation_status::ReservationStatus;
use crate::domain::coordinator::scheduler::priority_queue_scheduler::PriorityQueueScheduler;
use crate::domain::coordinator::scheduler::scheduler_trait::SchedulingSchema;
use crate::domain::coordinator::slot::slot_lock::SlotLockLayer;
use crate::error::{Error, Result};

lazy_static! {
    /// Process-wide half of the worker identities, so claims taken by this
    /// process are distinguishable from claims of workers on other nodes.
    static ref PROCESS_IDENTITY: String = format!("process-{}", &Uuid::new_v4().to_string()[..8]);
}

/// Identity recorded in initialization/disposal claims, e.g.
/// "Thread-3@process-1f2e9a01".
pub fn worker_identity(thread_index: usize) -> WorkerId {
    WorkerId::new(format!("Thread-{}@{}", thread_index, *PROCESS_IDENTITY))
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// URL under which this deployment serves its confirmed sessions.
    pub deployment_url: String,
    pub lifecycle: LifecycleConfig,
    /// Reservations not touched for this long are expired by the tick
    /// sweep. `None` leaves idle monitoring to an external reaper.
    pub queue_timeout_ms: Option<i64>,
}

impl CoordinatorConfig {
    pub fn new(deployment_url: impl Into<String>) -> Self {
        CoordinatorConfig { deployment_url: deployment_url.into(), lifecycle: LifecycleConfig::default(), queue_timeout_ms: None }
    }
}

/// The reservation coordinator of one deployment: catalogs, reservation
/// store, scheduling schemas, lifecycle manager and federation gateway
/// wired together behind the transport-agnostic surface
/// `reserve` / `get_reservation_status` / `finished_experiment`.
pub struct Coordinator {
    config: CoordinatorConfig,
    clock: SharedClock,

    pub resources: ResourceCatalog,
    pub experiments: ExperimentCatalog,
    pub labs: LabServerRegistry,
    pub slots: SlotLockLayer,
    pub store: Arc<ReservationStore>,

    lifecycle: Arc<LifecycleManager>,
    gateway: FederationGateway,

    schedulers: RwLock<HashMap<ExperimentId, Arc<PriorityQueueScheduler>>>,
    remote_deployments: RwLock<HashMap<ProviderId, Arc<RemoteDeployment>>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator").field("deployment_url", &self.config.deployment_url).finish()
    }
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, clock: SharedClock) -> Arc<Self> {
        let resources = ResourceCatalog::new();
        let experiments = ExperimentCatalog::new();
        let labs = LabServerRegistry::new();
        let slots = SlotLockLayer::new();
        let store = Arc::new(ReservationStore::new(experiments.clone(), clock.clone()));

        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            slots.clone(),
            labs.clone(),
            experiments.clone(),
            resources.clone(),
            clock.clone(),
            config.lifecycle.clone(),
        ));
        let gateway = FederationGateway::new(config.deployment_url.clone(), store.clone(), lifecycle.clone());

        Arc::new(Self {
            config,
            clock,
            resources,
            experiments,
            labs,
            slots,
            store,
            lifecycle,
            gateway,
            schedulers: RwLock::new(HashMap::new()),
            remote_deployments: RwLock::new(HashMap::new()),
        })
    }

    pub fn deployment_url(&self) -> &str {
        &self.config.deployment_url
    }

    //----------------------------
    // --- Deployment assembly ---
    //----------------------------

    pub fn register_resource_type(&self, name: ResourceTypeName) {
        self.resources.register_resource_type(name);
    }

    pub fn register_resource_instance(&self, resource_type: ResourceTypeName, name: ResourceInstanceName) -> Result<ResourceInstanceKey> {
        self.resources.register_resource_instance(resource_type, name)
    }

    pub fn register_lab_server(&self, address: LabAddress, server: Arc<dyn LaboratoryServer>) {
        self.labs.register(address, server);
    }

    /// Registers a runnable experiment instance and makes sure a scheduling
    /// schema exists for its experiment type (the first instance of a type
    /// also registers the local provider with the gateway).
    pub fn register_experiment_instance(
        &self,
        experiment: ExperimentId,
        lab_address: LabAddress,
        instance_id: ExperimentInstanceName,
        resource: ResourceInstanceKey,
    ) -> Result<ExperimentInstanceKey> {
        let resource_type =
            self.resources.get(resource).map(|instance| instance.resource_type).ok_or_else(|| Error::ResourceNotFound(format!("{:?}", resource)))?;

        self.experiments.register_experiment_type(experiment.clone());
        let key = self.experiments.register_experiment_instance(experiment.clone(), lab_address, instance_id, resource, resource_type)?;

        let mut guard = self.schedulers.write().expect("RwLock poisoned");
        if !guard.contains_key(&experiment) {
            let scheduler = Arc::new(PriorityQueueScheduler::new(
                experiment.clone(),
                self.resources.clone(),
                self.experiments.clone(),
                self.slots.clone(),
                self.lifecycle.clone(),
            ));
            guard.insert(experiment.clone(), scheduler.clone());

            let schema: Arc<dyn SchedulingSchema> = scheduler;
            self.gateway.register_local_candidate(experiment, ProviderId::new("local"), schema);
        }

        Ok(key)
    }

    /// Registers a cooperating deployment. Experiment mappings are added
    /// separately with [`Coordinator::map_remote_experiment`]; the session
    /// towards the provider is cached across all of them.
    pub fn register_remote_deployment(
        &self,
        provider: ProviderId,
        api: Arc<dyn DeploymentApi>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Arc<RemoteDeployment> {
        let deployment = Arc::new(RemoteDeployment::new(provider.clone(), api, username, password));
        let mut guard = self.remote_deployments.write().expect("RwLock poisoned");
        guard.insert(provider, deployment.clone());
        deployment
    }

    /// Declares that `provider` serves `local_experiment` under the name
    /// `remote_experiment`, taking at most `max_concurrent` sessions from
    /// this deployment at once.
    pub fn map_remote_experiment(
        &self,
        provider: &ProviderId,
        local_experiment: ExperimentId,
        remote_experiment: ExperimentId,
        max_concurrent: usize,
    ) -> Result<()> {
        let deployment = {
            let guard = self.remote_deployments.read().expect("RwLock poisoned");
            guard.get(provider).cloned().ok_or_else(|| Error::ResourceNotFound(format!("remote deployment {}", provider)))?
        };

        self.experiments.register_experiment_type(local_experiment.clone());
        self.gateway.register_remote_candidate(local_experiment, deployment, remote_experiment, max_concurrent);
        Ok(())
    }

    //------------------------
    // --- Client surface  ---
    //------------------------

    pub fn reserve(&self, experiment: &ExperimentId, client_initial_data: Value, server_initial_data: Value, request_info: Value) -> Result<ReservationId> {
        let reservation_id = self.store.create_reservation(experiment, client_initial_data, server_initial_data, request_info)?;
        log::info!("Created reservation {} for {}.", reservation_id, experiment);

        if let Err(e) = self.gateway.submit(reservation_id.clone(), experiment) {
            log::error!("Reservation {} could not be routed: {}", reservation_id, e);
            self.lifecycle.archive_unpromoted(&reservation_id, true);
            return Err(e);
        }

        Ok(reservation_id)
    }

    pub fn get_reservation_status(&self, reservation_id: &ReservationId) -> Result<ReservationStatus> {
        // Status polls count as activity for the idle-expiry sweep.
        let _ = self.store.touch(reservation_id);

        if let Some(status) = self.gateway.status_of(reservation_id) {
            return status;
        }

        match self.store.get_post_reservation(reservation_id) {
            Some(post) => Ok(ReservationStatus::PostReservation { finished: post.finished, initial_data: post.initial_data, end_data: post.end_data }),
            None => Err(Error::ReservationNotFound(reservation_id.to_string())),
        }
    }

    pub fn finished_experiment(&self, reservation_id: &ReservationId) -> Result<()> {
        self.finish_internal(reservation_id, false)
    }

    fn finish_internal(&self, reservation_id: &ReservationId, error: bool) -> Result<()> {
        match self.gateway.finished(reservation_id, error) {
            Ok(()) => Ok(()),
            Err(Error::ReservationNotFound(_)) if self.store.get_post_reservation(reservation_id).is_some() => Ok(()),
            Err(e) => Err(e),
        }
    }

    //------------------------
    // --- Scheduling loop ---
    //------------------------

    /// One full scheduling pass. Any number of workers (threads or
    /// processes against a shared slot layer) may run this concurrently.
    pub fn tick(&self, worker: &WorkerId) {
        self.gateway.tick();

        let schedulers: Vec<Arc<PriorityQueueScheduler>> = {
            let guard = self.schedulers.read().expect("RwLock poisoned");
            guard.values().cloned().collect()
        };
        for scheduler in &schedulers {
            scheduler.tick(worker);
        }

        let mut events = self.lifecycle.poll_initializations(worker);
        events.extend(self.lifecycle.poll_disposals(worker));
        for event in events {
            self.route_event(event, &schedulers);
        }

        if let Some(timeout) = self.config.queue_timeout_ms {
            let cutoff = self.clock.now_millis() - timeout;
            for reservation_id in self.store.idle_since(cutoff) {
                log::warn!("Reservation {} idle past the queue timeout; expiring it.", reservation_id);
                if let Err(e) = self.finish_internal(&reservation_id, true) {
                    log::error!("Could not expire idle reservation {}: {}", reservation_id, e);
                }
            }
        }

        self.store.clean_expired_post_data();
    }

    fn route_event(&self, event: LifecycleEvent, schedulers: &[Arc<PriorityQueueScheduler>]) {
        let scheduler_of = |reservation_id: &ReservationId| {
            schedulers.iter().find(|scheduler| SchedulingSchema::state_of(scheduler.as_ref(), reservation_id).is_some())
        };

        match event {
            LifecycleEvent::Initialized { reservation } => {
                if let Some(scheduler) = scheduler_of(&reservation) {
                    scheduler.apply_confirmed(&reservation);
                }
            }
            LifecycleEvent::InitializationBroken { reservation } | LifecycleEvent::ConfirmationTimedOut { reservation } => {
                if let Err(e) = self.finish_internal(&reservation, true) {
                    log::error!("Could not force-finish broken reservation {}: {}", reservation, e);
                }
            }
            LifecycleEvent::Disposed { reservation } | LifecycleEvent::DisposalBroken { reservation } => {
                if let Some(scheduler) = scheduler_of(&reservation) {
                    scheduler.apply_disposed(&reservation);
                }
                self.gateway.forget(&reservation);
            }
        }
    }

    /// Spawns `count` named worker threads, each looping `tick` with the
    /// given interval until the pool is stopped.
    pub fn spawn_workers(self: &Arc<Self>, count: usize, interval: Duration) -> WorkerPool {
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(count);

        for index in 0..count {
            let coordinator = self.clone();
            let stop_flag = stop.clone();
            let handle = thread::Builder::new()
                .name(format!("Worker-{}", index))
                .spawn(move || {
                    let worker = worker_identity(index);
                    log::info!("Scheduler worker {} started.", worker);
                    while !stop_flag.load(Ordering::Relaxed) {
                        coordinator.tick(&worker);
                        thread::sleep(interval);
                    }
                    log::info!("Scheduler worker {} stopped.", worker);
                })
                .expect("Failed to spawn scheduler worker thread");
            handles.push(handle);
        }

        WorkerPool { stop, handles }
    }
}

impl Coordinator {
    /// Builds a coordinator from a parsed deployment configuration.
    ///
    /// Laboratory addresses found in the configuration get a
    /// [`crate::domain::coordinator::lab_server::NullLaboratoryServer`]
    /// stand-in; real hardware drivers replace them through
    /// [`Coordinator::register_lab_server`].
    pub fn from_dto(dto: DeploymentDto, clock: SharedClock) -> Result<Arc<Self>> {
        let mut config = CoordinatorConfig::new(dto.deployment_url.clone());
        if let Some(timeouts) = &dto.timeouts {
            if let Some(ms) = timeouts.initialization_lease_ms {
                config.lifecycle.initialization_lease_ms = ms;
            }
            if let Some(ms) = timeouts.confirmation_ceiling_ms {
                config.lifecycle.confirmation_ceiling_ms = ms;
            }
            if let Some(ms) = timeouts.post_data_retention_ms {
                config.lifecycle.post_data_retention_ms = ms;
            }
            config.queue_timeout_ms = timeouts.queue_timeout_ms;
        }

        let coordinator = Coordinator::new(config, clock);

        for resource_type in &dto.resource_types {
            let type_name = ResourceTypeName::new(resource_type.name.clone());
            coordinator.register_resource_type(type_name.clone());
            for instance in &resource_type.instances {
                coordinator.register_resource_instance(type_name.clone(), ResourceInstanceName::new(instance.clone()))?;
            }
        }

        for experiment in &dto.experiments {
            let experiment_id = ExperimentId::parse(&experiment.experiment_id)
                .ok_or_else(|| Error::ModelConstructionError(format!("malformed experiment id '{}'", experiment.experiment_id)))?;

            for instance in &experiment.instances {
                let resource = coordinator
                    .resources
                    .lookup(&ResourceTypeName::new(instance.resource_type.clone()), &ResourceInstanceName::new(instance.resource_instance.clone()))
                    .ok_or_else(|| {
                        Error::ModelConstructionError(format!(
                            "experiment instance '{}' references unknown resource {}:{}",
                            instance.instance_id, instance.resource_type, instance.resource_instance
                        ))
                    })?;

                let lab_address = LabAddress::new(instance.lab_address.clone());
                coordinator.labs.register(lab_address.clone(), Arc::new(NullLaboratoryServer));
                coordinator.register_experiment_instance(
                    experiment_id.clone(),
                    lab_address,
                    ExperimentInstanceName::new(instance.instance_id.clone()),
                    resource,
                )?;
            }
        }

        for provider in &dto.remote_providers {
            let provider_id = ProviderId::new(provider.name.clone());
            let api: Arc<dyn DeploymentApi> = Arc::new(HttpDeploymentClient::new(provider.base_url.clone())?);
            coordinator.register_remote_deployment(provider_id.clone(), api, provider.username.clone(), provider.password.clone());

            for mapping in &provider.experiments {
                let local = ExperimentId::parse(&mapping.local_experiment)
                    .ok_or_else(|| Error::ModelConstructionError(format!("malformed experiment id '{}'", mapping.local_experiment)))?;
                let remote = ExperimentId::parse(&mapping.remote_experiment)
                    .ok_or_else(|| Error::ModelConstructionError(format!("malformed experiment id '{}'", mapping.remote_experiment)))?;
                coordinator.map_remote_experiment(&provider_id, local, remote, mapping.max_concurrent)?;
            }
        }

        Ok(coordinator)
    }
}

/// Handle over the spawned scheduler workers.
pub struct WorkerPool {
    stop: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Signals all workers and joins them.
    pub fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.handles {
            if handle.join().is_err() {
                log::error!("A scheduler worker panicked while shutting down.");
            }
        }
    }
}

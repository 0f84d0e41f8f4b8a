use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::domain::coordinator::federation::deployment_api::RemoteDeployment;
use crate::domain::coordinator::federation::load_compare::CandidateLoadCompare;
use crate::domain::coordinator::id::{ExperimentId, ProviderId, ReservationId};
use crate::domain::coordinator::lifecycle::lifecycle_manager::LifecycleManager;
use crate::domain::coordinator::reservation::reservation_store::ReservationStore;
use crate::domain::coordinator::reservation_status::ReservationStatus;
use crate::domain::coordinator::scheduler::scheduler_trait::{SchedulingSchema, SchedulingState};
use crate::error::{Error, Result};

/// Default priority assigned to reservations entering a local queue.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Where a candidate's reservations actually run.
#[derive(Clone)]
pub enum CandidateBackend {
    /// A scheduling schema of this deployment.
    Local(Arc<dyn SchedulingSchema>),
    /// A cooperating deployment reached through its reservation API.
    /// `remote_experiment` is the experiment identifier under which the
    /// provider knows the experiment; `max_concurrent` bounds how many
    /// sessions this gateway routes there at once.
    Remote { deployment: Arc<RemoteDeployment>, remote_experiment: ExperimentId, max_concurrent: usize },
}

impl std::fmt::Debug for CandidateBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CandidateBackend::Local(_) => write!(f, "Local"),
            CandidateBackend::Remote { deployment, remote_experiment, max_concurrent } => f
                .debug_struct("Remote")
                .field("provider", &deployment.provider_id)
                .field("remote_experiment", remote_experiment)
                .field("max_concurrent", max_concurrent)
                .finish(),
        }
    }
}

/// One provider able to serve an experiment type, with the metadata the
/// load comparator sorts on.
#[derive(Debug, Clone)]
pub struct ProviderCandidate {
    pub id: ProviderId,
    pub registration_index: usize,
    /// Reservations this gateway routed to the candidate and that have not
    /// finished yet.
    pub outstanding: usize,
    pub backend: CandidateBackend,
}

impl ProviderCandidate {
    fn has_free_capacity(&self) -> bool {
        match &self.backend {
            CandidateBackend::Local(schema) => schema.free_capacity() > 0,
            CandidateBackend::Remote { max_concurrent, .. } => self.outstanding < *max_concurrent,
        }
    }
}

#[derive(Debug, Clone)]
enum Route {
    /// No candidate had capacity yet; the reservation queues here.
    Pending,
    Local { provider: ProviderId },
    Remote { provider: ProviderId, remote_id: ReservationId },
}

#[derive(Debug)]
struct RouteEntry {
    route: Route,
    finished: bool,
}

#[derive(Debug, Default)]
struct GatewayInner {
    candidates: HashMap<ExperimentId, Vec<ProviderCandidate>>,
    /// FIFO queues of reservations not yet dispatched to any candidate.
    pending: HashMap<ExperimentId, Vec<ReservationId>>,
    routes: HashMap<ReservationId, RouteEntry>,
}

/// Routes reservation requests across every provider able to serve the
/// requested experiment type, local scheduling schemas and remote
/// deployments alike, and proxies status/finish calls to wherever a
/// reservation ended up. Subcontracting chains need no special handling: a
/// remote provider consulted here may itself forward through its own
/// gateway, transparently to this one.
pub struct FederationGateway {
    /// URL under which this deployment serves confirmed local sessions.
    local_url: String,
    store: Arc<ReservationStore>,
    lifecycle: Arc<LifecycleManager>,
    comparator: CandidateLoadCompare,
    inner: RwLock<GatewayInner>,
}

impl std::fmt::Debug for FederationGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederationGateway").field("local_url", &self.local_url).field("inner", &self.inner).finish()
    }
}

impl FederationGateway {
    pub fn new(local_url: impl Into<String>, store: Arc<ReservationStore>, lifecycle: Arc<LifecycleManager>) -> Self {
        Self {
            local_url: local_url.into(),
            store,
            lifecycle,
            comparator: CandidateLoadCompare,
            inner: RwLock::new(GatewayInner::default()),
        }
    }

    pub fn register_local_candidate(&self, experiment: ExperimentId, provider: ProviderId, schema: Arc<dyn SchedulingSchema>) {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        let list = guard.candidates.entry(experiment).or_default();
        let registration_index = list.len();
        list.push(ProviderCandidate { id: provider, registration_index, outstanding: 0, backend: CandidateBackend::Local(schema) });
    }

    pub fn register_remote_candidate(
        &self,
        experiment: ExperimentId,
        deployment: Arc<RemoteDeployment>,
        remote_experiment: ExperimentId,
        max_concurrent: usize,
    ) {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        let list = guard.candidates.entry(experiment).or_default();
        let registration_index = list.len();
        list.push(ProviderCandidate {
            id: deployment.provider_id.clone(),
            registration_index,
            outstanding: 0,
            backend: CandidateBackend::Remote { deployment, remote_experiment, max_concurrent },
        });
    }

    pub fn has_candidates(&self, experiment: &ExperimentId) -> bool {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.candidates.get(experiment).map(|list| !list.is_empty()).unwrap_or(false)
    }

    /// Candidates to try for a new dispatch, best first, or `None` when the
    /// reservation should queue at the gateway.
    ///
    /// A single-candidate experiment always dispatches: the candidate's own
    /// queue is authoritative and status calls proxy 1:1. With several
    /// candidates the gateway keeps the queue itself and only dispatches
    /// into free capacity, so the least-loaded provider wins.
    fn dispatch_plan(&self, experiment: &ExperimentId) -> Option<Vec<ProviderCandidate>> {
        let guard = self.inner.read().expect("RwLock poisoned");
        let list = guard.candidates.get(experiment)?;

        match list.len() {
            0 => None,
            1 => Some(vec![list[0].clone()]),
            _ => {
                let mut free: Vec<ProviderCandidate> = list.iter().filter(|candidate| candidate.has_free_capacity()).cloned().collect();
                if free.is_empty() {
                    return None;
                }
                free.sort_by(|a, b| self.comparator.compare(a, b));
                Some(free)
            }
        }
    }

    /// Routes a freshly created reservation. Either dispatches it to a
    /// candidate right away or queues it at the gateway for a later tick.
    pub fn submit(&self, reservation_id: ReservationId, experiment: &ExperimentId) -> Result<()> {
        match self.dispatch_plan(experiment) {
            Some(ranked) => self.try_dispatch(reservation_id, experiment, ranked),
            None => {
                let mut guard = self.inner.write().expect("RwLock poisoned");
                guard.pending.entry(experiment.clone()).or_default().push(reservation_id.clone());
                guard.routes.insert(reservation_id, RouteEntry { route: Route::Pending, finished: false });
                Ok(())
            }
        }
    }

    fn try_dispatch(&self, reservation_id: ReservationId, experiment: &ExperimentId, ranked: Vec<ProviderCandidate>) -> Result<()> {
        let mut last_error: Option<Error> = None;

        for candidate in ranked {
            match &candidate.backend {
                CandidateBackend::Local(schema) => {
                    schema.enqueue(reservation_id.clone(), DEFAULT_PRIORITY)?;
                    self.record_route(reservation_id, experiment, &candidate.id, Route::Local { provider: candidate.id.clone() });
                    return Ok(());
                }
                CandidateBackend::Remote { deployment, remote_experiment, .. } => {
                    let (client_data, server_data) = self.reservation_payloads(&reservation_id)?;
                    match deployment.reserve(remote_experiment, &client_data, &server_data) {
                        Ok(remote) => {
                            tracing::info!(
                                "Reservation {} forwarded to provider {} as {} ({}).",
                                reservation_id,
                                candidate.id,
                                remote.reservation_id,
                                remote.url
                            );
                            self.record_route(
                                reservation_id,
                                experiment,
                                &candidate.id,
                                Route::Remote { provider: candidate.id.clone(), remote_id: remote.reservation_id },
                            );
                            return Ok(());
                        }
                        Err(Error::RemoteUnavailable { provider, message }) => {
                            log::warn!("Provider {} unavailable for {} ({}); trying the next candidate.", provider, experiment, message);
                            last_error = Some(Error::RemoteUnavailable { provider, message });
                            continue;
                        }
                        Err(other) => return Err(other),
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::RemoteUnavailable {
            provider: "any".to_string(),
            message: format!("no provider could serve {}", experiment),
        }))
    }

    fn record_route(&self, reservation_id: ReservationId, experiment: &ExperimentId, provider: &ProviderId, route: Route) {
        let mut guard = self.inner.write().expect("RwLock poisoned");

        if let Some(queue) = guard.pending.get_mut(experiment) {
            queue.retain(|id| id != &reservation_id);
        }
        if let Some(list) = guard.candidates.get_mut(experiment) {
            if let Some(candidate) = list.iter_mut().find(|candidate| &candidate.id == provider) {
                candidate.outstanding += 1;
            }
        }
        guard.routes.insert(reservation_id, RouteEntry { route, finished: false });
    }

    /// Re-evaluates the gateway queues: freed capacity picks up pending
    /// reservations in FIFO order.
    pub fn tick(&self) {
        let experiments: Vec<ExperimentId> = {
            let guard = self.inner.read().expect("RwLock poisoned");
            guard.pending.iter().filter(|(_, queue)| !queue.is_empty()).map(|(experiment, _)| experiment.clone()).collect()
        };

        for experiment in experiments {
            loop {
                let Some(ranked) = self.dispatch_plan(&experiment) else {
                    break;
                };
                let head = {
                    let guard = self.inner.read().expect("RwLock poisoned");
                    guard.pending.get(&experiment).and_then(|queue| queue.first().cloned())
                };
                let Some(head) = head else {
                    break;
                };

                if let Err(e) = self.try_dispatch(head.clone(), &experiment, ranked) {
                    log::warn!("Could not dispatch pending reservation {}: {}. Will retry.", head, e);
                    break;
                }
            }
        }
    }

    fn reservation_payloads(&self, reservation_id: &ReservationId) -> Result<(Value, Value)> {
        let handle = self.store.get(reservation_id).ok_or_else(|| Error::ReservationNotFound(reservation_id.to_string()))?;
        let reservation = handle.read().expect("RwLock poisoned");
        Ok((reservation.client_initial_data.clone(), reservation.server_initial_data.clone()))
    }

    fn candidate(&self, experiment: &ExperimentId, provider: &ProviderId) -> Option<ProviderCandidate> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.candidates.get(experiment)?.iter().find(|candidate| &candidate.id == provider).cloned()
    }

    /// Status of a routed reservation; `None` if this gateway never saw the
    /// id (the caller falls back to the post-reservation archive).
    pub fn status_of(&self, reservation_id: &ReservationId) -> Option<Result<ReservationStatus>> {
        let route = {
            let guard = self.inner.read().expect("RwLock poisoned");
            guard.routes.get(reservation_id).map(|entry| entry.route.clone())
        };

        let experiment = self.store.experiment_type_of(reservation_id);

        match route? {
            Route::Pending => {
                let guard = self.inner.read().expect("RwLock poisoned");
                let position = experiment
                    .and_then(|experiment| guard.pending.get(&experiment))
                    .and_then(|queue| queue.iter().position(|id| id == reservation_id))
                    .unwrap_or(0);
                Some(Ok(ReservationStatus::Waiting { position }))
            }
            Route::Local { provider } => {
                let experiment = experiment?;
                let candidate = self.candidate(&experiment, &provider)?;
                let CandidateBackend::Local(schema) = candidate.backend else {
                    return None;
                };

                let status = match schema.state_of(reservation_id) {
                    Some(SchedulingState::Waiting) => ReservationStatus::Waiting { position: schema.position(reservation_id).unwrap_or(0) },
                    Some(SchedulingState::WaitingConfirmation) => ReservationStatus::WaitingConfirmation,
                    Some(SchedulingState::Confirmed) => {
                        ReservationStatus::Confirmed { url: self.local_url.clone(), remote_reservation_id: None }
                    }
                    // Finished but not disposed yet, or already archived.
                    Some(SchedulingState::Finished { .. }) | None => match self.store.get_post_reservation(reservation_id) {
                        Some(post) => {
                            ReservationStatus::PostReservation { finished: post.finished, initial_data: post.initial_data, end_data: post.end_data }
                        }
                        None => ReservationStatus::PostReservation { finished: false, initial_data: Value::Null, end_data: Value::Null },
                    },
                };
                Some(Ok(status))
            }
            Route::Remote { provider, remote_id } => {
                let experiment = experiment?;
                let candidate = self.candidate(&experiment, &provider)?;
                let CandidateBackend::Remote { deployment, .. } = candidate.backend else {
                    return None;
                };
                // Proxied 1:1; a confirmed status keeps the innermost url
                // through any subcontracting chain.
                Some(deployment.get_reservation_status(&remote_id).map(|status| match status {
                    ReservationStatus::Confirmed { url, remote_reservation_id } => {
                        ReservationStatus::Confirmed { url, remote_reservation_id: remote_reservation_id.or(Some(remote_id)) }
                    }
                    other => other,
                }))
            }
        }
    }

    /// Finishes a routed reservation wherever it currently lives. Safe to
    /// call repeatedly.
    pub fn finished(&self, reservation_id: &ReservationId, error: bool) -> Result<()> {
        let (route, already_finished) = {
            let guard = self.inner.read().expect("RwLock poisoned");
            match guard.routes.get(reservation_id) {
                Some(entry) => (entry.route.clone(), entry.finished),
                None => return Err(Error::ReservationNotFound(reservation_id.to_string())),
            }
        };
        if already_finished {
            return Ok(());
        }

        let experiment = self.store.experiment_type_of(reservation_id);

        match route {
            Route::Pending => {
                let mut guard = self.inner.write().expect("RwLock poisoned");
                if let Some(experiment) = &experiment {
                    if let Some(queue) = guard.pending.get_mut(experiment) {
                        queue.retain(|id| id != reservation_id);
                    }
                }
                guard.routes.remove(reservation_id);
                drop(guard);

                self.lifecycle.archive_unpromoted(reservation_id, error);
                Ok(())
            }
            Route::Local { provider } => {
                let experiment = experiment.ok_or_else(|| Error::ReservationNotFound(reservation_id.to_string()))?;
                let candidate = self.candidate(&experiment, &provider).ok_or_else(|| Error::ResourceNotFound(provider.to_string()))?;
                let CandidateBackend::Local(schema) = &candidate.backend else {
                    return Err(Error::ResourceNotFound(provider.to_string()));
                };

                match schema.finish(reservation_id, error) {
                    Ok(()) | Err(Error::ReservationNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                self.mark_finished(reservation_id, &experiment, &provider, schema.state_of(reservation_id).is_none());
                Ok(())
            }
            Route::Remote { provider, remote_id } => {
                // The local archive row is written first, so a provider
                // failure cannot leave the reservation unfinishable.
                self.lifecycle.archive_unpromoted(reservation_id, error);
                if let Some(experiment) = &experiment {
                    self.mark_finished(reservation_id, experiment, &provider, true);
                }

                let deployment = experiment
                    .as_ref()
                    .and_then(|experiment| self.candidate(experiment, &provider))
                    .and_then(|candidate| match candidate.backend {
                        CandidateBackend::Remote { deployment, .. } => Some(deployment),
                        CandidateBackend::Local(_) => None,
                    });
                if let Some(deployment) = deployment {
                    if let Err(e) = deployment.finished_experiment(&remote_id) {
                        log::warn!("Provider {} failed to finish remote reservation {}: {}", provider, remote_id, e);
                    }
                }
                Ok(())
            }
        }
    }

    fn mark_finished(&self, reservation_id: &ReservationId, experiment: &ExperimentId, provider: &ProviderId, drop_route: bool) {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        if let Some(list) = guard.candidates.get_mut(experiment) {
            if let Some(candidate) = list.iter_mut().find(|candidate| &candidate.id == provider) {
                candidate.outstanding = candidate.outstanding.saturating_sub(1);
            }
        }
        if drop_route {
            guard.routes.remove(reservation_id);
        } else if let Some(entry) = guard.routes.get_mut(reservation_id) {
            entry.finished = true;
        }
    }

    /// Called once disposal completed: the route is no longer needed.
    pub fn forget(&self, reservation_id: &ReservationId) {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        guard.routes.remove(reservation_id);
    }

    pub fn knows(&self, reservation_id: &ReservationId) -> bool {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.routes.contains_key(reservation_id)
    }
}

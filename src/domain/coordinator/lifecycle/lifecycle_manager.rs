use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::{Value, json};

use crate::domain::clock::SharedClock;
use crate::domain::coordinator::catalog::experiment_catalog::{ExperimentCatalog, ExperimentInstanceKey};
use crate::domain::coordinator::catalog::resource_catalog::{ResourceCatalog, ResourceInstanceKey};
use crate::domain::coordinator::id::{ReservationId, WorkerId};
use crate::domain::coordinator::lab_server::{LabPoll, LabServerRegistry};
use crate::domain::coordinator::reservation::reservation::{CurrentReservation, PostReservationRetrievedData};
use crate::domain::coordinator::reservation::reservation_store::ReservationStore;
use crate::domain::coordinator::slot::slot_lock::SlotLockLayer;
use crate::error::{Error, Result};

/// Retry delay after a transient failure talking to a laboratory server
/// (server handle missing, transport hiccup). Not used when the server
/// itself asked for a specific delay.
const TRANSIENT_RETRY_MS: i64 = 1_000;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Age after which an initialization/disposal claim of a (presumably
    /// crashed) worker may be reclaimed.
    pub initialization_lease_ms: i64,
    /// Ceiling on the whole WAITING_CONFIRMATION phase; reservations
    /// exceeding it are treated as broken and force-disposed.
    pub confirmation_ceiling_ms: i64,
    /// How long archived post-reservation rows are retained.
    pub post_data_retention_ms: i64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        LifecycleConfig { initialization_lease_ms: 15_000, confirmation_ceiling_ms: 120_000, post_data_retention_ms: 3_600_000 }
    }
}

/// State transitions observed during a poll pass. The coordinator routes
/// them to the owning scheduling schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Initialization finished: WAITING_CONFIRMATION -> CONFIRMED.
    Initialized { reservation: ReservationId },
    /// The server reported a permanent failure while initializing.
    InitializationBroken { reservation: ReservationId },
    /// The WAITING_CONFIRMATION ceiling was exceeded.
    ConfirmationTimedOut { reservation: ReservationId },
    /// Disposal finished; the slot is free again.
    Disposed { reservation: ReservationId },
    /// Disposal reported a permanent failure; the slot was released and the
    /// resource marked broken.
    DisposalBroken { reservation: ReservationId },
}

/// Drives promoted reservations through the initialization-polling and
/// disposal handshakes with the hosting servers.
///
/// Any number of workers may run the poll passes concurrently. A claim
/// (`currently_calling_*` + holder identity + claim timestamp) makes sure
/// a given reservation is polled by at most one worker at a time; the
/// lease timeout recovers claims of crashed workers.
pub struct LifecycleManager {
    store: Arc<ReservationStore>,
    slots: SlotLockLayer,
    labs: LabServerRegistry,
    experiments: ExperimentCatalog,
    resources: ResourceCatalog,
    clock: SharedClock,
    config: LifecycleConfig,

    /// Promotion records, keyed by reservation id. Insertion is the
    /// "promote once" barrier: a second scheduling schema trying to promote
    /// the same reservation fails here.
    current: RwLock<HashMap<ReservationId, CurrentReservation>>,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager").field("current", &self.current).finish()
    }
}

impl LifecycleManager {
    pub fn new(
        store: Arc<ReservationStore>,
        slots: SlotLockLayer,
        labs: LabServerRegistry,
        experiments: ExperimentCatalog,
        resources: ResourceCatalog,
        clock: SharedClock,
        config: LifecycleConfig,
    ) -> Self {
        Self { store, slots, labs, experiments, resources, clock, config, current: RwLock::new(HashMap::new()) }
    }

    /// Creates the promotion record for a reservation that was just granted
    /// a slot.
    ///
    /// # Returns
    /// Returns `false` if the reservation is already promoted (under this
    /// or any other scheduling schema); the caller must release the slot it
    /// acquired.
    pub fn promote(&self, reservation_id: ReservationId, experiment_instance: ExperimentInstanceKey, resource: ResourceInstanceKey) -> bool {
        let mut guard = self.current.write().expect("RwLock poisoned");
        if guard.contains_key(&reservation_id) {
            log::error!("Reservation {} is already promoted; refusing the second promotion.", reservation_id);
            return false;
        }
        let now = self.clock.now_millis();
        guard.insert(reservation_id.clone(), CurrentReservation::new(reservation_id, experiment_instance, resource, now));
        true
    }

    /// Rolls a promotion back before any initialization poll happened.
    /// Used when the reservation turns out to have been finished while the
    /// promoting worker was still holding it.
    pub fn cancel_promotion(&self, reservation_id: &ReservationId) {
        let mut guard = self.current.write().expect("RwLock poisoned");
        guard.remove(reservation_id);
    }

    pub fn current_of(&self, reservation_id: &ReservationId) -> Option<CurrentReservation> {
        let guard = self.current.read().expect("RwLock poisoned");
        guard.get(reservation_id).cloned()
    }

    /// One initialization pass over all promoted, not yet initialized
    /// reservations whose next poll is due. `worker` is the identity
    /// recorded in the claims this pass takes.
    pub fn poll_initializations(&self, worker: &WorkerId) -> Vec<LifecycleEvent> {
        let now = self.clock.now_millis();
        let mut events = Vec::new();
        let mut claimed: Vec<(ReservationId, ExperimentInstanceKey)> = Vec::new();

        {
            let mut guard = self.current.write().expect("RwLock poisoned");
            for (id, record) in guard.iter_mut() {
                if record.is_initialized() {
                    continue;
                }

                // Once disposal owns the reservation, initialization stops.
                let disposing = self.slots.hold_of(record.resource).map(|hold| hold.disposing).unwrap_or(false);
                if disposing {
                    continue;
                }

                if now - record.promoted_at > self.config.confirmation_ceiling_ms {
                    tracing::warn!(
                        "Reservation {} exceeded the confirmation ceiling ({} ms); treating the experiment as broken.",
                        id,
                        self.config.confirmation_ceiling_ms
                    );
                    events.push(LifecycleEvent::ConfirmationTimedOut { reservation: id.clone() });
                    continue;
                }

                if !record.initialization_due(now) {
                    continue;
                }

                if record.currently_calling_initialization {
                    let stale = record.claim_timestamp.map(|taken| now - taken > self.config.initialization_lease_ms).unwrap_or(true);
                    if !stale {
                        continue;
                    }
                    tracing::warn!("Reclaiming stale initialization claim of {:?} on reservation {}.", record.initializer, id);
                }

                record.currently_calling_initialization = true;
                record.initializer = Some(worker.clone());
                record.claim_timestamp = Some(now);
                claimed.push((id.clone(), record.experiment_instance));
            }
        }

        // The actual hardware polls run without the map lock held.
        for (id, instance_key) in claimed {
            let result = self.call_is_initializing(&id, instance_key);
            let now = self.clock.now_millis();

            let mut guard = self.current.write().expect("RwLock poisoned");
            let Some(record) = guard.get_mut(&id) else {
                continue; // disposed while we were polling
            };
            if record.initializer.as_ref() != Some(worker) {
                // Our lease expired and another worker took over; its
                // result wins.
                continue;
            }

            record.currently_calling_initialization = false;
            record.initializer = None;
            record.claim_timestamp = None;

            match result {
                Ok(LabPoll::Done(data)) => {
                    record.latest_initialization = None;
                    record.next_initialization_millis = None;
                    record.initial_data = Some(data);
                    tracing::info!("Reservation {} finished initialization.", id);
                    events.push(LifecycleEvent::Initialized { reservation: id });
                }
                Ok(LabPoll::RetryAfterMs(ms)) => {
                    record.next_initialization(now, ms);
                }
                Err(Error::HardwareBroken(message)) => {
                    log::error!("Initialization of reservation {} failed permanently: {}", id, message);
                    events.push(LifecycleEvent::InitializationBroken { reservation: id });
                }
                Err(other) => {
                    log::warn!("Transient failure polling initialization of reservation {}: {}", id, other);
                    record.next_initialization(now, TRANSIENT_RETRY_MS);
                }
            }
        }

        events
    }

    fn call_is_initializing(&self, id: &ReservationId, instance_key: ExperimentInstanceKey) -> Result<LabPoll> {
        let instance = self
            .experiments
            .get(instance_key)
            .ok_or_else(|| Error::HardwareBroken(format!("experiment instance of reservation {} is gone", id)))?;
        self.labs.server_for(&instance.lab_address)?.is_initializing(id)
    }

    /// Flags the slot hold of a promoted reservation for disposal. The
    /// poll passes take it from there. Calling it again for a reservation
    /// already disposing is a no-op.
    pub fn begin_disposal(&self, reservation_id: &ReservationId) -> Result<()> {
        let record = self.current_of(reservation_id).ok_or_else(|| Error::ReservationNotFound(reservation_id.to_string()))?;

        self.slots.compare_and_update(
            record.resource,
            |hold| hold.reservation_id == *reservation_id && !hold.disposing,
            |hold| hold.disposing = true,
        )?;
        Ok(())
    }

    /// One disposal pass over all holds flagged for disposal whose next
    /// dispose() call is due.
    pub fn poll_disposals(&self, worker: &WorkerId) -> Vec<LifecycleEvent> {
        let now = self.clock.now_millis();
        let mut events = Vec::new();
        let mut claimed: Vec<(ResourceInstanceKey, ReservationId)> = Vec::new();

        for hold in self.slots.disposing_holds() {
            if !hold.dispose_due(now) {
                continue;
            }
            if hold.currently_calling_dispose {
                let stale = hold.claim_timestamp.map(|taken| now - taken > self.config.initialization_lease_ms).unwrap_or(true);
                if !stale {
                    continue;
                }
                tracing::warn!("Reclaiming stale disposal claim of {:?} on resource {:?}.", hold.disposer, hold.resource);
            }

            let reservation_id = hold.reservation_id.clone();
            let took_claim = self
                .slots
                .compare_and_update(
                    hold.resource,
                    |current| {
                        current.disposing
                            && current.reservation_id == reservation_id
                            && (!current.currently_calling_dispose
                                || current.claim_timestamp.map(|taken| now - taken > self.config.initialization_lease_ms).unwrap_or(true))
                    },
                    |current| {
                        current.currently_calling_dispose = true;
                        current.disposer = Some(worker.clone());
                        current.claim_timestamp = Some(now);
                    },
                )
                .unwrap_or(false);

            if took_claim {
                claimed.push((hold.resource, hold.reservation_id));
            }
        }

        for (resource, id) in claimed {
            let result = self.call_dispose(&id);
            let now = self.clock.now_millis();

            match result {
                Ok(LabPoll::Done(end_data)) => {
                    self.finish_disposal(resource, &id, end_data, now);
                    tracing::info!("Reservation {} disposed; resource {:?} released.", id, resource);
                    events.push(LifecycleEvent::Disposed { reservation: id });
                }
                Ok(LabPoll::RetryAfterMs(ms)) => {
                    let _ = self.slots.compare_and_update(
                        resource,
                        |hold| hold.disposer.as_ref() == Some(worker),
                        |hold| {
                            hold.currently_calling_dispose = false;
                            hold.disposer = None;
                            hold.claim_timestamp = None;
                            hold.latest_dispose = Some(now);
                            hold.next_dispose_millis = Some(ms);
                        },
                    );
                }
                Err(Error::HardwareBroken(message)) => {
                    log::error!("Disposal of reservation {} failed permanently: {}. Marking resource {:?} broken.", id, message, resource);
                    if let Err(e) = self.resources.mark_slot_broken(resource) {
                        log::error!("Could not mark resource {:?} broken: {}", resource, e);
                    }
                    self.finish_disposal(resource, &id, json!({ "error": message }), now);
                    events.push(LifecycleEvent::DisposalBroken { reservation: id });
                }
                Err(other) => {
                    log::warn!("Transient failure disposing reservation {}: {}", id, other);
                    let _ = self.slots.compare_and_update(
                        resource,
                        |hold| hold.disposer.as_ref() == Some(worker),
                        |hold| {
                            hold.currently_calling_dispose = false;
                            hold.disposer = None;
                            hold.claim_timestamp = None;
                            hold.latest_dispose = Some(now);
                            hold.next_dispose_millis = Some(TRANSIENT_RETRY_MS);
                        },
                    );
                }
            }
        }

        events
    }

    fn call_dispose(&self, id: &ReservationId) -> Result<LabPoll> {
        let record = self.current_of(id).ok_or_else(|| Error::ReservationNotFound(id.to_string()))?;
        let instance = self
            .experiments
            .get(record.experiment_instance)
            .ok_or_else(|| Error::HardwareBroken(format!("experiment instance of reservation {} is gone", id)))?;
        self.labs.server_for(&instance.lab_address)?.dispose(id)
    }

    /// Completes disposal: archives the outcome, drops the promotion record
    /// and releases the slot, in that order.
    fn finish_disposal(&self, resource: ResourceInstanceKey, id: &ReservationId, end_data: Value, now: i64) {
        let record = {
            let mut guard = self.current.write().expect("RwLock poisoned");
            guard.remove(id)
        };

        let initial_data = record.and_then(|r| r.initial_data).unwrap_or(Value::Null);
        self.store.archive_post_reservation(PostReservationRetrievedData {
            reservation_id: id.clone(),
            finished: true,
            date: now,
            expiration_date: now + self.config.post_data_retention_ms,
            initial_data,
            end_data,
        });

        self.slots.release(resource);
    }

    /// Archives a reservation that never held a slot (cancelled while
    /// WAITING, or expired in the queue). No disposal handshake is needed.
    pub fn archive_unpromoted(&self, reservation_id: &ReservationId, error: bool) {
        let now = self.clock.now_millis();
        self.store.archive_post_reservation(PostReservationRetrievedData {
            reservation_id: reservation_id.clone(),
            finished: true,
            date: now,
            expiration_date: now + self.config.post_data_retention_ms,
            initial_data: Value::Null,
            end_data: if error { json!({ "error": true }) } else { Value::Null },
        });
    }
}

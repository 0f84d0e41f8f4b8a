use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use rand::rng;
use rand::seq::SliceRandom;

use crate::domain::coordinator::catalog::experiment_catalog::{ExperimentCatalog, ExperimentInstanceKey};
use crate::domain::coordinator::catalog::resource_catalog::{ResourceCatalog, ResourceInstanceKey};
use crate::domain::coordinator::id::{ExperimentId, ReservationId, WorkerId};
use crate::domain::coordinator::lifecycle::lifecycle_manager::LifecycleManager;
use crate::domain::coordinator::scheduler::scheduler_trait::{SchedulingSchema, SchedulingState};
use crate::domain::coordinator::slot::slot_lock::SlotLockLayer;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct WaitingEntry {
    reservation_id: ReservationId,
    priority: i32,
    sequence: u64,
}

#[derive(Debug, Default)]
struct QueueInner {
    /// WAITING reservations, kept ordered by (priority descending,
    /// enqueue sequence ascending), so the index is the queue position.
    waiting: Vec<WaitingEntry>,

    /// Per-reservation scheduling state, including promoted ones.
    states: HashMap<ReservationId, SchedulingState>,

    /// Monotonic counter providing FIFO order within equal priorities.
    sequence: u64,
}

/// The shipped scheduling schema: a per-experiment-type priority queue.
///
/// Promotion grabs a slot through the mutual-exclusion layer, so several
/// instances of this scheduler (one per experiment type, driven by many
/// workers) can share resource instances without double-booking them.
pub struct PriorityQueueScheduler {
    experiment_type: ExperimentId,
    resources: ResourceCatalog,
    experiments: ExperimentCatalog,
    slots: SlotLockLayer,
    lifecycle: Arc<LifecycleManager>,
    inner: RwLock<QueueInner>,
}

impl std::fmt::Debug for PriorityQueueScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityQueueScheduler").field("experiment_type", &self.experiment_type).field("inner", &self.inner).finish()
    }
}

impl PriorityQueueScheduler {
    pub fn new(
        experiment_type: ExperimentId,
        resources: ResourceCatalog,
        experiments: ExperimentCatalog,
        slots: SlotLockLayer,
        lifecycle: Arc<LifecycleManager>,
    ) -> Self {
        Self { experiment_type, resources, experiments, slots, lifecycle, inner: RwLock::new(QueueInner::default()) }
    }

    pub fn experiment_type(&self) -> &ExperimentId {
        &self.experiment_type
    }

    /// Experiment instances of this type whose resource is operational and
    /// whose slot has no active hold.
    fn free_candidates(&self) -> Vec<(ExperimentInstanceKey, ResourceInstanceKey)> {
        self.experiments
            .instances_of_type(&self.experiment_type)
            .into_iter()
            .filter_map(|key| self.experiments.get(key).map(|instance| (key, instance.resource)))
            .filter(|(_, resource)| self.resources.is_operational(*resource) && self.slots.is_free(*resource))
            .collect()
    }

    /// Atomically claims the current queue head, so concurrent ticking
    /// workers never promote the same reservation twice.
    fn pop_head(&self) -> Option<WaitingEntry> {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        if guard.waiting.is_empty() { None } else { Some(guard.waiting.remove(0)) }
    }

    /// Puts a popped entry back. The sort key (priority, original sequence)
    /// restores its exact position.
    fn push_back(&self, entry: WaitingEntry) {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        let index = guard
            .waiting
            .iter()
            .position(|other| (-other.priority, other.sequence) > (-entry.priority, entry.sequence))
            .unwrap_or(guard.waiting.len());
        guard.waiting.insert(index, entry);
    }
}

impl SchedulingSchema for PriorityQueueScheduler {
    fn enqueue(&self, reservation_id: ReservationId, priority: i32) -> Result<()> {
        let mut guard = self.inner.write().expect("RwLock poisoned");

        if guard.states.contains_key(&reservation_id) {
            log::warn!("Reservation {} is already scheduled; ignoring the duplicate enqueue.", reservation_id);
            return Ok(());
        }

        let sequence = guard.sequence;
        guard.sequence += 1;

        let entry = WaitingEntry { reservation_id: reservation_id.clone(), priority, sequence };
        // Insert after every entry of higher or equal priority: FIFO within
        // equal priority.
        let index = guard.waiting.iter().position(|other| other.priority < priority).unwrap_or(guard.waiting.len());
        guard.waiting.insert(index, entry);
        guard.states.insert(reservation_id, SchedulingState::Waiting);

        Ok(())
    }

    fn position(&self, reservation_id: &ReservationId) -> Option<usize> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.waiting.iter().position(|entry| &entry.reservation_id == reservation_id)
    }

    fn state_of(&self, reservation_id: &ReservationId) -> Option<SchedulingState> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.states.get(reservation_id).copied()
    }

    fn tick(&self, worker: &WorkerId) {
        loop {
            let mut candidates = self.free_candidates();
            if candidates.is_empty() {
                return;
            }
            // Concurrent workers spread across the candidate slots instead
            // of all racing the first one.
            candidates.shuffle(&mut rng());

            let Some(entry) = self.pop_head() else {
                return;
            };

            let mut promoted = false;
            for (instance, resource) in candidates {
                match self.slots.acquire(resource, entry.reservation_id.clone()) {
                    Ok(()) => {
                        if self.lifecycle.promote(entry.reservation_id.clone(), instance, resource) {
                            let still_waiting = {
                                let mut guard = self.inner.write().expect("RwLock poisoned");
                                match guard.states.get(&entry.reservation_id) {
                                    Some(SchedulingState::Waiting) => {
                                        guard.states.insert(entry.reservation_id.clone(), SchedulingState::WaitingConfirmation);
                                        true
                                    }
                                    // The client finished it between pop and
                                    // promotion. Roll the promotion back.
                                    _ => false,
                                }
                            };
                            if still_waiting {
                                log::info!(
                                    "Worker {} promoted reservation {} of {} onto resource {:?}.",
                                    worker,
                                    entry.reservation_id,
                                    self.experiment_type,
                                    resource
                                );
                            } else {
                                self.lifecycle.cancel_promotion(&entry.reservation_id);
                                self.slots.release(resource);
                            }
                        } else {
                            // Already promoted under another schema. The
                            // slot must not stay bound to a dead attempt;
                            // the owning schema drives the reservation on.
                            log::error!("Reservation {} was already promoted elsewhere; dropping the local queue entry.", entry.reservation_id);
                            self.slots.release(resource);
                        }
                        promoted = true;
                        break;
                    }
                    Err(Error::SlotBusy) => continue, // lost the race, next candidate
                    Err(e) => {
                        log::error!("Unexpected error acquiring slot {:?}: {}", resource, e);
                        continue;
                    }
                }
            }

            if !promoted {
                // Every candidate was taken by a concurrent worker. Leave
                // the reservation at the head and retry next tick.
                self.push_back(entry);
                return;
            }
        }
    }

    fn finish(&self, reservation_id: &ReservationId, error: bool) -> Result<()> {
        let state = {
            let guard = self.inner.read().expect("RwLock poisoned");
            guard.states.get(reservation_id).copied()
        };

        match state {
            None => Err(Error::ReservationNotFound(reservation_id.to_string())),
            Some(SchedulingState::Waiting) => {
                let mut guard = self.inner.write().expect("RwLock poisoned");
                guard.waiting.retain(|entry| &entry.reservation_id != reservation_id);
                guard.states.remove(reservation_id);
                drop(guard);

                self.lifecycle.archive_unpromoted(reservation_id, error);
                Ok(())
            }
            Some(SchedulingState::WaitingConfirmation) | Some(SchedulingState::Confirmed) => {
                {
                    let mut guard = self.inner.write().expect("RwLock poisoned");
                    guard.states.insert(reservation_id.clone(), SchedulingState::Finished { error });
                }
                self.lifecycle.begin_disposal(reservation_id)
            }
            // Finishing twice is legal and does nothing.
            Some(SchedulingState::Finished { .. }) => Ok(()),
        }
    }

    fn apply_confirmed(&self, reservation_id: &ReservationId) {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        if guard.states.get(reservation_id) == Some(&SchedulingState::WaitingConfirmation) {
            guard.states.insert(reservation_id.clone(), SchedulingState::Confirmed);
        }
    }

    fn apply_disposed(&self, reservation_id: &ReservationId) {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        guard.states.remove(reservation_id);
    }

    fn load(&self) -> usize {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard
            .states
            .values()
            .filter(|state| matches!(state, SchedulingState::Waiting | SchedulingState::WaitingConfirmation | SchedulingState::Confirmed))
            .count()
    }

    fn free_capacity(&self) -> usize {
        let free_slots: HashSet<ResourceInstanceKey> = self.free_candidates().into_iter().map(|(_, resource)| resource).collect();
        let waiting = {
            let guard = self.inner.read().expect("RwLock poisoned");
            guard.waiting.len()
        };
        free_slots.len().saturating_sub(waiting)
    }
}

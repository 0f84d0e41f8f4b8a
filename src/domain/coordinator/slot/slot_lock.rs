use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::domain::coordinator::catalog::resource_catalog::ResourceInstanceKey;
use crate::domain::coordinator::id::{ReservationId, WorkerId};
use crate::error::{Error, Result};

/// Cross-scheduler exclusive hold on one resource slot. Exists only while a
/// reservation is using or releasing the slot.
///
/// The record doubles as the disposal ledger: whichever worker owns
/// disposal duty records its progress here, so a restarted worker can
/// resume the multi-step dispose handshake where it stopped.
#[derive(Debug, Clone)]
pub struct SlotHold {
    pub resource: ResourceInstanceKey,
    pub reservation_id: ReservationId,

    pub disposing: bool,
    pub latest_dispose: Option<i64>,
    pub next_dispose_millis: Option<i64>,

    /// A dispose() call is in flight right now; `disposer` names the worker
    /// allowed to record its result. Same claim discipline as
    /// initialization.
    pub currently_calling_dispose: bool,
    pub disposer: Option<WorkerId>,
    pub claim_timestamp: Option<i64>,
}

impl SlotHold {
    fn new(resource: ResourceInstanceKey, reservation_id: ReservationId) -> Self {
        SlotHold {
            resource,
            reservation_id,
            disposing: false,
            latest_dispose: None,
            next_dispose_millis: None,
            currently_calling_dispose: false,
            disposer: None,
            claim_timestamp: None,
        }
    }

    /// The next dispose() call is due. The first call (no recorded attempt
    /// yet) is always due.
    pub fn dispose_due(&self, now: i64) -> bool {
        match (self.latest_dispose, self.next_dispose_millis) {
            (Some(latest), Some(next)) => now >= latest + next,
            _ => true,
        }
    }
}

/// Mutual exclusion over resource slots shared by concurrent scheduling
/// schema workers. `acquire` is insert-if-absent: of any number of racing
/// acquirers exactly one succeeds, the rest observe `Error::SlotBusy` and
/// must retry against a different candidate slot. All other mutations go
/// through [`SlotLockLayer::compare_and_update`], which only applies when
/// the caller's expectation about the prior state still holds.
#[derive(Debug, Clone)]
pub struct SlotLockLayer {
    inner: Arc<RwLock<HashMap<ResourceInstanceKey, SlotHold>>>,
}

impl SlotLockLayer {
    pub fn new() -> Self {
        Self { inner: Arc::new(RwLock::new(HashMap::new())) }
    }

    pub fn acquire(&self, resource: ResourceInstanceKey, reservation_id: ReservationId) -> Result<()> {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        match guard.entry(resource) {
            std::collections::hash_map::Entry::Occupied(_) => Err(Error::SlotBusy),
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(SlotHold::new(resource, reservation_id));
                Ok(())
            }
        }
    }

    /// Removes the hold so any scheduling schema can use the slot again.
    pub fn release(&self, resource: ResourceInstanceKey) -> bool {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        guard.remove(&resource).is_some()
    }

    pub fn is_free(&self, resource: ResourceInstanceKey) -> bool {
        let guard = self.inner.read().expect("RwLock poisoned");
        !guard.contains_key(&resource)
    }

    pub fn hold_of(&self, resource: ResourceInstanceKey) -> Option<SlotHold> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.get(&resource).cloned()
    }

    /// Snapshot of the holds currently in the disposal phase.
    pub fn disposing_holds(&self) -> Vec<SlotHold> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.values().filter(|hold| hold.disposing).cloned().collect()
    }

    /// Compare-and-swap update: `expected` is evaluated against the current
    /// record under the write lock; `apply` runs only if it holds.
    ///
    /// # Returns
    /// Returns `Ok(true)` if the update was applied, `Ok(false)` if the
    /// expectation no longer held, `Err` if the hold record is gone.
    pub fn compare_and_update<E, A>(&self, resource: ResourceInstanceKey, expected: E, apply: A) -> Result<bool>
    where
        E: FnOnce(&SlotHold) -> bool,
        A: FnOnce(&mut SlotHold),
    {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        let hold = guard.get_mut(&resource).ok_or_else(|| Error::ResourceNotFound(format!("slot hold for {:?}", resource)))?;

        if !expected(hold) {
            return Ok(false);
        }

        apply(hold);
        Ok(true)
    }
}

impl Default for SlotLockLayer {
    fn default() -> Self {
        Self::new()
    }
}

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::{Value, json};

use crate::domain::coordinator::id::{LabAddress, ReservationId};
use crate::error::{Error, Result};

/// Answer of the hosting server to one initialization or disposal poll.
#[derive(Debug, Clone, PartialEq)]
pub enum LabPoll {
    /// The operation completed; the payload is the server-provided data.
    Done(Value),
    /// Not yet. Ask again after the given number of milliseconds.
    RetryAfterMs(i64),
}

/// The experiment-hosting server as seen by the coordinator. Hardware
/// drivers live behind this seam; both methods are idempotent and safe to
/// call repeatedly. A permanent hardware failure surfaces as
/// `Error::HardwareBroken`.
pub trait LaboratoryServer: std::fmt::Debug + Send + Sync {
    fn is_initializing(&self, reservation_id: &ReservationId) -> Result<LabPoll>;
    fn dispose(&self, reservation_id: &ReservationId) -> Result<LabPoll>;
}

/// Laboratory server with no hardware behind it: every poll completes
/// immediately. Stands in for real drivers in demos and deployments whose
/// experiments need no device initialization.
#[derive(Debug, Default)]
pub struct NullLaboratoryServer;

impl LaboratoryServer for NullLaboratoryServer {
    fn is_initializing(&self, _reservation_id: &ReservationId) -> Result<LabPoll> {
        Ok(LabPoll::Done(json!({})))
    }

    fn dispose(&self, _reservation_id: &ReservationId) -> Result<LabPoll> {
        Ok(LabPoll::Done(json!({})))
    }
}

/// Maps laboratory coordinate addresses to server handles.
#[derive(Debug, Clone, Default)]
pub struct LabServerRegistry {
    directory: Arc<RwLock<HashMap<LabAddress, Arc<dyn LaboratoryServer>>>>,
}

impl LabServerRegistry {
    pub fn new() -> Self {
        Self { directory: Arc::new(RwLock::new(HashMap::new())) }
    }

    pub fn register(&self, address: LabAddress, server: Arc<dyn LaboratoryServer>) {
        let mut guard = self.directory.write().expect("RwLock poisoned");
        guard.insert(address, server);
    }

    pub fn server_for(&self, address: &LabAddress) -> Result<Arc<dyn LaboratoryServer>> {
        let guard = self.directory.read().expect("RwLock poisoned");
        guard.get(address).cloned().ok_or_else(|| Error::ResourceNotFound(format!("laboratory server {}", address)))
    }
}

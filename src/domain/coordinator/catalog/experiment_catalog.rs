use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use slotmap::{SlotMap, new_key_type};

use crate::domain::coordinator::catalog::resource_catalog::ResourceInstanceKey;
use crate::domain::coordinator::id::{ExperimentId, ExperimentInstanceName, LabAddress, ResourceTypeName};
use crate::error::{Error, Result};

new_key_type! {
    pub struct ExperimentInstanceKey;
}

/// A runnable instance of an experiment type, bound to exactly one resource
/// instance and hosted by the server at `lab_address`.
#[derive(Debug, Clone)]
pub struct ExperimentInstance {
    pub experiment_type: ExperimentId,
    pub instance_id: ExperimentInstanceName,
    pub lab_address: LabAddress,
    pub resource: ResourceInstanceKey,
}

#[derive(Debug, Default)]
struct CatalogInner {
    /// Known experiment types, local or federated.
    types: HashSet<ExperimentId>,

    /// Experiment instance storage.
    instances: SlotMap<ExperimentInstanceKey, ExperimentInstance>,

    /// Index lookup internal key using the unique (type, instance id) pair.
    name_index: HashMap<(ExperimentId, ExperimentInstanceName), ExperimentInstanceKey>,

    /// Every resource type that ever backed an experiment type. The set only
    /// grows: reservations must still resolve their resource type after the
    /// backing instance has been decommissioned.
    has_or_had_resource_types: HashMap<ExperimentId, HashSet<ResourceTypeName>>,
}

/// Registry of experiment types and the instances implementing them.
#[derive(Debug, Clone)]
pub struct ExperimentCatalog {
    inner: Arc<RwLock<CatalogInner>>,
}

impl ExperimentCatalog {
    pub fn new() -> Self {
        Self { inner: Arc::new(RwLock::new(CatalogInner::default())) }
    }

    /// Registers an experiment type. Types backing only federated providers
    /// are registered too, with no local instances.
    pub fn register_experiment_type(&self, experiment_type: ExperimentId) {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        guard.types.insert(experiment_type);
    }

    pub fn has_type(&self, experiment_type: &ExperimentId) -> bool {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.types.contains(experiment_type)
    }

    /// Adds a runnable experiment instance bound to `resource` (the backing
    /// resource instance) of type `resource_type`. Records the resource type
    /// in the append-only historical association.
    pub fn register_experiment_instance(
        &self,
        experiment_type: ExperimentId,
        lab_address: LabAddress,
        instance_id: ExperimentInstanceName,
        resource: ResourceInstanceKey,
        resource_type: ResourceTypeName,
    ) -> Result<ExperimentInstanceKey> {
        let mut guard = self.inner.write().expect("RwLock poisoned");

        if !guard.types.contains(&experiment_type) {
            return Err(Error::ExperimentNotFound(experiment_type.to_string()));
        }

        let index_key = (experiment_type.clone(), instance_id.clone());
        if let Some(existing) = guard.name_index.get(&index_key) {
            return Ok(*existing);
        }

        let key = guard.instances.insert(ExperimentInstance { experiment_type: experiment_type.clone(), instance_id, lab_address, resource });
        guard.name_index.insert(index_key, key);
        guard.has_or_had_resource_types.entry(experiment_type).or_default().insert(resource_type);

        Ok(key)
    }

    /// Removes a decommissioned instance. The historical resource-type
    /// association is deliberately left untouched.
    pub fn remove_experiment_instance(&self, key: ExperimentInstanceKey) -> bool {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        match guard.instances.remove(key) {
            Some(instance) => {
                guard.name_index.remove(&(instance.experiment_type, instance.instance_id));
                true
            }
            None => false,
        }
    }

    pub fn get(&self, key: ExperimentInstanceKey) -> Option<ExperimentInstance> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.instances.get(key).cloned()
    }

    /// All resource types that ever backed the experiment type, including
    /// types whose instances have since been removed.
    pub fn resource_types_for_experiment(&self, experiment_type: &ExperimentId) -> Result<Vec<ResourceTypeName>> {
        let guard = self.inner.read().expect("RwLock poisoned");

        if !guard.types.contains(experiment_type) {
            return Err(Error::ExperimentNotFound(experiment_type.to_string()));
        }

        let mut types: Vec<ResourceTypeName> =
            guard.has_or_had_resource_types.get(experiment_type).map(|set| set.iter().cloned().collect()).unwrap_or_default();
        types.sort();
        Ok(types)
    }

    pub fn instances_of_type(&self, experiment_type: &ExperimentId) -> Vec<ExperimentInstanceKey> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.instances.iter().filter(|(_, instance)| &instance.experiment_type == experiment_type).map(|(key, _)| key).collect()
    }
}

impl Default for ExperimentCatalog {
    fn default() -> Self {
        Self::new()
    }
}

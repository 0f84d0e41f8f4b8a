use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use slotmap::{SlotMap, new_key_type};

use crate::domain::coordinator::id::{ResourceInstanceName, ResourceTypeName};
use crate::error::{Error, Result};

new_key_type! {
    pub struct ResourceInstanceKey;
}

/// One concrete device of a resource type, e.g. the board
/// "pld1-basement-of-eng-building" of type "ud-pld-device-board1".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInstance {
    pub resource_type: ResourceTypeName,
    pub name: ResourceInstanceName,
}

#[derive(Debug, Default)]
struct CatalogInner {
    /// Known resource types. A type exists independently of its instances.
    types: HashSet<ResourceTypeName>,

    /// Resource instance storage.
    instances: SlotMap<ResourceInstanceKey, ResourceInstance>,

    /// Index lookup internal key using the unique (type, name) pair.
    name_index: HashMap<(ResourceTypeName, ResourceInstanceName), ResourceInstanceKey>,

    /// Presence of a key here is the "current resource slot" marker: the
    /// instance is operational. Absence means broken or under maintenance.
    operational: HashSet<ResourceInstanceKey>,
}

/// Registry of resource types, their instances and the operational-slot
/// markers. Scheduling schemas only ever hand out instances present in the
/// operational set.
#[derive(Debug, Clone)]
pub struct ResourceCatalog {
    inner: Arc<RwLock<CatalogInner>>,
}

impl ResourceCatalog {
    pub fn new() -> Self {
        Self { inner: Arc::new(RwLock::new(CatalogInner::default())) }
    }

    pub fn register_resource_type(&self, name: ResourceTypeName) {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        if !guard.types.insert(name.clone()) {
            log::debug!("Resource type {} was already registered.", name);
        }
    }

    /// Adds an instance of an already registered resource type. The new
    /// instance starts operational (its slot marker is created).
    ///
    /// # Returns
    /// Returns the internal key of the instance; registering the same
    /// (type, name) pair again returns the existing key.
    pub fn register_resource_instance(&self, resource_type: ResourceTypeName, name: ResourceInstanceName) -> Result<ResourceInstanceKey> {
        let mut guard = self.inner.write().expect("RwLock poisoned");

        if !guard.types.contains(&resource_type) {
            return Err(Error::ResourceNotFound(format!("resource type {}", resource_type)));
        }

        let index_key = (resource_type.clone(), name.clone());
        if let Some(existing) = guard.name_index.get(&index_key) {
            return Ok(*existing);
        }

        let key = guard.instances.insert(ResourceInstance { resource_type, name });
        guard.name_index.insert(index_key, key);
        guard.operational.insert(key);

        Ok(key)
    }

    /// Creates the slot marker: the instance is available for scheduling.
    pub fn mark_slot_operational(&self, key: ResourceInstanceKey) -> Result<()> {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        if !guard.instances.contains_key(key) {
            return Err(Error::ResourceNotFound(format!("resource instance {:?}", key)));
        }
        guard.operational.insert(key);
        Ok(())
    }

    /// Removes the slot marker. Running reservations keep their hold on the
    /// slot until disposal completes; the instance just stops being a
    /// promotion candidate.
    pub fn mark_slot_broken(&self, key: ResourceInstanceKey) -> Result<()> {
        let mut guard = self.inner.write().expect("RwLock poisoned");
        if !guard.instances.contains_key(key) {
            return Err(Error::ResourceNotFound(format!("resource instance {:?}", key)));
        }
        guard.operational.remove(&key);
        Ok(())
    }

    pub fn is_operational(&self, key: ResourceInstanceKey) -> bool {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.operational.contains(&key)
    }

    pub fn get(&self, key: ResourceInstanceKey) -> Option<ResourceInstance> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.instances.get(key).cloned()
    }

    pub fn lookup(&self, resource_type: &ResourceTypeName, name: &ResourceInstanceName) -> Option<ResourceInstanceKey> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.name_index.get(&(resource_type.clone(), name.clone())).copied()
    }

    pub fn has_type(&self, resource_type: &ResourceTypeName) -> bool {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.types.contains(resource_type)
    }

    pub fn instances_of_type(&self, resource_type: &ResourceTypeName) -> Vec<ResourceInstanceKey> {
        let guard = self.inner.read().expect("RwLock poisoned");
        guard.instances.iter().filter(|(_, instance)| &instance.resource_type == resource_type).map(|(key, _)| key).collect()
    }
}

impl Default for ResourceCatalog {
    fn default() -> Self {
        Self::new()
    }
}

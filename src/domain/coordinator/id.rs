use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub struct Id<T> {
    pub id: String,
    _marker: PhantomData<T>,
}

impl<T> Id<T> {
    pub fn new(id: impl Into<String>) -> Self {
        Id { id: id.into(), _marker: PhantomData }
    }
}

impl<T> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl<T> From<Id<T>> for String {
    fn from(id_wrapper: Id<T>) -> Self {
        // We can consume the Id<T> and extract the inner String
        id_wrapper.id
    }
}

impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let full_name = std::any::type_name::<T>();
        let clean_name = full_name.split("::").last().unwrap_or(full_name);
        let display_name = clean_name.replace("Tag", "Id");

        write!(f, "{}: {:?}", display_name, self.id)
    }
}

// Ids travel over the federation wire as plain strings.
impl<T> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.id)
    }
}

impl<'de, T> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let id = String::deserialize(deserializer)?;
        Ok(Id::new(id))
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Copy)]
pub struct ReservationTag;
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Copy)]
pub struct ResourceTypeTag;
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Copy)]
pub struct ResourceInstanceTag;
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Copy)]
pub struct ExperimentInstanceTag;
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Copy)]
pub struct LabAddressTag;
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Copy)]
pub struct ProviderTag;
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Copy)]
pub struct WorkerTag;
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Copy)]
pub struct SessionTag;

/// 36-character random reservation identifier (uuid v4 string).
pub type ReservationId = Id<ReservationTag>;
pub type ResourceTypeName = Id<ResourceTypeTag>;
pub type ResourceInstanceName = Id<ResourceInstanceTag>;
pub type ExperimentInstanceName = Id<ExperimentInstanceTag>;
/// Coordinate address of the server hosting an experiment instance.
pub type LabAddress = Id<LabAddressTag>;
pub type ProviderId = Id<ProviderTag>;
/// Identity of one scheduler worker, e.g. "Thread-3@process-1f2e".
pub type WorkerId = Id<WorkerTag>;
pub type SessionId = Id<SessionTag>;

/// An experiment type as students request it: "dummy1@Dummy experiments".
/// The pair (experiment name, category name) is unique system-wide.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub struct ExperimentId {
    pub exp_name: String,
    pub cat_name: String,
}

impl ExperimentId {
    pub fn new(exp_name: impl Into<String>, cat_name: impl Into<String>) -> Self {
        ExperimentId { exp_name: exp_name.into(), cat_name: cat_name.into() }
    }

    /// Parses the "experiment@category" form used in configuration files
    /// and on the federation wire.
    pub fn parse(combined: &str) -> Option<Self> {
        let (exp_name, cat_name) = combined.split_once('@')?;
        if exp_name.is_empty() || cat_name.is_empty() {
            return None;
        }
        Some(ExperimentId::new(exp_name, cat_name))
    }
}

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.exp_name, self.cat_name)
    }
}

impl fmt::Debug for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExperimentId: {:?}", format!("{}@{}", self.exp_name, self.cat_name))
    }
}

impl Serialize for ExperimentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ExperimentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let combined = String::deserialize(deserializer)?;
        ExperimentId::parse(&combined)
            .ok_or_else(|| D::Error::custom(format!("expected 'experiment@category', got '{}'", combined)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn experiment_id_parses_the_combined_form() {
        let id = ExperimentId::parse("dummy1@Dummy experiments").unwrap();
        assert_eq!(id.exp_name, "dummy1");
        assert_eq!(id.cat_name, "Dummy experiments");
        assert_eq!(id.to_string(), "dummy1@Dummy experiments");
    }

    #[test]
    fn experiment_id_rejects_malformed_input() {
        assert!(ExperimentId::parse("no-separator").is_none());
        assert!(ExperimentId::parse("@category").is_none());
        assert!(ExperimentId::parse("name@").is_none());
    }
}

pub mod experiment_catalog;
pub mod resource_catalog;

use std::sync::Arc;

use crate::api::deployment_dto::DeploymentDto;
use crate::domain::clock::SharedClock;
use crate::domain::coordinator::coordinator::Coordinator;
use crate::error::Result;
use crate::loader::parser::parse_json_file;

pub mod api;
pub mod domain;
pub mod error;
pub mod loader;
pub mod logger;

pub fn build_coordinator(file_path: &str, clock: SharedClock) -> Result<Arc<Coordinator>> {
    logger::init();
    log::info!("Logger initialized. Starting coordinator construction.");

    let root_dto: DeploymentDto = parse_json_file::<DeploymentDto>(file_path)?;
    log::info!("Deployment file parsed successfully.");

    let coordinator = Coordinator::from_dto(root_dto, clock)?;
    log::info!("Reservation coordinator for '{}' constructed successfully.", coordinator.deployment_url());

    Ok(coordinator)
}

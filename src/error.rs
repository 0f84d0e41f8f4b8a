use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("File not found or could not be read: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse deployment JSON: {0}")]
    DeserializationError(#[from] serde_json::Error),

    #[error("Failed to build the deployment model: {0}")]
    ModelConstructionError(String),

    #[error("Experiment type not found: {0}")]
    ExperimentNotFound(String),

    #[error("Reservation not found: {0}")]
    ReservationNotFound(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Could not generate a unique reservation id after {0} attempts")]
    IdCollision(u32),

    #[error("Resource slot is already held by another scheduling schema")]
    SlotBusy,

    #[error("Remote provider '{provider}' unavailable: {message}")]
    RemoteUnavailable { provider: String, message: String },

    #[error("Hardware reported a permanent failure: {0}")]
    HardwareBroken(String),
}

pub type Result<T> = std::result::Result<T, Error>;

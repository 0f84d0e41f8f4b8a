use serde::Deserialize;

/// Root of a deployment configuration file. Describes the local resources
/// and experiments of one deployment plus the remote providers it
/// federates with.
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentDto {
    /// URL under which this deployment serves its confirmed sessions.
    pub deployment_url: String,

    #[serde(default)]
    pub resource_types: Vec<ResourceTypeDto>,

    #[serde(default)]
    pub experiments: Vec<ExperimentDto>,

    #[serde(default)]
    pub remote_providers: Vec<RemoteProviderDto>,

    #[serde(default)]
    pub timeouts: Option<TimeoutsDto>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceTypeDto {
    pub name: String,
    /// Names of the concrete devices of this type.
    #[serde(default)]
    pub instances: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentDto {
    /// "experiment@category" form, e.g. "dummy1@Dummy experiments".
    pub experiment_id: String,
    #[serde(default)]
    pub instances: Vec<ExperimentInstanceDto>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentInstanceDto {
    pub instance_id: String,
    /// Coordinate address of the hosting laboratory server.
    pub lab_address: String,
    pub resource_type: String,
    pub resource_instance: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteProviderDto {
    pub name: String,
    pub base_url: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub experiments: Vec<RemoteExperimentMapDto>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteExperimentMapDto {
    /// Experiment id under which this deployment's clients ask for it.
    pub local_experiment: String,
    /// Experiment id under which the provider knows it.
    pub remote_experiment: String,
    /// How many concurrent sessions this deployment routes to the provider
    /// for this experiment.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_max_concurrent() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsDto {
    pub initialization_lease_ms: Option<i64>,
    pub confirmation_ceiling_ms: Option<i64>,
    pub post_data_retention_ms: Option<i64>,
    pub queue_timeout_ms: Option<i64>,
}

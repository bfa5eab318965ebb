pub mod actuator;
pub mod config;
pub mod controller_ctx;
pub mod health_check_action;
pub mod indexer;
pub mod machine_action;
pub mod machine_set_action;
pub mod node_link_watcher;
mod shared_test_utils;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error(transparent)]
    KubeError(#[from] kube::Error),

    #[error("Watcher Error: {0}")]
    WatcherError(#[from] kube::runtime::watcher::Error),

    #[error("Validation Error: {0}")]
    ValidationError(String),

    #[error("Actuator Error: {0}")]
    ActuatorError(#[from] actuator::ActuatorError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = ControllerError> = std::result::Result<T, E>;

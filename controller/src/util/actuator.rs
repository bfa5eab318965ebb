use std::time::Duration;

use async_trait::async_trait;
use mapi_shared::mapi::machine::Machine;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

/// Failure modes a provider actuator may report.
///
/// The Machine reconciler translates these into queue operations: a
/// `RequeueAfter` becomes a deferred requeue with no error, everything
/// else propagates for backoff after its side effects are recorded.
#[derive(Error, Debug)]
pub enum ActuatorError {
    /// The operation is in progress; check again after the delay.
    #[error("requeue in {0:?}: {1}")]
    RequeueAfter(Duration, String),

    /// The machine can never be created as specified.
    #[error("invalid machine configuration: {0}")]
    InvalidConfiguration(String),

    /// The actuator could not even build its scope for the machine; the
    /// cloud was not touched.
    #[error("machine scope: {0}")]
    Scope(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Per-provider adapter performing cloud mutations for a Machine.
///
/// Implementations mutate the in-memory Machine (provider status, provider
/// id, addresses); the reconciler owns persistence.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Actuator: Send + Sync {
    async fn exists(&self, machine: &Machine) -> Result<bool, ActuatorError>;
    async fn create(&self, machine: &mut Machine) -> Result<(), ActuatorError>;
    async fn update(&self, machine: &mut Machine) -> Result<(), ActuatorError>;
    async fn delete(&self, machine: &Machine) -> Result<(), ActuatorError>;
}

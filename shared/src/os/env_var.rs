use mockall::automock;
use std::{env, env::VarError};

/// Mockable environment lookup. The controller configuration reads every
/// tunable (target namespace, feature gates, timeouts, metrics port)
/// through this seam so tests can inject values without touching the
/// process environment.
#[automock]
pub trait EnvVarQuery: Send + Sync {
    fn get_env_var(&self, name: &'static str) -> Result<String, VarError>;
}

pub struct ActualEnvVarQuery;
impl EnvVarQuery for ActualEnvVarQuery {
    /// Gets an environment variable using std::env::var
    ///
    /// Example
    /// ```
    /// use mapi_shared::os::env_var::EnvVarQuery;
    ///
    /// let env_query = mapi_shared::os::env_var::ActualEnvVarQuery{};
    /// assert_eq!(
    ///     std::env::var("TARGET_NAMESPACE"),
    ///     env_query.get_env_var("TARGET_NAMESPACE")
    /// );
    /// ```
    fn get_env_var(&self, name: &'static str) -> Result<String, VarError> {
        env::var(name)
    }
}

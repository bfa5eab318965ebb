use std::time::Duration;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::conditions::Condition;
use super::duration::parse_duration;
use super::PAUSED_ANNOTATION;

/// Condition type reporting whether the unhealthy budget permits
/// remediation.
pub const REMEDIATION_ALLOWED_CONDITION: &str = "RemediationAllowed";
/// Reason set on `RemediationAllowed` when the budget is exhausted.
pub const TOO_MANY_UNHEALTHY_REASON: &str = "TooManyUnhealthy";

/// A Node condition that marks the backing Machine unhealthy once it has
/// held for `timeout`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UnhealthyCondition {
    /// Node condition type to watch, e.g. `Ready`.
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Condition status that signals trouble, e.g. `False`.
    pub status: String,

    /// How long the condition may hold before remediation, e.g. `300s`.
    pub timeout: String,
}

impl UnhealthyCondition {
    pub fn timeout(&self) -> Option<Duration> {
        parse_duration(&self.timeout)
    }
}

/// Policy governing remediation of unhealthy Machines in a labelled fleet.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "machine.mapi.sh",
    version = "v1beta1",
    kind = "MachineHealthCheck",
    status = "MachineHealthCheckStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachineHealthCheckSpec {
    /// Selects the Machines this check covers.
    #[serde(default)]
    pub selector: LabelSelector,

    /// Checked in order; the first expired condition triggers remediation.
    #[serde(default)]
    pub unhealthy_conditions: Vec<UnhealthyCondition>,

    /// How long a Machine may run without a Node before it is considered
    /// failed. `0` disables the check; unset falls back to the controller
    /// default of ten minutes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_startup_timeout: Option<String>,

    /// Remediation budget: an absolute count or a percentage of expected
    /// machines such as `40%`. Defaults to `100%`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unhealthy: Option<IntOrString>,

    /// When set, remediation creates an object cloned from this template
    /// instead of deleting the Machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation_template: Option<ObjectReference>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineHealthCheckStatus {
    /// Count of non-deleting Machines the selector matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_machines: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_healthy: Option<i32>,

    /// Remediations the budget still permits.
    #[serde(default)]
    pub remediations_allowed: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

impl MachineHealthCheck {
    /// Remediation is disabled while the paused annotation is present.
    pub fn is_paused(&self) -> bool {
        self.annotations().contains_key(PAUSED_ANNOTATION)
    }

    /// Node startup timeout from the spec, or `default` when unset.
    /// `Duration::ZERO` disables the no-Node path.
    pub fn node_startup_timeout(&self, default: Duration) -> Duration {
        self.spec
            .node_startup_timeout
            .as_deref()
            .and_then(parse_duration)
            .unwrap_or(default)
    }
}

/// Resolves the `maxUnhealthy` budget against the expected machine count.
///
/// `None` means no budget was configured and remediation is unrestricted.
/// Unparseable or negative values return an error; callers deny
/// remediation in that case.
pub fn max_unhealthy_allowed(
    max_unhealthy: Option<&IntOrString>,
    expected: i32,
) -> Result<i32, String> {
    let resolved = match max_unhealthy {
        None => expected,
        Some(IntOrString::Int(value)) => *value,
        Some(IntOrString::String(value)) => {
            let trimmed = value.trim();
            if let Some(percent) = trimmed.strip_suffix('%') {
                let percent: i64 = percent
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid maxUnhealthy value: {value:?}"))?;
                (percent * i64::from(expected) / 100) as i32
            } else {
                trimmed
                    .parse()
                    .map_err(|_| format!("invalid maxUnhealthy value: {value:?}"))?
            }
        }
    };
    if resolved < 0 {
        return Err(format!("negative maxUnhealthy: {resolved}"));
    }
    Ok(resolved)
}

/// Renders the configured budget for events and condition messages.
pub fn format_max_unhealthy(max_unhealthy: Option<&IntOrString>) -> String {
    match max_unhealthy {
        None => "100%".to_string(),
        Some(IntOrString::Int(value)) => value.to_string(),
        Some(IntOrString::String(value)) => value.clone(),
    }
}

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type reporting whether a reconciler is paused because another
/// API is authoritative for the object.
pub const PAUSED_CONDITION: &str = "Paused";
/// Reason set on the `Paused` condition while reconciliation is suspended.
pub const PAUSED_REASON_AUTHORITY: &str = "AuthoritativeAPIisNotMachineAPI";
/// Reason set on the `Paused` condition while reconciliation is active.
pub const NOT_PAUSED_REASON: &str = "AuthoritativeAPIMachineAPI";

/// Condition type mirrored onto Machines by the NodeLink reconciler,
/// tracking readiness of the linked Node.
pub const NODE_READY_CONDITION: &str = "NodeReady";

pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";
pub const CONDITION_UNKNOWN: &str = "Unknown";

/// Last observed condition of a Machine API object.
///
/// The shape is shared by Machines, MachineSets and MachineHealthChecks.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of the condition, unique within the owning list.
    #[serde(rename = "type")]
    pub condition_type: String,

    /// One of `True`, `False`, `Unknown`.
    pub status: String,

    /// Severity for conditions with `status == False`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,

    /// Machine readable reason for the last transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human readable detail for the last transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time the condition status changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

impl Condition {
    pub fn new(condition_type: &str, status: &str) -> Self {
        Condition {
            condition_type: condition_type.to_string(),
            status: status.to_string(),
            severity: None,
            reason: None,
            message: None,
            last_transition_time: None,
        }
    }

    pub fn with_reason(mut self, reason: &str, message: &str) -> Self {
        self.reason = Some(reason.to_string());
        self.message = Some(message.to_string());
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == CONDITION_TRUE
    }
}

/// Upserts `condition` into `conditions`, keyed by condition type.
///
/// `last_transition_time` is only refreshed when the status actually flips,
/// so repeated reconciles do not churn the timestamp.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition, now: DateTime<Utc>) {
    match conditions
        .iter_mut()
        .find(|existing| existing.condition_type == condition.condition_type)
    {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            } else {
                condition.last_transition_time = Some(Time(now));
            }
            *existing = condition;
        }
        None => {
            condition.last_transition_time = Some(Time(now));
            conditions.push(condition);
        }
    }
}

pub fn get_condition<'a>(
    conditions: &'a [Condition],
    condition_type: &str,
) -> Option<&'a Condition> {
    conditions
        .iter()
        .find(|condition| condition.condition_type == condition_type)
}

/// Builds the `Paused` condition for a reconciler gated on AuthoritativeAPI.
pub fn paused_condition(paused: bool) -> Condition {
    if paused {
        Condition::new(PAUSED_CONDITION, CONDITION_TRUE).with_reason(
            PAUSED_REASON_AUTHORITY,
            "reconciliation is paused, the AuthoritativeAPI is not MachineAPI",
        )
    } else {
        Condition::new(PAUSED_CONDITION, CONDITION_FALSE).with_reason(
            NOT_PAUSED_REASON,
            "reconciliation is active, the AuthoritativeAPI is MachineAPI",
        )
    }
}

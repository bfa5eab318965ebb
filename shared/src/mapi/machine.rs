use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{NodeAddress, ObjectReference, Taint};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::conditions::Condition;
use super::{MACHINE_ROLE_LABEL, MASTER_ROLE};

/// Which controller stack owns an object. Values other than `MachineAPI`
/// pause the Machine API reconcilers for that object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub enum MachineAuthority {
    MachineAPI,
    ClusterAPI,
    Migrating,
}

/// True when reconciliation must pause because another stack owns the
/// object. Unset authority counts as MachineAPI.
pub fn authority_pauses(authority: Option<&MachineAuthority>) -> bool {
    !matches!(authority, None | Some(MachineAuthority::MachineAPI))
}

/// Lifecycle phase reported in `MachineStatus`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub enum MachinePhase {
    Provisioning,
    Provisioned,
    Running,
    Deleting,
    Failed,
}

impl fmt::Display for MachinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            MachinePhase::Provisioning => "Provisioning",
            MachinePhase::Provisioned => "Provisioned",
            MachinePhase::Running => "Running",
            MachinePhase::Deleting => "Deleting",
            MachinePhase::Failed => "Failed",
        };
        f.write_str(phase)
    }
}

/// Defines the desired state of a single cloud instance.
///
/// The provider specific portion is carried as an opaque blob; the typed
/// views live in [`super::providers`] and are only decoded where the
/// platform is known.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "machine.mapi.sh",
    version = "v1beta1",
    kind = "Machine",
    status = "MachineStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Provider specific configuration, opaque to the generic controllers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_spec: Option<Value>,

    /// Labels the NodeLink reconciler mirrors onto the linked Node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    /// Taints the NodeLink reconciler appends to the linked Node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taints: Option<Vec<Taint>>,

    /// Provider assigned instance identifier, set by the actuator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authoritative_api: Option<MachineAuthority>,
}

/// Most recently observed status of a Machine.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<MachinePhase>,

    /// Reference to the Node this Machine backs, maintained by NodeLink.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<ObjectReference>,

    /// Updated whenever this status is persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addresses: Option<Vec<NodeAddress>>,

    /// Provider specific status, opaque to the generic controllers. A
    /// `taskRef` entry references an in-flight cloud task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_status: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authoritative_api: Option<MachineAuthority>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

impl Machine {
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn is_master(&self) -> bool {
        self.labels().get(MACHINE_ROLE_LABEL).map(String::as_str) == Some(MASTER_ROLE)
    }

    /// `<namespace>/<name>` key used by the retry caches and indexes.
    pub fn machine_key(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }

    /// Reference to the in-flight cloud task recorded in the provider
    /// status, if any.
    pub fn task_ref(&self) -> Option<String> {
        let task = self
            .status
            .as_ref()?
            .provider_status
            .as_ref()?
            .get("taskRef")?
            .as_str()?;
        if task.is_empty() {
            None
        } else {
            Some(task.to_string())
        }
    }

    pub fn phase(&self) -> Option<&MachinePhase> {
        self.status.as_ref()?.phase.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_machine_deserializes_with_defaults() {
        let machine: Machine = serde_json::from_value(json!({
            "apiVersion": "machine.mapi.sh/v1beta1",
            "kind": "Machine",
            "metadata": { "name": "worker-0", "namespace": "mapi" },
            "spec": {}
        }))
        .unwrap();
        assert!(machine.spec.provider_spec.is_none());
        assert!(machine.status.is_none());
        assert!(!machine.is_deleting());
        assert_eq!(machine.machine_key(), "mapi/worker-0");
    }

    #[test]
    fn test_task_ref_ignores_empty_string() {
        let mut machine = Machine::new("worker-0", MachineSpec::default());
        machine.status = Some(MachineStatus {
            provider_status: Some(json!({ "taskRef": "" })),
            ..Default::default()
        });
        assert_eq!(machine.task_ref(), None);

        machine.status.as_mut().unwrap().provider_status = Some(json!({ "taskRef": "task-123" }));
        assert_eq!(machine.task_ref(), Some("task-123".to_string()));
    }

    #[test]
    fn test_phase_round_trips_as_pascal_case() {
        let status = MachineStatus {
            phase: Some(MachinePhase::Provisioning),
            ..Default::default()
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["phase"], json!("Provisioning"));
    }

    #[test]
    fn test_is_master_requires_role_label() {
        let mut machine = Machine::new("cp-0", MachineSpec::default());
        assert!(!machine.is_master());
        machine
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(MACHINE_ROLE_LABEL.to_string(), MASTER_ROLE.to_string());
        assert!(machine.is_master());
    }
}

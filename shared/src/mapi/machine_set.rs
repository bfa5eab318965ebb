use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::conditions::Condition;
use super::machine::{MachineAuthority, MachineSpec};

/// Ordering used to pick victims when a MachineSet scales down.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub enum MachineSetDeletePolicy {
    #[default]
    Random,
    Newest,
    Oldest,
}

/// Template stamped out for every Machine a MachineSet creates.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineTemplateSpec {
    /// Labels and annotations copied onto created Machines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<MachineSpec>,
}

/// Maintains a stable set of Machines matching a template.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "machine.mapi.sh",
    version = "v1beta1",
    kind = "MachineSet",
    status = "MachineSetStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetSpec {
    /// Desired number of Machines. Must be set before the reconciler acts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Label selector for Machines this set owns. Must match the template
    /// labels and must not be empty.
    #[serde(default)]
    pub selector: LabelSelector,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<MachineTemplateSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_policy: Option<MachineSetDeletePolicy>,

    /// Seconds a Machine must be ready before it counts as available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_ready_seconds: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authoritative_api: Option<MachineAuthority>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetStatus {
    /// Count of non-deleting Machines selected by this set.
    #[serde(default)]
    pub replicas: i32,

    /// Count of selected Machines whose labels match the template labels
    /// exactly.
    #[serde(default)]
    pub fully_labeled_replicas: i32,

    #[serde(default)]
    pub ready_replicas: i32,

    #[serde(default)]
    pub available_replicas: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authoritative_api: Option<MachineAuthority>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

impl MachineSet {
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn delete_policy(&self) -> MachineSetDeletePolicy {
        self.spec.delete_policy.clone().unwrap_or_default()
    }

    /// Labels from the embedded template metadata.
    pub fn template_labels(&self) -> std::collections::BTreeMap<String, String> {
        self.spec
            .template
            .as_ref()
            .and_then(|template| template.metadata.as_ref())
            .and_then(|metadata| metadata.labels.clone())
            .unwrap_or_default()
    }
}

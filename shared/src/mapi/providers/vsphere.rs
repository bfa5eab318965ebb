use serde::{Deserialize, Serialize};

use super::aws::SecretReference;

const DEFAULT_CREDENTIALS_SECRET: &str = "vsphere-cloud-credentials";
const DEFAULT_USER_DATA_SECRET: &str = "worker-user-data";
const DEFAULT_NUM_CPUS: i32 = 2;
const DEFAULT_MEMORY_MIB: i64 = 8192;
const DEFAULT_DISK_GIB: i32 = 120;
const MIN_MEMORY_MIB: i64 = 2048;

/// vCenter placement for a cloned virtual machine.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VSphereWorkspace {
    #[serde(default)]
    pub server: String,

    #[serde(default)]
    pub datacenter: String,

    #[serde(default)]
    pub datastore: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_pool: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VSphereNetworkDevice {
    #[serde(default)]
    pub network_name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VSphereNetwork {
    #[serde(default)]
    pub devices: Vec<VSphereNetworkDevice>,
}

/// Machine configuration for virtual machines cloned in vSphere.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VSphereProviderConfig {
    /// Name of the template virtual machine to clone.
    #[serde(default)]
    pub template: String,

    #[serde(default)]
    pub workspace: VSphereWorkspace,

    #[serde(default)]
    pub network: VSphereNetwork,

    #[serde(default, rename = "numCPUs")]
    pub num_cpus: i32,

    #[serde(default, rename = "memoryMiB")]
    pub memory_mib: i64,

    #[serde(default)]
    pub disk_gib: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<SecretReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_secret: Option<SecretReference>,
}

impl VSphereProviderConfig {
    pub fn apply_defaults(&mut self) {
        if self.num_cpus == 0 {
            self.num_cpus = DEFAULT_NUM_CPUS;
        }
        if self.memory_mib == 0 {
            self.memory_mib = DEFAULT_MEMORY_MIB;
        }
        if self.disk_gib == 0 {
            self.disk_gib = DEFAULT_DISK_GIB;
        }
        if self.credentials_secret.is_none() {
            self.credentials_secret = Some(SecretReference {
                name: DEFAULT_CREDENTIALS_SECRET.to_string(),
            });
        }
        if self.user_data_secret.is_none() {
            self.user_data_secret = Some(SecretReference {
                name: DEFAULT_USER_DATA_SECRET.to_string(),
            });
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.template.is_empty() {
            errors.push("providerSpec.template: required".to_string());
        }
        if self.workspace.server.is_empty() {
            errors.push("providerSpec.workspace.server: required".to_string());
        }
        if self.workspace.datacenter.is_empty() {
            errors.push("providerSpec.workspace.datacenter: required".to_string());
        }
        if self.workspace.datastore.is_empty() {
            errors.push("providerSpec.workspace.datastore: required".to_string());
        }
        if self.network.devices.is_empty() {
            errors.push("providerSpec.network.devices: at least one device required".to_string());
        }
        for (index, device) in self.network.devices.iter().enumerate() {
            if device.network_name.is_empty() {
                errors.push(format!(
                    "providerSpec.network.devices[{index}].networkName: required"
                ));
            }
        }
        if self.num_cpus < 0 {
            errors.push("providerSpec.numCPUs: must not be negative".to_string());
        }
        if self.memory_mib != 0 && self.memory_mib < MIN_MEMORY_MIB {
            errors.push(format!(
                "providerSpec.memoryMiB: must be at least {MIN_MEMORY_MIB}"
            ));
        }
        errors
    }
}

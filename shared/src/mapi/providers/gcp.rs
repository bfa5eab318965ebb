use serde::{Deserialize, Serialize};

use super::aws::SecretReference;

const DEFAULT_CREDENTIALS_SECRET: &str = "gcp-cloud-credentials";
const DEFAULT_USER_DATA_SECRET: &str = "worker-user-data";
const DEFAULT_MACHINE_TYPE: &str = "n1-standard-4";
const DEFAULT_DISK_SIZE_GB: i64 = 128;
const DEFAULT_DISK_TYPE: &str = "pd-ssd";
const MIN_BOOT_DISK_SIZE_GB: i64 = 16;

const VALID_DISK_TYPES: &[&str] = &["pd-standard", "pd-ssd", "pd-balanced"];

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GcpDisk {
    #[serde(default)]
    pub boot: bool,

    #[serde(default)]
    pub size_gb: i64,

    #[serde(rename = "type", default)]
    pub disk_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GcpNetworkInterface {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnetwork: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GcpServiceAccount {
    #[serde(default)]
    pub email: String,

    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Machine configuration for instances provisioned in GCE.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GcpProviderConfig {
    #[serde(default)]
    pub machine_type: String,

    #[serde(default)]
    pub zone: String,

    #[serde(rename = "projectID", default)]
    pub project_id: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<GcpDisk>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_interfaces: Vec<GcpNetworkInterface>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_accounts: Vec<GcpServiceAccount>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<SecretReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_secret: Option<SecretReference>,
}

impl GcpProviderConfig {
    pub fn apply_defaults(&mut self) {
        if self.machine_type.is_empty() {
            self.machine_type = DEFAULT_MACHINE_TYPE.to_string();
        }
        if self.disks.is_empty() {
            self.disks.push(GcpDisk {
                boot: true,
                size_gb: DEFAULT_DISK_SIZE_GB,
                disk_type: DEFAULT_DISK_TYPE.to_string(),
                image: None,
            });
        }
        for disk in &mut self.disks {
            if disk.disk_type.is_empty() {
                disk.disk_type = DEFAULT_DISK_TYPE.to_string();
            }
            if disk.size_gb == 0 {
                disk.size_gb = DEFAULT_DISK_SIZE_GB;
            }
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
        if self.machine_type.is_empty() {
            errors.push("providerSpec.machineType: required".to_string());
        }
        if self.zone.is_empty() {
            errors.push("providerSpec.zone: required".to_string());
        }
        if self.project_id.is_empty() {
            errors.push("providerSpec.projectID: required".to_string());
        }
        for (index, disk) in self.disks.iter().enumerate() {
            if disk.boot && disk.size_gb < MIN_BOOT_DISK_SIZE_GB {
                errors.push(format!(
                    "providerSpec.disks[{index}].sizeGb: boot disk must be at least {MIN_BOOT_DISK_SIZE_GB}GB"
                ));
            }
            if !disk.disk_type.is_empty() && !VALID_DISK_TYPES.contains(&disk.disk_type.as_str()) {
                errors.push(format!(
                    "providerSpec.disks[{index}].type: unknown type {:?}",
                    disk.disk_type
                ));
            }
        }
        errors
    }
}

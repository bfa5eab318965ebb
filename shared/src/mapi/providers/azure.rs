use serde::{Deserialize, Serialize};

use super::aws::SecretReference;

const DEFAULT_CREDENTIALS_SECRET: &str = "azure-cloud-credentials";
const DEFAULT_USER_DATA_SECRET: &str = "worker-user-data";
const DEFAULT_VM_SIZE: &str = "Standard_D4s_v3";
const DEFAULT_OS_DISK_SIZE_GB: i32 = 128;

const VALID_STORAGE_ACCOUNT_TYPES: &[&str] =
    &["Premium_LRS", "StandardSSD_LRS", "Standard_LRS", "UltraSSD_LRS"];

/// Marketplace or gallery image to boot from. Either the four marketplace
/// coordinates or a resource id must be given.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AzureImage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none", rename = "resourceID")]
    pub resource_id: Option<String>,
}

impl AzureImage {
    fn is_marketplace(&self) -> bool {
        self.publisher.is_some()
            && self.offer.is_some()
            && self.sku.is_some()
            && self.version.is_some()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AzureManagedDisk {
    #[serde(default)]
    pub storage_account_type: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AzureOsDisk {
    #[serde(default)]
    pub disk_size_gb: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_disk: Option<AzureManagedDisk>,
}

/// Machine configuration for instances provisioned in Azure.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AzureProviderConfig {
    #[serde(default)]
    pub vm_size: String,

    #[serde(default)]
    pub location: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<AzureImage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_disk: Option<AzureOsDisk>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vnet: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<SecretReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_secret: Option<SecretReference>,
}

impl AzureProviderConfig {
    pub fn apply_defaults(&mut self) {
        if self.vm_size.is_empty() {
            self.vm_size = DEFAULT_VM_SIZE.to_string();
        }
        let os_disk = self.os_disk.get_or_insert_with(Default::default);
        if os_disk.disk_size_gb == 0 {
            os_disk.disk_size_gb = DEFAULT_OS_DISK_SIZE_GB;
        }
        if os_disk.managed_disk.is_none() {
            os_disk.managed_disk = Some(AzureManagedDisk {
                storage_account_type: "Premium_LRS".to_string(),
            });
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
        if self.vm_size.is_empty() {
            errors.push("providerSpec.vmSize: required".to_string());
        }
        if self.location.is_empty() {
            errors.push("providerSpec.location: required".to_string());
        }
        match &self.image {
            None => errors.push("providerSpec.image: required".to_string()),
            Some(image) => {
                if !image.is_marketplace() && image.resource_id.is_none() {
                    errors.push(
                        "providerSpec.image: expected either resourceID or publisher/offer/sku/version"
                            .to_string(),
                    );
                }
            }
        }
        if let Some(os_disk) = &self.os_disk {
            if os_disk.disk_size_gb < 0 {
                errors.push("providerSpec.osDisk.diskSizeGB: must not be negative".to_string());
            }
            if let Some(managed) = &os_disk.managed_disk {
                if !managed.storage_account_type.is_empty()
                    && !VALID_STORAGE_ACCOUNT_TYPES
                        .contains(&managed.storage_account_type.as_str())
                {
                    errors.push(format!(
                        "providerSpec.osDisk.managedDisk.storageAccountType: unknown type {:?}",
                        managed.storage_account_type
                    ));
                }
            }
        }
        errors
    }
}

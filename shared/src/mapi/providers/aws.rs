use serde::{Deserialize, Serialize};

/// Secret name the credentials default to when unset.
const DEFAULT_CREDENTIALS_SECRET: &str = "aws-cloud-credentials";
/// Secret name the instance user data defaults to when unset.
const DEFAULT_USER_DATA_SECRET: &str = "worker-user-data";
const DEFAULT_INSTANCE_TYPE: &str = "m5.large";

/// Reference to an AWS object by id or by tag filters.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwsResourceReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arn: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<AwsFilter>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwsFilter {
    pub name: String,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwsPlacement {
    #[serde(default)]
    pub region: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenancy: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwsEbsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_size: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iops: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwsBlockDeviceMapping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ebs: Option<AwsEbsConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    #[serde(default)]
    pub name: String,
}

/// Machine configuration for instances provisioned in EC2.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwsProviderConfig {
    #[serde(default)]
    pub instance_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ami: Option<AwsResourceReference>,

    #[serde(default)]
    pub placement: AwsPlacement,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<AwsResourceReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iam_instance_profile: Option<AwsResourceReference>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_groups: Vec<AwsResourceReference>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub block_devices: Vec<AwsBlockDeviceMapping>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<SecretReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_secret: Option<SecretReference>,
}

impl AwsProviderConfig {
    pub fn apply_defaults(&mut self) {
        if self.instance_type.is_empty() {
            self.instance_type = DEFAULT_INSTANCE_TYPE.to_string();
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
        if self.instance_type.is_empty() {
            errors.push("providerSpec.instanceType: required".to_string());
        }
        match &self.ami {
            None => errors.push("providerSpec.ami: required".to_string()),
            Some(ami) => {
                if ami.id.is_none() && ami.arn.is_none() && ami.filters.is_empty() {
                    errors.push(
                        "providerSpec.ami: expected either id, arn or filters".to_string(),
                    );
                }
            }
        }
        if self.placement.region.is_empty() {
            errors.push("providerSpec.placement.region: required".to_string());
        }
        for (index, device) in self.block_devices.iter().enumerate() {
            let Some(ebs) = &device.ebs else { continue };
            if let Some(size) = ebs.volume_size {
                if size <= 0 {
                    errors.push(format!(
                        "providerSpec.blockDevices[{index}].ebs.volumeSize: must be positive"
                    ));
                }
            }
            if ebs.iops.is_some() && ebs.volume_type.as_deref() != Some("io1") {
                errors.push(format!(
                    "providerSpec.blockDevices[{index}].ebs.iops: only valid for io1 volumes"
                ));
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal() -> AwsProviderConfig {
        serde_json::from_value(json!({
            "ami": { "id": "ami-0123456789abcdef0" },
            "placement": { "region": "us-east-1" }
        }))
        .unwrap()
    }

    #[test]
    fn test_defaults_fill_secrets_and_instance_type() {
        let mut config = minimal();
        config.apply_defaults();
        assert_eq!(config.instance_type, DEFAULT_INSTANCE_TYPE);
        assert_eq!(
            config.credentials_secret.as_ref().unwrap().name,
            DEFAULT_CREDENTIALS_SECRET
        );
        assert_eq!(
            config.user_data_secret.as_ref().unwrap().name,
            DEFAULT_USER_DATA_SECRET
        );
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_validate_requires_ami_and_region() {
        let config = AwsProviderConfig::default();
        let errors = config.validate();
        assert!(errors.iter().any(|e| e.contains("instanceType")));
        assert!(errors.iter().any(|e| e.contains("ami")));
        assert!(errors.iter().any(|e| e.contains("placement.region")));
    }

    #[test]
    fn test_validate_rejects_iops_on_gp3() {
        let mut config = minimal();
        config.apply_defaults();
        config.block_devices = vec![AwsBlockDeviceMapping {
            device_name: None,
            ebs: Some(AwsEbsConfig {
                volume_size: Some(120),
                volume_type: Some("gp3".to_string()),
                iops: Some(3000),
            }),
        }];
        let errors = config.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("iops"));
    }
}

use std::str::FromStr;

use serde_json::Value;

pub mod aws;
pub mod azure;
pub mod gcp;
pub mod vsphere;

pub use aws::AwsProviderConfig;
pub use azure::AzureProviderConfig;
pub use gcp::GcpProviderConfig;
pub use vsphere::VSphereProviderConfig;

/// Cloud platform the cluster runs on, taken from the infrastructure
/// configuration. Selects which typed view decodes a provider spec.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Platform {
    Aws,
    Azure,
    Gcp,
    VSphere,
    /// No platform configured; provider specs stay opaque.
    #[default]
    None,
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "aws" => Ok(Platform::Aws),
            "azure" => Ok(Platform::Azure),
            "gcp" => Ok(Platform::Gcp),
            "vsphere" => Ok(Platform::VSphere),
            "" | "none" => Ok(Platform::None),
            other => Err(format!("unknown platform: {other:?}")),
        }
    }
}

/// Typed view over the opaque provider spec carried by a Machine.
///
/// Decoding dispatches on the platform tag; specs for platforms without a
/// typed view are kept verbatim and pass validation untouched.
#[derive(Clone, Debug, PartialEq)]
pub enum ProviderConfig {
    Aws(AwsProviderConfig),
    Azure(AzureProviderConfig),
    Gcp(GcpProviderConfig),
    VSphere(VSphereProviderConfig),
    Unknown(Value),
}

impl ProviderConfig {
    /// Decodes `raw` according to `platform`. A decode failure is a
    /// validation error, not an I/O error.
    pub fn decode(platform: Platform, raw: &Value) -> Result<Self, String> {
        let decoded = match platform {
            Platform::Aws => ProviderConfig::Aws(
                serde_json::from_value(raw.clone())
                    .map_err(|e| format!("providerSpec: not a valid AWS machine config: {e}"))?,
            ),
            Platform::Azure => ProviderConfig::Azure(
                serde_json::from_value(raw.clone())
                    .map_err(|e| format!("providerSpec: not a valid Azure machine config: {e}"))?,
            ),
            Platform::Gcp => ProviderConfig::Gcp(
                serde_json::from_value(raw.clone())
                    .map_err(|e| format!("providerSpec: not a valid GCP machine config: {e}"))?,
            ),
            Platform::VSphere => ProviderConfig::VSphere(
                serde_json::from_value(raw.clone()).map_err(|e| {
                    format!("providerSpec: not a valid vSphere machine config: {e}")
                })?,
            ),
            Platform::None => ProviderConfig::Unknown(raw.clone()),
        };
        Ok(decoded)
    }

    /// Fills platform defaults for fields the user may omit. Runs before
    /// [`ProviderConfig::validate`].
    pub fn apply_defaults(&mut self) {
        match self {
            ProviderConfig::Aws(config) => config.apply_defaults(),
            ProviderConfig::Azure(config) => config.apply_defaults(),
            ProviderConfig::Gcp(config) => config.apply_defaults(),
            ProviderConfig::VSphere(config) => config.apply_defaults(),
            ProviderConfig::Unknown(_) => {}
        }
    }

    /// Returns field-path qualified validation errors, empty when valid.
    pub fn validate(&self) -> Vec<String> {
        match self {
            ProviderConfig::Aws(config) => config.validate(),
            ProviderConfig::Azure(config) => config.validate(),
            ProviderConfig::Gcp(config) => config.validate(),
            ProviderConfig::VSphere(config) => config.validate(),
            ProviderConfig::Unknown(_) => Vec::new(),
        }
    }

    /// Serializes the (possibly defaulted) config back to the raw form
    /// stored on the Machine.
    pub fn to_raw(&self) -> Value {
        match self {
            ProviderConfig::Aws(config) => serde_json::to_value(config).unwrap_or(Value::Null),
            ProviderConfig::Azure(config) => serde_json::to_value(config).unwrap_or(Value::Null),
            ProviderConfig::Gcp(config) => serde_json::to_value(config).unwrap_or(Value::Null),
            ProviderConfig::VSphere(config) => serde_json::to_value(config).unwrap_or(Value::Null),
            ProviderConfig::Unknown(raw) => raw.clone(),
        }
    }
}

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::client::Client;

use super::mapi::{API_GROUP, API_VERSION};

pub mod api;
pub mod events;
pub mod node;
pub mod selector;

pub const ERROR_NOT_FOUND: u16 = 404;
pub const ERROR_CONFLICT: u16 = 409;

/// OwnershipType defines what type of Kubernetes object
/// an object is dependent on
#[derive(Clone, Debug)]
pub enum OwnershipType {
    MachineSet,
    Machine,
}

/// OwnershipInfo provides enough information to identify
/// the Kubernetes object an object depends on
#[derive(Clone, Debug)]
pub struct OwnershipInfo {
    object_type: OwnershipType,
    object_uid: String,
    object_name: String,
}

impl OwnershipInfo {
    pub fn new(object_type: OwnershipType, object_name: String, object_uid: String) -> Self {
        OwnershipInfo {
            object_type,
            object_uid,
            object_name,
        }
    }

    pub fn get_api_version(&self) -> String {
        match self.object_type {
            OwnershipType::MachineSet | OwnershipType::Machine => {
                format!("{}/{}", API_GROUP, API_VERSION)
            }
        }
    }

    pub fn get_kind(&self) -> String {
        match self.object_type {
            OwnershipType::MachineSet => "MachineSet",
            OwnershipType::Machine => "Machine",
        }
        .to_string()
    }

    pub fn get_controller(&self) -> Option<bool> {
        Some(true)
    }

    pub fn get_block_owner_deletion(&self) -> Option<bool> {
        Some(true)
    }

    pub fn get_name(&self) -> String {
        self.object_name.clone()
    }

    pub fn get_uid(&self) -> String {
        self.object_uid.clone()
    }

    /// Builds the controller OwnerReference for this owner.
    pub fn to_owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.get_api_version(),
            kind: self.get_kind(),
            name: self.get_name(),
            uid: self.get_uid(),
            controller: self.get_controller(),
            block_owner_deletion: self.get_block_owner_deletion(),
        }
    }
}

/// Returns the controller OwnerReference of an object, if any.
pub fn controller_owner(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|reference| reference.controller.unwrap_or(false))
}

/// Wrapper around a real cluster connection, used wherever the mockable
/// [`api::IntoApi`] traits need a concrete implementation.
#[derive(Clone)]
pub struct KubeImpl {
    pub(crate) client: Client,
}

impl KubeImpl {
    /// Create a KubeImpl from the in-cluster or local kubeconfig.
    pub async fn new() -> anyhow::Result<Self> {
        Ok(KubeImpl {
            client: Client::try_default().await?,
        })
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }
}

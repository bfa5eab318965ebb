use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use mapi_shared::k8s::api::{IntoApi, IntoDynApi};
use mapi_shared::k8s::events::EventSink;
use mapi_shared::mapi::health_check::MachineHealthCheck;
use mapi_shared::mapi::machine::Machine;
use mapi_shared::mapi::machine_set::MachineSet;
use serde_json::Value;
use tokio::sync::RwLock;

use super::config::ControllerConfig;
use super::indexer::Indexer;

pub trait ControllerKubeClient:
    IntoApi<Machine> + IntoApi<MachineSet> + IntoApi<MachineHealthCheck> + IntoApi<Node> + IntoDynApi
{
}

impl<
        T: IntoApi<Machine>
            + IntoApi<MachineSet>
            + IntoApi<MachineHealthCheck>
            + IntoApi<Node>
            + IntoDynApi,
    > ControllerKubeClient for T
{
}

pub struct ControllerContext {
    /// Kubernetes client
    pub client: Arc<dyn ControllerKubeClient>,
    pub events: Arc<dyn EventSink>,
    pub config: ControllerConfig,
    /// Secondary indexes over Machines and Nodes, fed by the watch streams.
    pub indexer: Arc<RwLock<Indexer>>,
    /// In-flight cloud task per Machine key. Only the Machine reconcile
    /// path mutates this; the work queue serializes per key.
    pub task_ids: Arc<RwLock<HashMap<String, String>>>,
    /// Provider status whose persistence failed, per Machine key, replayed
    /// on the next reconcile.
    pub failed_provider_status: Arc<RwLock<HashMap<String, Value>>>,
    /// Last observed `(ready, deleting)` per Node name; NodeRef updates
    /// fire when either flips.
    pub node_readiness: Arc<RwLock<HashMap<String, (bool, bool)>>>,
}

impl ControllerContext {
    pub fn new(
        client: Arc<dyn ControllerKubeClient>,
        events: Arc<dyn EventSink>,
        config: ControllerConfig,
    ) -> Self {
        ControllerContext {
            client,
            events,
            config,
            indexer: Arc::new(RwLock::new(Indexer::default())),
            task_ids: Arc::new(RwLock::new(HashMap::new())),
            failed_provider_status: Arc::new(RwLock::new(HashMap::new())),
            node_readiness: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Machine api scoped to the namespace of the object under reconcile.
    pub fn machines(&self, namespace: &str) -> Box<dyn mapi_shared::k8s::api::Api<Machine>> {
        IntoApi::<Machine>::namespaced(self.client.as_ref(), namespace)
    }
}

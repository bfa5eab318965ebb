//! Secondary keyed views over Machines and Nodes.
//!
//! The NodeLink reconciler correlates Nodes with Machines by provider id
//! first and internal IP second; both directions are O(1) lookups here
//! instead of namespace-wide list-and-filter scans. The indexes are fed
//! incrementally by the watch streams in [`run_machine_index`] and
//! [`run_node_index`] and rebuilt wholesale when a watch restarts.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Node;
use kube::runtime::watcher;
use kube::runtime::watcher::Event;
use kube::ResourceExt;
use log::{error, trace};
use mapi_shared::k8s::api::IntoApi;
use mapi_shared::k8s::node::internal_addresses;
use mapi_shared::mapi::machine::Machine;

use super::controller_ctx::ControllerContext;

#[derive(Debug, Default)]
struct MachineIndexEntry {
    node_name: Option<String>,
    provider_id: Option<String>,
    internal_ips: Vec<String>,
}

#[derive(Debug, Default)]
struct NodeIndexEntry {
    provider_id: Option<String>,
    internal_ips: Vec<String>,
}

/// Incrementally maintained secondary indexes. Values are `ns/name`
/// machine keys or Node names; a lookup may return 0, 1 or many entries
/// and consumers treat more than one as an error.
#[derive(Debug, Default)]
pub struct Indexer {
    machines_by_node_name: HashMap<String, BTreeSet<String>>,
    machines_by_provider_id: HashMap<String, BTreeSet<String>>,
    machines_by_internal_ip: HashMap<String, BTreeSet<String>>,
    nodes_by_provider_id: HashMap<String, BTreeSet<String>>,
    nodes_by_internal_ip: HashMap<String, BTreeSet<String>>,
    machine_entries: HashMap<String, MachineIndexEntry>,
    node_entries: HashMap<String, NodeIndexEntry>,
}

fn remove_from(index: &mut HashMap<String, BTreeSet<String>>, key: &str, value: &str) {
    if let Some(values) = index.get_mut(key) {
        values.remove(value);
        if values.is_empty() {
            index.remove(key);
        }
    }
}

fn insert_into(index: &mut HashMap<String, BTreeSet<String>>, key: String, value: String) {
    index.entry(key).or_default().insert(value);
}

impl Indexer {
    pub fn apply_machine(&mut self, machine: &Machine) {
        let key = machine.machine_key();
        self.delete_machine(&key);

        let entry = MachineIndexEntry {
            node_name: machine
                .status
                .as_ref()
                .and_then(|status| status.node_ref.as_ref())
                .and_then(|node_ref| node_ref.name.clone()),
            provider_id: machine
                .spec
                .provider_id
                .clone()
                .filter(|provider_id| !provider_id.is_empty()),
            internal_ips: machine
                .status
                .as_ref()
                .and_then(|status| status.addresses.as_ref())
                .map(|addresses| {
                    addresses
                        .iter()
                        .filter(|address| address.type_ == "InternalIP")
                        .map(|address| address.address.clone())
                        .collect()
                })
                .unwrap_or_default(),
        };

        if let Some(node_name) = &entry.node_name {
            insert_into(&mut self.machines_by_node_name, node_name.clone(), key.clone());
        }
        if let Some(provider_id) = &entry.provider_id {
            insert_into(
                &mut self.machines_by_provider_id,
                provider_id.clone(),
                key.clone(),
            );
        }
        for ip in &entry.internal_ips {
            insert_into(&mut self.machines_by_internal_ip, ip.clone(), key.clone());
        }
        self.machine_entries.insert(key, entry);
    }

    pub fn delete_machine(&mut self, key: &str) {
        let Some(entry) = self.machine_entries.remove(key) else {
            return;
        };
        if let Some(node_name) = &entry.node_name {
            remove_from(&mut self.machines_by_node_name, node_name, key);
        }
        if let Some(provider_id) = &entry.provider_id {
            remove_from(&mut self.machines_by_provider_id, provider_id, key);
        }
        for ip in &entry.internal_ips {
            remove_from(&mut self.machines_by_internal_ip, ip, key);
        }
    }

    pub fn resync_machines(&mut self, machines: &[Machine]) {
        let keys: Vec<String> = self.machine_entries.keys().cloned().collect();
        for key in keys {
            self.delete_machine(&key);
        }
        for machine in machines {
            self.apply_machine(machine);
        }
    }

    pub fn apply_node(&mut self, node: &Node) {
        let name = node.name_any();
        self.delete_node(&name);

        let entry = NodeIndexEntry {
            provider_id: node
                .spec
                .as_ref()
                .and_then(|spec| spec.provider_id.clone())
                .filter(|provider_id| !provider_id.is_empty()),
            internal_ips: internal_addresses(node),
        };

        if let Some(provider_id) = &entry.provider_id {
            insert_into(
                &mut self.nodes_by_provider_id,
                provider_id.clone(),
                name.clone(),
            );
        }
        for ip in &entry.internal_ips {
            insert_into(&mut self.nodes_by_internal_ip, ip.clone(), name.clone());
        }
        self.node_entries.insert(name, entry);
    }

    pub fn delete_node(&mut self, name: &str) {
        let Some(entry) = self.node_entries.remove(name) else {
            return;
        };
        if let Some(provider_id) = &entry.provider_id {
            remove_from(&mut self.nodes_by_provider_id, provider_id, name);
        }
        for ip in &entry.internal_ips {
            remove_from(&mut self.nodes_by_internal_ip, ip, name);
        }
    }

    pub fn resync_nodes(&mut self, nodes: &[Node]) {
        let names: Vec<String> = self.node_entries.keys().cloned().collect();
        for name in names {
            self.delete_node(&name);
        }
        for node in nodes {
            self.apply_node(node);
        }
    }

    fn lookup(index: &HashMap<String, BTreeSet<String>>, key: &str) -> Vec<String> {
        index
            .get(key)
            .map(|values| values.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn machines_for_node_name(&self, node_name: &str) -> Vec<String> {
        Self::lookup(&self.machines_by_node_name, node_name)
    }

    pub fn machines_for_provider_id(&self, provider_id: &str) -> Vec<String> {
        Self::lookup(&self.machines_by_provider_id, provider_id)
    }

    pub fn machines_for_internal_ip(&self, ip: &str) -> Vec<String> {
        Self::lookup(&self.machines_by_internal_ip, ip)
    }

    pub fn nodes_for_provider_id(&self, provider_id: &str) -> Vec<String> {
        Self::lookup(&self.nodes_by_provider_id, provider_id)
    }

    pub fn nodes_for_internal_ip(&self, ip: &str) -> Vec<String> {
        Self::lookup(&self.nodes_by_internal_ip, ip)
    }
}

/// Feeds the machine side of the index from a watch stream.
pub async fn run_machine_index(ctx: Arc<ControllerContext>) -> anyhow::Result<()> {
    let api: kube::Api<Machine> = match &ctx.config.target_namespace {
        Some(namespace) => IntoApi::<Machine>::namespaced(ctx.client.as_ref(), namespace),
        None => IntoApi::<Machine>::all(ctx.client.as_ref()),
    }
    .as_inner();
    let mut stream = watcher(api, watcher::Config::default()).boxed();
    loop {
        let event = match stream.try_next().await {
            Err(e) => {
                error!("machine index watch error: {}", e);
                continue;
            }
            Ok(None) => anyhow::bail!("machine index watch stream ended"),
            Ok(Some(event)) => event,
        };
        match event {
            Event::Applied(machine) => {
                trace!("machine index apply {}", machine.machine_key());
                ctx.indexer.write().await.apply_machine(&machine);
            }
            Event::Deleted(machine) => {
                trace!("machine index delete {}", machine.machine_key());
                ctx.indexer.write().await.delete_machine(&machine.machine_key());
            }
            Event::Restarted(machines) => {
                trace!("machine index resync of {} machines", machines.len());
                ctx.indexer.write().await.resync_machines(&machines);
            }
        }
    }
}

/// Feeds the node side of the index from a watch stream.
pub async fn run_node_index(ctx: Arc<ControllerContext>) -> anyhow::Result<()> {
    let api: kube::Api<Node> = IntoApi::<Node>::all(ctx.client.as_ref()).as_inner();
    let mut stream = watcher(api, watcher::Config::default()).boxed();
    loop {
        let event = match stream.try_next().await {
            Err(e) => {
                error!("node index watch error: {}", e);
                continue;
            }
            Ok(None) => anyhow::bail!("node index watch stream ended"),
            Ok(Some(event)) => event,
        };
        match event {
            Event::Applied(node) => {
                ctx.indexer.write().await.apply_node(&node);
            }
            Event::Deleted(node) => {
                ctx.indexer.write().await.delete_node(&node.name_any());
            }
            Event::Restarted(nodes) => {
                ctx.indexer.write().await.resync_nodes(&nodes);
            }
        }
    }
}

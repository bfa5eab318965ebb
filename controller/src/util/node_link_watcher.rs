//! Bidirectional correlation of Nodes with Machines.
//!
//! A Node is matched to its Machine by provider id first, by internal IP
//! second, and by an already-recorded NodeRef as a last resort. The
//! winning Machine gets its `NodeRef`, `NodeReady` condition and
//! `lastUpdated` refreshed whenever node readiness flips or the Node
//! starts or stops being deleted, and the Node is
//! stamped with the machine back-reference annotation plus the labels and
//! taints declared on the Machine spec. Node writes only happen when the
//! mirrored object actually differs.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::ResourceExt;
use log::{error, info, trace, warn};
use mapi_shared::k8s::api::{Api, IntoApi};
use mapi_shared::k8s::node::{has_taint, internal_addresses, is_node_ready};
use mapi_shared::mapi::conditions::{
    set_condition, Condition, CONDITION_FALSE, CONDITION_TRUE, NODE_READY_CONDITION,
};
use mapi_shared::mapi::machine::Machine;
use mapi_shared::mapi::MACHINE_ANNOTATION;
use serde_json::json;

use super::controller_ctx::ControllerContext;
use super::{ControllerError, Result};

/// Initialize the node link controller
pub async fn run(ctx: Arc<ControllerContext>) {
    let api: kube::Api<Node> = IntoApi::<Node>::all(ctx.client.as_ref()).as_inner();
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("Nodes are not queryable; {e:?}");
        std::process::exit(1);
    }
    let machines: kube::Api<Machine> = match &ctx.config.target_namespace {
        Some(namespace) => IntoApi::<Machine>::namespaced(ctx.client.as_ref(), namespace),
        None => IntoApi::<Machine>::all(ctx.client.as_ref()),
    }
    .as_inner();
    Controller::new(api, Config::default().any_semantic())
        // A Machine change re-links the Node its NodeRef points at.
        .watches(machines, Config::default().any_semantic(), |machine: Machine| {
            machine
                .status
                .as_ref()
                .and_then(|status| status.node_ref.as_ref())
                .and_then(|node_ref| node_ref.name.clone())
                .map(|node_name| ObjectRef::<Node>::new(&node_name))
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

fn error_policy(_node: Arc<Node>, error: &ControllerError, _ctx: Arc<ControllerContext>) -> Action {
    warn!("node link reconcile failed: {:?}", error);
    Action::requeue(Duration::from_secs(5 * 60))
}

async fn reconcile(node: Arc<Node>, ctx: Arc<ControllerContext>) -> Result<Action> {
    reconcile_inner(&node, &ctx).await
}

/// Resolves the Machine keys correlated with a Node: provider id first,
/// internal IPs second, the recorded NodeRef as fallback.
async fn find_machine_keys(node: &Node, ctx: &ControllerContext) -> Vec<String> {
    let indexer = ctx.indexer.read().await;
    if let Some(provider_id) = node
        .spec
        .as_ref()
        .and_then(|spec| spec.provider_id.as_ref())
        .filter(|provider_id| !provider_id.is_empty())
    {
        let machines = indexer.machines_for_provider_id(provider_id);
        if !machines.is_empty() {
            return machines;
        }
    }
    let mut by_ip = BTreeSet::new();
    for ip in internal_addresses(node) {
        by_ip.extend(indexer.machines_for_internal_ip(&ip));
    }
    if !by_ip.is_empty() {
        return by_ip.into_iter().collect();
    }
    indexer.machines_for_node_name(&node.name_any())
}

/// The Node as it should look once the machine's labels, taints and
/// back-reference annotation are mirrored on. Existing node taints and
/// labels are never removed.
fn desired_node(node: &Node, machine: &Machine) -> Node {
    let mut desired = node.clone();
    desired
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(MACHINE_ANNOTATION.to_string(), machine.machine_key());
    if let Some(machine_labels) = &machine.spec.labels {
        let labels = desired.metadata.labels.get_or_insert_with(Default::default);
        for (key, value) in machine_labels {
            labels.insert(key.clone(), value.clone());
        }
    }
    if let Some(machine_taints) = &machine.spec.taints {
        let taints = desired
            .spec
            .get_or_insert_with(Default::default)
            .taints
            .get_or_insert_with(Default::default);
        for taint in machine_taints {
            if !has_taint(taints, taint) {
                taints.push(taint.clone());
            }
        }
    }
    desired
}

pub(crate) async fn reconcile_inner(node: &Node, ctx: &ControllerContext) -> Result<Action> {
    let node_name = node.name_any();
    trace!("linking node {}", node_name);

    let machine_keys = find_machine_keys(node, ctx).await;
    let machine_key = match machine_keys.as_slice() {
        [] => {
            warn!("no machine matches node {}, skipping link", node_name);
            return Ok(Action::await_change());
        }
        [machine_key] => machine_key,
        _ => {
            return Err(ControllerError::Other(anyhow::anyhow!(
                "expected one machine for node {}, got {}: {}",
                node_name,
                machine_keys.len(),
                machine_keys.join(", ")
            )));
        }
    };
    let (namespace, machine_name) = machine_key
        .split_once('/')
        .ok_or_else(|| ControllerError::Other(anyhow::anyhow!("malformed machine key {machine_key}")))?;
    let machines_api = ctx.machines(namespace);
    let Some(machine) = machines_api.get(machine_name).await? else {
        warn!("machine {} for node {} is gone", machine_key, node_name);
        return Ok(Action::await_change());
    };

    let now = Utc::now();
    let node_deleted = node.metadata.deletion_timestamp.is_some();
    // A node on its way out stops counting as ready. Deletion is tracked
    // alongside readiness so starting to delete always forces an update,
    // even when the node was already not ready.
    let ready = is_node_ready(node) && !node_deleted;
    let link_state = (ready, node_deleted);
    let cached = ctx.node_readiness.read().await.get(&node_name).copied();
    if cached != Some(link_state) {
        info!(
            "node {} readiness changed to {} (deleting: {}), updating machine {}",
            node_name, ready, node_deleted, machine_key
        );
        let mut status = machine.status.clone().unwrap_or_default();
        status.node_ref = Some(ObjectReference {
            kind: Some("Node".to_string()),
            name: Some(node_name.clone()),
            uid: node.uid(),
            ..Default::default()
        });
        let mut conditions = status.conditions.take().unwrap_or_default();
        set_condition(
            &mut conditions,
            Condition::new(
                NODE_READY_CONDITION,
                if ready { CONDITION_TRUE } else { CONDITION_FALSE },
            ),
            now,
        );
        status.conditions = Some(conditions);
        status.last_updated = Some(Time(now));
        machines_api
            .raw_patch_status(
                machine_name,
                &Patch::Merge(json!({ "status": status })),
                &PatchParams::default(),
            )
            .await?;
        ctx.node_readiness
            .write()
            .await
            .insert(node_name.clone(), link_state);
    }

    if !node_deleted {
        let desired = desired_node(node, &machine);
        if &desired != node {
            let nodes_api = IntoApi::<Node>::all(ctx.client.as_ref());
            let mut patch = json!({
                "metadata": {
                    "labels": desired.metadata.labels,
                    "annotations": desired.metadata.annotations
                }
            });
            if let Some(taints) = desired.spec.as_ref().and_then(|spec| spec.taints.as_ref()) {
                patch["spec"] = json!({ "taints": taints });
            }
            nodes_api
                .raw_patch(&node_name, &Patch::Merge(patch), &PatchParams::default())
                .await?;
        }
    }

    Ok(Action::await_change())
}

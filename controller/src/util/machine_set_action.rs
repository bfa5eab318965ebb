//! Replica count enforcement for MachineSets.
//!
//! Each reconcile partitions the namespace's Machines into members and
//! strangers, adopts matching orphans, then closes the gap between the
//! member count and `spec.replicas`: template-stamped creates when short,
//! delete-policy ordered concurrent deletes when over. Both directions
//! wait for the change to become visible in the store before returning so
//! the next reconcile works from settled state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Resource, ResourceExt};
use log::{error, info, trace, warn};
use mapi_shared::k8s::api::{Api, IntoApi};
use mapi_shared::k8s::events::reason;
use mapi_shared::k8s::selector::{is_empty, matches};
use mapi_shared::k8s::{controller_owner, OwnershipInfo, OwnershipType};
use mapi_shared::mapi::conditions::{
    get_condition, paused_condition, set_condition, NODE_READY_CONDITION,
};
use mapi_shared::mapi::machine::{authority_pauses, Machine};
use mapi_shared::mapi::machine_set::{MachineSet, MachineSetDeletePolicy, MachineSetStatus};
use rand::seq::SliceRandom;
use serde_json::json;

use super::controller_ctx::ControllerContext;
use super::{ControllerError, Result};
use crate::MACHINE_SET_REPLICAS_METRIC;

/// Requeue used when ready machines are merely waiting out
/// `minReadySeconds`; defends against clock skew around the transition.
const AVAILABILITY_REQUEUE: Duration = Duration::from_secs(1);

/// Initialize the machine set controller
pub async fn run(ctx: Arc<ControllerContext>) {
    let api: kube::Api<MachineSet> = match &ctx.config.target_namespace {
        Some(namespace) => IntoApi::<MachineSet>::namespaced(ctx.client.as_ref(), namespace),
        None => IntoApi::<MachineSet>::all(ctx.client.as_ref()),
    }
    .as_inner();
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("MachineSets are not queryable; {e:?}");
        std::process::exit(1);
    }
    let machines: kube::Api<Machine> = match &ctx.config.target_namespace {
        Some(namespace) => IntoApi::<Machine>::namespaced(ctx.client.as_ref(), namespace),
        None => IntoApi::<Machine>::all(ctx.client.as_ref()),
    }
    .as_inner();
    Controller::new(api, Config::default().any_semantic())
        .owns(machines, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

fn error_policy(
    _machine_set: Arc<MachineSet>,
    error: &ControllerError,
    _ctx: Arc<ControllerContext>,
) -> Action {
    warn!("machine set reconcile failed: {:?}", error);
    Action::requeue(Duration::from_secs(5 * 60))
}

async fn reconcile(machine_set: Arc<MachineSet>, ctx: Arc<ControllerContext>) -> Result<Action> {
    reconcile_inner(&machine_set, &ctx).await
}

async fn validation_error(
    machine_set: &MachineSet,
    ctx: &ControllerContext,
    message: String,
) -> ControllerError {
    ctx.events
        .publish(
            machine_set.object_ref(&()),
            kube::runtime::events::EventType::Warning,
            reason::RECONCILE_ERROR,
            &message,
        )
        .await;
    ControllerError::ValidationError(message)
}

pub(crate) async fn reconcile_inner(
    machine_set: &MachineSet,
    ctx: &ControllerContext,
) -> Result<Action> {
    let name = machine_set.name_any();
    let Some(namespace) = machine_set.namespace() else {
        return Err(ControllerError::ValidationError(format!(
            "machine set {name} has no namespace"
        )));
    };
    if machine_set.is_deleting() {
        trace!("machine set {}/{} is being deleted", namespace, name);
        return Ok(Action::await_change());
    }
    let now = Utc::now();

    let mut existing_status = machine_set.status.clone().unwrap_or_default();
    if ctx.config.machine_api_migration {
        let paused = authority_pauses(existing_status.authoritative_api.as_ref());
        let mut conditions = existing_status.conditions.take().unwrap_or_default();
        set_condition(&mut conditions, paused_condition(paused), now);
        existing_status.conditions = Some(conditions);
        if paused {
            info!(
                "machine set {}/{} is paused, the MachineAPI is not authoritative",
                namespace, name
            );
            IntoApi::<MachineSet>::namespaced(ctx.client.as_ref(), &namespace)
                .raw_patch_status(
                    &name,
                    &Patch::Merge(json!({ "status": existing_status })),
                    &PatchParams::default(),
                )
                .await?;
            return Ok(Action::await_change());
        }
    }

    // Spec validation; acting on a bad selector could select everything.
    let Some(replicas) = machine_set.spec.replicas else {
        return Err(validation_error(
            machine_set,
            ctx,
            format!("machine set {namespace}/{name}: spec.replicas must be set"),
        )
        .await);
    };
    if is_empty(&machine_set.spec.selector) {
        return Err(validation_error(
            machine_set,
            ctx,
            format!("machine set {namespace}/{name}: spec.selector must not be empty"),
        )
        .await);
    }
    let template_labels = machine_set.template_labels();
    if !matches(&machine_set.spec.selector, &template_labels) {
        return Err(validation_error(
            machine_set,
            ctx,
            format!(
                "machine set {namespace}/{name}: spec.selector does not match template labels"
            ),
        )
        .await);
    }

    let machines_api = ctx.machines(&namespace);
    let all_machines = machines_api.list(&ListParams::default()).await?;
    let filtered = filter_and_adopt_machines(
        machine_set,
        all_machines.items,
        machines_api.as_ref(),
    )
    .await;

    let sync_result = sync_replicas(machine_set, replicas, &filtered, ctx, machines_api.as_ref()).await;

    let mut status = calculate_status(machine_set, &filtered, now);
    status.conditions = existing_status.conditions;
    status.authoritative_api = existing_status.authoritative_api;
    if let Err(e) = &sync_result {
        status.error_message = Some(e.to_string());
    }
    MACHINE_SET_REPLICAS_METRIC
        .with_label_values(&[namespace.as_str(), name.as_str()])
        .set(i64::from(status.replicas));

    let ready = status.ready_replicas;
    let available = status.available_replicas;
    let patch_result = IntoApi::<MachineSet>::namespaced(ctx.client.as_ref(), &namespace)
        .raw_patch_status(
            &name,
            &Patch::Merge(json!({ "status": status })),
            &PatchParams::default(),
        )
        .await;

    match (sync_result, patch_result) {
        (Err(sync_error), Err(patch_error)) => Err(ControllerError::Other(anyhow::anyhow!(
            "sync failed: {sync_error}; status patch failed: {patch_error}"
        ))),
        (Err(sync_error), Ok(_)) => Err(sync_error),
        (Ok(()), Err(patch_error)) => Err(patch_error.into()),
        (Ok(()), Ok(_)) => {
            let min_ready = machine_set.spec.min_ready_seconds.unwrap_or(0);
            if min_ready > 0 && ready == replicas && available != ready {
                trace!(
                    "machine set {}/{} waiting out minReadySeconds",
                    namespace,
                    name
                );
                return Ok(Action::requeue(AVAILABILITY_REQUEUE));
            }
            Ok(Action::await_change())
        }
    }
}

/// Partitions the namespace's Machines into this set's members, adopting
/// matching orphans along the way. Deleting machines, strangers owned by
/// someone else and label mismatches are dropped. The result is sorted by
/// name so downstream decisions are deterministic.
async fn filter_and_adopt_machines(
    machine_set: &MachineSet,
    machines: Vec<Machine>,
    api: &dyn Api<Machine>,
) -> Vec<Machine> {
    let set_uid = machine_set.uid().unwrap_or_default();
    let mut filtered = Vec::new();
    for machine in machines {
        if machine.is_deleting() {
            continue;
        }
        if !matches(&machine_set.spec.selector, machine.labels()) {
            continue;
        }
        match controller_owner(&machine.metadata) {
            Some(owner) if owner.uid != set_uid => continue,
            Some(_) => filtered.push(machine),
            None => match adopt_machine(machine_set, &machine, api).await {
                Ok(()) => filtered.push(machine),
                Err(e) => {
                    warn!(
                        "failed to adopt machine {}: {:?}",
                        machine.machine_key(),
                        e
                    );
                }
            },
        }
    }
    filtered.sort_by_key(|machine| machine.name_any());
    filtered
}

async fn adopt_machine(
    machine_set: &MachineSet,
    machine: &Machine,
    api: &dyn Api<Machine>,
) -> Result<(), kube::Error> {
    info!(
        "adopting orphaned machine {} into machine set {}",
        machine.machine_key(),
        machine_set.name_any()
    );
    let mut owner_references = machine.owner_references().to_vec();
    owner_references.push(
        OwnershipInfo::new(
            OwnershipType::MachineSet,
            machine_set.name_any(),
            machine_set.uid().unwrap_or_default(),
        )
        .to_owner_reference(),
    );
    api.raw_patch(
        &machine.name_any(),
        &Patch::Merge(json!({ "metadata": { "ownerReferences": owner_references } })),
        &PatchParams::default(),
    )
    .await?;
    Ok(())
}

async fn sync_replicas(
    machine_set: &MachineSet,
    replicas: i32,
    filtered: &[Machine],
    ctx: &ControllerContext,
    api: &dyn Api<Machine>,
) -> Result<()> {
    let key = format!(
        "{}/{}",
        machine_set.namespace().unwrap_or_default(),
        machine_set.name_any()
    );
    let diff = filtered.len() as i32 - replicas;
    if diff < 0 {
        let count = -diff;
        info!("machine set {} is short {} machines, creating", key, count);
        let mut created_names = Vec::new();
        let mut errors: Vec<anyhow::Error> = Vec::new();
        for _ in 0..count {
            let machine = machine_from_template(machine_set)?;
            match api.create(&machine).await {
                Ok(created) => created_names.push(created.name_any()),
                Err(e) => {
                    error!("machine set {} failed to create machine: {:?}", key, e);
                    ctx.events
                        .publish(
                            machine_set.object_ref(&()),
                            kube::runtime::events::EventType::Warning,
                            reason::FAILED_CREATE,
                            &format!("failed to create machine: {e}"),
                        )
                        .await;
                    errors.push(e.into());
                }
            }
        }
        if let Err(e) = wait_for_machines(
            api,
            &created_names,
            true,
            ctx.config.state_confirmation_timeout,
            ctx.config.state_confirmation_interval,
        )
        .await
        {
            errors.push(e);
        }
        if let Some(error) = errors.into_iter().next() {
            return Err(ControllerError::Other(error));
        }
    } else if diff > 0 {
        info!("machine set {} has {} machines too many, deleting", key, diff);
        let victims = machines_to_delete(filtered.to_vec(), diff as usize, &machine_set.delete_policy());
        let victim_names: Vec<String> = victims.iter().map(|machine| machine.name_any()).collect();
        let deletes = victim_names.iter().map(|victim| {
            let api = &*api;
            async move {
                api.delete(victim)
                    .await
                    .map(|_| ())
                    .map_err(anyhow::Error::from)
            }
        });
        let results = futures::future::join_all(deletes).await;
        let mut first_error = None;
        for (victim, result) in victim_names.iter().zip(results) {
            if let Err(e) = result {
                error!("machine set {} failed to delete machine {}: {:?}", key, victim, e);
                ctx.events
                    .publish(
                        machine_set.object_ref(&()),
                        kube::runtime::events::EventType::Warning,
                        reason::FAILED_DELETE,
                        &format!("failed to delete machine {victim}: {e}"),
                    )
                    .await;
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        if let Err(e) = wait_for_machines(
            api,
            &victim_names,
            false,
            ctx.config.state_confirmation_timeout,
            ctx.config.state_confirmation_interval,
        )
        .await
        {
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
        if let Some(error) = first_error {
            return Err(ControllerError::Other(error));
        }
    }
    Ok(())
}

fn machine_from_template(machine_set: &MachineSet) -> Result<Machine> {
    let template = machine_set.spec.template.as_ref().ok_or_else(|| {
        ControllerError::ValidationError(format!(
            "machine set {} has no template to scale up from",
            machine_set.name_any()
        ))
    })?;
    let metadata = ObjectMeta {
        generate_name: Some(format!("{}-", machine_set.name_any())),
        namespace: machine_set.namespace(),
        labels: template
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.labels.clone()),
        annotations: template
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.annotations.clone()),
        owner_references: Some(vec![OwnershipInfo::new(
            OwnershipType::MachineSet,
            machine_set.name_any(),
            machine_set.uid().unwrap_or_default(),
        )
        .to_owner_reference()]),
        ..Default::default()
    };
    Ok(Machine {
        metadata,
        spec: template.spec.clone().unwrap_or_default(),
        status: None,
    })
}

fn creation_time(machine: &Machine) -> DateTime<Utc> {
    machine
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|Time(timestamp)| *timestamp)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Picks `count` victims for scale down. Machines already being deleted
/// rank first under every policy; the policy orders the rest.
fn machines_to_delete(
    mut machines: Vec<Machine>,
    count: usize,
    policy: &MachineSetDeletePolicy,
) -> Vec<Machine> {
    if *policy == MachineSetDeletePolicy::Random {
        machines.shuffle(&mut rand::thread_rng());
    }
    machines.sort_by(|a, b| {
        b.is_deleting().cmp(&a.is_deleting()).then_with(|| match policy {
            MachineSetDeletePolicy::Newest => creation_time(b).cmp(&creation_time(a)),
            MachineSetDeletePolicy::Oldest => creation_time(a).cmp(&creation_time(b)),
            MachineSetDeletePolicy::Random => std::cmp::Ordering::Equal,
        })
    });
    machines.truncate(count);
    machines
}

/// Bounded poll until every named machine is (or stops being) visible in
/// the store. A machine with a deletion timestamp counts as gone.
async fn wait_for_machines(
    api: &dyn Api<Machine>,
    names: &[String],
    until_present: bool,
    timeout: Duration,
    interval: Duration,
) -> anyhow::Result<()> {
    for name in names {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let settled = match api.get(name).await? {
                Some(machine) => {
                    if until_present {
                        true
                    } else {
                        machine.is_deleting()
                    }
                }
                None => !until_present,
            };
            if settled {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!(
                    "timed out waiting for machine {} {}",
                    name,
                    if until_present {
                        "to appear in the cache"
                    } else {
                        "to be deleted from the cache"
                    }
                );
            }
            tokio::time::sleep(interval).await;
        }
    }
    Ok(())
}

/// Derives the replica counters from the filtered machine list. A machine
/// is fully labeled only when its label set equals the template's exactly.
/// Readiness follows the `NodeReady` condition NodeLink mirrors onto
/// Machines; availability additionally waits out `minReadySeconds`.
fn calculate_status(
    machine_set: &MachineSet,
    filtered: &[Machine],
    now: DateTime<Utc>,
) -> MachineSetStatus {
    let template_labels = machine_set.template_labels();
    let min_ready_seconds = machine_set.spec.min_ready_seconds.unwrap_or(0);
    let mut fully_labeled_replicas = 0;
    let mut ready_replicas = 0;
    let mut available_replicas = 0;
    for machine in filtered {
        if machine.labels() == &template_labels {
            fully_labeled_replicas += 1;
        }
        let Some(status) = &machine.status else {
            continue;
        };
        if status.node_ref.is_none() {
            continue;
        }
        let Some(ready) = status
            .conditions
            .as_ref()
            .and_then(|conditions| get_condition(conditions, NODE_READY_CONDITION))
        else {
            continue;
        };
        if !ready.is_true() {
            continue;
        }
        ready_replicas += 1;
        if min_ready_seconds == 0 {
            available_replicas += 1;
        } else if let Some(Time(since)) = &ready.last_transition_time {
            if now >= *since + chrono::Duration::seconds(i64::from(min_ready_seconds)) {
                available_replicas += 1;
            }
        }
    }
    MachineSetStatus {
        replicas: filtered.len() as i32,
        fully_labeled_replicas,
        ready_replicas,
        available_replicas,
        observed_generation: machine_set.metadata.generation,
        error_message: None,
        authoritative_api: None,
        conditions: None,
    }
}

#[cfg(test)]
mod tests {
    use super::super::shared_test_utils::mock_client::MockControllerKubeClient;
    use super::super::shared_test_utils::{
        assert_action, machine_from_json, machine_list, machine_set_from_json, test_context,
    };
    use super::*;
    use mapi_shared::k8s::api::MockApi;
    use mockall::predicate::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn worker_set(replicas: i32) -> MachineSet {
        machine_set_from_json(json!({
            "apiVersion": "machine.mapi.sh/v1beta1",
            "kind": "MachineSet",
            "metadata": {
                "name": "workers",
                "namespace": "mapi",
                "uid": "set-uid-1",
                "generation": 4
            },
            "spec": {
                "replicas": replicas,
                "selector": { "matchLabels": { "role": "worker" } },
                "template": {
                    "metadata": { "labels": { "role": "worker" } },
                    "spec": {}
                }
            }
        }))
    }

    fn owned_worker(name: &str, created: &str) -> Machine {
        machine_from_json(json!({
            "apiVersion": "machine.mapi.sh/v1beta1",
            "kind": "Machine",
            "metadata": {
                "name": name,
                "namespace": "mapi",
                "uid": format!("{name}-uid"),
                "creationTimestamp": created,
                "labels": { "role": "worker" },
                "ownerReferences": [{
                    "apiVersion": "machine.mapi.sh/v1beta1",
                    "kind": "MachineSet",
                    "name": "workers",
                    "uid": "set-uid-1",
                    "controller": true,
                    "blockOwnerDeletion": true
                }]
            },
            "spec": {}
        }))
    }

    fn expect_status_patch_ok(api: &mut MockApi<MachineSet>) {
        api.expect_raw_patch_status()
            .times(1)
            .returning(|_, _, _| Ok(MachineSet::new("unused", Default::default())));
    }

    // Scale up from zero: three creates with the template labels and a
    // controller owner reference, then status reports the new replicas.
    #[tokio::test]
    async fn test_reconcile_scale_up_from_zero() {
        let _ = env_logger::builder().is_test(true).try_init();
        let machine_set = worker_set(3);
        let mut client = MockControllerKubeClient::default();

        let mut machines_api: MockApi<Machine> = MockApi::new();
        machines_api
            .expect_list()
            .times(1)
            .returning(|_| machine_list(vec![]));
        let counter = AtomicUsize::new(0);
        machines_api
            .expect_create()
            .times(3)
            .withf(|machine| {
                machine.metadata.generate_name.as_deref() == Some("workers-")
                    && machine.labels().get("role").map(String::as_str) == Some("worker")
                    && controller_owner(&machine.metadata)
                        .is_some_and(|owner| owner.name == "workers" && owner.kind == "MachineSet")
            })
            .returning(move |machine| {
                let index = counter.fetch_add(1, Ordering::SeqCst);
                let mut created = machine.clone();
                created.metadata.name = Some(format!("workers-{index}"));
                created.metadata.generate_name = None;
                Ok(created)
            });
        machines_api
            .expect_get()
            .returning(|name| {
                Ok(Some(machine_from_json(json!({
                    "apiVersion": "machine.mapi.sh/v1beta1",
                    "kind": "Machine",
                    "metadata": { "name": name, "namespace": "mapi", "labels": { "role": "worker" } },
                    "spec": {}
                }))))
            });
        client
            .machine
            .expect_namespaced()
            .return_once(move |_| Box::new(machines_api));

        let mut sets_api: MockApi<MachineSet> = MockApi::new();
        sets_api
            .expect_raw_patch_status()
            .times(1)
            .withf(|name, patch, _| {
                name == "workers"
                    && match patch {
                        Patch::Merge(value) => {
                            value["status"]["replicas"] == json!(0)
                                && value["status"]["readyReplicas"] == json!(0)
                                && value["status"]["observedGeneration"] == json!(4)
                        }
                        _ => false,
                    }
            })
            .returning(|_, _, _| Ok(MachineSet::new("unused", Default::default())));
        client
            .machine_set
            .expect_namespaced()
            .return_once(move |_| Box::new(sets_api));

        let ctx = test_context(client);
        let action = reconcile_inner(&machine_set, &ctx).await.unwrap();
        assert_action(action, Action::await_change());
    }

    // Scale down with the Newest policy deletes the two youngest machines
    // and leaves the oldest alone.
    #[tokio::test]
    async fn test_reconcile_scale_down_newest() {
        let _ = env_logger::builder().is_test(true).try_init();
        let machine_set = worker_set(1);
        let mut client = MockControllerKubeClient::default();
        let mut machine_set = machine_set;
        machine_set.spec.delete_policy = Some(MachineSetDeletePolicy::Newest);

        let mut machines_api: MockApi<Machine> = MockApi::new();
        machines_api.expect_list().times(1).returning(|_| {
            machine_list(vec![
                owned_worker("worker-t0", "2026-01-01T00:00:00Z"),
                owned_worker("worker-t1", "2026-01-02T00:00:00Z"),
                owned_worker("worker-t2", "2026-01-03T00:00:00Z"),
            ])
        });
        machines_api
            .expect_delete()
            .times(2)
            .withf(|name| name == "worker-t1" || name == "worker-t2")
            .returning(|_| Ok(either::Either::Left(Machine::new("gone", Default::default()))));
        machines_api.expect_get().returning(|_| Ok(None));
        client
            .machine
            .expect_namespaced()
            .return_once(move |_| Box::new(machines_api));

        let mut sets_api: MockApi<MachineSet> = MockApi::new();
        expect_status_patch_ok(&mut sets_api);
        client
            .machine_set
            .expect_namespaced()
            .return_once(move |_| Box::new(sets_api));

        let ctx = test_context(client);
        reconcile_inner(&machine_set, &ctx).await.unwrap();
    }

    // An orphan with matching labels is adopted; a machine controlled by
    // another owner is left alone and not counted.
    #[tokio::test]
    async fn test_reconcile_adopts_matching_orphans() {
        let _ = env_logger::builder().is_test(true).try_init();
        let machine_set = worker_set(2);
        let mut client = MockControllerKubeClient::default();

        let orphan = machine_from_json(json!({
            "apiVersion": "machine.mapi.sh/v1beta1",
            "kind": "Machine",
            "metadata": {
                "name": "orphan-0",
                "namespace": "mapi",
                "uid": "orphan-uid",
                "labels": { "role": "worker" }
            },
            "spec": {}
        }));
        let foreign = machine_from_json(json!({
            "apiVersion": "machine.mapi.sh/v1beta1",
            "kind": "Machine",
            "metadata": {
                "name": "foreign-0",
                "namespace": "mapi",
                "labels": { "role": "worker" },
                "ownerReferences": [{
                    "apiVersion": "machine.mapi.sh/v1beta1",
                    "kind": "MachineSet",
                    "name": "others",
                    "uid": "other-set-uid",
                    "controller": true
                }]
            },
            "spec": {}
        }));

        let mut machines_api: MockApi<Machine> = MockApi::new();
        machines_api.expect_list().times(1).returning(move |_| {
            machine_list(vec![
                orphan.clone(),
                foreign.clone(),
                owned_worker("worker-0", "2026-01-01T00:00:00Z"),
            ])
        });
        machines_api
            .expect_raw_patch()
            .times(1)
            .withf(|name, patch, _| {
                name == "orphan-0"
                    && match patch {
                        Patch::Merge(value) => {
                            let owners = &value["metadata"]["ownerReferences"];
                            owners[0]["name"] == json!("workers")
                                && owners[0]["controller"] == json!(true)
                        }
                        _ => false,
                    }
            })
            .returning(|_, _, _| Ok(Machine::new("unused", Default::default())));
        client
            .machine
            .expect_namespaced()
            .return_once(move |_| Box::new(machines_api));

        let mut sets_api: MockApi<MachineSet> = MockApi::new();
        sets_api
            .expect_raw_patch_status()
            .times(1)
            .withf(|_, patch, _| match patch {
                // worker-0 and the adopted orphan; the foreign machine is
                // excluded.
                Patch::Merge(value) => value["status"]["replicas"] == json!(2),
                _ => false,
            })
            .returning(|_, _, _| Ok(MachineSet::new("unused", Default::default())));
        client
            .machine_set
            .expect_namespaced()
            .return_once(move |_| Box::new(sets_api));

        let ctx = test_context(client);
        reconcile_inner(&machine_set, &ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_rejects_empty_selector() {
        let _ = env_logger::builder().is_test(true).try_init();
        let machine_set = machine_set_from_json(json!({
            "apiVersion": "machine.mapi.sh/v1beta1",
            "kind": "MachineSet",
            "metadata": { "name": "workers", "namespace": "mapi", "uid": "set-uid-1" },
            "spec": { "replicas": 1, "selector": {} }
        }));
        let ctx = test_context(MockControllerKubeClient::default());
        let result = reconcile_inner(&machine_set, &ctx).await;
        assert!(matches!(result, Err(ControllerError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_reconcile_rejects_selector_template_mismatch() {
        let _ = env_logger::builder().is_test(true).try_init();
        let machine_set = machine_set_from_json(json!({
            "apiVersion": "machine.mapi.sh/v1beta1",
            "kind": "MachineSet",
            "metadata": { "name": "workers", "namespace": "mapi", "uid": "set-uid-1" },
            "spec": {
                "replicas": 1,
                "selector": { "matchLabels": { "role": "worker" } },
                "template": { "metadata": { "labels": { "role": "infra" } }, "spec": {} }
            }
        }));
        let ctx = test_context(MockControllerKubeClient::default());
        let result = reconcile_inner(&machine_set, &ctx).await;
        assert!(matches!(result, Err(ControllerError::ValidationError(_))));
    }

    #[test]
    fn test_machines_to_delete_policies() {
        let t0 = owned_worker("worker-t0", "2026-01-01T00:00:00Z");
        let t1 = owned_worker("worker-t1", "2026-01-02T00:00:00Z");
        let t2 = owned_worker("worker-t2", "2026-01-03T00:00:00Z");

        let newest = machines_to_delete(
            vec![t0.clone(), t1.clone(), t2.clone()],
            2,
            &MachineSetDeletePolicy::Newest,
        );
        let names: Vec<String> = newest.iter().map(|m| m.name_any()).collect();
        assert_eq!(names, vec!["worker-t2", "worker-t1"]);

        let oldest = machines_to_delete(
            vec![t0.clone(), t1.clone(), t2.clone()],
            2,
            &MachineSetDeletePolicy::Oldest,
        );
        let names: Vec<String> = oldest.iter().map(|m| m.name_any()).collect();
        assert_eq!(names, vec!["worker-t0", "worker-t1"]);

        let random = machines_to_delete(
            vec![t0.clone(), t1.clone(), t2.clone()],
            2,
            &MachineSetDeletePolicy::Random,
        );
        assert_eq!(random.len(), 2);
    }

    #[test]
    fn test_machines_to_delete_prefers_already_deleting() {
        let t0 = owned_worker("worker-t0", "2026-01-01T00:00:00Z");
        let t1 = owned_worker("worker-t1", "2026-01-02T00:00:00Z");
        let mut draining = owned_worker("worker-draining", "2026-01-03T00:00:00Z");
        draining.metadata.deletion_timestamp =
            Some(Time(Utc::now()));

        // Oldest would pick t0 first, but the draining machine outranks it.
        let victims = machines_to_delete(
            vec![t0, t1, draining],
            1,
            &MachineSetDeletePolicy::Oldest,
        );
        assert_eq!(victims[0].name_any(), "worker-draining");
    }

    #[test]
    fn test_calculate_status_counts() {
        let machine_set = worker_set(3);
        let now = Utc::now();
        let ready_for = |seconds: i64| {
            json!([{
                "type": NODE_READY_CONDITION,
                "status": "True",
                "lastTransitionTime": Time(now - chrono::Duration::seconds(seconds))
            }])
        };

        let mut fresh = owned_worker("worker-fresh", "2026-01-01T00:00:00Z");
        fresh.status = Some(serde_json::from_value(json!({
            "nodeRef": { "kind": "Node", "name": "node-a" },
            "conditions": ready_for(5)
        })).unwrap());
        let mut seasoned = owned_worker("worker-seasoned", "2026-01-01T00:00:00Z");
        seasoned.status = Some(serde_json::from_value(json!({
            "nodeRef": { "kind": "Node", "name": "node-b" },
            "conditions": ready_for(120)
        })).unwrap());
        let mut extra_labels = owned_worker("worker-extra", "2026-01-01T00:00:00Z");
        extra_labels.metadata.labels = Some(
            [("role".to_string(), "worker".to_string()), ("extra".to_string(), "1".to_string())]
                .into_iter()
                .collect(),
        );

        let mut with_min_ready = machine_set.clone();
        with_min_ready.spec.min_ready_seconds = Some(60);
        let status = calculate_status(
            &with_min_ready,
            &[fresh, seasoned, extra_labels],
            now,
        );
        assert_eq!(status.replicas, 3);
        // The machine carrying a label beyond the template set is not
        // fully labeled.
        assert_eq!(status.fully_labeled_replicas, 2);
        assert_eq!(status.ready_replicas, 2);
        // Only the machine past minReadySeconds counts as available.
        assert_eq!(status.available_replicas, 1);
        assert_eq!(status.observed_generation, Some(4));
    }

    #[tokio::test]
    async fn test_wait_for_machines_times_out_with_descriptive_error() {
        let mut api: MockApi<Machine> = MockApi::new();
        api.expect_get().returning(|_| Ok(None));
        let error = wait_for_machines(
            &api,
            &["workers-0".to_string()],
            true,
            Duration::from_millis(5),
            Duration::from_millis(1),
        )
        .await
        .unwrap_err();
        assert!(error.to_string().contains("workers-0"));
        assert!(error.to_string().contains("appear"));
    }
}

//! Drives the per-provider actuator for single Machines.
//!
//! The reconciler owns persistence: actuators mutate in-memory copies and
//! every surviving change is written back here through a status patch.
//! Two process-wide caches carry create retry state between reconciles —
//! `task_ids` remembers the cloud task a create started, and
//! `failed_provider_status` holds provider status whose persistence
//! failed so it can be replayed instead of starting a second create.
//!
//! This module is wired into provider binaries together with their
//! [`Actuator`](super::actuator::Actuator) implementation; the generic
//! `mapi-controller` binary runs the other three controllers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Resource, ResourceExt};
use log::{error, info, trace, warn};
use mapi_shared::k8s::api::{Api, IntoApi};
use mapi_shared::k8s::events::reason;
use mapi_shared::mapi::conditions::{paused_condition, set_condition};
use mapi_shared::mapi::machine::{
    authority_pauses, Machine, MachinePhase, MachineStatus,
};
use mapi_shared::mapi::providers::ProviderConfig;
use mapi_shared::mapi::MACHINE_FINALIZER;
use serde_json::json;

use super::actuator::{Actuator, ActuatorError};
use super::controller_ctx::ControllerContext;
use super::{ControllerError, Result};

/// Requeue applied while a cloud task recorded in the task cache has not
/// been observed on the Machine yet.
const PENDING_TASK_REQUEUE: Duration = Duration::from_secs(30);

/// Context handed to the Machine reconciler: the shared controller state
/// plus the provider actuator the hosting binary supplies.
pub struct MachineControllerContext {
    pub ctx: Arc<ControllerContext>,
    pub actuator: Arc<dyn Actuator>,
}

/// Initialize the machine controller with a provider actuator.
pub async fn run(ctx: Arc<ControllerContext>, actuator: Arc<dyn Actuator>) {
    let api: kube::Api<Machine> = match &ctx.config.target_namespace {
        Some(namespace) => IntoApi::<Machine>::namespaced(ctx.client.as_ref(), namespace),
        None => IntoApi::<Machine>::all(ctx.client.as_ref()),
    }
    .as_inner();
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("Machines are not queryable; {e:?}");
        std::process::exit(1);
    }
    Controller::new(api, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(
            reconcile,
            error_policy,
            Arc::new(MachineControllerContext { ctx, actuator }),
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

fn error_policy(
    _machine: Arc<Machine>,
    error: &ControllerError,
    _ctx: Arc<MachineControllerContext>,
) -> Action {
    warn!("machine reconcile failed: {:?}", error);
    Action::requeue(Duration::from_secs(5 * 60))
}

async fn reconcile(machine: Arc<Machine>, ctx: Arc<MachineControllerContext>) -> Result<Action> {
    reconcile_inner(&machine, &ctx.ctx, ctx.actuator.as_ref()).await
}

async fn patch_status(
    api: &dyn Api<Machine>,
    name: &str,
    status: &MachineStatus,
) -> Result<(), kube::Error> {
    api.raw_patch_status(
        name,
        &Patch::Merge(json!({ "status": status })),
        &PatchParams::default(),
    )
    .await?;
    Ok(())
}

/// This function is the main Reconcile function for Machine resources.
pub(crate) async fn reconcile_inner(
    machine: &Machine,
    ctx: &ControllerContext,
    actuator: &dyn Actuator,
) -> Result<Action> {
    let machine_name = machine.name_any();
    let namespace = machine.namespace().ok_or_else(|| {
        ControllerError::ValidationError(format!("machine {machine_name} has no namespace"))
    })?;
    let key = machine.machine_key();
    trace!("reconciling machine {}", key);
    let api = ctx.machines(&namespace);
    let now = Utc::now();

    let mut status = machine.status.clone().unwrap_or_default();

    if ctx.config.machine_api_migration {
        let paused = authority_pauses(status.authoritative_api.as_ref());
        let mut conditions = status.conditions.take().unwrap_or_default();
        set_condition(&mut conditions, paused_condition(paused), now);
        status.conditions = Some(conditions);
        if paused {
            info!("machine {} is paused, the MachineAPI is not authoritative", key);
            status.last_updated = Some(Time(now));
            patch_status(api.as_ref(), &machine_name, &status).await?;
            return Ok(Action::await_change());
        }
    }

    if machine.is_deleting() {
        return delete_machine(machine, &mut status, ctx, actuator, api.as_ref(), now).await;
    }

    if !machine
        .finalizers()
        .iter()
        .any(|finalizer| finalizer == MACHINE_FINALIZER)
    {
        api.add_finalizer(machine, MACHINE_FINALIZER).await?;
    }

    if let Some(raw) = &machine.spec.provider_spec {
        let validation_errors = match ProviderConfig::decode(ctx.config.platform, raw) {
            Ok(mut provider_config) => {
                provider_config.apply_defaults();
                provider_config.validate()
            }
            Err(decode_error) => vec![decode_error],
        };
        if !validation_errors.is_empty() {
            let message = validation_errors.join(", ");
            ctx.events
                .publish(
                    machine.object_ref(&()),
                    kube::runtime::events::EventType::Warning,
                    reason::RECONCILE_ERROR,
                    &message,
                )
                .await;
            status.phase = Some(MachinePhase::Failed);
            status.error_message = Some(message.clone());
            status.last_updated = Some(Time(now));
            patch_status(api.as_ref(), &machine_name, &status).await?;
            return Err(ControllerError::ValidationError(message));
        }
    }

    let exists = match actuator.exists(machine).await {
        Ok(exists) => exists,
        Err(ActuatorError::RequeueAfter(delay, note)) => {
            info!("machine {} existence check pending: {}", key, note);
            return Ok(Action::requeue(delay));
        }
        Err(e) => return Err(e.into()),
    };

    if exists {
        update_machine(machine, &mut status, ctx, actuator, api.as_ref(), now).await
    } else {
        create_machine(machine, &mut status, ctx, actuator, api.as_ref(), now).await
    }
}

async fn delete_machine(
    machine: &Machine,
    status: &mut MachineStatus,
    ctx: &ControllerContext,
    actuator: &dyn Actuator,
    api: &dyn Api<Machine>,
    now: chrono::DateTime<Utc>,
) -> Result<Action> {
    let machine_name = machine.name_any();
    let key = machine.machine_key();

    if status.phase != Some(MachinePhase::Deleting) {
        status.phase = Some(MachinePhase::Deleting);
        status.last_updated = Some(Time(now));
        patch_status(api, &machine_name, status).await?;
    }

    match actuator.delete(machine).await {
        Ok(()) => {
            api.remove_finalizer(machine, MACHINE_FINALIZER).await?;
            ctx.task_ids.write().await.remove(&key);
            ctx.failed_provider_status.write().await.remove(&key);
            ctx.events
                .publish(
                    machine.object_ref(&()),
                    kube::runtime::events::EventType::Normal,
                    reason::DELETED,
                    &format!("Deleted Machine {machine_name}"),
                )
                .await;
            Ok(Action::await_change())
        }
        Err(ActuatorError::RequeueAfter(delay, note)) => {
            info!("machine {} deletion in progress: {}", key, note);
            Ok(Action::requeue(delay))
        }
        Err(e) => {
            ctx.events
                .publish(
                    machine.object_ref(&()),
                    kube::runtime::events::EventType::Warning,
                    reason::FAILED_DELETE,
                    &format!("{e}"),
                )
                .await;
            Err(e.into())
        }
    }
}

/// The create contract distinguishes failures before the cloud is touched
/// (`Scope`), permanent spec problems (`InvalidConfiguration`) and
/// in-progress work (`RequeueAfter`). A create that started a cloud task
/// whose status patch then fails is recoverable: the provider status is
/// cached and replayed on the next pass instead of starting a second task.
async fn create_machine(
    machine: &Machine,
    status: &mut MachineStatus,
    ctx: &ControllerContext,
    actuator: &dyn Actuator,
    api: &dyn Api<Machine>,
    now: chrono::DateTime<Utc>,
) -> Result<Action> {
    let machine_name = machine.name_any();
    let key = machine.machine_key();

    let pending_task = ctx.task_ids.read().await.get(&key).cloned();
    if let Some(pending_task) = pending_task {
        match machine.task_ref() {
            None => {
                // The task started but the status carrying it was lost.
                let saved = ctx.failed_provider_status.read().await.get(&key).cloned();
                if let Some(saved) = saved {
                    info!("machine {} restoring provider status for task {}", key, pending_task);
                    status.provider_status = Some(saved);
                    status.last_updated = Some(Time(now));
                    patch_status(api, &machine_name, status).await?;
                    ctx.failed_provider_status.write().await.remove(&key);
                    return Ok(Action::requeue(PENDING_TASK_REQUEUE));
                }
                warn!(
                    "machine {} has stale task {} and no saved provider status",
                    key, pending_task
                );
                return Ok(Action::requeue(PENDING_TASK_REQUEUE));
            }
            Some(current) if current == pending_task => {
                trace!("machine {} task {} still in flight", key, pending_task);
                return Ok(Action::requeue(PENDING_TASK_REQUEUE));
            }
            Some(_) => {
                // The observed task moved past the cached one.
                ctx.task_ids.write().await.remove(&key);
            }
        }
    }

    let mut updated = machine.clone();
    match actuator.create(&mut updated).await {
        Ok(()) => {
            if let Some(task) = updated.task_ref() {
                ctx.task_ids.write().await.insert(key.clone(), task);
            }
            let updated_status = updated.status.unwrap_or_default();
            status.provider_status = updated_status.provider_status;
            status.addresses = updated_status.addresses;
            status.phase = Some(MachinePhase::Provisioning);
            status.last_updated = Some(Time(now));
            match patch_status(api, &machine_name, status).await {
                Ok(()) => {
                    ctx.failed_provider_status.write().await.remove(&key);
                    ctx.events
                        .publish(
                            machine.object_ref(&()),
                            kube::runtime::events::EventType::Normal,
                            reason::CREATED,
                            &format!("Created Machine {machine_name}"),
                        )
                        .await;
                    Ok(Action::await_change())
                }
                Err(e) => {
                    if let Some(provider_status) = &status.provider_status {
                        ctx.failed_provider_status
                            .write()
                            .await
                            .insert(key.clone(), provider_status.clone());
                    }
                    error!(
                        "machine {} created but provider status could not be saved: {:?}",
                        key, e
                    );
                    Err(e.into())
                }
            }
        }
        Err(ActuatorError::RequeueAfter(delay, note)) => {
            info!("machine {} creation in progress: {}", key, note);
            Ok(Action::requeue(delay))
        }
        Err(ActuatorError::InvalidConfiguration(message)) => {
            ctx.events
                .publish(
                    machine.object_ref(&()),
                    kube::runtime::events::EventType::Warning,
                    reason::FAILED_CREATE,
                    &message,
                )
                .await;
            status.phase = Some(MachinePhase::Failed);
            status.error_message = Some(message.clone());
            status.last_updated = Some(Time(now));
            patch_status(api, &machine_name, status).await?;
            Err(ControllerError::ValidationError(message))
        }
        Err(e @ ActuatorError::Scope(_)) => {
            // The cloud was never touched, nothing to cache.
            ctx.events
                .publish(
                    machine.object_ref(&()),
                    kube::runtime::events::EventType::Warning,
                    reason::FAILED_CREATE,
                    &format!("{e}"),
                )
                .await;
            Err(e.into())
        }
        Err(e) => {
            ctx.events
                .publish(
                    machine.object_ref(&()),
                    kube::runtime::events::EventType::Warning,
                    reason::FAILED_CREATE,
                    &format!("{e}"),
                )
                .await;
            Err(e.into())
        }
    }
}

async fn update_machine(
    machine: &Machine,
    status: &mut MachineStatus,
    ctx: &ControllerContext,
    actuator: &dyn Actuator,
    api: &dyn Api<Machine>,
    now: chrono::DateTime<Utc>,
) -> Result<Action> {
    let machine_name = machine.name_any();
    let key = machine.machine_key();

    let mut updated = machine.clone();
    match actuator.update(&mut updated).await {
        Ok(()) => {
            ctx.task_ids.write().await.remove(&key);
            ctx.failed_provider_status.write().await.remove(&key);
            let updated_status = updated.status.unwrap_or_default();
            status.provider_status = updated_status.provider_status;
            status.addresses = updated_status.addresses;
            status.phase = Some(if status.node_ref.is_some() {
                MachinePhase::Running
            } else {
                MachinePhase::Provisioned
            });
            status.last_updated = Some(Time(now));
            patch_status(api, &machine_name, status).await?;
            ctx.events
                .publish(
                    machine.object_ref(&()),
                    kube::runtime::events::EventType::Normal,
                    reason::UPDATED,
                    &format!("Updated Machine {machine_name}"),
                )
                .await;
            Ok(Action::await_change())
        }
        Err(ActuatorError::RequeueAfter(delay, note)) => {
            info!("machine {} update in progress: {}", key, note);
            Ok(Action::requeue(delay))
        }
        Err(e) => {
            // Terminal for this pass: any create retry state is spent.
            ctx.task_ids.write().await.remove(&key);
            ctx.failed_provider_status.write().await.remove(&key);
            ctx.events
                .publish(
                    machine.object_ref(&()),
                    kube::runtime::events::EventType::Warning,
                    reason::FAILED_UPDATE,
                    &format!("{e}"),
                )
                .await;
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::actuator::MockActuator;
    use super::super::shared_test_utils::mock_client::MockControllerKubeClient;
    use super::super::shared_test_utils::{assert_action, machine_from_json, test_context, test_context_with_events};
    use super::*;
    use mapi_shared::k8s::api::MockApi;
    use mapi_shared::k8s::events::MockEventSink;
    use mapi_shared::mapi::machine::MachineAuthority;
    use mockall::predicate::*;
    use serde_json::json;

    fn running_machine() -> Machine {
        machine_from_json(json!({
            "apiVersion": "machine.mapi.sh/v1beta1",
            "kind": "Machine",
            "metadata": {
                "name": "worker-0",
                "namespace": "mapi",
                "uid": "machine-uid-0",
                "finalizers": [MACHINE_FINALIZER]
            },
            "spec": {},
            "status": {}
        }))
    }

    fn expect_status_patch(api: &mut MockApi<Machine>, times: usize) {
        api.expect_raw_patch_status()
            .times(times)
            .returning(|_, _, _| Ok(Machine::new("unused", Default::default())));
    }

    #[tokio::test]
    async fn test_reconcile_update_path_persists_status_and_clears_caches() {
        let _ = env_logger::builder().is_test(true).try_init();
        let machine = running_machine();
        let mut client = MockControllerKubeClient::default();
        let mut machine_api: MockApi<Machine> = MockApi::new();
        machine_api
            .expect_raw_patch_status()
            .times(1)
            .withf(|name, patch, _| {
                name == "worker-0"
                    && match patch {
                        Patch::Merge(value) => {
                            value["status"]["phase"] == json!("Provisioned")
                        }
                        _ => false,
                    }
            })
            .returning(|_, _, _| Ok(Machine::new("unused", Default::default())));
        client
            .machine
            .expect_namespaced()
            .return_once(move |_| Box::new(machine_api));
        let ctx = test_context(client);
        ctx.task_ids
            .write()
            .await
            .insert("mapi/worker-0".to_string(), "task-1".to_string());
        ctx.failed_provider_status
            .write()
            .await
            .insert("mapi/worker-0".to_string(), json!({"taskRef": "task-1"}));

        let mut actuator = MockActuator::new();
        actuator.expect_exists().times(1).returning(|_| Ok(true));
        actuator.expect_update().times(1).returning(|_| Ok(()));

        let action = reconcile_inner(&machine, &ctx, &actuator).await.unwrap();
        assert_action(action, Action::await_change());
        assert!(ctx.task_ids.read().await.is_empty());
        assert!(ctx.failed_provider_status.read().await.is_empty());
    }

    // A failed update is just as terminal as a successful one: the create
    // retry state for the machine is dropped either way.
    #[tokio::test]
    async fn test_reconcile_update_failure_clears_caches() {
        let _ = env_logger::builder().is_test(true).try_init();
        let machine = running_machine();
        let mut client = MockControllerKubeClient::default();
        let machine_api: MockApi<Machine> = MockApi::new();
        client
            .machine
            .expect_namespaced()
            .return_once(move |_| Box::new(machine_api));

        let mut events = MockEventSink::new();
        events
            .expect_publish()
            .times(1)
            .withf(|_, _, event_reason, _| event_reason == reason::FAILED_UPDATE)
            .return_const(());
        let ctx = test_context_with_events(client, events);
        ctx.task_ids
            .write()
            .await
            .insert("mapi/worker-0".to_string(), "task-1".to_string());
        ctx.failed_provider_status
            .write()
            .await
            .insert("mapi/worker-0".to_string(), json!({"taskRef": "task-1"}));

        let mut actuator = MockActuator::new();
        actuator.expect_exists().times(1).returning(|_| Ok(true));
        actuator
            .expect_update()
            .times(1)
            .returning(|_| Err(ActuatorError::Other(anyhow::anyhow!("instance degraded"))));

        assert!(reconcile_inner(&machine, &ctx, &actuator).await.is_err());
        assert!(ctx.task_ids.read().await.is_empty());
        assert!(ctx.failed_provider_status.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_create_records_task_and_emits_event() {
        let _ = env_logger::builder().is_test(true).try_init();
        let machine = running_machine();
        let mut client = MockControllerKubeClient::default();
        let mut machine_api: MockApi<Machine> = MockApi::new();
        expect_status_patch(&mut machine_api, 1);
        client
            .machine
            .expect_namespaced()
            .return_once(move |_| Box::new(machine_api));

        let mut events = MockEventSink::new();
        events
            .expect_publish()
            .times(1)
            .withf(|_, _, event_reason, note| {
                event_reason == reason::CREATED && note == "Created Machine worker-0"
            })
            .return_const(());
        let ctx = test_context_with_events(client, events);

        let mut actuator = MockActuator::new();
        actuator.expect_exists().times(1).returning(|_| Ok(false));
        actuator.expect_create().times(1).returning(|machine| {
            machine.status = Some(MachineStatus {
                provider_status: Some(json!({"taskRef": "task-7"})),
                ..Default::default()
            });
            Ok(())
        });

        reconcile_inner(&machine, &ctx, &actuator).await.unwrap();
        assert_eq!(
            ctx.task_ids.read().await.get("mapi/worker-0"),
            Some(&"task-7".to_string())
        );
    }

    // A pending task with an unchanged task ref must not start a second
    // create.
    #[tokio::test]
    async fn test_reconcile_pending_task_skips_create() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut machine = running_machine();
        machine.status = Some(MachineStatus {
            provider_status: Some(json!({"taskRef": "task-7"})),
            ..Default::default()
        });
        let mut client = MockControllerKubeClient::default();
        let machine_api: MockApi<Machine> = MockApi::new();
        client
            .machine
            .expect_namespaced()
            .return_once(move |_| Box::new(machine_api));
        let ctx = test_context(client);
        ctx.task_ids
            .write()
            .await
            .insert("mapi/worker-0".to_string(), "task-7".to_string());

        let mut actuator = MockActuator::new();
        actuator.expect_exists().times(1).returning(|_| Ok(false));
        actuator.expect_create().never();

        let action = reconcile_inner(&machine, &ctx, &actuator).await.unwrap();
        assert_action(action, Action::requeue(PENDING_TASK_REQUEUE));
    }

    // Lost status write: the cached provider status is replayed before any
    // new create is issued.
    #[tokio::test]
    async fn test_reconcile_stale_task_ref_replays_saved_status() {
        let _ = env_logger::builder().is_test(true).try_init();
        let machine = running_machine();
        let mut client = MockControllerKubeClient::default();
        let mut machine_api: MockApi<Machine> = MockApi::new();
        machine_api
            .expect_raw_patch_status()
            .times(1)
            .withf(|_, patch, _| match patch {
                Patch::Merge(value) => {
                    value["status"]["providerStatus"]["taskRef"] == json!("task-7")
                }
                _ => false,
            })
            .returning(|_, _, _| Ok(Machine::new("unused", Default::default())));
        client
            .machine
            .expect_namespaced()
            .return_once(move |_| Box::new(machine_api));
        let ctx = test_context(client);
        ctx.task_ids
            .write()
            .await
            .insert("mapi/worker-0".to_string(), "task-7".to_string());
        ctx.failed_provider_status
            .write()
            .await
            .insert("mapi/worker-0".to_string(), json!({"taskRef": "task-7"}));

        let mut actuator = MockActuator::new();
        actuator.expect_exists().times(1).returning(|_| Ok(false));
        actuator.expect_create().never();

        let action = reconcile_inner(&machine, &ctx, &actuator).await.unwrap();
        assert_action(action, Action::requeue(PENDING_TASK_REQUEUE));
        assert!(ctx.failed_provider_status.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_create_scope_error_is_not_cached() {
        let _ = env_logger::builder().is_test(true).try_init();
        let machine = running_machine();
        let mut client = MockControllerKubeClient::default();
        let machine_api: MockApi<Machine> = MockApi::new();
        client
            .machine
            .expect_namespaced()
            .return_once(move |_| Box::new(machine_api));

        let mut events = MockEventSink::new();
        events
            .expect_publish()
            .times(1)
            .withf(|_, _, event_reason, _| event_reason == reason::FAILED_CREATE)
            .return_const(());
        let ctx = test_context_with_events(client, events);

        let mut actuator = MockActuator::new();
        actuator.expect_exists().times(1).returning(|_| Ok(false));
        actuator
            .expect_create()
            .times(1)
            .returning(|_| Err(ActuatorError::Scope("no cluster context".to_string())));

        assert!(reconcile_inner(&machine, &ctx, &actuator).await.is_err());
        assert!(ctx.task_ids.read().await.is_empty());
        assert!(ctx.failed_provider_status.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_deletion_removes_finalizer_and_emits_event() {
        let _ = env_logger::builder().is_test(true).try_init();
        let machine = machine_from_json(json!({
            "apiVersion": "machine.mapi.sh/v1beta1",
            "kind": "Machine",
            "metadata": {
                "name": "worker-0",
                "namespace": "mapi",
                "uid": "machine-uid-0",
                "deletionTimestamp": "2026-01-01T00:00:00Z",
                "finalizers": [MACHINE_FINALIZER]
            },
            "spec": {},
            "status": { "phase": "Running" }
        }));
        let mut client = MockControllerKubeClient::default();
        let mut machine_api: MockApi<Machine> = MockApi::new();
        expect_status_patch(&mut machine_api, 1);
        machine_api
            .expect_remove_finalizer()
            .times(1)
            .returning(|_, _| Ok(()));
        client
            .machine
            .expect_namespaced()
            .return_once(move |_| Box::new(machine_api));

        let mut events = MockEventSink::new();
        events
            .expect_publish()
            .times(1)
            .withf(|_, _, event_reason, note| {
                event_reason == reason::DELETED && note == "Deleted Machine worker-0"
            })
            .return_const(());
        let ctx = test_context_with_events(client, events);

        let mut actuator = MockActuator::new();
        actuator.expect_delete().times(1).returning(|_| Ok(()));

        let action = reconcile_inner(&machine, &ctx, &actuator).await.unwrap();
        assert_action(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_reconcile_deletion_requeues_on_requeue_after() {
        let _ = env_logger::builder().is_test(true).try_init();
        let machine = machine_from_json(json!({
            "apiVersion": "machine.mapi.sh/v1beta1",
            "kind": "Machine",
            "metadata": {
                "name": "worker-0",
                "namespace": "mapi",
                "uid": "machine-uid-0",
                "deletionTimestamp": "2026-01-01T00:00:00Z",
                "finalizers": [MACHINE_FINALIZER]
            },
            "spec": {},
            "status": { "phase": "Deleting" }
        }));
        let mut client = MockControllerKubeClient::default();
        let machine_api: MockApi<Machine> = MockApi::new();
        client
            .machine
            .expect_namespaced()
            .return_once(move |_| Box::new(machine_api));
        let ctx = test_context(client);

        let mut actuator = MockActuator::new();
        actuator.expect_delete().times(1).returning(|_| {
            Err(ActuatorError::RequeueAfter(
                Duration::from_secs(20),
                "instance draining".to_string(),
            ))
        });

        let action = reconcile_inner(&machine, &ctx, &actuator).await.unwrap();
        assert_action(action, Action::requeue(Duration::from_secs(20)));
    }

    #[tokio::test]
    async fn test_reconcile_paused_when_authority_is_cluster_api() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut machine = running_machine();
        machine.status = Some(MachineStatus {
            authoritative_api: Some(MachineAuthority::ClusterAPI),
            ..Default::default()
        });
        let mut client = MockControllerKubeClient::default();
        let mut machine_api: MockApi<Machine> = MockApi::new();
        machine_api
            .expect_raw_patch_status()
            .times(1)
            .withf(|_, patch, _| match patch {
                Patch::Merge(value) => {
                    let conditions = &value["status"]["conditions"];
                    conditions[0]["type"] == json!("Paused")
                        && conditions[0]["status"] == json!("True")
                        && conditions[0]["reason"] == json!("AuthoritativeAPIisNotMachineAPI")
                }
                _ => false,
            })
            .returning(|_, _, _| Ok(Machine::new("unused", Default::default())));
        client
            .machine
            .expect_namespaced()
            .return_once(move |_| Box::new(machine_api));
        let mut ctx = test_context(client);
        Arc::get_mut(&mut ctx).unwrap().config.machine_api_migration = true;

        // Paused: the actuator must never be driven.
        let actuator = MockActuator::new();
        let action = reconcile_inner(&machine, &ctx, &actuator).await.unwrap();
        assert_action(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_reconcile_invalid_provider_spec_fails_the_machine() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut machine = running_machine();
        machine.spec.provider_spec = Some(json!({ "instanceType": 42 }));
        let mut client = MockControllerKubeClient::default();
        let mut machine_api: MockApi<Machine> = MockApi::new();
        machine_api
            .expect_raw_patch_status()
            .times(1)
            .withf(|_, patch, _| match patch {
                Patch::Merge(value) => value["status"]["phase"] == json!("Failed"),
                _ => false,
            })
            .returning(|_, _, _| Ok(Machine::new("unused", Default::default())));
        client
            .machine
            .expect_namespaced()
            .return_once(move |_| Box::new(machine_api));

        let mut events = MockEventSink::new();
        events
            .expect_publish()
            .times(1)
            .withf(|_, _, event_reason, _| event_reason == reason::RECONCILE_ERROR)
            .return_const(());
        let mut ctx = test_context_with_events(client, events);
        Arc::get_mut(&mut ctx).unwrap().config.platform =
            mapi_shared::mapi::providers::Platform::Aws;

        let actuator = MockActuator::new();
        let result = reconcile_inner(&machine, &ctx, &actuator).await;
        assert!(matches!(result, Err(ControllerError::ValidationError(_))));
    }
}

//! Health evaluation and remediation for MachineHealthChecks.
//!
//! Every reconcile classifies each selected Machine together with its
//! Node into healthy, unhealthy or likely-to-become-unhealthy, enforces
//! the `maxUnhealthy` budget across the whole fleet, and dispatches
//! remediation for the unhealthy: in-tree Machine deletion, or creation
//! of a CR cloned from `spec.remediationTemplate` for an external
//! remediation controller to act on.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{ListParams, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Resource, ResourceExt};
use log::{error, info, trace, warn};
use mapi_shared::k8s::api::{Api, IntoApi};
use mapi_shared::k8s::controller_owner;
use mapi_shared::k8s::events::reason;
use mapi_shared::k8s::selector::{is_empty, matches};
use mapi_shared::mapi::conditions::{
    set_condition, Condition, CONDITION_FALSE, CONDITION_TRUE,
};
use mapi_shared::mapi::health_check::{
    format_max_unhealthy, max_unhealthy_allowed, MachineHealthCheck, MachineHealthCheckStatus,
    UnhealthyCondition, REMEDIATION_ALLOWED_CONDITION, TOO_MANY_UNHEALTHY_REASON,
};
use mapi_shared::mapi::machine::{Machine, MachinePhase};
use mapi_shared::mapi::{CLONED_FROM_GROUP_KIND_ANNOTATION, CLONED_FROM_NAME_ANNOTATION};
use mapi_shared::k8s::{OwnershipInfo, OwnershipType};
use serde_json::{json, Value};

use super::controller_ctx::ControllerContext;
use super::{ControllerError, Result};
use crate::REMEDIATION_COUNT_METRIC;

/// Requeue applied while the unhealthy budget blocks remediation; health
/// may recover without an edge we observe.
const RESTRICTED_REQUEUE: Duration = Duration::from_secs(30);

/// Ephemeral (health check, machine, node) tuple built per reconcile.
/// `node` is `None` when the Machine has no NodeRef yet; a Node carrying
/// only a name marks a Node that was deleted from the cluster.
struct Target {
    machine: Machine,
    node: Option<Node>,
}

impl Target {
    fn node_name(&self) -> String {
        self.node
            .as_ref()
            .map(|node| node.name_any())
            .unwrap_or_default()
    }
}

/// Initialize the health check controller
pub async fn run(ctx: Arc<ControllerContext>) {
    let api: kube::Api<MachineHealthCheck> = match &ctx.config.target_namespace {
        Some(namespace) => {
            IntoApi::<MachineHealthCheck>::namespaced(ctx.client.as_ref(), namespace)
        }
        None => IntoApi::<MachineHealthCheck>::all(ctx.client.as_ref()),
    }
    .as_inner();
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("MachineHealthChecks are not queryable; {e:?}");
        std::process::exit(1);
    }
    Controller::new(api, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

fn error_policy(
    _health_check: Arc<MachineHealthCheck>,
    error: &ControllerError,
    _ctx: Arc<ControllerContext>,
) -> Action {
    warn!("health check reconcile failed: {:?}", error);
    Action::requeue(Duration::from_secs(5 * 60))
}

async fn reconcile(
    health_check: Arc<MachineHealthCheck>,
    ctx: Arc<ControllerContext>,
) -> Result<Action> {
    reconcile_inner(&health_check, &ctx).await
}

pub(crate) async fn reconcile_inner(
    health_check: &MachineHealthCheck,
    ctx: &ControllerContext,
) -> Result<Action> {
    let name = health_check.name_any();
    let Some(namespace) = health_check.namespace() else {
        return Err(ControllerError::ValidationError(format!(
            "health check {name} has no namespace"
        )));
    };
    let now = Utc::now();
    let paused = health_check.is_paused();
    if paused {
        info!("health check {}/{} is paused, remediation disabled", namespace, name);
    }

    if is_empty(&health_check.spec.selector) {
        let message = format!("health check {namespace}/{name}: spec.selector must not be empty");
        ctx.events
            .publish(
                health_check.object_ref(&()),
                kube::runtime::events::EventType::Warning,
                reason::RECONCILE_ERROR,
                &message,
            )
            .await;
        return Err(ControllerError::ValidationError(message));
    }

    let startup_timeout = health_check.node_startup_timeout(ctx.config.node_startup_timeout);
    let machines_api = ctx.machines(&namespace);
    let nodes_api = IntoApi::<Node>::all(ctx.client.as_ref());

    let machines = machines_api.list(&ListParams::default()).await?;
    let mut targets = Vec::new();
    for machine in machines.items {
        if machine.is_deleting() {
            continue;
        }
        if !matches(&health_check.spec.selector, machine.labels()) {
            continue;
        }
        let node = match machine
            .status
            .as_ref()
            .and_then(|status| status.node_ref.as_ref())
            .and_then(|node_ref| node_ref.name.clone())
        {
            None => None,
            Some(node_name) => match nodes_api.get(&node_name).await? {
                Some(node) => Some(node),
                // The referenced Node is gone; a name-only Node marks it.
                None => {
                    let mut deleted = Node::default();
                    deleted.metadata.name = Some(node_name);
                    Some(deleted)
                }
            },
        };
        targets.push(Target { machine, node });
    }

    let mut current_healthy = 0;
    let mut need_remediation = Vec::new();
    let mut healthy_targets = Vec::new();
    let mut next_check_times = Vec::new();
    for target in targets.iter() {
        let (needs_remediation, next_check) = health_check_target(
            target,
            &health_check.spec.unhealthy_conditions,
            startup_timeout,
            now,
        );
        if needs_remediation {
            need_remediation.push(target);
        } else if let Some(next_check) = next_check {
            trace!(
                "health check {}/{} target {} likely unhealthy, next check in {:?}",
                namespace,
                name,
                target.machine.machine_key(),
                next_check
            );
            next_check_times.push(next_check);
        } else {
            current_healthy += 1;
            healthy_targets.push(target);
        }
    }

    let total_targets = targets.len() as i32;
    let unhealthy = total_targets - current_healthy;
    let max_unhealthy =
        max_unhealthy_allowed(health_check.spec.max_unhealthy.as_ref(), total_targets);

    let mut status = MachineHealthCheckStatus {
        expected_machines: Some(total_targets),
        current_healthy: Some(current_healthy),
        remediations_allowed: 0,
        conditions: health_check
            .status
            .as_ref()
            .and_then(|status| status.conditions.clone()),
    };
    let mut conditions = status.conditions.take().unwrap_or_default();

    let allowed = match &max_unhealthy {
        Ok(max_unhealthy) => max_unhealthy - unhealthy >= 0,
        Err(e) => {
            warn!("health check {}/{}: {}", namespace, name, e);
            false
        }
    };

    let api = IntoApi::<MachineHealthCheck>::namespaced(ctx.client.as_ref(), &namespace);
    if !allowed {
        let budget = format_max_unhealthy(health_check.spec.max_unhealthy.as_ref());
        let message = format!(
            "Remediation restricted, total targets: {total_targets}, current healthy: {current_healthy}, maxUnhealthy: {budget}"
        );
        ctx.events
            .publish(
                health_check.object_ref(&()),
                kube::runtime::events::EventType::Warning,
                reason::REMEDIATION_RESTRICTED,
                &message,
            )
            .await;
        set_condition(
            &mut conditions,
            Condition::new(REMEDIATION_ALLOWED_CONDITION, CONDITION_FALSE)
                .with_reason(TOO_MANY_UNHEALTHY_REASON, &message),
            now,
        );
        status.conditions = Some(conditions);
        api.raw_patch_status(
            &name,
            &Patch::Merge(json!({ "status": status })),
            &PatchParams::default(),
        )
        .await?;
        return Ok(Action::requeue(RESTRICTED_REQUEUE));
    }

    set_condition(
        &mut conditions,
        Condition::new(REMEDIATION_ALLOWED_CONDITION, CONDITION_TRUE),
        now,
    );
    status.conditions = Some(conditions);
    if let Ok(max_unhealthy) = &max_unhealthy {
        let remaining =
            max_unhealthy - (total_targets - current_healthy - need_remediation.len() as i32);
        status.remediations_allowed = remaining.max(0);
    }

    let mut remediation_errors: Vec<anyhow::Error> = Vec::new();
    if !paused {
        for target in &need_remediation {
            remediate_target(
                target,
                health_check,
                ctx,
                machines_api.as_ref(),
                &mut remediation_errors,
            )
            .await;
        }
        // Targets that recovered take their external remediation CR with
        // them.
        if health_check.spec.remediation_template.is_some() {
            for target in &healthy_targets {
                if let Err(e) = remove_external_remediation(health_check, &target.machine, ctx).await
                {
                    remediation_errors.push(e);
                }
            }
        }
    }

    api.raw_patch_status(
        &name,
        &Patch::Merge(json!({ "status": status })),
        &PatchParams::default(),
    )
    .await?;

    if !remediation_errors.is_empty() {
        let combined = remediation_errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(ControllerError::Other(anyhow::anyhow!(
            "{} remediation errors: {}",
            remediation_errors.len(),
            combined
        )));
    }

    match next_check_times.into_iter().min() {
        Some(next_check) => Ok(Action::requeue(next_check)),
        None => Ok(Action::await_change()),
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Classifies one target. Returns whether it needs remediation now and,
/// when a timer is still running against it, when to look again.
///
/// A target counts as healthy only when neither is set.
fn health_check_target(
    target: &Target,
    unhealthy_conditions: &[UnhealthyCondition],
    startup_timeout: Duration,
    now: DateTime<Utc>,
) -> (bool, Option<Duration>) {
    let machine = &target.machine;
    if machine.phase() == Some(&MachinePhase::Failed) {
        return (true, None);
    }

    let Some(node) = &target.node else {
        // No Node yet: judge against the startup timeout.
        if startup_timeout.is_zero() {
            return (false, None);
        }
        let Some(Time(last_updated)) = machine
            .status
            .as_ref()
            .and_then(|status| status.last_updated.as_ref())
        else {
            return (false, Some(startup_timeout));
        };
        let deadline = *last_updated + chrono_duration(startup_timeout);
        if now > deadline {
            return (true, None);
        }
        let remaining = (deadline - now + chrono::Duration::seconds(1))
            .to_std()
            .unwrap_or_default();
        return (false, Some(remaining));
    };

    if node.uid().unwrap_or_default().is_empty() {
        // The Node existed once and is gone.
        return (true, None);
    }

    let node_conditions = node
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref());
    let mut next_check: Option<Duration> = None;
    for unhealthy_condition in unhealthy_conditions {
        let Some(timeout) = unhealthy_condition.timeout() else {
            warn!(
                "skipping unhealthy condition {} with unparseable timeout {:?}",
                unhealthy_condition.condition_type, unhealthy_condition.timeout
            );
            continue;
        };
        let Some(node_condition) = node_conditions.and_then(|conditions| {
            conditions.iter().find(|condition| {
                condition.type_ == unhealthy_condition.condition_type
                    && condition.status == unhealthy_condition.status
            })
        }) else {
            continue;
        };
        let since = node_condition
            .last_transition_time
            .as_ref()
            .map(|Time(transition)| *transition)
            .unwrap_or(now);
        let deadline = since + chrono_duration(timeout);
        if now > deadline {
            return (true, None);
        }
        let remaining = (deadline - now + chrono::Duration::seconds(1))
            .to_std()
            .unwrap_or_default();
        next_check = Some(match next_check {
            Some(current) => current.min(remaining),
            None => remaining,
        });
    }
    (false, next_check)
}

async fn remediate_target(
    target: &Target,
    health_check: &MachineHealthCheck,
    ctx: &ControllerContext,
    machines_api: &dyn Api<Machine>,
    errors: &mut Vec<anyhow::Error>,
) {
    let machine = &target.machine;
    let machine_key = machine.machine_key();
    let namespace = health_check.namespace().unwrap_or_default();
    let name = health_check.name_any();

    ctx.events
        .publish(
            machine.object_ref(&()),
            kube::runtime::events::EventType::Normal,
            reason::DETECTED_UNHEALTHY,
            &format!(
                "Machine {} has unhealthy node {}",
                machine_key,
                target.node_name()
            ),
        )
        .await;

    if machine.is_master() {
        ctx.events
            .publish(
                machine.object_ref(&()),
                kube::runtime::events::EventType::Normal,
                reason::SKIPPED_MASTER,
                &format!("Machine {machine_key} is a control plane machine, skipping remediation"),
            )
            .await;
        return;
    }
    if controller_owner(&machine.metadata).is_none() {
        ctx.events
            .publish(
                machine.object_ref(&()),
                kube::runtime::events::EventType::Normal,
                reason::SKIPPED_NO_CONTROLLER,
                &format!("Machine {machine_key} has no controller owner, skipping remediation"),
            )
            .await;
        return;
    }

    if health_check.spec.remediation_template.is_some() {
        match create_external_remediation(health_check, machine, ctx).await {
            Ok(true) => {
                REMEDIATION_COUNT_METRIC
                    .with_label_values(&[namespace.as_str(), name.as_str(), "external"])
                    .inc();
                ctx.events
                    .publish(
                        machine.object_ref(&()),
                        kube::runtime::events::EventType::Normal,
                        reason::EXTERNAL_ANNOTATION_ADDED,
                        &format!("Requested external remediation of machine {machine_key}"),
                    )
                    .await;
            }
            Ok(false) => {
                trace!("external remediation for {} already requested", machine_key);
            }
            Err(e) => {
                ctx.events
                    .publish(
                        machine.object_ref(&()),
                        kube::runtime::events::EventType::Warning,
                        reason::EXTERNAL_ANNOTATION_FAILED,
                        &format!("Failed to request external remediation of machine {machine_key}: {e}"),
                    )
                    .await;
                errors.push(e);
            }
        }
        return;
    }

    match machines_api.delete(&machine.name_any()).await {
        Ok(_) => {
            REMEDIATION_COUNT_METRIC
                .with_label_values(&[namespace.as_str(), name.as_str(), "internal"])
                .inc();
            ctx.events
                .publish(
                    health_check.object_ref(&()),
                    kube::runtime::events::EventType::Normal,
                    reason::MACHINE_DELETED,
                    &format!("Machine {machine_key} has been remediated by deletion"),
                )
                .await;
        }
        Err(e) => {
            ctx.events
                .publish(
                    health_check.object_ref(&()),
                    kube::runtime::events::EventType::Warning,
                    reason::MACHINE_DELETION_FAILED,
                    &format!("Machine {machine_key} remediation failed: {e}"),
                )
                .await;
            errors.push(e.into());
        }
    }
}

/// Resolves the remediation template reference into the ApiResources of
/// the template and the remediation object it stamps out. The object kind
/// is the template kind with the `Template` suffix stripped.
fn remediation_resources(
    template_ref: &ObjectReference,
) -> anyhow::Result<(ApiResource, ApiResource, String)> {
    let api_version = template_ref
        .api_version
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("remediation template has no apiVersion"))?;
    let kind = template_ref
        .kind
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("remediation template has no kind"))?;
    let template_name = template_ref
        .name
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("remediation template has no name"))?;
    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    };
    let template_resource = ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind));
    let object_kind = kind.strip_suffix("Template").unwrap_or(kind);
    let object_resource =
        ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, object_kind));
    Ok((template_resource, object_resource, template_name.to_string()))
}

/// Creates the external remediation CR for a machine by cloning the
/// template's `spec.template` sub-tree. The object is named after the
/// machine, which makes creation idempotent: if it already exists nothing
/// happens and `Ok(false)` is returned.
async fn create_external_remediation(
    health_check: &MachineHealthCheck,
    machine: &Machine,
    ctx: &ControllerContext,
) -> anyhow::Result<bool> {
    let Some(template_ref) = health_check.spec.remediation_template.as_ref() else {
        return Ok(false);
    };
    let (template_resource, object_resource, template_name) =
        remediation_resources(template_ref)?;
    let namespace = machine.namespace().unwrap_or_default();
    let machine_name = machine.name_any();

    let template = ctx
        .client
        .dynamic(&namespace, &template_resource)
        .get(&template_name)
        .await?
        .ok_or_else(|| {
            anyhow::anyhow!("remediation template {}/{} not found", namespace, template_name)
        })?;

    let object_api = ctx.client.dynamic(&namespace, &object_resource);
    if object_api.get(&machine_name).await?.is_some() {
        return Ok(false);
    }

    let template_spec = template
        .data
        .get("spec")
        .and_then(|spec| spec.get("template"))
        .cloned()
        .unwrap_or(Value::Null);
    let spec = template_spec
        .get("spec")
        .cloned()
        .unwrap_or(template_spec);

    let mut object = DynamicObject::new(&machine_name, &object_resource).within(&namespace);
    object.data = json!({ "spec": spec });
    object.metadata.annotations = Some(
        [
            (
                CLONED_FROM_NAME_ANNOTATION.to_string(),
                template_name.clone(),
            ),
            (
                CLONED_FROM_GROUP_KIND_ANNOTATION.to_string(),
                format!(
                    "{}.{}",
                    template_ref.kind.as_deref().unwrap_or_default(),
                    template_ref.api_version.as_deref().unwrap_or_default().split('/').next().unwrap_or_default()
                ),
            ),
        ]
        .into_iter()
        .collect(),
    );
    object.metadata.owner_references = Some(vec![OwnershipInfo::new(
        OwnershipType::Machine,
        machine_name.clone(),
        machine.uid().unwrap_or_default(),
    )
    .to_owner_reference()]);

    object_api.create(&object).await?;
    info!(
        "created external remediation {} for machine {}/{}",
        object_resource.kind, namespace, machine_name
    );
    Ok(true)
}

/// Deletes the external remediation CR of a machine that is healthy
/// again, if one exists.
async fn remove_external_remediation(
    health_check: &MachineHealthCheck,
    machine: &Machine,
    ctx: &ControllerContext,
) -> anyhow::Result<()> {
    let Some(template_ref) = health_check.spec.remediation_template.as_ref() else {
        return Ok(());
    };
    let (_, object_resource, _) = remediation_resources(template_ref)?;
    let namespace = machine.namespace().unwrap_or_default();
    let machine_name = machine.name_any();

    let object_api = ctx.client.dynamic(&namespace, &object_resource);
    if object_api.get(&machine_name).await?.is_some() {
        info!(
            "machine {}/{} is healthy again, removing external remediation",
            namespace, machine_name
        );
        object_api.delete(&machine_name).await?;
    }
    Ok(())
}

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::client::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use log::{info, warn};
use mockall::automock;

/// Event reasons emitted by the controllers. Messages carry the detail;
/// reasons stay machine matchable.
pub mod reason {
    pub const CREATED: &str = "Created";
    pub const UPDATED: &str = "Updated";
    pub const DELETED: &str = "Deleted";
    pub const FAILED_CREATE: &str = "FailedCreate";
    pub const FAILED_UPDATE: &str = "FailedUpdate";
    pub const FAILED_DELETE: &str = "FailedDelete";
    pub const MACHINE_DELETED: &str = "MachineDeleted";
    pub const MACHINE_DELETION_FAILED: &str = "MachineDeletionFailed";
    pub const EXTERNAL_ANNOTATION_ADDED: &str = "ExternalAnnotationAdded";
    pub const EXTERNAL_ANNOTATION_FAILED: &str = "ExternalAnnotationFailed";
    pub const DETECTED_UNHEALTHY: &str = "DetectedUnhealthy";
    pub const REMEDIATION_RESTRICTED: &str = "RemediationRestricted";
    pub const SKIPPED_NO_CONTROLLER: &str = "SkippedNoController";
    pub const SKIPPED_MASTER: &str = "SkippedMaster";
    pub const RECONCILE_ERROR: &str = "ReconcileError";
}

/// Named event emission, mockable for tests. The cluster recorder
/// deduplicates repeated events by (object, reason, note).
#[automock]
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(
        &self,
        reference: ObjectReference,
        event_type: EventType,
        event_reason: &str,
        note: &str,
    );
}

/// EventSink backed by the cluster event API.
pub struct RecorderSink {
    client: Client,
    reporter: Reporter,
}

impl RecorderSink {
    pub fn new(client: Client) -> Self {
        RecorderSink {
            client,
            reporter: Reporter {
                controller: "mapi-controller".into(),
                instance: None,
            },
        }
    }
}

#[async_trait]
impl EventSink for RecorderSink {
    async fn publish(
        &self,
        reference: ObjectReference,
        event_type: EventType,
        event_reason: &str,
        note: &str,
    ) {
        info!(
            "event {:?} {} for {}/{}: {}",
            event_type,
            event_reason,
            reference.namespace.as_deref().unwrap_or_default(),
            reference.name.as_deref().unwrap_or_default(),
            note
        );
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference);
        // Event emission is observability only, never a reconcile failure.
        if let Err(e) = recorder
            .publish(Event {
                type_: event_type,
                reason: event_reason.to_string(),
                note: Some(note.to_string()),
                action: event_reason.to_string(),
                secondary: None,
            })
            .await
        {
            warn!("failed to publish event {}: {:?}", event_reason, e);
        }
    }
}

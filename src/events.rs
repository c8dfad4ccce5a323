//! Kubernetes Event recording for the Broker controller.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so reconciliation failures show up in `kubectl describe broker`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. Control flow never depends on whether an event landed.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

/// Trait for publishing Kubernetes Events.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "InternalError")
    /// * `action` - What action was taken (e.g. "Reconcile")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as the given controller name.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Publisher that drops every event.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// A reconcile step failed
    pub const INTERNAL_ERROR: &str = "InternalError";
    /// Writing the Broker status failed
    pub const UPDATE_FAILED: &str = "UpdateFailed";
    /// The dead letter sink destination cannot be resolved as written
    pub const INVALID_DEAD_LETTER_SINK: &str = "InvalidDeadLetterSink";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Status subresource write
    pub const UPDATE_STATUS: &str = "UpdateStatus";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[test]
    fn reason_constants_are_pascal_case() {
        assert_eq!(reasons::INTERNAL_ERROR, "InternalError");
        assert_eq!(reasons::UPDATE_FAILED, "UpdateFailed");
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        let publisher = NoopEventPublisher;
        publisher
            .publish(
                &ObjectReference::default(),
                EventType::Warning,
                reasons::INTERNAL_ERROR,
                actions::RECONCILE,
                Some("test".to_string()),
            )
            .await;
    }

    #[tokio::test]
    async fn mock_publisher_records_reason_and_note() {
        let mut events = MockEventPublisher::new();
        events
            .expect_publish()
            .withf(|_, type_, reason, action, note| {
                *type_ == EventType::Warning
                    && reason == reasons::UPDATE_FAILED
                    && action == actions::UPDATE_STATUS
                    && note.as_deref() == Some("conflict")
            })
            .times(1)
            .returning(|_, _, _, _, _| ());

        events
            .publish(
                &ObjectReference::default(),
                EventType::Warning,
                reasons::UPDATE_FAILED,
                actions::UPDATE_STATUS,
                Some("conflict".to_string()),
            )
            .await;
    }
}

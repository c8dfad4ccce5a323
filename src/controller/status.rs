//! Broker status folding
//!
//! [`aggregate`] is pure: it takes the previous status and what this pass
//! observed, and returns the next status. Steps the pass never reached are
//! `None` in [`Observations`] and keep their previous condition, so a pass
//! that stops early does not erase what an earlier pass learned.

use super::address::ResolveError;
use crate::crd::{
    Addressable, BrokerStatus, Condition, ConditionStatus, CHANNEL_ADDRESS_ANNOTATION,
    CHANNEL_API_VERSION_ANNOTATION, CHANNEL_KIND_ANNOTATION, CHANNEL_NAME_ANNOTATION,
};

/// Trigger channel exists and is addressable
pub const TRIGGER_CHANNEL_READY: &str = "TriggerChannelReady";
/// Shared filter deployment has ready endpoints
pub const FILTER_READY: &str = "FilterReady";
/// Shared ingress deployment has ready endpoints
pub const INGRESS_READY: &str = "IngressReady";
/// Broker has a public address
pub const ADDRESSABLE: &str = "Addressable";
/// Dead letter sink resolved, or none configured
pub const DEAD_LETTER_SINK_RESOLVED: &str = "DeadLetterSinkResolved";
/// Overall readiness, derived from the others
pub const READY: &str = "Ready";

/// Conditions that feed Ready, in the order their failures are reported
pub const DEPENDENT_CONDITIONS: [&str; 5] = [
    TRIGGER_CHANNEL_READY,
    FILTER_READY,
    INGRESS_READY,
    ADDRESSABLE,
    DEAD_LETTER_SINK_RESOLVED,
];

/// Condition reasons
pub mod reasons {
    /// The channel template could not be read
    pub const CHANNEL_TEMPLATE_FAILED: &str = "ChannelTemplateFailed";
    /// The trigger channel could not be created or patched
    pub const CHANNEL_FAILURE: &str = "ChannelFailure";
    /// Filter or ingress endpoints are missing
    pub const SERVICE_FAILURE: &str = "ServiceFailure";
    /// The dead letter sink is malformed
    pub const INVALID_DEAD_LETTER_SINK: &str = "InvalidDeadLetterSink";
    /// No dead letter sink is declared
    pub const DEAD_LETTER_SINK_NOT_CONFIGURED: &str = "DeadLetterSinkNotConfigured";
}

const CHANNEL_NO_ADDRESS_MESSAGE: &str = "Channel does not have an address.";
const DEAD_LETTER_SINK_NOT_CONFIGURED_MESSAGE: &str = "No dead letter sink is configured.";

/// Identity and address of a ready trigger channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelSummary {
    /// Channel apiVersion
    pub api_version: String,
    /// Channel kind
    pub kind: String,
    /// Channel name
    pub name: String,
    /// Channel address URL
    pub url: String,
}

/// Outcome of the template and channel steps
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// The channel template could not be read; carries the cause
    TemplateFailed(String),
    /// Creating, reading or patching the channel failed
    Failed(String),
    /// The channel is missing or has no address yet
    Unresolved(ResolveError),
    /// The channel is addressable
    Ready(ChannelSummary),
}

/// Outcome of an endpoints check
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceState {
    /// At least one ready address
    Ready,
    /// Missing or not ready; carries the message
    Failed(String),
}

/// Outcome of dead letter sink resolution
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkState {
    /// No sink declared
    NotConfigured,
    /// Sink resolved to this URI
    Resolved(String),
    /// Sink declared but unusable
    Failed {
        /// Condition reason
        reason: String,
        /// Condition message
        message: String,
    },
}

/// Everything one reconcile pass learned
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Observations {
    /// Template and channel outcome
    pub channel: Option<ChannelState>,
    /// Filter endpoints outcome
    pub filter: Option<ServiceState>,
    /// Ingress endpoints outcome
    pub ingress: Option<ServiceState>,
    /// Dead letter sink outcome
    pub dead_letter_sink: Option<SinkState>,
    /// Public Broker address
    pub address: Option<String>,
}

/// Fold this pass's observations into the previous status
pub fn aggregate(
    previous: &BrokerStatus,
    observed: &Observations,
    generation: Option<i64>,
) -> BrokerStatus {
    let mut status = previous.clone();
    status.observed_generation = generation;

    for type_ in DEPENDENT_CONDITIONS.iter().chain(std::iter::once(&READY)) {
        if status.condition(type_).is_none() {
            status
                .conditions
                .push(Condition::new(*type_, ConditionStatus::Unknown, "", ""));
        }
    }

    if let Some(channel) = &observed.channel {
        apply_channel(&mut status, channel);
    }
    if let Some(filter) = &observed.filter {
        set_condition(&mut status.conditions, service_condition(FILTER_READY, filter));
    }
    if let Some(ingress) = &observed.ingress {
        set_condition(&mut status.conditions, service_condition(INGRESS_READY, ingress));
    }
    if let Some(sink) = &observed.dead_letter_sink {
        apply_sink(&mut status, sink);
    }
    if let Some(url) = &observed.address {
        status.address = Some(Addressable {
            url: Some(url.clone()),
        });
        set_condition(
            &mut status.conditions,
            Condition::new(ADDRESSABLE, ConditionStatus::True, "", ""),
        );
    }

    let ready = derive_ready(&status.conditions);
    set_condition(&mut status.conditions, ready);
    status
}

fn apply_channel(status: &mut BrokerStatus, channel: &ChannelState) {
    let condition = match channel {
        ChannelState::TemplateFailed(cause) => Condition::new(
            TRIGGER_CHANNEL_READY,
            ConditionStatus::False,
            reasons::CHANNEL_TEMPLATE_FAILED,
            format!("Error on setting up the ChannelTemplate: {}", cause),
        ),
        ChannelState::Failed(message) => Condition::new(
            TRIGGER_CHANNEL_READY,
            ConditionStatus::False,
            reasons::CHANNEL_FAILURE,
            message.clone(),
        ),
        ChannelState::Unresolved(err) => {
            let message = match err {
                ResolveError::NoAddress { .. } => CHANNEL_NO_ADDRESS_MESSAGE.to_string(),
                ResolveError::NotFound { .. } => err.to_string(),
            };
            Condition::new(
                TRIGGER_CHANNEL_READY,
                ConditionStatus::False,
                err.reason(),
                message,
            )
        }
        ChannelState::Ready(summary) => {
            for (key, value) in [
                (CHANNEL_ADDRESS_ANNOTATION, &summary.url),
                (CHANNEL_API_VERSION_ANNOTATION, &summary.api_version),
                (CHANNEL_KIND_ANNOTATION, &summary.kind),
                (CHANNEL_NAME_ANNOTATION, &summary.name),
            ] {
                status.annotations.insert(key.to_string(), value.clone());
            }
            Condition::new(TRIGGER_CHANNEL_READY, ConditionStatus::True, "", "")
        }
    };
    set_condition(&mut status.conditions, condition);
}

fn service_condition(type_: &str, state: &ServiceState) -> Condition {
    match state {
        ServiceState::Ready => Condition::new(type_, ConditionStatus::True, "", ""),
        ServiceState::Failed(message) => Condition::new(
            type_,
            ConditionStatus::False,
            reasons::SERVICE_FAILURE,
            message.clone(),
        ),
    }
}

fn apply_sink(status: &mut BrokerStatus, sink: &SinkState) {
    let condition = match sink {
        SinkState::NotConfigured => {
            status.dead_letter_sink_uri = None;
            Condition::new(
                DEAD_LETTER_SINK_RESOLVED,
                ConditionStatus::True,
                reasons::DEAD_LETTER_SINK_NOT_CONFIGURED,
                DEAD_LETTER_SINK_NOT_CONFIGURED_MESSAGE,
            )
        }
        SinkState::Resolved(uri) => {
            status.dead_letter_sink_uri = Some(uri.clone());
            Condition::new(DEAD_LETTER_SINK_RESOLVED, ConditionStatus::True, "", "")
        }
        SinkState::Failed { reason, message } => {
            // A stale URI would keep advertising a sink that no longer resolves
            status.dead_letter_sink_uri = None;
            Condition::new(
                DEAD_LETTER_SINK_RESOLVED,
                ConditionStatus::False,
                reason.clone(),
                message.clone(),
            )
        }
    };
    set_condition(&mut status.conditions, condition);
}

/// Replace the condition of the same type unless only its timestamp differs
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) if existing.same_state(&condition) => {}
        Some(existing) => *existing = condition,
        None => conditions.push(condition),
    }
}

fn derive_ready(conditions: &[Condition]) -> Condition {
    let dependents: Vec<&Condition> = DEPENDENT_CONDITIONS
        .iter()
        .filter_map(|type_| conditions.iter().find(|c| c.type_ == *type_))
        .collect();

    if let Some(failed) = dependents
        .iter()
        .find(|c| c.status == ConditionStatus::False)
    {
        return Condition::new(
            READY,
            ConditionStatus::False,
            failed.reason.clone(),
            failed.message.clone(),
        );
    }
    if dependents.len() == DEPENDENT_CONDITIONS.len() && dependents.iter().all(|c| c.is_true()) {
        Condition::new(READY, ConditionStatus::True, "", "")
    } else {
        Condition::new(READY, ConditionStatus::Unknown, "", "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const ADDRESS: &str =
        "http://broker-ingress.knative-testing.svc.cluster.local/test-namespace/test-broker";

    fn summary() -> ChannelSummary {
        ChannelSummary {
            api_version: "messaging.knative.dev/v1".to_string(),
            kind: "InMemoryChannel".to_string(),
            name: "test-broker-kne-trigger".to_string(),
            url: "http://test-broker-kne-trigger-kn-channel.test-namespace.svc.cluster.local"
                .to_string(),
        }
    }

    fn converged() -> Observations {
        Observations {
            channel: Some(ChannelState::Ready(summary())),
            filter: Some(ServiceState::Ready),
            ingress: Some(ServiceState::Ready),
            dead_letter_sink: Some(SinkState::NotConfigured),
            address: Some(ADDRESS.to_string()),
        }
    }

    fn status_of(status: &BrokerStatus, type_: &str) -> ConditionStatus {
        status.condition(type_).unwrap().status
    }

    /// Story: A fully converged Broker becomes Ready with its public address
    #[test]
    fn story_converged_broker_is_ready() {
        let status = aggregate(&BrokerStatus::default(), &converged(), Some(1));

        assert_eq!(status_of(&status, READY), ConditionStatus::True);
        assert_eq!(status.address_url(), Some(ADDRESS));
        assert_eq!(status.observed_generation, Some(1));
        assert_eq!(
            status.condition(DEAD_LETTER_SINK_RESOLVED).unwrap().reason,
            reasons::DEAD_LETTER_SINK_NOT_CONFIGURED
        );
        assert_eq!(
            status.annotations.get(CHANNEL_NAME_ANNOTATION).unwrap(),
            "test-broker-kne-trigger"
        );
        assert_eq!(
            status.annotations.get(CHANNEL_KIND_ANNOTATION).unwrap(),
            "InMemoryChannel"
        );
    }

    /// Story: Folding the same observations twice changes nothing
    #[test]
    fn story_unchanged_pass_is_equal() {
        let first = aggregate(&BrokerStatus::default(), &converged(), Some(1));
        let second = aggregate(&first, &converged(), Some(1));
        assert_eq!(first, second);
    }

    /// Story: A channel without address stops readiness with its own message
    #[test]
    fn story_channel_without_address_keeps_ready_false() {
        let observed = Observations {
            channel: Some(ChannelState::Unresolved(ResolveError::NoAddress {
                kind: "InMemoryChannel".to_string(),
                namespace: "test-namespace".to_string(),
                name: "test-broker-kne-trigger".to_string(),
            })),
            ..Default::default()
        };
        let status = aggregate(&BrokerStatus::default(), &observed, None);

        let ready = status.condition(READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, "NoAddress");
        assert_eq!(ready.message, "Channel does not have an address.");
        assert_eq!(status_of(&status, FILTER_READY), ConditionStatus::Unknown);
        assert!(status.address.is_none());
    }

    #[test]
    fn template_failure_is_prefixed() {
        let observed = Observations {
            channel: Some(ChannelState::TemplateFailed(
                "configmap \"test-configmap\" not found".to_string(),
            )),
            ..Default::default()
        };
        let status = aggregate(&BrokerStatus::default(), &observed, None);
        let cond = status.condition(TRIGGER_CHANNEL_READY).unwrap();
        assert_eq!(cond.reason, reasons::CHANNEL_TEMPLATE_FAILED);
        assert_eq!(
            cond.message,
            "Error on setting up the ChannelTemplate: configmap \"test-configmap\" not found"
        );
    }

    #[rstest]
    #[case::filter_down(FILTER_READY)]
    #[case::ingress_down(INGRESS_READY)]
    fn service_failure_blocks_ready(#[case] failing: &str) {
        let mut observed = converged();
        let failure = ServiceState::Failed("endpoints \"broker-filter\" not found".to_string());
        if failing == FILTER_READY {
            observed.filter = Some(failure);
        } else {
            observed.ingress = Some(failure);
        }

        let status = aggregate(&BrokerStatus::default(), &observed, None);
        let ready = status.condition(READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, reasons::SERVICE_FAILURE);
        assert_eq!(status_of(&status, failing), ConditionStatus::False);
    }

    #[test]
    fn first_failure_in_order_explains_ready() {
        let mut observed = converged();
        observed.channel = Some(ChannelState::Failed("channel broken".to_string()));
        observed.ingress = Some(ServiceState::Failed("ingress broken".to_string()));

        let status = aggregate(&BrokerStatus::default(), &observed, None);
        assert_eq!(status.condition(READY).unwrap().message, "channel broken");
    }

    /// Story: A sink that stops resolving clears the cached URI
    #[test]
    fn story_unresolvable_sink_reverts_uri() {
        let mut observed = converged();
        observed.dead_letter_sink = Some(SinkState::Resolved(
            "http://test-dls.test-namespace.svc.cluster.local".to_string(),
        ));
        let resolved = aggregate(&BrokerStatus::default(), &observed, None);
        assert!(resolved.dead_letter_sink_uri.is_some());

        observed.dead_letter_sink = Some(SinkState::Failed {
            reason: "NotFound".to_string(),
            message: "Broker \"test-namespace/test-sink\" not found".to_string(),
        });
        let failed = aggregate(&resolved, &observed, None);
        assert!(failed.dead_letter_sink_uri.is_none());
        assert_eq!(status_of(&failed, DEAD_LETTER_SINK_RESOLVED), ConditionStatus::False);
        assert_eq!(status_of(&failed, READY), ConditionStatus::False);
    }

    #[test]
    fn unchanged_condition_keeps_transition_time() {
        let mut conditions = vec![Condition::new(FILTER_READY, ConditionStatus::True, "", "")];
        let original = conditions[0].last_transition_time;

        let later = Condition {
            last_transition_time: original + chrono::Duration::seconds(30),
            ..conditions[0].clone()
        };
        set_condition(&mut conditions, later);
        assert_eq!(conditions[0].last_transition_time, original);

        set_condition(
            &mut conditions,
            Condition::new(FILTER_READY, ConditionStatus::False, "ServiceFailure", "gone"),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, ConditionStatus::False);
    }

    #[test]
    fn steps_not_reached_keep_previous_conditions() {
        let ready = aggregate(&BrokerStatus::default(), &converged(), Some(1));
        let filter_before = ready.condition(FILTER_READY).cloned();

        let observed = Observations {
            channel: Some(ChannelState::Failed("patch rejected".to_string())),
            ..Default::default()
        };
        let status = aggregate(&ready, &observed, Some(2));
        assert_eq!(status.condition(FILTER_READY).cloned(), filter_before);
        assert_eq!(status.address_url(), Some(ADDRESS));
        assert_eq!(status_of(&status, READY), ConditionStatus::False);
    }
}

//! Broker reconciliation
//!
//! One pass reads the channel template, converges the trigger channel,
//! checks the shared filter and ingress endpoints, resolves the dead letter
//! sink and writes the folded status back. Every failure is turned into a
//! condition, a Warning event and an error for the error policy.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use super::address::{object_address, resolve_destination, validate_destination, DestinationError};
use super::channel::reconcile_trigger_channel;
use super::client::{BrokerKubeClient, KubeClientImpl};
use super::endpoints::check_endpoints;
use super::status::{
    aggregate, reasons, ChannelState, ChannelSummary, Observations, ServiceState, SinkState,
    READY,
};
use super::template::resolve_channel_template;
use crate::backoff::{BackoffConfig, KeyedBackoff};
use crate::config::ControllerConfig;
use crate::crd::{Broker, BrokerStatus};
use crate::events::{actions, reasons as event_reasons, EventPublisher, KubeEventPublisher};
use crate::{Error, FIELD_MANAGER, FILTER_ROLE, INGRESS_ROLE};

/// Requeue delay while the trigger channel has no address
pub const CHANNEL_NO_ADDRESS_REQUEUE: Duration = Duration::from_secs(10);

/// Requeue delay after losing a create race for the trigger channel
pub const CHANNEL_CREATE_RACE_REQUEUE: Duration = Duration::from_secs(2);

/// Requeue delay while a declared dead letter sink cannot be resolved
pub const SINK_UNRESOLVED_REQUEUE: Duration = Duration::from_secs(30);

/// Controller context containing shared state and clients
///
/// The context is shared across all reconciliation calls. Use
/// [`ContextBuilder`] in the binary and [`Context::from_parts`] when the
/// collaborators are already built:
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .config(ControllerConfig::default().with_system_namespace("knative-eventing"))
///     .build();
/// ```
pub struct Context {
    /// Kubernetes access (trait object for testability)
    pub kube: Arc<dyn BrokerKubeClient>,
    /// Event publisher for operator-visible failures
    pub events: Arc<dyn EventPublisher>,
    /// Controller configuration
    pub config: ControllerConfig,
    /// Per-Broker retry schedule used by [`error_policy`]
    pub backoff: KeyedBackoff,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Assemble a context from already-built collaborators
    pub fn from_parts(
        kube: Arc<dyn BrokerKubeClient>,
        events: Arc<dyn EventPublisher>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            kube,
            events,
            config,
            backoff: KeyedBackoff::new(BackoffConfig::default()),
        }
    }

    /// Create a context for unit tests with mock collaborators.
    ///
    /// Uses the `knative-testing` system namespace and a jitter-free backoff.
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn BrokerKubeClient>, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            kube,
            events,
            config: ControllerConfig::default().with_system_namespace("knative-testing"),
            backoff: KeyedBackoff::new(BackoffConfig::without_jitter()),
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .kube_client(mock_kube)
///     .event_publisher(Arc::new(NoopEventPublisher))
///     .build();
/// ```
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn BrokerKubeClient>>,
    events: Option<Arc<dyn EventPublisher>>,
    config: ControllerConfig,
    backoff: BackoffConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            events: None,
            config: ControllerConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }

    /// Set the controller configuration
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn BrokerKubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the retry schedule
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), FIELD_MANAGER))
            }),
            config: self.config,
            backoff: KeyedBackoff::new(self.backoff),
        }
    }
}

/// Reconcile a Broker
///
/// A successful pass clears the Broker's retry history.
#[instrument(skip(broker, ctx), fields(broker = %broker.key()))]
pub async fn reconcile(broker: Arc<Broker>, ctx: Arc<Context>) -> Result<Action, Error> {
    let result = reconcile_broker(&broker, &ctx).await;
    if result.is_ok() {
        ctx.backoff.reset(&broker.key());
    }
    result
}

/// Reconcile the Broker behind a `namespace/name` work-queue key.
///
/// Malformed keys and Brokers that no longer exist are dropped without
/// retrying.
pub async fn reconcile_key(key: &str, ctx: Arc<Context>) -> Result<Action, Error> {
    let Some((namespace, name)) = split_key(key) else {
        error!(key, "invalid resource key");
        return Ok(Action::await_change());
    };

    match ctx.kube.get_broker(namespace, name).await? {
        Some(broker) => reconcile(Arc::new(broker), ctx).await,
        None => {
            debug!(key, "broker no longer exists");
            ctx.backoff.reset(key);
            Ok(Action::await_change())
        }
    }
}

fn split_key(key: &str) -> Option<(&str, &str)> {
    let mut parts = key.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(namespace), Some(name), None) if !namespace.is_empty() && !name.is_empty() => {
            Some((namespace, name))
        }
        _ => None,
    }
}

async fn reconcile_broker(broker: &Broker, ctx: &Context) -> Result<Action, Error> {
    if broker.meta().deletion_timestamp.is_some() {
        debug!("broker is being deleted");
        return Ok(Action::await_change());
    }
    if broker.class() != Some(ctx.config.broker_class.as_str()) {
        debug!(class = ?broker.class(), "broker class handled elsewhere");
        return Ok(Action::await_change());
    }

    let namespace = broker.namespace().unwrap_or_default();
    let previous = broker.status.clone().unwrap_or_default();
    let generation = broker.meta().generation;
    let mut observed = Observations::default();

    let template = match resolve_channel_template(
        ctx.kube.as_ref(),
        broker,
        &ctx.config.channel_template_key,
    )
    .await
    {
        Ok(template) => template,
        Err(e) => {
            warn!(error = %e, "channel template unavailable");
            observed.channel = Some(ChannelState::TemplateFailed(e.to_string()));
            let note = e.to_string();
            return fail(broker, ctx, aggregate(&previous, &observed, generation), e, note).await;
        }
    };

    // A malformed sink would be copied onto the channel, so reject it first
    if let Some(sink) = broker.spec.dead_letter_sink() {
        if let Err(e) = validate_destination(sink) {
            return reject_sink(broker, ctx, &previous, observed, generation, e).await;
        }
    }

    let channel = match reconcile_trigger_channel(ctx.kube.as_ref(), broker, &template).await {
        Ok(Some(channel)) => channel,
        Ok(None) => {
            debug!("trigger channel created concurrently");
            return Ok(Action::requeue(CHANNEL_CREATE_RACE_REQUEUE));
        }
        Err(e) => {
            warn!(error = %e, "trigger channel reconcile failed");
            observed.channel = Some(ChannelState::Failed(e.to_string()));
            let note = format!("failed to reconcile trigger channel: {}", e);
            return fail(broker, ctx, aggregate(&previous, &observed, generation), e, note).await;
        }
    };

    let channel_url = match object_address(&channel) {
        Ok(url) => url,
        Err(e) => {
            debug!(channel = %channel.name_any(), "trigger channel has no address yet");
            observed.channel = Some(ChannelState::Unresolved(e));
            commit_status(broker, ctx, &aggregate(&previous, &observed, generation)).await?;
            return Ok(Action::requeue(CHANNEL_NO_ADDRESS_REQUEUE));
        }
    };
    observed.channel = Some(ChannelState::Ready(ChannelSummary {
        api_version: template.api_version.clone(),
        kind: template.kind.clone(),
        name: channel.name_any(),
        url: channel_url,
    }));

    for (role, service) in [
        (FILTER_ROLE, ctx.config.filter_service_name.as_str()),
        (INGRESS_ROLE, ctx.config.ingress_service_name.as_str()),
    ] {
        let checked = check_endpoints(
            ctx.kube.as_ref(),
            &ctx.config.system_namespace,
            role,
            service,
        )
        .await;
        let state = match &checked {
            Ok(()) => ServiceState::Ready,
            Err(e) => ServiceState::Failed(e.to_string()),
        };
        if role == FILTER_ROLE {
            observed.filter = Some(state);
        } else {
            observed.ingress = Some(state);
        }
        if let Err(e) = checked {
            warn!(role, error = %e, "broker endpoints not ready");
            let note = e.to_string();
            return fail(broker, ctx, aggregate(&previous, &observed, generation), e, note).await;
        }
    }

    let mut sink_pending = false;
    let sink_state = match broker.spec.dead_letter_sink() {
        None => SinkState::NotConfigured,
        Some(sink) => {
            match resolve_destination(ctx.kube.as_ref(), &ctx.config, sink, &namespace).await {
                Ok(uri) => SinkState::Resolved(uri),
                Err(DestinationError::Unresolved(e)) => {
                    warn!(error = %e, "dead letter sink not resolvable yet");
                    sink_pending = true;
                    SinkState::Failed {
                        reason: e.reason().to_string(),
                        message: e.to_string(),
                    }
                }
                Err(DestinationError::Invalid(e)) => {
                    return reject_sink(broker, ctx, &previous, observed, generation, e).await;
                }
                Err(DestinationError::Api(e)) => {
                    let note = e.to_string();
                    return fail(broker, ctx, aggregate(&previous, &observed, generation), e, note)
                        .await;
                }
            }
        }
    };
    observed.dead_letter_sink = Some(sink_state);
    observed.address = Some(ctx.config.broker_address(&namespace, &broker.name_any()));

    let status = aggregate(&previous, &observed, generation);
    if commit_status(broker, ctx, &status).await? {
        info!(ready = ?status.condition(READY).map(|c| c.status), "broker status updated");
    }

    if sink_pending {
        Ok(Action::requeue(SINK_UNRESOLVED_REQUEUE))
    } else {
        Ok(Action::await_change())
    }
}

/// Record a structurally invalid dead letter sink. Retrying cannot help
/// until the Broker is edited.
async fn reject_sink(
    broker: &Broker,
    ctx: &Context,
    previous: &BrokerStatus,
    mut observed: Observations,
    generation: Option<i64>,
    e: Error,
) -> Result<Action, Error> {
    warn!(error = %e, "dead letter sink rejected");
    observed.dead_letter_sink = Some(SinkState::Failed {
        reason: reasons::INVALID_DEAD_LETTER_SINK.to_string(),
        message: e.to_string(),
    });
    commit_status(broker, ctx, &aggregate(previous, &observed, generation)).await?;
    publish_warning(broker, ctx, e.event_reason(), actions::RECONCILE, e.to_string()).await;
    Ok(Action::await_change())
}

/// Write the failure status, announce the failure and hand the error to the
/// error policy. A failed status write replaces the original error.
async fn fail(
    broker: &Broker,
    ctx: &Context,
    status: BrokerStatus,
    e: Error,
    note: String,
) -> Result<Action, Error> {
    commit_status(broker, ctx, &status).await?;
    publish_warning(broker, ctx, e.event_reason(), actions::RECONCILE, note).await;
    Err(e)
}

/// Write `status` unless the Broker already carries it.
///
/// Returns whether a write was issued.
async fn commit_status(
    broker: &Broker,
    ctx: &Context,
    status: &BrokerStatus,
) -> Result<bool, Error> {
    if broker.status.as_ref() == Some(status) {
        debug!("status unchanged");
        return Ok(false);
    }

    if let Err(e) = ctx.kube.update_broker_status(broker, status).await {
        let err = Error::status_update(broker.name_any(), e.to_string());
        warn!(error = %err, conflict = e.is_conflict(), "status write failed");
        publish_warning(
            broker,
            ctx,
            event_reasons::UPDATE_FAILED,
            actions::UPDATE_STATUS,
            err.to_string(),
        )
        .await;
        return Err(err);
    }
    Ok(true)
}

async fn publish_warning(broker: &Broker, ctx: &Context, reason: &str, action: &str, note: String) {
    ctx.events
        .publish(
            &broker.object_ref(&()),
            EventType::Warning,
            reason,
            action,
            Some(note),
        )
        .await;
}

/// Error policy for the controller
///
/// Delays grow per Broker key; failures only a spec edit can fix start on a
/// slower schedule but are still retried.
pub fn error_policy(broker: Arc<Broker>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = broker.key();
    let delay = ctx.backoff.next_delay(&key, error.requires_spec_change());
    error!(
        ?error,
        broker = %key,
        retry_in_ms = delay.as_millis() as u64,
        "reconciliation failed"
    );
    Action::requeue(delay)
}

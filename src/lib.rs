//! Channel Broker - reconciliation core for channel-backed event Brokers
//!
//! A Broker is a namespaced event-routing endpoint. Each Broker is backed by a
//! trigger channel whose concrete kind comes from a template stored in a
//! ConfigMap, and is served by shared filter and ingress deployments living in
//! the controller's own namespace.
//!
//! # Modules
//!
//! - [`crd`] - Broker custom resource and the duck types it embeds
//! - [`controller`] - Reconciliation logic (template, channel, address, status)
//! - [`events`] - Kubernetes Event publishing
//! - [`backoff`] - Per-key retry delays for the error policy
//! - [`config`] - Controller configuration
//! - [`kube_utils`] - ApiResource construction and client setup
//! - [`telemetry`] - Structured logging setup
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod backoff;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Well-known labels and annotations
// =============================================================================
// These keys are read by other eventing components (trigger reconcilers,
// the data plane), so they must stay byte-for-byte stable.

/// Annotation selecting which broker implementation owns a Broker
pub const BROKER_CLASS_ANNOTATION: &str = "eventing.knative.dev/broker.class";

/// Broker class handled by this controller
pub const DEFAULT_BROKER_CLASS: &str = "MTChannelBasedBroker";

/// Label carrying the owning Broker's name on its trigger channel
pub const BROKER_LABEL: &str = "eventing.knative.dev/broker";

/// Label marking a channel as carrying every event of its Broker
pub const BROKER_EVERYTHING_LABEL: &str = "eventing.knative.dev/brokerEverything";

/// Label distinguishing the filter and ingress endpoints
pub const BROKER_ROLE_LABEL: &str = "eventing.knative.dev/brokerRole";

/// Role label value of the filter deployment
pub const FILTER_ROLE: &str = "filter";

/// Role label value of the ingress deployment
pub const INGRESS_ROLE: &str = "ingress";

/// Annotation marking the trigger channel's dispatcher scope
pub const SCOPE_ANNOTATION: &str = "eventing.knative.dev/scope";

/// Scope value for channels served by the shared dispatcher
pub const SCOPE_CLUSTER: &str = "cluster";

/// Suffix appended to the Broker name to form its trigger channel name
pub const TRIGGER_CHANNEL_SUFFIX: &str = "kne-trigger";

/// Field manager used for writes issued by this controller
pub const FIELD_MANAGER: &str = "mt-broker-controller";

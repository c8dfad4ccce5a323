//! Controller configuration
//!
//! Values are fixed for the lifetime of the process. The binary fills them
//! from flags and environment variables; tests use [`ControllerConfig::default`].

use crate::DEFAULT_BROKER_CLASS;

/// Namespace the filter and ingress deployments run in when not overridden
pub const DEFAULT_SYSTEM_NAMESPACE: &str = "knative-eventing";

/// Cluster DNS suffix used to build service hostnames
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

/// Name of the shared ingress service
pub const DEFAULT_INGRESS_SERVICE: &str = "broker-ingress";

/// Name of the shared filter service
pub const DEFAULT_FILTER_SERVICE: &str = "broker-filter";

/// ConfigMap key holding the embedded channel template
pub const DEFAULT_CHANNEL_TEMPLATE_KEY: &str = "channelTemplateSpec";

/// Default number of Brokers reconciled concurrently
pub const DEFAULT_WORKERS: u16 = 2;

/// Runtime configuration shared by every reconcile pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Namespace holding the filter/ingress endpoints
    pub system_namespace: String,
    /// Cluster DNS suffix (e.g. "cluster.local")
    pub cluster_domain: String,
    /// Ingress service name, the host part of every Broker address
    pub ingress_service_name: String,
    /// Filter service name, used in readiness messages
    pub filter_service_name: String,
    /// Broker class annotation value this controller owns
    pub broker_class: String,
    /// ConfigMap data key holding the channel template
    pub channel_template_key: String,
    /// Maximum concurrent reconciles
    pub workers: u16,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            system_namespace: DEFAULT_SYSTEM_NAMESPACE.to_string(),
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
            ingress_service_name: DEFAULT_INGRESS_SERVICE.to_string(),
            filter_service_name: DEFAULT_FILTER_SERVICE.to_string(),
            broker_class: DEFAULT_BROKER_CLASS.to_string(),
            channel_template_key: DEFAULT_CHANNEL_TEMPLATE_KEY.to_string(),
            workers: DEFAULT_WORKERS,
        }
    }
}

impl ControllerConfig {
    /// Set the system namespace
    pub fn with_system_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.system_namespace = namespace.into();
        self
    }

    /// Fully qualified hostname of a service in the given namespace
    pub fn service_hostname(&self, name: &str, namespace: &str) -> String {
        format!("{}.{}.svc.{}", name, namespace, self.cluster_domain)
    }

    /// Hostname of the shared ingress service
    pub fn ingress_hostname(&self) -> String {
        self.service_hostname(&self.ingress_service_name, &self.system_namespace)
    }

    /// Public address of a Broker, served by the shared ingress
    pub fn broker_address(&self, namespace: &str, name: &str) -> String {
        format!("http://{}/{}/{}", self.ingress_hostname(), namespace, name)
    }
}

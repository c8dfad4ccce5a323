//! Readiness of the shared filter and ingress deployments
//!
//! Both run once per cluster in the system namespace. Their Endpoints carry
//! a role label, so a single labelled list answers "is anyone serving?".

use k8s_openapi::api::core::v1::Endpoints;

use super::client::BrokerKubeClient;
use crate::{Error, BROKER_ROLE_LABEL};

/// Label selector matching Endpoints of the given role
pub fn role_selector(role: &str) -> String {
    format!("{}={}", BROKER_ROLE_LABEL, role)
}

/// Whether any subset of the Endpoints has a ready address
pub fn has_ready_address(endpoints: &Endpoints) -> bool {
    endpoints
        .subsets
        .iter()
        .flatten()
        .any(|subset| subset.addresses.as_ref().is_some_and(|a| !a.is_empty()))
}

/// Check that the role's service has at least one ready backend.
///
/// `service` is only used to word the failure.
pub async fn check_endpoints(
    kube: &dyn BrokerKubeClient,
    system_namespace: &str,
    role: &str,
    service: &str,
) -> Result<(), Error> {
    let found = kube
        .list_endpoints(system_namespace, &role_selector(role))
        .await
        .map_err(|e| Error::service_failure(service, e.to_string()))?;

    if found.is_empty() {
        return Err(Error::service_failure(
            service,
            format!("endpoints \"{}\" not found", service),
        ));
    }
    if !found.iter().any(has_ready_address) {
        return Err(Error::service_failure(
            service,
            format!("endpoints \"{}\" has no ready addresses", service),
        ));
    }
    Ok(())
}

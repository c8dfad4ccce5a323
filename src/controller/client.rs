//! Kubernetes access for Broker reconciliation
//!
//! Every read and write the reconciler performs goes through
//! [`BrokerKubeClient`], so tests can script cluster state with a mock and
//! assert exactly which writes a pass issued.

use async_trait::async_trait;
use json_patch::PatchOperation;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints};
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::{Broker, BrokerStatus};
use crate::{Error, FIELD_MANAGER};

/// Trait abstracting Kubernetes client operations for Brokers
///
/// Lookups return `Ok(None)` when the object does not exist so callers can
/// tell "absent" apart from API failures.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerKubeClient: Send + Sync {
    /// Get a Broker by namespace and name
    async fn get_broker(&self, namespace: &str, name: &str) -> Result<Option<Broker>, Error>;

    /// Get a ConfigMap by namespace and name
    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error>;

    /// Get a trigger channel of the given resource type
    async fn get_channel(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error>;

    /// Create a trigger channel
    ///
    /// Returns `Ok(None)` if an object with the same name already exists.
    async fn create_channel(
        &self,
        resource: &ApiResource,
        channel: &DynamicObject,
    ) -> Result<Option<DynamicObject>, Error>;

    /// Apply an RFC 6902 JSON patch to a trigger channel
    async fn patch_channel(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &[PatchOperation],
    ) -> Result<DynamicObject, Error>;

    /// Get any object that may expose an address in its status
    async fn get_addressable(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error>;

    /// List Endpoints in a namespace matching a label selector
    async fn list_endpoints(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Endpoints>, Error>;

    /// Write the status subresource of a Broker
    ///
    /// The write is conditional on the Broker's resourceVersion, so a stale
    /// copy fails with a conflict instead of overwriting newer state.
    async fn update_broker_status(
        &self,
        broker: &Broker,
        status: &BrokerStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get_dynamic(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, resource);
        match api.get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BrokerKubeClient for KubeClientImpl {
    async fn get_broker(&self, namespace: &str, name: &str) -> Result<Option<Broker>, Error> {
        let api: Api<Broker> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(broker) => Ok(Some(broker)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(cm) => Ok(Some(cm)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_channel(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        self.get_dynamic(resource, namespace, name).await
    }

    async fn create_channel(
        &self,
        resource: &ApiResource,
        channel: &DynamicObject,
    ) -> Result<Option<DynamicObject>, Error> {
        let namespace = channel.namespace().unwrap_or_default();
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &namespace, resource);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        match api.create(&params, channel).await {
            Ok(created) => Ok(Some(created)),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(channel = %channel.name_any(), "channel already exists");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_channel(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &[PatchOperation],
    ) -> Result<DynamicObject, Error> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, resource);
        let patch = json_patch::Patch(patch.to_vec());
        let patched = api
            .patch(
                name,
                &PatchParams {
                    field_manager: Some(FIELD_MANAGER.to_string()),
                    ..Default::default()
                },
                &Patch::Json::<()>(patch),
            )
            .await?;
        Ok(patched)
    }

    async fn get_addressable(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        self.get_dynamic(resource, namespace, name).await
    }

    async fn list_endpoints(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Endpoints>, Error> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default().labels(label_selector)).await?;
        Ok(list.items)
    }

    async fn update_broker_status(
        &self,
        broker: &Broker,
        status: &BrokerStatus,
    ) -> Result<(), Error> {
        let namespace = broker.namespace().unwrap_or_default();
        let api: Api<Broker> = Api::namespaced(self.client.clone(), &namespace);
        let status_patch = status_merge_patch(broker.resource_version(), status)?;

        api.patch_status(
            &broker.name_any(),
            &PatchParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..Default::default()
            },
            &Patch::Merge(&status_patch),
        )
        .await?;

        Ok(())
    }
}

/// Build the merge patch written to the status subresource.
///
/// Optional fields that are unset become explicit nulls so a merge patch
/// clears them instead of leaving the previous value behind. Including the
/// resourceVersion makes the API server reject the write if the Broker
/// changed since it was read.
pub(crate) fn status_merge_patch(
    resource_version: Option<String>,
    status: &BrokerStatus,
) -> Result<serde_json::Value, Error> {
    let mut status_value = serde_json::to_value(status)?;
    if let Some(fields) = status_value.as_object_mut() {
        for key in ["address", "deadLetterSinkUri", "observedGeneration"] {
            fields.entry(key).or_insert(serde_json::Value::Null);
        }
    }

    let mut patch = serde_json::json!({ "status": status_value });
    if let Some(rv) = resource_version {
        patch["metadata"] = serde_json::json!({ "resourceVersion": rv });
    }
    Ok(patch)
}

//! Broker Custom Resource Definition
//!
//! A Broker is a namespaced event-routing endpoint. Its spec names the
//! ConfigMap holding the trigger channel template and the delivery options
//! mirrored onto that channel; its status reports readiness of every
//! dependent plus the resolved public address.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Addressable, Condition, DeliverySpec, Destination, KReference};
use crate::BROKER_CLASS_ANNOTATION;

/// Status annotation caching the trigger channel's address
pub const CHANNEL_ADDRESS_ANNOTATION: &str = "knative.dev/channelAddress";
/// Status annotation caching the trigger channel's apiVersion
pub const CHANNEL_API_VERSION_ANNOTATION: &str = "knative.dev/channelAPIVersion";
/// Status annotation caching the trigger channel's kind
pub const CHANNEL_KIND_ANNOTATION: &str = "knative.dev/channelKind";
/// Status annotation caching the trigger channel's name
pub const CHANNEL_NAME_ANNOTATION: &str = "knative.dev/channelName";

/// Specification for a Broker
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "eventing.knative.dev",
    version = "v1",
    kind = "Broker",
    plural = "brokers",
    status = "BrokerStatus",
    namespaced,
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".status.address.url"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BrokerSpec {
    /// Reference to the ConfigMap holding the channel template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<KReference>,

    /// Delivery options mirrored onto the trigger channel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliverySpec>,
}

impl BrokerSpec {
    /// Dead letter sink declared in the delivery options, if any
    pub fn dead_letter_sink(&self) -> Option<&Destination> {
        self.delivery
            .as_ref()
            .and_then(|d| d.dead_letter_sink.as_ref())
    }
}

/// Status for a Broker
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStatus {
    /// Generation last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Readiness conditions of the Broker and its dependents
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Public address of the Broker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Addressable>,

    /// Trigger channel details for consumers that cannot look it up
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Resolved dead letter sink URI
    #[serde(
        default,
        rename = "deadLetterSinkUri",
        alias = "deadLetterSinkURI",
        skip_serializing_if = "Option::is_none"
    )]
    pub dead_letter_sink_uri: Option<String>,
}

impl BrokerStatus {
    /// Look up a condition by type
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Public address URL, if one has been assigned
    pub fn address_url(&self) -> Option<&str> {
        self.address.as_ref().and_then(|a| a.url.as_deref())
    }
}

impl Broker {
    /// Broker class annotation value, if set
    pub fn class(&self) -> Option<&str> {
        self.annotations()
            .get(BROKER_CLASS_ANNOTATION)
            .map(String::as_str)
    }

    /// Work-queue key (`namespace/name`) of this Broker
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any())
    }
}

//! Trigger channel management
//!
//! Every Broker owns exactly one channel, named `<broker>-kne-trigger`, of the
//! type its template names. The channel carries the Broker's delivery
//! options; an existing channel is brought in line with a JSON patch that
//! touches only the delivery fields this controller manages.

use std::collections::BTreeMap;

use json_patch::{AddOperation, PatchOperation, RemoveOperation, ReplaceOperation};
use jsonptr::PointerBuf;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::{Resource, ResourceExt};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::client::BrokerKubeClient;
use super::template::ChannelTemplate;
use crate::crd::{Broker, BrokerSpec, DeliverySpec};
use crate::{
    Error, BROKER_EVERYTHING_LABEL, BROKER_LABEL, SCOPE_ANNOTATION, SCOPE_CLUSTER,
    TRIGGER_CHANNEL_SUFFIX,
};

/// Name of a Broker's trigger channel
pub fn trigger_channel_name(broker_name: &str) -> String {
    format!("{}-{}", broker_name, TRIGGER_CHANNEL_SUFFIX)
}

/// Labels stamped on every trigger channel
pub fn channel_labels(broker_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (BROKER_LABEL.to_string(), broker_name.to_string()),
        (BROKER_EVERYTHING_LABEL.to_string(), "true".to_string()),
    ])
}

/// Delivery options the trigger channel should carry.
///
/// A non-positive retry count is treated as unset. Returns `None` when
/// neither field survives.
pub fn desired_delivery(spec: &BrokerSpec) -> Option<DeliverySpec> {
    let delivery = spec.delivery.as_ref()?;
    let desired = DeliverySpec {
        dead_letter_sink: delivery.dead_letter_sink.clone(),
        retry: delivery.retry.filter(|r| *r > 0),
    };
    if desired.dead_letter_sink.is_none() && desired.retry.is_none() {
        None
    } else {
        Some(desired)
    }
}

/// Build the channel to create for a Broker that has none
pub fn desired_channel(
    broker: &Broker,
    template: &ChannelTemplate,
    delivery: Option<&DeliverySpec>,
) -> Result<DynamicObject, Error> {
    let namespace = broker.namespace().unwrap_or_default();
    let name = trigger_channel_name(&broker.name_any());
    let owner = OwnerReference {
        block_owner_deletion: Some(true),
        ..broker.controller_owner_ref(&()).ok_or_else(|| {
            Error::internal_with_context(
                "desired_channel",
                "broker has no uid for owner reference",
            )
        })?
    };

    let mut spec = match template.spec.clone() {
        Some(Value::Object(fields)) => fields,
        _ => Map::new(),
    };
    // Delivery mirrors the Broker only, never the template
    spec.remove("delivery");
    if let Some(delivery) = delivery {
        spec.insert("delivery".to_string(), serde_json::to_value(delivery)?);
    }

    let mut channel = DynamicObject::new(&name, &template.api_resource()).within(&namespace);
    channel.metadata.labels = Some(channel_labels(&broker.name_any()));
    channel.metadata.annotations = Some(BTreeMap::from([(
        SCOPE_ANNOTATION.to_string(),
        SCOPE_CLUSTER.to_string(),
    )]));
    channel.metadata.owner_references = Some(vec![owner]);
    channel.data = json!({ "spec": Value::Object(spec) });

    Ok(channel)
}

/// Shape of the delivery subtree this controller owns.
///
/// Anything outside these fields belongs to someone else and is never
/// touched by [`delivery_patch`].
enum Field {
    Leaf(&'static str),
    Object(&'static str, &'static [Field]),
}

const REFERENCE_FIELDS: &[Field] = &[
    Field::Leaf("apiVersion"),
    Field::Leaf("kind"),
    Field::Leaf("namespace"),
    Field::Leaf("name"),
];

const DESTINATION_FIELDS: &[Field] = &[Field::Object("ref", REFERENCE_FIELDS), Field::Leaf("uri")];

const DELIVERY_FIELDS: &[Field] = &[
    Field::Leaf("retry"),
    Field::Object("deadLetterSink", DESTINATION_FIELDS),
];

/// Minimal JSON patch taking the channel's delivery to `desired`.
///
/// An empty result means the channel already matches.
pub fn delivery_patch(
    channel: &DynamicObject,
    desired: Option<&DeliverySpec>,
) -> Result<Vec<PatchOperation>, Error> {
    let desired = desired.map(serde_json::to_value).transpose()?;
    let mut ops = Vec::new();

    match (channel.data.get("spec"), desired) {
        (None, None) => {}
        (None, Some(desired)) => ops.push(add(&["spec"], json!({ "delivery": desired }))),
        (Some(spec), desired) if !spec.is_object() => {
            // Whatever was there cannot hold delivery options
            let replacement = match desired {
                Some(desired) => json!({ "delivery": desired }),
                None => json!({}),
            };
            ops.push(replace(&["spec"], replacement));
        }
        (Some(spec), desired) => match (spec.get("delivery"), desired) {
            (None, None) => {}
            (None, Some(desired)) => ops.push(add(&["spec", "delivery"], desired)),
            (Some(_), None) => ops.push(remove(&["spec", "delivery"])),
            (Some(current), Some(desired)) => {
                let mut path = vec!["spec".to_string(), "delivery".to_string()];
                diff_object(DELIVERY_FIELDS, current, &desired, &mut path, &mut ops);
            }
        },
    }

    Ok(ops)
}

fn diff_object(
    fields: &[Field],
    current: &Value,
    desired: &Value,
    path: &mut Vec<String>,
    ops: &mut Vec<PatchOperation>,
) {
    if !current.is_object() {
        ops.push(replace(path.as_slice(), desired.clone()));
        return;
    }

    for field in fields {
        let key = match field {
            Field::Leaf(key) | Field::Object(key, _) => *key,
        };
        path.push(key.to_string());
        match (current.get(key), desired.get(key), field) {
            (None, None, _) => {}
            (None, Some(want), _) => ops.push(add(path.as_slice(), want.clone())),
            (Some(_), None, _) => ops.push(remove(path.as_slice())),
            (Some(have), Some(want), Field::Leaf(_)) => {
                if have != want {
                    ops.push(replace(path.as_slice(), want.clone()));
                }
            }
            (Some(have), Some(want), Field::Object(_, children)) => {
                diff_object(children, have, want, path, ops);
            }
        }
        path.pop();
    }
}

fn pointer<S: AsRef<str>>(path: &[S]) -> PointerBuf {
    PointerBuf::from_tokens(path.iter().map(|s| s.as_ref()))
}

fn add<S: AsRef<str>>(path: &[S], value: Value) -> PatchOperation {
    PatchOperation::Add(AddOperation {
        path: pointer(path),
        value,
    })
}

fn replace<S: AsRef<str>>(path: &[S], value: Value) -> PatchOperation {
    PatchOperation::Replace(ReplaceOperation {
        path: pointer(path),
        value,
    })
}

fn remove<S: AsRef<str>>(path: &[S]) -> PatchOperation {
    PatchOperation::Remove(RemoveOperation {
        path: pointer(path),
    })
}

/// Make sure the Broker's trigger channel exists and carries its delivery
/// options.
///
/// Returns `Ok(None)` when a concurrent create won the race; the caller
/// should look again on the next pass.
pub async fn reconcile_trigger_channel(
    kube: &dyn BrokerKubeClient,
    broker: &Broker,
    template: &ChannelTemplate,
) -> Result<Option<DynamicObject>, Error> {
    let resource = template.api_resource();
    let namespace = broker.namespace().unwrap_or_default();
    let name = trigger_channel_name(&broker.name_any());
    let delivery = desired_delivery(&broker.spec);

    let existing = kube
        .get_channel(&resource, &namespace, &name)
        .await
        .map_err(|e| {
            Error::channel_failure(format!("failed to get channel {}/{}: {}", namespace, name, e))
        })?;

    let Some(existing) = existing else {
        let channel = desired_channel(broker, template, delivery.as_ref())?;
        let created = kube.create_channel(&resource, &channel).await.map_err(|e| {
            Error::channel_failure(format!(
                "failed to create channel {}/{}: {}",
                namespace, name, e
            ))
        })?;
        if created.is_some() {
            info!(channel = %name, kind = %template.kind, "created trigger channel");
        }
        return Ok(created);
    };

    let ops = delivery_patch(&existing, delivery.as_ref())?;
    if ops.is_empty() {
        return Ok(Some(existing));
    }

    debug!(channel = %name, operations = ops.len(), "patching trigger channel delivery");
    let patched = kube
        .patch_channel(&resource, &namespace, &name, &ops)
        .await
        .map_err(|e| {
            Error::channel_failure(format!(
                "failed to patch channel {}/{}: {}",
                namespace, name, e
            ))
        })?;
    Ok(Some(patched))
}

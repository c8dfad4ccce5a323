//! Duck-typed address resolution
//!
//! Addressable objects have exposed their URL under several status shapes
//! over time. Each shape is a strategy; the first strategy yielding a
//! non-empty string wins, and the result must parse as a URL with a host.

use kube::api::DynamicObject;
use serde_json::Value;
use tracing::debug;

use super::client::BrokerKubeClient;
use crate::config::ControllerConfig;
use crate::crd::{Destination, KReference};
use crate::kube_utils::build_api_resource;
use crate::Error;

/// Why a reference could not be turned into a URL
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum ResolveError {
    /// The referenced object does not exist
    #[error("{kind} \"{namespace}/{name}\" not found")]
    NotFound {
        /// Kind of the referent
        kind: String,
        /// Namespace of the referent
        namespace: String,
        /// Name of the referent
        name: String,
    },

    /// The object exists but exposes no usable address
    #[error("{kind} \"{namespace}/{name}\" does not have an address")]
    NoAddress {
        /// Kind of the referent
        kind: String,
        /// Namespace of the referent
        namespace: String,
        /// Name of the referent
        name: String,
    },
}

impl ResolveError {
    /// Condition reason for this failure
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NotFound",
            Self::NoAddress { .. } => "NoAddress",
        }
    }
}

/// Failure resolving a destination
#[derive(Debug)]
pub enum DestinationError {
    /// The destination is malformed; only a spec edit fixes it
    Invalid(Error),
    /// The destination is well formed but cannot be resolved right now
    Unresolved(ResolveError),
    /// The lookup itself failed
    Api(Error),
}

/// Extraction strategy: a pure read of one status shape
type AddressStrategy = fn(&Value) -> Option<String>;

/// Strategies in preference order, newest contract first
const ADDRESS_STRATEGIES: &[(&str, AddressStrategy)] = &[
    ("status.address.url", address_url_field),
    ("status.addresses[0].url", addresses_list_url),
    ("status.address.hostname", legacy_hostname),
];

fn address_url_field(data: &Value) -> Option<String> {
    data.pointer("/status/address/url")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn addresses_list_url(data: &Value) -> Option<String> {
    data.pointer("/status/addresses/0/url")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn legacy_hostname(data: &Value) -> Option<String> {
    data.pointer("/status/address/hostname")
        .and_then(Value::as_str)
        .filter(|h| !h.is_empty())
        .map(|h| format!("http://{}", h))
}

/// Extract a usable URL from an object's schemaless body.
///
/// Returns `None` when no strategy yields a non-empty string or when the
/// winning string has no host.
pub fn extract_address(data: &Value) -> Option<String> {
    let (strategy, raw) = ADDRESS_STRATEGIES
        .iter()
        .find_map(|(name, strategy)| strategy(data).filter(|s| !s.is_empty()).map(|s| (*name, s)))?;

    if has_host(&raw) {
        Some(raw)
    } else {
        debug!(strategy, url = %raw, "address has no host");
        None
    }
}

/// Whether `raw` parses as a URL with a non-empty host
pub fn has_host(raw: &str) -> bool {
    url::Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(|h| !h.is_empty()))
        .unwrap_or(false)
}

/// Address of an object already in hand
pub fn object_address(obj: &DynamicObject) -> Result<String, ResolveError> {
    extract_address(&obj.data).ok_or_else(|| ResolveError::NoAddress {
        kind: obj
            .types
            .as_ref()
            .map(|t| t.kind.clone())
            .unwrap_or_default(),
        namespace: obj.metadata.namespace.clone().unwrap_or_default(),
        name: obj.metadata.name.clone().unwrap_or_default(),
    })
}

/// Check a destination's shape without touching the API server.
pub fn validate_destination(dest: &Destination) -> Result<(), Error> {
    match (&dest.ref_, dest.uri.as_deref()) {
        (None, None) | (None, Some("")) => Err(Error::invalid_dead_letter_sink(
            "expected at least one, got none: ref, uri",
        )),
        (Some(reference), _) => {
            let mut missing = Vec::new();
            if reference.name.is_empty() {
                missing.push("ref.name");
            }
            if reference.kind.is_empty() {
                missing.push("ref.kind");
            }
            if reference.api_version.is_empty() {
                missing.push("ref.apiVersion");
            }
            if missing.is_empty() {
                Ok(())
            } else {
                Err(Error::invalid_dead_letter_sink(format!(
                    "missing field(s): {}",
                    missing.join(", ")
                )))
            }
        }
        (None, Some(uri)) => {
            if has_host(uri) {
                Ok(())
            } else {
                Err(Error::invalid_dead_letter_sink(format!(
                    "uri {:?} is not an absolute URL",
                    uri
                )))
            }
        }
    }
}

/// Resolve a destination to a URL.
///
/// `default_namespace` is used when the ref carries none.
pub async fn resolve_destination(
    kube: &dyn BrokerKubeClient,
    config: &ControllerConfig,
    dest: &Destination,
    default_namespace: &str,
) -> Result<String, DestinationError> {
    validate_destination(dest).map_err(DestinationError::Invalid)?;

    let Some(reference) = dest.ref_.as_ref() else {
        // validate_destination guarantees an absolute uri here
        return Ok(dest.uri.clone().unwrap_or_default());
    };

    let base = resolve_reference(kube, config, reference, default_namespace).await?;
    match dest.uri.as_deref().filter(|u| !u.is_empty()) {
        None => Ok(base),
        Some(relative) => join_relative(&base, relative).map_err(DestinationError::Invalid),
    }
}

async fn resolve_reference(
    kube: &dyn BrokerKubeClient,
    config: &ControllerConfig,
    reference: &KReference,
    default_namespace: &str,
) -> Result<String, DestinationError> {
    let namespace = reference.namespace_or(default_namespace);

    // Core Services are addressable by DNS name alone
    if reference.api_version == "v1" && reference.kind == "Service" {
        return Ok(format!(
            "http://{}",
            config.service_hostname(&reference.name, namespace)
        ));
    }

    let resource = build_api_resource(&reference.api_version, &reference.kind);
    let obj = kube
        .get_addressable(&resource, namespace, &reference.name)
        .await
        .map_err(DestinationError::Api)?
        .ok_or_else(|| {
            DestinationError::Unresolved(ResolveError::NotFound {
                kind: reference.kind.clone(),
                namespace: namespace.to_string(),
                name: reference.name.clone(),
            })
        })?;

    extract_address(&obj.data).ok_or_else(|| {
        DestinationError::Unresolved(ResolveError::NoAddress {
            kind: reference.kind.clone(),
            namespace: namespace.to_string(),
            name: reference.name.clone(),
        })
    })
}

fn join_relative(base: &str, relative: &str) -> Result<String, Error> {
    let base = url::Url::parse(base)
        .map_err(|e| Error::invalid_dead_letter_sink(format!("invalid base url {}: {}", base, e)))?;
    let joined = base.join(relative).map_err(|e| {
        Error::invalid_dead_letter_sink(format!("cannot resolve uri {:?}: {}", relative, e))
    })?;
    Ok(joined.to_string())
}

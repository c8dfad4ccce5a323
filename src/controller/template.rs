//! Channel template lookup
//!
//! A Broker names a ConfigMap; one key of that ConfigMap holds a YAML
//! document giving the apiVersion and kind of the channel to create, plus an
//! optional spec merged into the channel.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::discovery::ApiResource;
use kube::ResourceExt;
use serde::Deserialize;

use super::client::BrokerKubeClient;
use crate::crd::{Broker, KReference};
use crate::kube_utils::build_api_resource;
use crate::Error;

/// Kind and apiVersion of the ConfigMap a Broker's config must point at
const CONFIG_KIND: &str = "ConfigMap";
const CONFIG_API_VERSION: &str = "v1";

/// Channel type and optional spec copied into every trigger channel
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelTemplate {
    /// apiVersion of the channel resource
    #[serde(default)]
    pub api_version: String,
    /// Kind of the channel resource
    #[serde(default)]
    pub kind: String,
    /// Spec fields merged into the channel's spec
    #[serde(default)]
    pub spec: Option<serde_json::Value>,
}

impl ChannelTemplate {
    /// API resource for the templated channel type
    pub fn api_resource(&self) -> ApiResource {
        build_api_resource(&self.api_version, &self.kind)
    }
}

/// Check a Broker's config reference and return the ConfigMap's namespace
/// and name. An unset namespace means the Broker's own.
pub fn validate_config_reference<'a>(
    config: Option<&'a KReference>,
    broker_namespace: &'a str,
) -> Result<(&'a str, &'a str), Error> {
    let config = config.ok_or_else(|| Error::invalid_config("failed to find channelTemplate"))?;

    if config.kind != CONFIG_KIND || config.api_version != CONFIG_API_VERSION {
        return Err(Error::unsupported_config(&config.kind, &config.api_version));
    }
    if config.name.is_empty() {
        return Err(Error::invalid_config(
            "Broker.Spec.Config name and namespace are required",
        ));
    }

    Ok((config.namespace_or(broker_namespace), &config.name))
}

/// Parse the template held under `key` in a ConfigMap
pub fn parse_template(config_map: &ConfigMap, key: &str) -> Result<ChannelTemplate, Error> {
    let namespace = config_map.namespace().unwrap_or_default();
    let name = config_map.name_any();
    let invalid = |msg: String| Error::invalid_template(&namespace, &name, msg);

    let raw = config_map
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .ok_or_else(|| invalid(format!("missing key {:?}", key)))?;

    let template: ChannelTemplate =
        serde_yaml::from_str(raw).map_err(|e| invalid(format!("cannot parse {:?}: {}", key, e)))?;

    if template.api_version.is_empty() || template.kind.is_empty() {
        return Err(invalid("template must set apiVersion and kind".to_string()));
    }
    Ok(template)
}

/// Fetch and parse the channel template a Broker points at
pub async fn resolve_channel_template(
    kube: &dyn BrokerKubeClient,
    broker: &Broker,
    key: &str,
) -> Result<ChannelTemplate, Error> {
    let broker_namespace = broker.namespace().unwrap_or_default();
    let (namespace, name) =
        validate_config_reference(broker.spec.config.as_ref(), &broker_namespace)?;

    let config_map = kube
        .get_config_map(namespace, name)
        .await?
        .ok_or_else(|| Error::config_not_found(namespace, name))?;

    parse_template(&config_map, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::client::MockBrokerKubeClient;
    use crate::crd::BrokerSpec;
    use kube::api::ObjectMeta;
    use rstest::rstest;
    use std::collections::BTreeMap;

    const KEY: &str = "channelTemplateSpec";
    const IMC_TEMPLATE: &str = "apiVersion: \"messaging.knative.dev/v1\"\nkind: \"InMemoryChannel\"\n";

    fn config_map(data: Option<&str>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("test-configmap".to_string()),
                namespace: Some("test-namespace".to_string()),
                ..Default::default()
            },
            data: data.map(|d| BTreeMap::from([(KEY.to_string(), d.to_string())])),
            ..Default::default()
        }
    }

    fn config_ref(kind: &str, api_version: &str, name: &str) -> KReference {
        KReference {
            kind: kind.to_string(),
            namespace: None,
            name: name.to_string(),
            api_version: api_version.to_string(),
        }
    }

    mod config_reference {
        use super::*;

        #[test]
        fn missing_reference_reports_missing_template() {
            let err = validate_config_reference(None, "test-namespace").unwrap_err();
            assert_eq!(err.to_string(), "failed to find channelTemplate");
        }

        #[rstest]
        #[case::wrong_kind("Secret", "v1")]
        #[case::wrong_version("ConfigMap", "v2")]
        #[case::both_wrong("Channel", "messaging.knative.dev/v1")]
        fn only_core_configmaps_are_supported(#[case] kind: &str, #[case] api_version: &str) {
            let reference = config_ref(kind, api_version, "test-configmap");
            let err = validate_config_reference(Some(&reference), "test-namespace").unwrap_err();
            assert_eq!(
                err.to_string(),
                "Broker.Spec.Config configuration not supported, only [kind: ConfigMap, apiVersion: v1]"
            );
        }

        #[test]
        fn empty_name_is_required_field_error() {
            let reference = config_ref("ConfigMap", "v1", "");
            let err = validate_config_reference(Some(&reference), "test-namespace").unwrap_err();
            assert_eq!(
                err.to_string(),
                "Broker.Spec.Config name and namespace are required"
            );
        }

        #[test]
        fn namespace_defaults_to_brokers() {
            let reference = config_ref("ConfigMap", "v1", "test-configmap");
            let (ns, name) = validate_config_reference(Some(&reference), "test-namespace").unwrap();
            assert_eq!((ns, name), ("test-namespace", "test-configmap"));
        }
    }

    mod parsing {
        use super::*;

        #[test]
        fn in_memory_channel_template_parses() {
            let template = parse_template(&config_map(Some(IMC_TEMPLATE)), KEY).unwrap();
            assert_eq!(template.api_version, "messaging.knative.dev/v1");
            assert_eq!(template.kind, "InMemoryChannel");
            assert!(template.spec.is_none());

            let ar = template.api_resource();
            assert_eq!(ar.group, "messaging.knative.dev");
            assert_eq!(ar.plural, "inmemorychannels");
        }

        #[test]
        fn template_spec_is_carried() {
            let raw = "apiVersion: messaging.knative.dev/v1beta1\nkind: KafkaChannel\nspec:\n  numPartitions: 3\n";
            let template = parse_template(&config_map(Some(raw)), KEY).unwrap();
            assert_eq!(template.spec.unwrap()["numPartitions"], 3);
        }

        #[rstest]
        #[case::no_data(None)]
        #[case::not_yaml(Some("apiVersion: [unclosed"))]
        #[case::no_kind(Some("apiVersion: messaging.knative.dev/v1\n"))]
        fn unusable_templates_are_rejected(#[case] data: Option<&str>) {
            let err = parse_template(&config_map(data), KEY).unwrap_err();
            assert!(matches!(err, Error::InvalidChannelTemplate { .. }));
            assert!(err.requires_spec_change());
        }
    }

    mod resolution {
        use super::*;

        fn broker() -> Broker {
            let mut broker = Broker::new(
                "test-broker",
                BrokerSpec {
                    config: Some(config_ref("ConfigMap", "v1", "test-configmap")),
                    delivery: None,
                },
            );
            broker.metadata.namespace = Some("test-namespace".to_string());
            broker
        }

        /// Story: The ConfigMap has not been created yet
        #[tokio::test]
        async fn story_missing_configmap_is_not_found() {
            let mut kube = MockBrokerKubeClient::new();
            kube.expect_get_config_map()
                .withf(|ns, name| ns == "test-namespace" && name == "test-configmap")
                .returning(|_, _| Ok(None));

            let err = resolve_channel_template(&kube, &broker(), KEY)
                .await
                .unwrap_err();
            assert_eq!(err.to_string(), "configmap \"test-configmap\" not found");
        }

        #[tokio::test]
        async fn existing_configmap_yields_template() {
            let mut kube = MockBrokerKubeClient::new();
            kube.expect_get_config_map()
                .returning(|_, _| Ok(Some(config_map(Some(IMC_TEMPLATE)))));

            let template = resolve_channel_template(&kube, &broker(), KEY)
                .await
                .unwrap();
            assert_eq!(template.kind, "InMemoryChannel");
        }
    }
}

//! Error types for the Broker controller
//!
//! The Display text of each variant is what operators see, both in the
//! Broker's conditions and in Kubernetes Events, so the wording of the
//! user-facing variants is stable.

use thiserror::Error;

use crate::events::reasons;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Broker reconciliation
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The Broker's config reference is missing or incomplete
    #[error("{message}")]
    InvalidConfigReference {
        /// Description of what's missing
        message: String,
    },

    /// The Broker's config reference points at something other than a ConfigMap
    #[error("Broker.Spec.Config configuration not supported, only [kind: ConfigMap, apiVersion: v1]")]
    UnsupportedConfigReference {
        /// Kind found in the reference
        kind: String,
        /// apiVersion found in the reference
        api_version: String,
    },

    /// The referenced ConfigMap does not exist (yet)
    #[error("configmap \"{name}\" not found")]
    ConfigNotFound {
        /// Namespace that was searched
        namespace: String,
        /// ConfigMap name
        name: String,
    },

    /// The ConfigMap exists but its channel template cannot be used
    #[error("invalid channel template in configmap {namespace}/{name}: {message}")]
    InvalidChannelTemplate {
        /// ConfigMap namespace
        namespace: String,
        /// ConfigMap name
        name: String,
        /// Parse or validation failure
        message: String,
    },

    /// Creating, reading or patching the trigger channel failed
    #[error("{message}")]
    ChannelFailure {
        /// Description including the channel's namespace/name and the cause
        message: String,
    },

    /// Filter or ingress endpoints are missing
    #[error("{message}")]
    ServiceFailure {
        /// Service whose endpoints were checked
        service: String,
        /// Description of what's missing
        message: String,
    },

    /// The dead letter sink destination is structurally invalid
    #[error("invalid dead letter sink: {message}")]
    InvalidDeadLetterSink {
        /// Description of what's invalid
        message: String,
    },

    /// Writing the Broker's status failed
    #[error("Failed to update status for \"{broker}\": {message}")]
    StatusUpdate {
        /// Broker name
        broker: String,
        /// Underlying cause
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred
        context: String,
    },
}

impl Error {
    /// Create an invalid config reference error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfigReference {
            message: msg.into(),
        }
    }

    /// Create an unsupported config reference error
    pub fn unsupported_config(kind: impl Into<String>, api_version: impl Into<String>) -> Self {
        Self::UnsupportedConfigReference {
            kind: kind.into(),
            api_version: api_version.into(),
        }
    }

    /// Create a config-not-found error
    pub fn config_not_found(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::ConfigNotFound {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create an invalid channel template error
    pub fn invalid_template(
        namespace: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::InvalidChannelTemplate {
            namespace: namespace.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a trigger channel failure
    pub fn channel_failure(msg: impl Into<String>) -> Self {
        Self::ChannelFailure {
            message: msg.into(),
        }
    }

    /// Create a service failure for the given service
    pub fn service_failure(service: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ServiceFailure {
            service: service.into(),
            message: msg.into(),
        }
    }

    /// Create an invalid dead letter sink error
    pub fn invalid_dead_letter_sink(msg: impl Into<String>) -> Self {
        Self::InvalidDeadLetterSink {
            message: msg.into(),
        }
    }

    /// Create a status update failure
    pub fn status_update(broker: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::StatusUpdate {
            broker: broker.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Event reason used when this error surfaces on a Broker
    pub fn event_reason(&self) -> &'static str {
        match self {
            Self::StatusUpdate { .. } => reasons::UPDATE_FAILED,
            Self::InvalidDeadLetterSink { .. } => reasons::INVALID_DEAD_LETTER_SINK,
            _ => reasons::INTERNAL_ERROR,
        }
    }

    /// Whether only an edit to the Broker (or its ConfigMap) can fix this.
    ///
    /// Such failures are still retried, just on a slower schedule.
    pub fn requires_spec_change(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfigReference { .. }
                | Self::UnsupportedConfigReference { .. }
                | Self::InvalidChannelTemplate { .. }
                | Self::InvalidDeadLetterSink { .. }
        )
    }

    /// Whether the underlying API call was rejected with 409 Conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("inducing failure: {}", reason),
            reason: reason.to_string(),
            code,
        })
    }

    // ==========================================================================
    // Story Tests: Messages operators see on a misconfigured Broker
    // ==========================================================================

    /// Story: A Broker without a config reference explains what's missing
    #[test]
    fn story_missing_config_reference_is_reported_verbatim() {
        let err = Error::invalid_config("failed to find channelTemplate");
        assert_eq!(err.to_string(), "failed to find channelTemplate");
        assert!(err.requires_spec_change());
        assert_eq!(err.event_reason(), reasons::INTERNAL_ERROR);
    }

    /// Story: Pointing the config at a Deployment names the only supported kind
    #[test]
    fn story_unsupported_config_kind_names_configmap() {
        let err = Error::unsupported_config("Deployment", "v1");
        assert_eq!(
            err.to_string(),
            "Broker.Spec.Config configuration not supported, only [kind: ConfigMap, apiVersion: v1]"
        );
        assert!(err.requires_spec_change());
    }

    /// Story: A missing ConfigMap reads like the API server's own not-found
    #[test]
    fn story_config_not_found_matches_api_server_wording() {
        let err = Error::config_not_found("test-namespace", "test-configmap");
        assert_eq!(err.to_string(), r#"configmap "test-configmap" not found"#);
        // The ConfigMap may still show up, no edit required
        assert!(!err.requires_spec_change());
    }

    /// Story: Status write failures name the Broker and use their own reason
    #[test]
    fn story_status_update_failure_uses_update_failed_reason() {
        let err = Error::status_update("test-broker", "inducing failure for update brokers");
        assert_eq!(
            err.to_string(),
            r#"Failed to update status for "test-broker": inducing failure for update brokers"#
        );
        assert_eq!(err.event_reason(), reasons::UPDATE_FAILED);
        assert!(!err.requires_spec_change());
    }

    /// Story: Channel and service failures pass their message through untouched
    #[test]
    fn story_dependent_failures_keep_their_message() {
        let err = Error::channel_failure(
            "failed to create channel test-namespace/test-broker-kne-trigger: boom",
        );
        assert_eq!(
            err.to_string(),
            "failed to create channel test-namespace/test-broker-kne-trigger: boom"
        );

        let err = Error::service_failure("broker-filter", r#"endpoints "broker-filter" not found"#);
        assert_eq!(err.to_string(), r#"endpoints "broker-filter" not found"#);
        match err {
            Error::ServiceFailure { service, .. } => assert_eq!(service, "broker-filter"),
            _ => panic!("Expected ServiceFailure variant"),
        }
    }

    #[test]
    fn test_conflict_detection() {
        let err = Error::from(api_error(409, "AlreadyExists"));
        assert!(err.is_conflict());

        let err = Error::from(api_error(500, "InternalError"));
        assert!(!err.is_conflict());

        assert!(!Error::internal("not an api error").is_conflict());
    }

    #[test]
    fn test_internal_error_context() {
        let err = Error::internal_with_context("status", "broker has no name");
        assert_eq!(err.to_string(), "internal error [status]: broker has no name");

        let err = Error::internal("oops");
        assert!(err.to_string().contains(UNKNOWN_CONTEXT));
    }

    #[test]
    fn test_serde_json_errors_convert() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err = Error::from(parse.unwrap_err());
        assert!(err.to_string().starts_with("serialization error:"));
    }
}

//! Broker controller
//!
//! This module contains the reconciliation logic for Brokers. The controller
//! follows the Kubernetes observe-diff-act loop: every pass recomputes the
//! desired state from scratch and writes only what differs.

pub mod address;
mod broker;
pub mod channel;
pub mod client;
pub mod endpoints;
pub mod status;
pub mod template;

use std::fmt::Debug;

use tracing::{debug, error};

pub use broker::{
    error_policy, reconcile, reconcile_key, Context, ContextBuilder, CHANNEL_CREATE_RACE_REQUEUE,
    CHANNEL_NO_ADDRESS_REQUEUE, SINK_UNRESOLVED_REQUEUE,
};
pub use client::{BrokerKubeClient, KubeClientImpl};

/// Log one item of a controller's output stream
pub fn log_reconcile_result<T: Debug, E: Debug>(kind: &'static str, result: Result<T, E>) {
    match result {
        Ok(outcome) => debug!(kind, ?outcome, "reconciliation completed"),
        Err(e) => error!(kind, error = ?e, "reconciliation error"),
    }
}

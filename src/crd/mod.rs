//! Custom Resource Definitions for the Broker controller
//!
//! The Broker is the only CRD owned here; the trigger channel and any
//! addressable it points at are handled as schemaless dynamic objects.

mod broker;
mod types;

pub use broker::{
    Broker, BrokerSpec, BrokerStatus, CHANNEL_ADDRESS_ANNOTATION, CHANNEL_API_VERSION_ANNOTATION,
    CHANNEL_KIND_ANNOTATION, CHANNEL_NAME_ANNOTATION,
};
pub use types::{
    Addressable, Condition, ConditionStatus, DeliverySpec, Destination, KReference,
};

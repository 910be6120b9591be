//! Core types for fieldscan.
//!
//! This crate defines the discovery data model, the configuration document,
//! the error and fault taxonomy, and the event bus shared by every other crate.

pub mod config;
pub mod error;
pub mod event;
pub mod eventbus;
pub mod types;
pub mod vocabulary;

pub use config::DiscoveryConfig;
pub use error::{Error, Fault, FaultKind, Result};
pub use event::{DiscoveryEvent, EventMetadata};
pub use eventbus::{EventBus, EventBusReceiver, FilteredReceiver, SharedEventBus, DEFAULT_CHANNEL_CAPACITY};
pub use types::*;
pub use vocabulary::{builtin_vocabulary, SensorTypeSpec};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::{
        env_vars, ClassifierConfig, CycleConfig, DiscoveryConfig, NamespaceConfig, ProbeConfig,
        RegistryConfig,
    };
    pub use crate::error::{Error, Fault, FaultKind, Result};
    pub use crate::event::{DiscoveryEvent, EventMetadata};
    pub use crate::eventbus::{EventBus, SharedEventBus};
    pub use crate::types::{
        ChannelKey, ChannelKind, ChannelRecord, Classification, CurrentView, DeviceRecord,
        Protocol, Sample, SensorType, SignalKind, SignalProfile, Tag,
    };
    pub use crate::vocabulary::SensorTypeSpec;
}

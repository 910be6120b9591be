//! Discovery events.
//!
//! Everything the orchestrator wants an outside observer to know about a
//! running cycle flows through the event bus as one of these variants.

use serde::{Deserialize, Serialize};

use crate::error::FaultKind;

/// Event published by the discovery engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DiscoveryEvent {
    // ========== Cycle Events ==========
    /// A scan cycle started
    CycleStarted {
        cycle: u64,
        run_id: String,
        probes: usize,
        timestamp: i64,
    },

    /// One probe returned (fully or cut off)
    ProbeCompleted {
        cycle: u64,
        probe: String,
        devices: usize,
        duration_ms: u64,
        timestamp: i64,
    },

    /// A probe recorded a fault
    ProbeFault {
        cycle: u64,
        probe: String,
        kind: FaultKind,
        message: String,
        timestamp: i64,
    },

    /// A cycle finished merging (and generating, if there was a delta)
    CycleCompleted {
        cycle: u64,
        changed: bool,
        devices: usize,
        tags: usize,
        unclassified: usize,
        duration_ms: u64,
        timestamp: i64,
    },

    /// More than the configured fraction of probes failed
    Degraded {
        cycle: u64,
        failed_probes: Vec<String>,
        total_probes: usize,
        timestamp: i64,
    },

    /// The cycle aborted on a catastrophic error
    Fatal {
        cycle: u64,
        error: String,
        backoff_cycles: u32,
        timestamp: i64,
    },

    // ========== Artifact Events ==========
    /// Artifacts were regenerated for changed groups
    ArtifactsGenerated {
        cycle: u64,
        groups: Vec<String>,
        removed_groups: Vec<String>,
        timestamp: i64,
    },

    // ========== Registry Events ==========
    /// A channel's mean moved away from its history
    DriftDetected {
        device_id: String,
        channel: String,
        previous_mean: f64,
        current_mean: f64,
        timestamp: i64,
    },

    /// A channel changed sensor type after passing hysteresis
    Reclassified {
        device_id: String,
        channel: String,
        from: String,
        to: String,
        confidence: f64,
        timestamp: i64,
    },

    /// Device missed enough cycles to be marked stale
    DeviceStale {
        device_id: String,
        missed_cycles: u32,
        timestamp: i64,
    },

    /// Stale device removed after the retention window
    DevicePurged { device_id: String, timestamp: i64 },
}

impl DiscoveryEvent {
    /// Get the event type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            DiscoveryEvent::CycleStarted { .. } => "CycleStarted",
            DiscoveryEvent::ProbeCompleted { .. } => "ProbeCompleted",
            DiscoveryEvent::ProbeFault { .. } => "ProbeFault",
            DiscoveryEvent::CycleCompleted { .. } => "CycleCompleted",
            DiscoveryEvent::Degraded { .. } => "Degraded",
            DiscoveryEvent::Fatal { .. } => "Fatal",
            DiscoveryEvent::ArtifactsGenerated { .. } => "ArtifactsGenerated",
            DiscoveryEvent::DriftDetected { .. } => "DriftDetected",
            DiscoveryEvent::Reclassified { .. } => "Reclassified",
            DiscoveryEvent::DeviceStale { .. } => "DeviceStale",
            DiscoveryEvent::DevicePurged { .. } => "DevicePurged",
        }
    }

    pub fn is_cycle_event(&self) -> bool {
        matches!(
            self,
            DiscoveryEvent::CycleStarted { .. }
                | DiscoveryEvent::ProbeCompleted { .. }
                | DiscoveryEvent::CycleCompleted { .. }
                | DiscoveryEvent::Degraded { .. }
                | DiscoveryEvent::Fatal { .. }
        )
    }

    /// Events an operator should be alerted to.
    pub fn is_alert_event(&self) -> bool {
        matches!(
            self,
            DiscoveryEvent::ProbeFault { .. }
                | DiscoveryEvent::Degraded { .. }
                | DiscoveryEvent::Fatal { .. }
                | DiscoveryEvent::DriftDetected { .. }
                | DiscoveryEvent::DeviceStale { .. }
        )
    }

    pub fn is_registry_event(&self) -> bool {
        matches!(
            self,
            DiscoveryEvent::DriftDetected { .. }
                | DiscoveryEvent::Reclassified { .. }
                | DiscoveryEvent::DeviceStale { .. }
                | DiscoveryEvent::DevicePurged { .. }
        )
    }

    /// Cycle number, for events that belong to one.
    pub fn cycle(&self) -> Option<u64> {
        match self {
            DiscoveryEvent::CycleStarted { cycle, .. }
            | DiscoveryEvent::ProbeCompleted { cycle, .. }
            | DiscoveryEvent::ProbeFault { cycle, .. }
            | DiscoveryEvent::CycleCompleted { cycle, .. }
            | DiscoveryEvent::Degraded { cycle, .. }
            | DiscoveryEvent::Fatal { cycle, .. }
            | DiscoveryEvent::ArtifactsGenerated { cycle, .. } => Some(*cycle),
            _ => None,
        }
    }
}

/// Event metadata carried alongside every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: String,
    /// Groups all events of one cycle
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Component that published
    pub source: String,
    pub timestamp: i64,
}

impl EventMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            correlation_id: None,
            source: source.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_classes() {
        let fatal = DiscoveryEvent::Fatal {
            cycle: 3,
            error: "store down".to_string(),
            backoff_cycles: 2,
            timestamp: 0,
        };
        assert_eq!(fatal.type_name(), "Fatal");
        assert!(fatal.is_cycle_event());
        assert!(fatal.is_alert_event());
        assert_eq!(fatal.cycle(), Some(3));

        let purged = DiscoveryEvent::DevicePurged {
            device_id: "net:10.0.0.9".to_string(),
            timestamp: 0,
        };
        assert!(purged.is_registry_event());
        assert!(!purged.is_alert_event());
        assert_eq!(purged.cycle(), None);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = DiscoveryEvent::DeviceStale {
            device_id: "d".to_string(),
            missed_cycles: 3,
            timestamp: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "DeviceStale");
        let back: DiscoveryEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_metadata_correlation() {
        let meta = EventMetadata::new("engine").with_correlation_id("run-1");
        assert_eq!(meta.source, "engine");
        assert_eq!(meta.correlation_id.as_deref(), Some("run-1"));
        assert!(!meta.event_id.is_empty());
    }
}

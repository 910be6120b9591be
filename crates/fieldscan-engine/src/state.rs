//! Orchestrator state and the reports it hands out.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use fieldscan_core::Fault;

/// Orchestrator state machine.
///
/// `Idle -> Scanning -> Merging -> Generating -> Idle`, with `Degraded`
/// replacing `Idle` at the end of a cycle in which too many probes failed.
/// `Shutdown` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Idle,
    Scanning,
    Merging,
    Generating,
    Degraded,
    Shutdown,
}

impl OrchestratorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Merging => "merging",
            Self::Generating => "generating",
            Self::Degraded => "degraded",
            Self::Shutdown => "shutdown",
        }
    }

    /// Whether a new cycle may start from this state.
    pub fn can_start_cycle(&self) -> bool {
        matches!(self, Self::Idle | Self::Degraded)
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one probe contributed to a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSummary {
    pub probe: String,
    pub devices: usize,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<Fault>,
}

/// Result of one completed cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub run_id: String,
    pub started_at: i64,
    pub duration_ms: u64,
    pub probes: Vec<ProbeSummary>,
    /// Whether merging moved the registry version
    pub changed: bool,
    pub degraded: bool,
    pub devices: usize,
    pub tags: usize,
    pub unclassified: usize,
    pub reclassified: usize,
    pub stale: Vec<String>,
    pub purged: Vec<String>,
    /// Groups whose artifacts were re-emitted
    pub generated_groups: Vec<String>,
    pub removed_groups: Vec<String>,
    /// Every fault recorded during the cycle, probe and classifier alike
    pub faults: Vec<Fault>,
}

impl CycleReport {
    pub fn failed_probes(&self) -> Vec<&str> {
        self.probes
            .iter()
            .filter(|p| p.fault.is_some())
            .map(|p| p.probe.as_str())
            .collect()
    }
}

/// Operator-facing status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: Option<OrchestratorState>,
    pub cycles_run: u64,
    pub last_successful_cycle: Option<u64>,
    pub last_successful_at: Option<i64>,
    pub registry_version: u64,
    pub devices: usize,
    pub stale_devices: usize,
    pub tags: usize,
    pub unclassified_devices: usize,
    pub registry_conflicts: u64,
    /// Faults recorded per probe since start
    pub probe_faults: BTreeMap<String, u64>,
    pub backoff_remaining: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.map(|s| s.as_str()).unwrap_or("unknown");
        writeln!(f, "state:                 {}", state)?;
        writeln!(f, "cycles run:            {}", self.cycles_run)?;
        match (self.last_successful_cycle, self.last_successful_at) {
            (Some(cycle), Some(at)) => {
                let when = chrono::DateTime::from_timestamp_millis(at)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| at.to_string());
                writeln!(f, "last successful cycle: {} at {}", cycle, when)?;
            }
            _ => writeln!(f, "last successful cycle: never")?,
        }
        writeln!(f, "registry version:      {}", self.registry_version)?;
        writeln!(f, "devices:               {} ({} stale)", self.devices, self.stale_devices)?;
        writeln!(f, "tags:                  {}", self.tags)?;
        writeln!(f, "unclassified devices:  {}", self.unclassified_devices)?;
        writeln!(f, "registry conflicts:    {}", self.registry_conflicts)?;
        if self.backoff_remaining > 0 {
            writeln!(f, "backoff:               {} cycles", self.backoff_remaining)?;
        }
        if let Some(error) = &self.last_error {
            writeln!(f, "last error:            {}", error)?;
        }
        writeln!(f, "probe faults:")?;
        if self.probe_faults.is_empty() {
            writeln!(f, "  (none)")?;
        }
        for (probe, count) in &self.probe_faults {
            writeln!(f, "  {:<20} {}", probe, count)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_start_states() {
        assert!(OrchestratorState::Idle.can_start_cycle());
        assert!(OrchestratorState::Degraded.can_start_cycle());
        assert!(!OrchestratorState::Scanning.can_start_cycle());
        assert!(!OrchestratorState::Shutdown.can_start_cycle());
    }

    #[test]
    fn test_status_display_reports_required_fields() {
        let mut status = StatusReport {
            state: Some(OrchestratorState::Degraded),
            unclassified_devices: 2,
            ..Default::default()
        };
        status.probe_faults.insert("line1".to_string(), 3);
        let text = status.to_string();
        assert!(text.contains("degraded"));
        assert!(text.contains("last successful cycle: never"));
        assert!(text.contains("unclassified devices:  2"));
        assert!(text.contains("line1"));
    }
}

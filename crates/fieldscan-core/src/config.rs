//! Discovery engine configuration.
//!
//! The configuration is a single TOML document loaded once and passed to the
//! orchestrator at cycle start. Every section has serde defaults so a minimal
//! file only lists its probes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::types::{AlarmThresholds, Protocol};
use crate::vocabulary::{builtin_vocabulary, merge_vocabulary, SensorTypeSpec};
use crate::{config_err, validation_err};

/// Environment variable names.
pub mod env_vars {
    pub const CONFIG_PATH: &str = "FIELDSCAN_CONFIG";
    pub const LOG_JSON: &str = "FIELDSCAN_LOG_JSON";
}

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "fieldscan.toml";

/// Complete configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub cycle: CycleConfig,
    pub classifier: ClassifierConfig,
    pub registry: RegistryConfig,
    pub namespace: NamespaceConfig,
    pub artifacts: ArtifactConfig,
    /// Extra or replacement sensor types merged over the built-in vocabulary.
    pub vocabulary: Vec<SensorTypeSpec>,
    pub tag_overrides: Vec<TagOverride>,
    pub probes: Vec<ProbeConfig>,
}

impl DiscoveryConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| config_err!("cannot read {}: {}", path.display(), e))?;
        let config = Self::from_toml_str(&content)?;
        info!(
            category = "config",
            path = %path.display(),
            probes = config.probes.len(),
            "Loaded discovery configuration"
        );
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: DiscoveryConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Built-in vocabulary with configured entries merged over it.
    pub fn effective_vocabulary(&self) -> Vec<SensorTypeSpec> {
        let base = if self.classifier.builtin_vocabulary {
            builtin_vocabulary()
        } else {
            Vec::new()
        };
        merge_vocabulary(base, &self.vocabulary)
    }

    /// Check invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let c = &self.classifier;
        if !(0.0..=1.0).contains(&c.confidence_floor) {
            return Err(validation_err!("confidence_floor must be in [0,1], got {}", c.confidence_floor));
        }
        if !(0.0..=1.0).contains(&c.hysteresis_margin) {
            return Err(validation_err!("hysteresis_margin must be in [0,1], got {}", c.hysteresis_margin));
        }
        if c.min_profile_samples < 2 {
            return Err(validation_err!("min_profile_samples must be at least 2, got {}", c.min_profile_samples));
        }
        let w = &c.weights;
        if [w.naming, w.range, w.prior, w.profile].iter().any(|v| *v < 0.0) || w.total() <= 0.0 {
            return Err(validation_err!("factor weights must be non-negative with a positive sum"));
        }
        if self.cycle.interval_secs == 0 {
            return Err(validation_err!("cycle.interval_secs must be positive"));
        }
        if !(0.0..=1.0).contains(&self.cycle.degraded_fraction) {
            return Err(validation_err!("cycle.degraded_fraction must be in [0,1]"));
        }
        if self.registry.stale_after_cycles == 0 {
            return Err(validation_err!("registry.stale_after_cycles must be positive"));
        }
        if self.namespace.location_prefix.trim().is_empty() {
            return Err(validation_err!("namespace.location_prefix must not be empty"));
        }

        let mut names = HashSet::new();
        for probe in &self.probes {
            if !names.insert(probe.name()) {
                return Err(validation_err!("duplicate probe name '{}'", probe.name()));
            }
            probe.validate()?;
        }
        for spec in &self.vocabulary {
            if spec.envelope_min > spec.envelope_max {
                return Err(validation_err!("vocabulary '{}' has an inverted envelope", spec.name));
            }
        }
        Ok(())
    }

    /// Resolve the configuration path from an explicit flag, the environment, or the default.
    pub fn resolve_path(explicit: Option<PathBuf>) -> PathBuf {
        explicit
            .or_else(|| std::env::var(env_vars::CONFIG_PATH).ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }
}

/// Scan cycle scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    pub interval_secs: u64,
    /// Global cut-off for the scanning phase of one cycle.
    pub cycle_timeout_secs: u64,
    /// Fraction of failed probes above which the cycle is DEGRADED.
    pub degraded_fraction: f64,
    /// Upper bound on skipped ticks after a fatal cycle.
    pub max_backoff_cycles: u32,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            cycle_timeout_secs: 25,
            degraded_fraction: 0.5,
            max_backoff_cycles: 8,
        }
    }
}

impl CycleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }
}

/// Factor weights of the classification scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FactorWeights {
    pub naming: f64,
    pub range: f64,
    pub prior: f64,
    pub profile: f64,
}

impl Default for FactorWeights {
    fn default() -> Self {
        Self {
            naming: 0.35,
            range: 0.25,
            prior: 0.15,
            profile: 0.25,
        }
    }
}

impl FactorWeights {
    pub fn total(&self) -> f64 {
        self.naming + self.range + self.prior + self.profile
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub confidence_floor: f64,
    pub hysteresis_margin: f64,
    pub weights: FactorWeights,
    /// Start from the built-in vocabulary before merging `[[vocabulary]]`.
    pub builtin_vocabulary: bool,
    /// Valid samples a channel needs before variance and noise are profiled.
    pub min_profile_samples: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 0.5,
            hysteresis_margin: 0.15,
            weights: FactorWeights::default(),
            builtin_vocabulary: true,
            min_profile_samples: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Consecutive missed cycles before a device is marked stale.
    pub stale_after_cycles: u32,
    /// Retention window for stale devices before purge.
    pub purge_after_secs: u64,
    /// Profiles kept per channel for drift detection.
    pub profile_history: usize,
    /// Mean shift, as a fraction of the historical span, reported as drift.
    pub drift_threshold: f64,
    /// Change-log entries kept in memory.
    pub log_capacity: usize,
    /// redb snapshot file; in-memory only when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,
    pub snapshot_retention: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stale_after_cycles: 3,
            purge_after_secs: 24 * 3600,
            profile_history: 10,
            drift_threshold: 0.25,
            log_capacity: 10_000,
            snapshot_path: None,
            snapshot_retention: 20,
        }
    }
}

impl RegistryConfig {
    pub fn purge_after(&self) -> Duration {
        Duration::from_secs(self.purge_after_secs)
    }
}

/// Explicit equipment-group assignment by device id or label pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRule {
    /// Substring matched case-insensitively against device id, address and channel labels.
    pub pattern: String,
    pub group: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    pub location_prefix: String,
    pub unassigned_group: String,
    pub group_rules: Vec<GroupRule>,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            location_prefix: "Plant".to_string(),
            unassigned_group: "Unassigned".to_string(),
            group_rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Directory artifacts are written to; nothing is written when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    pub warning_channels: Vec<String>,
    pub critical_channels: Vec<String>,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            warning_channels: vec!["dashboard".to_string()],
            critical_channels: vec!["dashboard".to_string(), "email".to_string()],
        }
    }
}

/// Explicit tag metadata overriding the per-type defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagOverride {
    /// Exact device id, or a prefix ending in `*`.
    pub device: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarms: Option<AlarmThresholds>,
}

impl TagOverride {
    pub fn matches(&self, device_id: &str, channel: &str) -> bool {
        let device_ok = match self.device.strip_suffix('*') {
            Some(prefix) => device_id.starts_with(prefix),
            None => self.device == device_id,
        };
        device_ok && self.channel.as_deref().map_or(true, |c| c == channel)
    }
}

// ---------------------------------------------------------------------------
// Probe configuration
// ---------------------------------------------------------------------------

fn default_probe_timeout() -> u64 {
    10_000
}

/// One configured probe; the `kind` field selects the protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeConfig {
    Usb(UsbProbeConfig),
    Modbus(ModbusProbeConfig),
    OpcUa(OpcUaProbeConfig),
    Mqtt(MqttProbeConfig),
    Network(NetworkProbeConfig),
}

impl ProbeConfig {
    pub fn name(&self) -> &str {
        match self {
            ProbeConfig::Usb(c) => &c.name,
            ProbeConfig::Modbus(c) => &c.name,
            ProbeConfig::OpcUa(c) => &c.name,
            ProbeConfig::Mqtt(c) => &c.name,
            ProbeConfig::Network(c) => &c.name,
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            ProbeConfig::Usb(_) => Protocol::Usb,
            ProbeConfig::Modbus(_) => Protocol::Modbus,
            ProbeConfig::OpcUa(_) => Protocol::OpcUa,
            ProbeConfig::Mqtt(_) => Protocol::Mqtt,
            ProbeConfig::Network(_) => Protocol::Network,
        }
    }

    /// Per-probe timeout, independent of the global cycle timeout.
    pub fn timeout(&self) -> Duration {
        let ms = match self {
            ProbeConfig::Usb(c) => c.timeout_ms,
            ProbeConfig::Modbus(c) => c.timeout_ms,
            ProbeConfig::OpcUa(c) => c.timeout_ms,
            ProbeConfig::Mqtt(c) => c.timeout_ms,
            ProbeConfig::Network(c) => c.timeout_ms,
        };
        Duration::from_millis(ms)
    }

    /// Location prefix override for devices found by this probe.
    pub fn location(&self) -> Option<&str> {
        match self {
            ProbeConfig::Usb(c) => c.location.as_deref(),
            ProbeConfig::Modbus(c) => c.location.as_deref(),
            ProbeConfig::OpcUa(c) => c.location.as_deref(),
            ProbeConfig::Mqtt(c) => c.location.as_deref(),
            ProbeConfig::Network(c) => c.location.as_deref(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name().trim().is_empty() {
            return Err(validation_err!("probe name must not be empty"));
        }
        match self {
            ProbeConfig::Modbus(c) => {
                if c.unit_start > c.unit_end {
                    return Err(validation_err!("probe '{}': unit_start > unit_end", c.name));
                }
                if c.blocks.iter().any(|b| b.count == 0 || b.count > 125) {
                    return Err(validation_err!("probe '{}': register block count must be 1..=125", c.name));
                }
                if let Some(b) = c.blocks.iter().find(|b| b.end() > MODBUS_ADDRESS_SPACE) {
                    return Err(validation_err!(
                        "probe '{}': register block {}:{} + {} runs past address 65535",
                        c.name,
                        b.table.prefix(),
                        b.start,
                        b.count
                    ));
                }
            }
            ProbeConfig::OpcUa(c) => {
                if c.max_depth == 0 {
                    return Err(validation_err!("probe '{}': max_depth must be positive", c.name));
                }
            }
            ProbeConfig::Mqtt(c) => {
                if c.filter.is_empty() {
                    return Err(validation_err!("probe '{}': filter must not be empty", c.name));
                }
                if c.max_samples_per_channel == 0 {
                    return Err(validation_err!("probe '{}': max_samples_per_channel must be positive", c.name));
                }
            }
            ProbeConfig::Network(c) => {
                if c.ports.is_empty() {
                    return Err(validation_err!("probe '{}': no ports to scan", c.name));
                }
            }
            ProbeConfig::Usb(_) => {}
        }
        Ok(())
    }
}

/// Maps a USB vendor/product pair to a signal hint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsbHint {
    /// Hex vendor id as in sysfs `idVendor` (e.g. `"0403"`).
    pub vendor_id: String,
    pub product_id: String,
    pub signal_hint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbProbeConfig {
    pub name: String,
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,
    #[serde(default)]
    pub hints: Vec<UsbHint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default = "default_probe_timeout")]
    pub timeout_ms: u64,
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys/bus/usb/devices")
}

/// Modbus data table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterTable {
    Coil,
    DiscreteInput,
    Holding,
    Input,
}

impl RegisterTable {
    /// Short prefix used in channel names.
    pub fn prefix(&self) -> &'static str {
        match self {
            RegisterTable::Coil => "co",
            RegisterTable::DiscreteInput => "di",
            RegisterTable::Holding => "hr",
            RegisterTable::Input => "ir",
        }
    }
}

/// Size of each Modbus data table.
pub const MODBUS_ADDRESS_SPACE: u32 = 65_536;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterBlock {
    pub table: RegisterTable,
    pub start: u16,
    pub count: u16,
}

impl RegisterBlock {
    /// One past the last address of the block.
    pub fn end(&self) -> u32 {
        self.start as u32 + self.count as u32
    }

    /// Addresses of the block, clipped to the table.
    pub fn addresses(&self) -> impl Iterator<Item = u16> {
        (self.start as u32..self.end().min(MODBUS_ADDRESS_SPACE)).map(|address| address as u16)
    }
}

/// Human label for one register of one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterLabel {
    pub unit: u8,
    #[serde(default = "default_label_table")]
    pub table: RegisterTable,
    pub address: u16,
    pub name: String,
}

fn default_label_table() -> RegisterTable {
    RegisterTable::Holding
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusProbeConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    #[serde(default = "default_unit_start")]
    pub unit_start: u8,
    #[serde(default = "default_unit_end")]
    pub unit_end: u8,
    #[serde(default = "default_blocks")]
    pub blocks: Vec<RegisterBlock>,
    #[serde(default)]
    pub labels: Vec<RegisterLabel>,
    #[serde(default = "default_samples_per_scan")]
    pub samples_per_scan: usize,
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default = "default_probe_timeout")]
    pub timeout_ms: u64,
}

fn default_modbus_port() -> u16 {
    502
}
fn default_unit_start() -> u8 {
    1
}
fn default_unit_end() -> u8 {
    5
}
fn default_blocks() -> Vec<RegisterBlock> {
    vec![RegisterBlock {
        table: RegisterTable::Holding,
        start: 0,
        count: 1,
    }]
}
fn default_samples_per_scan() -> usize {
    5
}
fn default_sample_interval() -> u64 {
    100
}
fn default_request_timeout() -> u64 {
    500
}

impl ModbusProbeConfig {
    pub fn label_for(&self, unit: u8, table: RegisterTable, address: u16) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.unit == unit && l.table == table && l.address == address)
            .map(|l| l.name.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpcUaProbeConfig {
    pub name: String,
    pub endpoint: String,
    /// Address-space snapshot (JSON nodeset) served by the built-in browser.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodeset: Option<PathBuf>,
    #[serde(default = "default_root_node")]
    pub root_node: String,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_opcua_samples")]
    pub samples_per_scan: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default = "default_probe_timeout")]
    pub timeout_ms: u64,
}

fn default_root_node() -> String {
    "i=85".to_string()
}
fn default_max_depth() -> usize {
    6
}
fn default_opcua_samples() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttProbeConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default = "default_mqtt_filter")]
    pub filter: String,
    /// Sniff window.
    #[serde(default = "default_mqtt_window")]
    pub window_ms: u64,
    #[serde(default = "default_max_topics")]
    pub max_topics: usize,
    /// Most recent samples kept per channel during a window.
    #[serde(default = "default_max_samples_per_channel")]
    pub max_samples_per_channel: usize,
    /// How often updated topics are pushed to the scan results.
    #[serde(default = "default_mqtt_flush_interval")]
    pub flush_interval_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default = "default_probe_timeout")]
    pub timeout_ms: u64,
}

fn default_mqtt_port() -> u16 {
    1883
}
fn default_mqtt_filter() -> String {
    "#".to_string()
}
fn default_mqtt_window() -> u64 {
    5_000
}
fn default_max_topics() -> usize {
    1_000
}
fn default_max_samples_per_channel() -> usize {
    256
}
fn default_mqtt_flush_interval() -> u64 {
    1_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkProbeConfig {
    pub name: String,
    /// Single IP, CIDR (`10.0.0.0/24`) or last-octet range (`10.0.0.1-50`).
    pub subnet: String,
    #[serde(default = "default_industrial_ports")]
    pub ports: Vec<u16>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default = "default_probe_timeout")]
    pub timeout_ms: u64,
}

/// Well-known industrial service ports.
pub fn default_industrial_ports() -> Vec<u16> {
    vec![
        502,   // Modbus TCP
        102,   // Siemens S7
        4840,  // OPC UA
        1883,  // MQTT
        8883,  // MQTT over TLS
        44818, // EtherNet/IP
        20000, // DNP3
        47808, // BACnet/IP
        2404,  // IEC 60870-5-104
    ]
}
fn default_connect_timeout() -> u64 {
    300
}
fn default_concurrency() -> usize {
    64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    const SAMPLE: &str = r#"
        [cycle]
        interval_secs = 60

        [classifier]
        confidence_floor = 0.6

        [[probes]]
        kind = "modbus"
        name = "line1-plc"
        host = "10.0.0.5"
        unit_end = 5

        [[probes.labels]]
        unit = 4
        address = 0
        name = "TEMP"

        [[probes]]
        kind = "mqtt"
        name = "broker"
        host = "localhost"
        filter = "plant/#"

        [[tag_overrides]]
        device = "modbus:10.0.0.5:502/*"
        unit = "°F"
    "#;

    #[test]
    fn test_parse_with_defaults() {
        let config = DiscoveryConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.cycle.interval_secs, 60);
        assert_eq!(config.cycle.cycle_timeout_secs, 25);
        assert_eq!(config.classifier.confidence_floor, 0.6);
        assert_eq!(config.classifier.hysteresis_margin, 0.15);
        assert_eq!(config.namespace.location_prefix, "Plant");
        assert_eq!(config.probes.len(), 2);
        match &config.probes[0] {
            ProbeConfig::Modbus(m) => {
                assert_eq!(m.port, 502);
                assert_eq!(m.unit_start, 1);
                assert_eq!(m.label_for(4, RegisterTable::Holding, 0), Some("TEMP"));
            }
            other => panic!("unexpected probe {:?}", other),
        }
        assert_eq!(config.probes[1].protocol(), Protocol::Mqtt);
    }

    #[test]
    fn test_empty_document_is_valid() {
        let config = DiscoveryConfig::from_toml_str("").unwrap();
        assert!(config.probes.is_empty());
        assert!(!config.effective_vocabulary().is_empty());
    }

    #[test]
    fn test_rejects_duplicate_probe_names() {
        let doc = r#"
            [[probes]]
            kind = "network"
            name = "dup"
            subnet = "10.0.0.1"
            [[probes]]
            kind = "network"
            name = "dup"
            subnet = "10.0.0.2"
        "#;
        let err = DiscoveryConfig::from_toml_str(doc).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_rejects_bad_floor() {
        let err = DiscoveryConfig::from_toml_str("[classifier]\nconfidence_floor = 1.5\n").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_min_profile_samples() {
        assert_eq!(DiscoveryConfig::default().classifier.min_profile_samples, 2);
        let config = DiscoveryConfig::from_toml_str("[classifier]\nmin_profile_samples = 8\n").unwrap();
        assert_eq!(config.classifier.min_profile_samples, 8);
        let err = DiscoveryConfig::from_toml_str("[classifier]\nmin_profile_samples = 1\n").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_parse_error_reported() {
        let err = DiscoveryConfig::from_toml_str("[cycle\n").unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn test_tag_override_matching() {
        let ov = TagOverride {
            device: "modbus:10.0.0.5:502/*".to_string(),
            channel: Some("hr:0".to_string()),
            unit: None,
            range_min: None,
            range_max: None,
            alarms: None,
        };
        assert!(ov.matches("modbus:10.0.0.5:502/4", "hr:0"));
        assert!(!ov.matches("modbus:10.0.0.5:502/4", "hr:1"));
        assert!(!ov.matches("modbus:10.0.0.6:502/4", "hr:0"));
    }

    #[test]
    fn test_round_trip_default_document() {
        let text = DiscoveryConfig::default().to_toml_string().unwrap();
        let parsed = DiscoveryConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.cycle.interval_secs, 30);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fieldscan.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = DiscoveryConfig::load(&path).unwrap();
        assert_eq!(config.probes[0].name(), "line1-plc");
        assert!(DiscoveryConfig::load(dir.path().join("missing.toml")).is_err());
    }
}

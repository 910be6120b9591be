//! Discovery data model shared by probes, classifier, registry and artifacts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Current UTC time in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Protocol family a device was discovered through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Usb,
    Modbus,
    OpcUa,
    Mqtt,
    Network,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Usb => "usb",
            Protocol::Modbus => "modbus",
            Protocol::OpcUa => "opc_ua",
            Protocol::Mqtt => "mqtt",
            Protocol::Network => "network",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of data point a channel is, as reported by its protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Modbus coil (1 bit, read-write)
    Coil,
    /// Modbus discrete input (1 bit, read-only)
    DiscreteInput,
    /// Modbus holding register (16 bit, read-write)
    HoldingRegister,
    /// Modbus input register (16 bit, read-only)
    InputRegister,
    /// OPC-UA leaf variable
    Variable,
    /// MQTT topic (or a scalar field of a topic's JSON payload)
    Topic,
    /// USB hub port with a hardware signal hint
    HubPort,
}

/// One raw observation of a channel.
///
/// Values stay as JSON so malformed readings survive until the profiler
/// can count them as data-quality defects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: i64,
    pub value: serde_json::Value,
}

impl Sample {
    pub fn new(timestamp: i64, value: impl Into<serde_json::Value>) -> Self {
        Self {
            timestamp,
            value: value.into(),
        }
    }
}

/// A single signal exposed by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    /// Stable channel identifier within the device (e.g. `hr:0`, `value`).
    pub name: String,
    pub kind: ChannelKind,
    /// Human naming hint (register label, browse name, topic leaf).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Protocol data type, when the protocol reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    /// Hardware-reported signal hint (USB hubs).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub samples: Vec<Sample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_latency_ms: Option<f64>,
}

impl ChannelRecord {
    pub fn new(name: impl Into<String>, kind: ChannelKind) -> Self {
        Self {
            name: name.into(),
            kind,
            label: None,
            data_type: None,
            signal_hint: None,
            samples: Vec::new(),
            response_latency_ms: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_data_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = Some(data_type.into());
        self
    }

    pub fn with_signal_hint(mut self, hint: impl Into<String>) -> Self {
        self.signal_hint = Some(hint.into());
        self
    }

    pub fn with_samples(mut self, samples: Vec<Sample>) -> Self {
        self.samples = samples;
        self
    }

    pub fn with_latency(mut self, latency_ms: f64) -> Self {
        self.response_latency_ms = Some(latency_ms);
        self
    }

    /// Text the classifier matches vocabulary keywords against.
    pub fn naming_text(&self) -> String {
        match &self.label {
            Some(label) => format!("{} {}", label, self.name),
            None => self.name.clone(),
        }
    }
}

/// A device as seen by one probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Deterministic id derived from the protocol address.
    pub id: String,
    pub protocol: Protocol,
    pub address: String,
    /// Name of the configured probe that produced this record.
    pub source_probe: String,
    pub discovered_at: i64,
    pub last_seen: i64,
    #[serde(default)]
    pub raw_attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub channels: Vec<ChannelRecord>,
    #[serde(default)]
    pub stale: bool,
    #[serde(default)]
    pub missed_cycles: u32,
}

impl DeviceRecord {
    pub fn new(
        id: impl Into<String>,
        protocol: Protocol,
        address: impl Into<String>,
        source_probe: impl Into<String>,
    ) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            protocol,
            address: address.into(),
            source_probe: source_probe.into(),
            discovered_at: now,
            last_seen: now,
            raw_attributes: BTreeMap::new(),
            channels: Vec::new(),
            stale: false,
            missed_cycles: 0,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.raw_attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_channel(mut self, channel: ChannelRecord) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn channel(&self, name: &str) -> Option<&ChannelRecord> {
        self.channels.iter().find(|c| c.name == name)
    }

    /// Identity of the record, ignoring timestamps, attributes and samples.
    pub fn identity(&self) -> (String, Vec<String>) {
        let mut channels: Vec<String> = self.channels.iter().map(|c| c.name.clone()).collect();
        channels.sort();
        (self.id.clone(), channels)
    }

    /// Copy of the record with per-cycle observations (samples, latency)
    /// stripped, as the registry stores it.
    pub fn without_samples(&self) -> Self {
        let mut record = self.clone();
        for channel in &mut record.channels {
            channel.samples.clear();
            channel.response_latency_ms = None;
        }
        record
    }
}

/// Registry key: one channel of one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelKey {
    pub device_id: String,
    pub channel: String,
}

impl ChannelKey {
    pub fn new(device_id: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            channel: channel.into(),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.device_id, self.channel)
    }
}

/// Semantic sensor type name (`temperature`, `status`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorType(String);

impl SensorType {
    pub const UNKNOWN: &'static str = "unknown";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn unknown() -> Self {
        Self(Self::UNKNOWN.to_string())
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == Self::UNKNOWN
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Broad signal family of a sensor type; drives widget selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Continuous physical quantity
    Analog,
    /// Two-state status signal
    Digital,
    /// Counters and other unbounded numeric values
    Numeric,
}

/// Noise classification of a channel's recent samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseClass {
    /// Fewer than two valid samples
    Insufficient,
    /// Every valid sample had the same value
    Constant,
    /// Values drawn from {0, 1}
    Binary,
    /// Varies with low sign-change rate around its mean
    Smooth,
    /// Varies erratically
    Noisy,
}

/// Per-channel summary statistics for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalProfile {
    pub device_id: String,
    pub channel: String,
    pub mean: f64,
    /// `None` when there is insufficient evidence (fewer than two samples).
    pub variance: Option<f64>,
    pub min: f64,
    pub max: f64,
    /// Samples per second over the observed span.
    pub sample_rate: f64,
    pub noise_class: NoiseClass,
    pub sample_count: usize,
    pub distinct_values: usize,
    pub is_binary: bool,
    pub zero_crossing_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_latency_ms: Option<f64>,
    /// Malformed samples filtered out before computing statistics.
    pub defects: usize,
    pub computed_at: i64,
}

impl SignalProfile {
    pub fn key(&self) -> ChannelKey {
        ChannelKey::new(&self.device_id, &self.channel)
    }

    pub fn has_values(&self) -> bool {
        self.sample_count > 0
    }

    pub fn span(&self) -> f64 {
        self.max - self.min
    }
}

/// Confidence-scored sensor type proposal for a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub device_id: String,
    pub channel: String,
    pub sensor_type: SensorType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_kind: Option<SignalKind>,
    pub confidence: f64,
    #[serde(default)]
    pub evidence: Vec<String>,
    pub classified_at: i64,
}

impl Classification {
    pub fn key(&self) -> ChannelKey {
        ChannelKey::new(&self.device_id, &self.channel)
    }

    pub fn is_unknown(&self) -> bool {
        self.sensor_type.is_unknown()
    }
}

/// Alarm limits attached to a tag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlarmThresholds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_low: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_high: Option<f64>,
}

impl AlarmThresholds {
    pub fn is_empty(&self) -> bool {
        self.low_low.is_none() && self.low.is_none() && self.high.is_none() && self.high_high.is_none()
    }
}

/// A published unified-namespace tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub uns_path: String,
    pub device_id: String,
    pub channel: String,
    pub location: String,
    pub equipment_group: String,
    pub sensor_type: SensorType,
    pub instance_index: u32,
    pub signal_kind: SignalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_max: Option<f64>,
    #[serde(default)]
    pub alarm_thresholds: AlarmThresholds,
    pub source_probe: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Tag {
    pub fn key(&self) -> ChannelKey {
        ChannelKey::new(&self.device_id, &self.channel)
    }
}

/// How an equipment group was derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum GroupingRule {
    /// Matched an explicit configuration rule
    Configured { pattern: String },
    /// Taken from the device's `equipment` attribute
    Attribute,
    /// Parent segment of a hierarchical device/channel name
    NameHierarchy,
    /// No context available
    Unassigned,
}

/// Cluster of related devices used for dashboard composition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipmentGroup {
    pub group_id: String,
    pub location: String,
    pub member_device_ids: Vec<String>,
    pub grouping_rule: GroupingRule,
}

/// Materialized current state of the registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CurrentView {
    pub version: u64,
    pub devices: Vec<DeviceRecord>,
    pub classifications: Vec<Classification>,
    pub tags: Vec<Tag>,
    pub groups: Vec<EquipmentGroup>,
}

impl CurrentView {
    /// Devices that have at least one channel and no published tag.
    pub fn unclassified_device_count(&self) -> usize {
        self.devices
            .iter()
            .filter(|d| !d.channels.is_empty())
            .filter(|d| !self.tags.iter().any(|t| t.device_id == d.id))
            .count()
    }

    pub fn tag_for(&self, key: &ChannelKey) -> Option<&Tag> {
        self.tags
            .iter()
            .find(|t| t.device_id == key.device_id && t.channel == key.channel)
    }

    pub fn classification_for(&self, key: &ChannelKey) -> Option<&Classification> {
        self.classifications
            .iter()
            .find(|c| c.device_id == key.device_id && c.channel == key.channel)
    }

    pub fn device(&self, id: &str) -> Option<&DeviceRecord> {
        self.devices.iter().find(|d| d.id == id)
    }
}

/// Registry view frozen at the end of a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub cycle: u64,
    pub taken_at: i64,
    pub view: CurrentView,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_identity_ignores_samples_and_time() {
        let a = DeviceRecord::new("modbus:h:502/2", Protocol::Modbus, "h:502/2", "mb")
            .with_channel(
                ChannelRecord::new("hr:0", ChannelKind::HoldingRegister)
                    .with_samples(vec![Sample::new(1, 0)]),
            );
        let mut b = a.clone();
        b.last_seen += 5_000;
        b.channels[0].samples.push(Sample::new(2, 1));
        assert_eq!(a.identity(), b.identity());
        assert!(b.without_samples().channels[0].samples.is_empty());
    }

    #[test]
    fn test_sensor_type_unknown() {
        assert!(SensorType::unknown().is_unknown());
        assert!(!SensorType::new("temperature").is_unknown());
        let json = serde_json::to_string(&SensorType::new("status")).unwrap();
        assert_eq!(json, "\"status\"");
    }

    #[test]
    fn test_channel_naming_text() {
        let ch = ChannelRecord::new("hr:0", ChannelKind::HoldingRegister).with_label("TEMP");
        assert_eq!(ch.naming_text(), "TEMP hr:0");
    }

    #[test]
    fn test_unclassified_count() {
        let dev = DeviceRecord::new("d1", Protocol::Mqtt, "t", "mq")
            .with_channel(ChannelRecord::new("value", ChannelKind::Topic));
        let host = DeviceRecord::new("net:10.0.0.1", Protocol::Network, "10.0.0.1", "net");
        let view = CurrentView {
            devices: vec![dev, host],
            ..Default::default()
        };
        assert_eq!(view.unclassified_device_count(), 1);
    }
}

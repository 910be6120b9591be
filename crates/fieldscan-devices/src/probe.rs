//! The closed set of protocol probes and their shared scan plumbing.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use fieldscan_core::config::ProbeConfig;
use fieldscan_core::{DeviceRecord, Fault, FaultKind, Protocol, Sample, SensorTypeSpec};

use crate::error::{ProbeError, ProbeResult};
use crate::modbus::ModbusProbe;
use crate::mqtt::MqttProbe;
use crate::network::NetworkProbe;
use crate::opcua::OpcUaProbe;
use crate::usb::UsbProbe;

/// What a probe can do beyond being asked for its devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeCapabilities {
    pub enumerate: bool,
    pub sample: bool,
    pub write: bool,
}

impl ProbeCapabilities {
    pub const ENUMERATE_ONLY: Self = Self {
        enumerate: true,
        sample: false,
        write: false,
    };
}

#[derive(Default)]
struct SinkInner {
    records: Vec<DeviceRecord>,
    /// Position of each record id in `records`
    index: HashMap<String, usize>,
    faults: Vec<Fault>,
}

/// Collects records while a probe runs.
///
/// The orchestrator keeps a clone, so whatever was pushed before a probe is
/// cut off by the cycle timeout is still merged.
#[derive(Clone, Default)]
pub struct ScanSink {
    inner: Arc<Mutex<SinkInner>>,
}

impl ScanSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, replacing an earlier one with the same id.
    pub fn upsert(&self, record: DeviceRecord) {
        let mut inner = self.inner.lock();
        match inner.index.get(&record.id).copied() {
            Some(i) => inner.records[i] = record,
            None => {
                let position = inner.records.len();
                inner.index.insert(record.id.clone(), position);
                inner.records.push(record);
            }
        }
    }

    /// Record a device-level fault that does not fail the probe.
    pub fn fault(&self, fault: Fault) {
        self.inner.lock().faults.push(fault);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take everything collected so far.
    pub fn drain(&self) -> (Vec<DeviceRecord>, Vec<Fault>) {
        let mut inner = self.inner.lock();
        inner.index.clear();
        (
            std::mem::take(&mut inner.records),
            std::mem::take(&mut inner.faults),
        )
    }
}

/// Result of one probe scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanOutcome {
    pub probe: String,
    pub protocol: Protocol,
    pub records: Vec<DeviceRecord>,
    /// Probe-level failure; records may still hold partial results.
    pub fault: Option<Fault>,
    /// Per-device problems that did not fail the probe.
    #[serde(default)]
    pub device_faults: Vec<Fault>,
    pub elapsed: Duration,
}

impl ScanOutcome {
    pub fn failed(&self) -> bool {
        self.fault.is_some()
    }

    /// Outcome for a probe that was cancelled by the cycle timeout.
    pub fn cut_off(probe: &ProtocolProbe, sink: &ScanSink, elapsed: Duration) -> Self {
        let (mut records, device_faults) = sink.drain();
        probe.stamp_location(&mut records);
        Self {
            probe: probe.name().to_string(),
            protocol: probe.protocol(),
            records,
            fault: Some(Fault::new(
                FaultKind::ProbeTimeout,
                probe.name(),
                format!("cut off by cycle timeout after {} ms", elapsed.as_millis()),
            )),
            device_faults,
            elapsed,
        }
    }
}

/// Samples per channel name.
pub type ChannelSamples = BTreeMap<String, Vec<Sample>>;

/// One configured probe.
pub enum ProtocolProbe {
    Usb(UsbProbe),
    Modbus(ModbusProbe),
    OpcUa(OpcUaProbe),
    Mqtt(MqttProbe),
    Network(NetworkProbe),
}

impl ProtocolProbe {
    /// Build a probe wired to its live I/O seam. `vocabulary` is the
    /// effective sensor vocabulary, used where a probe matches names.
    pub fn from_config(config: &ProbeConfig, vocabulary: &[SensorTypeSpec]) -> ProbeResult<Self> {
        Ok(match config {
            ProbeConfig::Usb(c) => ProtocolProbe::Usb(UsbProbe::new(c.clone(), vocabulary)),
            ProbeConfig::Modbus(c) => ProtocolProbe::Modbus(ModbusProbe::connect(c.clone())),
            ProbeConfig::OpcUa(c) => ProtocolProbe::OpcUa(OpcUaProbe::from_config(c.clone())?),
            ProbeConfig::Mqtt(c) => ProtocolProbe::Mqtt(MqttProbe::connect(c.clone())),
            ProbeConfig::Network(c) => ProtocolProbe::Network(NetworkProbe::new(c.clone())?),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            ProtocolProbe::Usb(p) => &p.config().name,
            ProtocolProbe::Modbus(p) => &p.config().name,
            ProtocolProbe::OpcUa(p) => &p.config().name,
            ProtocolProbe::Mqtt(p) => &p.config().name,
            ProtocolProbe::Network(p) => &p.config().name,
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            ProtocolProbe::Usb(_) => Protocol::Usb,
            ProtocolProbe::Modbus(_) => Protocol::Modbus,
            ProtocolProbe::OpcUa(_) => Protocol::OpcUa,
            ProtocolProbe::Mqtt(_) => Protocol::Mqtt,
            ProtocolProbe::Network(_) => Protocol::Network,
        }
    }

    pub fn capabilities(&self) -> ProbeCapabilities {
        match self {
            ProtocolProbe::Modbus(_) | ProtocolProbe::OpcUa(_) => ProbeCapabilities {
                enumerate: true,
                sample: true,
                write: false,
            },
            _ => ProbeCapabilities::ENUMERATE_ONLY,
        }
    }

    /// The probe's own timeout from configuration.
    pub fn timeout(&self) -> Duration {
        let ms = match self {
            ProtocolProbe::Usb(p) => p.config().timeout_ms,
            ProtocolProbe::Modbus(p) => p.config().timeout_ms,
            ProtocolProbe::OpcUa(p) => p.config().timeout_ms,
            ProtocolProbe::Mqtt(p) => p.config().timeout_ms,
            ProtocolProbe::Network(p) => p.config().timeout_ms,
        };
        Duration::from_millis(ms)
    }

    fn location(&self) -> Option<&str> {
        match self {
            ProtocolProbe::Usb(p) => p.config().location.as_deref(),
            ProtocolProbe::Modbus(p) => p.config().location.as_deref(),
            ProtocolProbe::OpcUa(p) => p.config().location.as_deref(),
            ProtocolProbe::Mqtt(p) => p.config().location.as_deref(),
            ProtocolProbe::Network(p) => p.config().location.as_deref(),
        }
    }

    fn stamp_location(&self, records: &mut [DeviceRecord]) {
        if let Some(location) = self.location() {
            for record in records {
                record
                    .raw_attributes
                    .entry("location".to_string())
                    .or_insert_with(|| location.to_string());
            }
        }
    }

    /// Scan with a fresh sink.
    pub async fn scan(&self, timeout: Duration) -> ScanOutcome {
        self.scan_with_sink(timeout, ScanSink::new()).await
    }

    /// Scan into a caller-owned sink, bounded by `timeout`.
    ///
    /// Never fails: errors and timeouts become the outcome's fault and
    /// anything pushed before them is returned.
    pub async fn scan_with_sink(&self, timeout: Duration, sink: ScanSink) -> ScanOutcome {
        let started = Instant::now();
        let result = tokio::time::timeout(timeout, self.enumerate(&sink)).await;
        let elapsed = started.elapsed();

        let fault = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => {
                warn!(
                    category = "probe",
                    probe = %self.name(),
                    error = %e,
                    "Probe scan failed"
                );
                Some(e.to_fault(self.name()))
            }
            Err(_) => {
                warn!(
                    category = "probe",
                    probe = %self.name(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Probe scan timed out"
                );
                Some(Fault::new(
                    FaultKind::ProbeTimeout,
                    self.name(),
                    format!("scan exceeded {} ms", timeout.as_millis()),
                ))
            }
        };

        let (mut records, device_faults) = sink.drain();
        self.stamp_location(&mut records);
        debug!(
            category = "probe",
            probe = %self.name(),
            devices = records.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Probe scan finished"
        );

        ScanOutcome {
            probe: self.name().to_string(),
            protocol: self.protocol(),
            records,
            fault,
            device_faults,
            elapsed,
        }
    }

    async fn enumerate(&self, sink: &ScanSink) -> ProbeResult<()> {
        match self {
            ProtocolProbe::Usb(p) => p.enumerate(sink).await,
            ProtocolProbe::Modbus(p) => p.enumerate(sink).await,
            ProtocolProbe::OpcUa(p) => p.enumerate(sink).await,
            ProtocolProbe::Mqtt(p) => p.enumerate(sink).await,
            ProtocolProbe::Network(p) => p.enumerate(sink).await,
        }
    }

    /// Read a known device's channels for `duration`.
    pub async fn sample(&self, device_id: &str, duration: Duration) -> ProbeResult<ChannelSamples> {
        match self {
            ProtocolProbe::Modbus(p) => p.sample(device_id, duration).await,
            ProtocolProbe::OpcUa(p) => p.sample(device_id, duration).await,
            _ => Err(ProbeError::Unsupported("sample")),
        }
    }

    /// Probes observe only; no variant writes to a device.
    pub async fn write(&self, _device_id: &str, _channel: &str, _value: f64) -> ProbeResult<()> {
        Err(ProbeError::Unsupported("write"))
    }
}

//! Modbus scanner.
//!
//! Walks a unit-id range and tries the configured register blocks on each
//! unit. A unit is a device when at least one block reads back without a
//! protocol exception. What the registers mean is left to the classifier.

pub mod codec;
pub mod transport;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use fieldscan_core::config::{ModbusProbeConfig, RegisterBlock, RegisterTable};
use fieldscan_core::{now_millis, ChannelKind, ChannelRecord, DeviceRecord, Protocol, Sample};

pub use transport::{ModbusTransport, SimulatedTransport, SimulatedUnit, TcpTransport};

use crate::error::{ProbeError, ProbeResult};
use crate::probe::{ChannelSamples, ScanSink};

/// Channel name for one register, e.g. `hr:40`.
pub fn channel_name(table: RegisterTable, address: u16) -> String {
    format!("{}:{}", table.prefix(), address)
}

fn channel_kind(table: RegisterTable) -> ChannelKind {
    match table {
        RegisterTable::Coil => ChannelKind::Coil,
        RegisterTable::DiscreteInput => ChannelKind::DiscreteInput,
        RegisterTable::Holding => ChannelKind::HoldingRegister,
        RegisterTable::Input => ChannelKind::InputRegister,
    }
}

fn data_type(table: RegisterTable) -> &'static str {
    if codec::is_bit_table(table) {
        "bool"
    } else {
        "uint16"
    }
}

/// Modbus probe over any [`ModbusTransport`].
pub struct ModbusProbe {
    config: ModbusProbeConfig,
    transport: Arc<dyn ModbusTransport>,
}

impl ModbusProbe {
    pub fn new(config: ModbusProbeConfig, transport: Arc<dyn ModbusTransport>) -> Self {
        Self { config, transport }
    }

    /// Probe over Modbus TCP to the configured host.
    pub fn connect(config: ModbusProbeConfig) -> Self {
        let transport = TcpTransport::new(
            config.host.clone(),
            config.port,
            Duration::from_millis(config.request_timeout_ms),
        );
        Self::new(config, Arc::new(transport))
    }

    pub fn config(&self) -> &ModbusProbeConfig {
        &self.config
    }

    pub fn device_id(&self, unit: u8) -> String {
        format!("modbus:{}/{}", self.transport.endpoint(), unit)
    }

    fn unit_of(&self, device_id: &str) -> ProbeResult<u8> {
        let prefix = format!("modbus:{}/", self.transport.endpoint());
        device_id
            .strip_prefix(&prefix)
            .and_then(|unit| unit.parse().ok())
            .ok_or_else(|| ProbeError::NotFound(device_id.to_string()))
    }

    /// Blocks of `unit` that answer, with the first read's values and latency.
    async fn live_blocks(&self, unit: u8) -> ProbeResult<Vec<(RegisterBlock, Vec<u16>, f64)>> {
        let mut live = Vec::new();
        for block in &self.config.blocks {
            let started = Instant::now();
            match self
                .transport
                .read(unit, block.table, block.start, block.count)
                .await
            {
                Ok(values) => {
                    let latency = started.elapsed().as_secs_f64() * 1000.0;
                    live.push((block.clone(), values, latency));
                }
                Err(ProbeError::Exception { code, .. }) => {
                    debug!(
                        category = "modbus",
                        unit,
                        table = block.table.prefix(),
                        start = block.start,
                        code,
                        "Block rejected"
                    );
                }
                // Absent unit: nothing else on it will answer either.
                Err(ProbeError::Timeout(_)) => return Ok(Vec::new()),
                Err(e) => return Err(e),
            }
        }
        Ok(live)
    }

    pub(crate) async fn enumerate(&self, sink: &ScanSink) -> ProbeResult<()> {
        let endpoint = self.transport.endpoint();
        for unit in self.config.unit_start..=self.config.unit_end {
            let live = self.live_blocks(unit).await?;
            if live.is_empty() {
                continue;
            }

            let now = now_millis();
            let mut samples: BTreeMap<(u8, u16), Vec<Sample>> = BTreeMap::new();
            let mut latencies: BTreeMap<(u8, u16), f64> = BTreeMap::new();
            for (block, values, latency) in &live {
                for (address, value) in block.addresses().zip(values) {
                    let key = (codec::read_function(block.table), address);
                    samples.entry(key).or_default().push(Sample::new(now, *value));
                    latencies.insert(key, *latency);
                }
            }

            for _ in 1..self.config.samples_per_scan {
                tokio::time::sleep(Duration::from_millis(self.config.sample_interval_ms)).await;
                for (block, _, _) in &live {
                    // A dropped read only shortens the series.
                    if let Ok(values) = self
                        .transport
                        .read(unit, block.table, block.start, block.count)
                        .await
                    {
                        let at = now_millis();
                        for (address, value) in block.addresses().zip(&values) {
                            let key = (codec::read_function(block.table), address);
                            samples.entry(key).or_default().push(Sample::new(at, *value));
                        }
                    }
                }
            }

            let mut record = DeviceRecord::new(
                self.device_id(unit),
                Protocol::Modbus,
                format!("{}/{}", endpoint, unit),
                &self.config.name,
            )
            .with_attribute("endpoint", endpoint.clone())
            .with_attribute("unit_id", unit.to_string());

            for (block, _, _) in &live {
                for address in block.addresses() {
                    let key = (codec::read_function(block.table), address);
                    let mut channel = ChannelRecord::new(channel_name(block.table, address), channel_kind(block.table))
                        .with_data_type(data_type(block.table))
                        .with_samples(samples.remove(&key).unwrap_or_default());
                    if let Some(latency) = latencies.get(&key) {
                        channel = channel.with_latency(*latency);
                    }
                    if let Some(label) = self.config.label_for(unit, block.table, address) {
                        channel = channel.with_label(label);
                    }
                    record = record.with_channel(channel);
                }
            }

            info!(
                category = "modbus",
                probe = %self.config.name,
                unit,
                channels = record.channels.len(),
                "Modbus unit found"
            );
            sink.upsert(record);
        }
        Ok(())
    }

    /// Read every configured block of a known unit repeatedly for `duration`.
    pub(crate) async fn sample(&self, device_id: &str, duration: Duration) -> ProbeResult<ChannelSamples> {
        let unit = self.unit_of(device_id)?;
        let deadline = Instant::now() + duration;
        let mut out: ChannelSamples = BTreeMap::new();
        loop {
            for block in &self.config.blocks {
                match self
                    .transport
                    .read(unit, block.table, block.start, block.count)
                    .await
                {
                    Ok(values) => {
                        let at = now_millis();
                        for (address, value) in block.addresses().zip(&values) {
                            out.entry(channel_name(block.table, address))
                                .or_default()
                                .push(Sample::new(at, *value));
                        }
                    }
                    Err(ProbeError::Exception { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
            if Instant::now() + Duration::from_millis(self.config.sample_interval_ms) >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(self.config.sample_interval_ms)).await;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ModbusProbeConfig {
        ModbusProbeConfig {
            name: "plc".to_string(),
            host: "sim".to_string(),
            port: 502,
            unit_start: 1,
            unit_end: 5,
            blocks: vec![RegisterBlock {
                table: RegisterTable::Holding,
                start: 0,
                count: 1,
            }],
            labels: Vec::new(),
            samples_per_scan: 4,
            sample_interval_ms: 1,
            request_timeout_ms: 100,
            location: None,
            timeout_ms: 5_000,
        }
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(channel_name(RegisterTable::Input, 7), "ir:7");
        assert_eq!(channel_name(RegisterTable::Coil, 12), "co:12");
    }

    #[tokio::test]
    async fn test_scan_collects_samples_per_register() {
        let transport = SimulatedTransport::new("sim:502")
            .with_unit(3, SimulatedUnit::new().holding(0, vec![10, 11, 12, 13]));
        let probe = ModbusProbe::new(config(), Arc::new(transport));
        let sink = ScanSink::new();
        probe.enumerate(&sink).await.unwrap();
        let (records, _) = sink.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "modbus:sim:502/3");
        let channel = records[0].channel("hr:0").unwrap();
        assert_eq!(channel.samples.len(), 4);
        assert_eq!(channel.samples[3].value, serde_json::json!(13));
        assert!(channel.response_latency_ms.is_some());
    }

    #[tokio::test]
    async fn test_exception_only_unit_is_not_a_device() {
        // Unit 1 answers, but only for an address outside the configured block.
        let transport =
            SimulatedTransport::new("sim:502").with_unit(1, SimulatedUnit::new().holding(9, vec![1]));
        let probe = ModbusProbe::new(config(), Arc::new(transport));
        let sink = ScanSink::new();
        probe.enumerate(&sink).await.unwrap();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_sample_known_unit() {
        let transport = SimulatedTransport::new("sim:502")
            .with_unit(2, SimulatedUnit::new().holding(0, vec![1, 2, 3]));
        let probe = ModbusProbe::new(config(), Arc::new(transport));
        let samples = probe
            .sample("modbus:sim:502/2", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(!samples["hr:0"].is_empty());
        assert!(matches!(
            probe.sample("modbus:other:502/2", Duration::from_millis(5)).await,
            Err(ProbeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_block_at_end_of_table() {
        let mut config = config();
        config.blocks = vec![RegisterBlock {
            table: RegisterTable::Holding,
            start: 65535,
            count: 2,
        }];
        let transport = SimulatedTransport::new("sim:502")
            .with_unit(2, SimulatedUnit::new().holding(65535, vec![7]));
        let probe = ModbusProbe::new(config, Arc::new(transport));
        let sink = ScanSink::new();
        probe.enumerate(&sink).await.unwrap();
        let (records, _) = sink.drain();
        assert_eq!(records.len(), 1);
        let names: Vec<&str> = records[0].channels.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["hr:65535"]);
        assert_eq!(records[0].channels[0].samples.len(), 4);
    }
}

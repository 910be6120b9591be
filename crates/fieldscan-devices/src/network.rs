//! Network service scanner.
//!
//! Bounded TCP connect probe across a subnet for well-known industrial
//! ports. A host with any open port becomes a device tagged with the
//! protocols its ports imply; hosts carry no channels.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use fieldscan_core::config::NetworkProbeConfig;
use fieldscan_core::{DeviceRecord, Protocol};

use crate::error::{ProbeError, ProbeResult};
use crate::probe::ScanSink;

/// Largest subnet accepted (a /16).
pub const MAX_HOSTS: usize = 65_536;

/// Service implied by a well-known port.
pub fn service_for_port(port: u16) -> Option<&'static str> {
    match port {
        502 => Some("modbus"),
        102 => Some("s7"),
        4840 => Some("opc_ua"),
        1883 | 8883 => Some("mqtt"),
        44818 => Some("ethernet_ip"),
        20000 => Some("dnp3"),
        47808 => Some("bacnet"),
        2404 => Some("iec104"),
        _ => None,
    }
}

/// Parse an IP range string into a list of addresses.
///
/// Supports `192.168.1.0/24`, `192.168.1.1-100` and a single address.
pub fn parse_ip_range(range: &str) -> ProbeResult<Vec<IpAddr>> {
    let invalid = || ProbeError::InvalidConfig(format!("invalid IP range '{}'", range));
    let range = range.trim();

    if let Some((base, prefix)) = range.split_once('/') {
        let base: Ipv4Addr = base.parse().map_err(|_| invalid())?;
        let prefix: u32 = prefix.parse().map_err(|_| invalid())?;
        if prefix > 32 {
            return Err(invalid());
        }
        let size = 1u64 << (32 - prefix);
        if size as usize > MAX_HOSTS {
            return Err(ProbeError::InvalidConfig(format!(
                "subnet '{}' is larger than {} hosts",
                range, MAX_HOSTS
            )));
        }
        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        let network = u32::from(base) & mask;
        // Skip network and broadcast addresses for ordinary subnets.
        let (first, last) = if size > 2 { (1, size - 1) } else { (0, size) };
        Ok((first..last)
            .map(|i| IpAddr::V4(Ipv4Addr::from(network + i as u32)))
            .collect())
    } else if let Some((base, last_octet)) = range.split_once('-') {
        let base: Ipv4Addr = base.parse().map_err(|_| invalid())?;
        let end: u8 = last_octet.parse().map_err(|_| invalid())?;
        let [a, b, c, start] = base.octets();
        if end < start {
            return Err(invalid());
        }
        Ok((start..=end)
            .map(|d| IpAddr::V4(Ipv4Addr::new(a, b, c, d)))
            .collect())
    } else {
        let addr: IpAddr = range.parse().map_err(|_| invalid())?;
        Ok(vec![addr])
    }
}

pub struct NetworkProbe {
    config: NetworkProbeConfig,
    hosts: Vec<IpAddr>,
}

impl NetworkProbe {
    pub fn new(config: NetworkProbeConfig) -> ProbeResult<Self> {
        let hosts = parse_ip_range(&config.subnet)?;
        Ok(Self { config, hosts })
    }

    pub fn config(&self) -> &NetworkProbeConfig {
        &self.config
    }

    pub fn hosts(&self) -> &[IpAddr] {
        &self.hosts
    }

    async fn open_ports(&self, host: IpAddr) -> Vec<u16> {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let checks = self.config.ports.iter().map(|&port| async move {
            let addr = SocketAddr::new(host, port);
            match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(_)) => Some(port),
                _ => None,
            }
        });
        let mut open: Vec<u16> = futures::future::join_all(checks).await.into_iter().flatten().collect();
        open.sort_unstable();
        open
    }

    pub(crate) async fn enumerate(&self, sink: &ScanSink) -> ProbeResult<()> {
        let concurrency = self.config.concurrency.max(1);
        let mut results = stream::iter(self.hosts.iter().copied())
            .map(|host| async move { (host, self.open_ports(host).await) })
            .buffer_unordered(concurrency);

        let mut found = 0usize;
        while let Some((host, ports)) = results.next().await {
            if ports.is_empty() {
                continue;
            }
            let services: Vec<&str> = ports.iter().filter_map(|p| service_for_port(*p)).collect();
            debug!(category = "network", host = %host, ports = ?ports, "Host answered");
            let record = DeviceRecord::new(format!("net:{}", host), Protocol::Network, host.to_string(), &self.config.name)
                .with_attribute(
                    "open_ports",
                    ports.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(","),
                )
                .with_attribute("services", services.join(","));
            sink.upsert(record);
            found += 1;
        }

        info!(
            category = "network",
            probe = %self.config.name,
            hosts = self.hosts.len(),
            found,
            "Subnet scan finished"
        );
        Ok(())
    }
}

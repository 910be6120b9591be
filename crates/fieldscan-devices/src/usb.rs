//! USB hub port enumerator.
//!
//! Reads the Linux sysfs USB tree. Each attached device becomes a record
//! keyed by its bus-port path; devices with a signal-type hint get one
//! `signal` channel carrying the hint for the classifier.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use fieldscan_core::config::{UsbHint, UsbProbeConfig};
use fieldscan_core::{ChannelKind, ChannelRecord, DeviceRecord, Protocol, SensorTypeSpec};

use crate::error::{ProbeError, ProbeResult};
use crate::probe::ScanSink;

/// One entry of the sysfs device tree.
#[derive(Debug, Clone, PartialEq)]
pub struct UsbEntry {
    /// Bus-port path such as `1-1.4`
    pub port_path: String,
    pub vendor_id: String,
    pub product_id: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
    pub class_code: u32,
    /// Contents of a `signal_hint` attribute, when the driver exposes one
    pub signal_hint: Option<String>,
}

impl UsbEntry {
    pub fn is_hub(&self) -> bool {
        self.class_code == 0x09
    }
}

fn read_attr(path: &Path, attr: &str) -> Option<String> {
    std::fs::read_to_string(path.join(attr))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// List device entries below a sysfs root, skipping interfaces and root hubs.
pub fn read_sysfs(root: &Path) -> ProbeResult<Vec<UsbEntry>> {
    let entries = std::fs::read_dir(root)
        .map_err(|e| ProbeError::Unavailable(format!("{}: {}", root.display(), e)))?;
    let mut out = Vec::new();
    for entry in entries.flatten() {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        // `usb1` is a root hub, `1-1:1.0` an interface.
        if !name.contains('-') || name.contains(':') {
            continue;
        }
        let path = entry.path();
        out.push(UsbEntry {
            port_path: name,
            vendor_id: read_attr(&path, "idVendor").unwrap_or_default(),
            product_id: read_attr(&path, "idProduct").unwrap_or_default(),
            manufacturer: read_attr(&path, "manufacturer"),
            product: read_attr(&path, "product"),
            serial: read_attr(&path, "serial"),
            class_code: read_attr(&path, "bDeviceClass")
                .and_then(|s| u32::from_str_radix(&s, 16).ok())
                .unwrap_or(0),
            signal_hint: read_attr(&path, "signal_hint"),
        });
    }
    out.sort_by(|a, b| a.port_path.cmp(&b.port_path));
    Ok(out)
}

pub struct UsbProbe {
    config: UsbProbeConfig,
    vocabulary: Vec<String>,
}

impl UsbProbe {
    /// Product strings are matched against the names of `vocabulary`.
    pub fn new(config: UsbProbeConfig, vocabulary: &[SensorTypeSpec]) -> Self {
        Self {
            config,
            vocabulary: vocabulary.iter().map(|s| s.name.to_lowercase()).collect(),
        }
    }

    pub fn config(&self) -> &UsbProbeConfig {
        &self.config
    }

    pub fn sysfs_root(&self) -> &PathBuf {
        &self.config.sysfs_root
    }

    /// Signal hint from the device, the hint table, or the product string.
    pub fn hint_for(&self, entry: &UsbEntry) -> Option<String> {
        if let Some(hint) = &entry.signal_hint {
            return Some(hint.to_lowercase());
        }
        let table_hit = self.config.hints.iter().find(|h: &&UsbHint| {
            h.vendor_id.eq_ignore_ascii_case(&entry.vendor_id)
                && h.product_id.eq_ignore_ascii_case(&entry.product_id)
        });
        if let Some(hint) = table_hit {
            return Some(hint.signal_hint.to_lowercase());
        }
        let product = entry.product.as_deref()?.to_lowercase();
        self.vocabulary
            .iter()
            .find(|name| product.contains(name.as_str()))
            .cloned()
    }

    fn record(&self, entry: &UsbEntry) -> DeviceRecord {
        let mut record = DeviceRecord::new(
            format!("usb:{}", entry.port_path),
            Protocol::Usb,
            entry.port_path.clone(),
            &self.config.name,
        )
        .with_attribute("vendor_id", entry.vendor_id.clone())
        .with_attribute("product_id", entry.product_id.clone())
        .with_attribute("class", format!("{:02x}", entry.class_code));
        if let Some(m) = &entry.manufacturer {
            record = record.with_attribute("manufacturer", m.clone());
        }
        if let Some(p) = &entry.product {
            record = record.with_attribute("product", p.clone());
        }
        if let Some(s) = &entry.serial {
            record = record.with_attribute("serial", s.clone());
        }
        // Hub position: the parent path is the hub the device hangs off.
        if let Some((hub, _)) = entry.port_path.rsplit_once('.') {
            record = record.with_attribute("hub", hub.to_string());
        }

        if !entry.is_hub() {
            if let Some(hint) = self.hint_for(entry) {
                let mut channel = ChannelRecord::new("signal", ChannelKind::HubPort).with_signal_hint(hint);
                if let Some(product) = &entry.product {
                    channel = channel.with_label(product.clone());
                }
                record = record.with_channel(channel);
            }
        }
        record
    }

    pub(crate) async fn enumerate(&self, sink: &ScanSink) -> ProbeResult<()> {
        let root = self.config.sysfs_root.clone();
        let entries = tokio::task::spawn_blocking(move || read_sysfs(&root))
            .await
            .map_err(|e| ProbeError::Protocol(e.to_string()))??;
        for entry in &entries {
            debug!(category = "usb", port = %entry.port_path, vendor = %entry.vendor_id, "USB device");
            sink.upsert(self.record(entry));
        }
        info!(
            category = "usb",
            probe = %self.config.name,
            devices = entries.len(),
            "USB enumeration finished"
        );
        Ok(())
    }
}

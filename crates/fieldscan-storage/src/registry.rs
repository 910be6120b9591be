//! Discovery registry.
//!
//! The registry owns the canonical discovery state. Probes and the classifier
//! only hand it proposals; the registry decides what sticks:
//!
//! - device merges keep the newest `last_seen` and its attributes
//! - classifications change type only past the hysteresis margin
//! - tag paths stay locked while a channel keeps its sensor type
//!
//! State is sharded per key in `DashMap`s so unrelated devices update in
//! parallel while same-key writes linearize on the shard lock. Every
//! material change is appended to a bounded in-memory log and bumps the
//! registry version.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::try_result::TryResult;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use fieldscan_core::config::RegistryConfig;
use fieldscan_core::{
    now_millis, ChannelKey, Classification, CurrentView, DeviceRecord, EquipmentGroup, Fault,
    RegistrySnapshot, SensorType, SignalProfile, Tag,
};
use fieldscan_discovery::{derive_groups, detect_drift, Drift, NamespaceBuilder, TagRequest};

/// One entry of the registry change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub version: u64,
    pub at: i64,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub change: Change,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Change {
    DeviceAdded,
    DeviceUpdated,
    DeviceStale { missed_cycles: u32 },
    DevicePurged,
    Classified { sensor_type: SensorType, confidence: f64 },
    Reclassified { from: SensorType, to: SensorType, confidence: f64 },
    TagAssigned { uns_path: String },
    TagRemoved { uns_path: String },
    /// Same path and channel, new metadata
    TagUpdated { uns_path: String },
    Restored { cycle: u64 },
}

/// What happened to a device proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMerge {
    Inserted,
    /// Identity, attributes or channel set changed
    Updated,
    /// Only `last_seen` moved
    Refreshed,
}

/// What happened to a classification proposal.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassificationMerge {
    Inserted,
    /// Type changed past the hysteresis margin
    Replaced { from: SensorType },
    /// Same type; confidence and evidence refreshed
    Refreshed,
    /// Proposal rejected by hysteresis
    Kept { current: SensorType },
}

impl ClassificationMerge {
    pub fn is_change(&self) -> bool {
        matches!(self, Self::Inserted | Self::Replaced { .. })
    }
}

pub struct Registry {
    config: RegistryConfig,
    hysteresis_margin: f64,
    devices: DashMap<String, DeviceRecord>,
    classifications: DashMap<ChannelKey, Classification>,
    profiles: DashMap<ChannelKey, VecDeque<SignalProfile>>,
    tags: RwLock<Vec<Tag>>,
    groups: RwLock<Vec<EquipmentGroup>>,
    log: Mutex<VecDeque<LogEntry>>,
    version: AtomicU64,
    conflicts: AtomicU64,
}

impl Registry {
    pub fn new(config: RegistryConfig, hysteresis_margin: f64) -> Self {
        Self {
            config,
            hysteresis_margin,
            devices: DashMap::new(),
            classifications: DashMap::new(),
            profiles: DashMap::new(),
            tags: RwLock::new(Vec::new()),
            groups: RwLock::new(Vec::new()),
            log: Mutex::new(VecDeque::new()),
            version: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Current registry version; moves only on material changes.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Same-shard write contention observed so far.
    pub fn conflict_count(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    fn append(&self, device_id: &str, channel: Option<&str>, change: Change) {
        let mut log = self.log.lock();
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        log.push_back(LogEntry {
            version,
            at: now_millis(),
            device_id: device_id.to_string(),
            channel: channel.map(str::to_string),
            change,
        });
        while log.len() > self.config.log_capacity.max(1) {
            log.pop_front();
        }
    }

    /// Log entries newer than `version`.
    pub fn changes_since(&self, version: u64) -> Vec<LogEntry> {
        self.log.lock().iter().filter(|e| e.version > version).cloned().collect()
    }

    fn note_contention<K, V>(&self, map: &DashMap<K, V>, key: &K)
    where
        K: Eq + std::hash::Hash,
    {
        if let TryResult::Locked = map.try_get_mut(key) {
            self.conflicts.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Merge a device proposal.
    ///
    /// `last_seen` takes the maximum and `discovered_at` the minimum. The
    /// newer record's attributes and channel set win; equal timestamps fall
    /// back to comparing attributes so the merge is order-independent.
    pub fn upsert_device(&self, record: DeviceRecord) -> DeviceMerge {
        let incoming = record.without_samples();
        self.note_contention(&self.devices, &incoming.id);

        let outcome = match self.devices.entry(incoming.id.clone()) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let mut stored = incoming;
                stored.stale = false;
                stored.missed_cycles = 0;
                slot.insert(stored);
                DeviceMerge::Inserted
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                let newer = (incoming.last_seen, &incoming.raw_attributes) > (existing.last_seen, &existing.raw_attributes);
                let mut changed = existing.stale;
                existing.stale = false;
                existing.missed_cycles = 0;
                existing.discovered_at = existing.discovered_at.min(incoming.discovered_at);
                if newer {
                    changed |= existing.raw_attributes != incoming.raw_attributes
                        || existing.channels != incoming.channels
                        || existing.address != incoming.address
                        || existing.source_probe != incoming.source_probe;
                    existing.raw_attributes = incoming.raw_attributes;
                    existing.channels = incoming.channels;
                    existing.address = incoming.address;
                    existing.source_probe = incoming.source_probe;
                }
                existing.last_seen = existing.last_seen.max(incoming.last_seen);
                if changed {
                    DeviceMerge::Updated
                } else {
                    DeviceMerge::Refreshed
                }
            }
        };

        match outcome {
            DeviceMerge::Inserted => {
                debug!(category = "registry", device = %record.id, "Device added");
                self.append(&record.id, None, Change::DeviceAdded);
            }
            DeviceMerge::Updated => self.append(&record.id, None, Change::DeviceUpdated),
            DeviceMerge::Refreshed => {}
        }
        outcome
    }

    /// Merge a classification proposal under the hysteresis rule.
    ///
    /// A different type replaces the stored one only when its confidence
    /// beats the stored confidence by the margin. `unknown` never replaces a
    /// known type, and a known type always replaces `unknown`.
    pub fn upsert_classification(&self, proposed: Classification) -> ClassificationMerge {
        let key = proposed.key();
        self.note_contention(&self.classifications, &key);

        let outcome = match self.classifications.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(proposed.clone());
                ClassificationMerge::Inserted
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let current = slot.get_mut();
                if current.sensor_type == proposed.sensor_type {
                    *current = proposed.clone();
                    ClassificationMerge::Refreshed
                } else if proposed.is_unknown() {
                    ClassificationMerge::Kept {
                        current: current.sensor_type.clone(),
                    }
                } else if current.is_unknown() || proposed.confidence > current.confidence + self.hysteresis_margin {
                    let from = std::mem::replace(current, proposed.clone()).sensor_type;
                    ClassificationMerge::Replaced { from }
                } else {
                    ClassificationMerge::Kept {
                        current: current.sensor_type.clone(),
                    }
                }
            }
        };

        match &outcome {
            ClassificationMerge::Inserted => self.append(
                &key.device_id,
                Some(&key.channel),
                Change::Classified {
                    sensor_type: proposed.sensor_type.clone(),
                    confidence: proposed.confidence,
                },
            ),
            ClassificationMerge::Replaced { from } => {
                info!(
                    category = "registry",
                    key = %key,
                    from = %from,
                    to = %proposed.sensor_type,
                    confidence = proposed.confidence,
                    "Channel reclassified"
                );
                self.append(
                    &key.device_id,
                    Some(&key.channel),
                    Change::Reclassified {
                        from: from.clone(),
                        to: proposed.sensor_type.clone(),
                        confidence: proposed.confidence,
                    },
                )
            }
            _ => {}
        }
        outcome
    }

    pub fn classification(&self, key: &ChannelKey) -> Option<Classification> {
        self.classifications.get(key).map(|c| c.clone())
    }

    pub fn device(&self, device_id: &str) -> Option<DeviceRecord> {
        self.devices.get(device_id).map(|d| d.clone())
    }

    /// Append a profile to the bounded history and report drift against the
    /// profiles recorded before it.
    pub fn record_profile(&self, profile: SignalProfile) -> Option<Drift> {
        let key = profile.key();
        self.note_contention(&self.profiles, &key);
        let mut history = self.profiles.entry(key).or_default();
        let drift = detect_drift(history.make_contiguous(), &profile, self.config.drift_threshold);
        history.push_back(profile);
        while history.len() > self.config.profile_history.max(1) {
            history.pop_front();
        }
        drift
    }

    pub fn latest_profile(&self, key: &ChannelKey) -> Option<SignalProfile> {
        self.profiles.get(key).and_then(|h| h.back().cloned())
    }

    /// Mark a device stale. Returns false when it is unknown or already stale.
    pub fn mark_stale(&self, device_id: &str) -> bool {
        let missed = match self.devices.get_mut(device_id) {
            Some(mut device) if !device.stale => {
                device.stale = true;
                device.missed_cycles
            }
            _ => return false,
        };
        info!(category = "registry", device = %device_id, missed, "Device marked stale");
        self.append(device_id, None, Change::DeviceStale { missed_cycles: missed });
        true
    }

    /// Count a missed cycle for every device not seen this cycle.
    ///
    /// Devices owned by a probe that faulted this cycle are skipped: their
    /// absence says nothing about the device. Returns the devices that
    /// became stale, with their missed-cycle count.
    pub fn record_cycle_miss(&self, seen: &HashSet<String>, faulted_probes: &HashSet<String>) -> Vec<(String, u32)> {
        let mut newly_stale = Vec::new();
        for mut device in self.devices.iter_mut() {
            if seen.contains(&device.id) || faulted_probes.contains(&device.source_probe) {
                continue;
            }
            device.missed_cycles = device.missed_cycles.saturating_add(1);
            if !device.stale && device.missed_cycles >= self.config.stale_after_cycles {
                newly_stale.push((device.id.clone(), device.missed_cycles));
            }
        }
        newly_stale.sort();
        newly_stale.retain(|(id, _)| self.mark_stale(id));
        newly_stale
    }

    /// Remove stale devices not seen within `older_than`, with everything
    /// keyed under them. Returns the purged device ids.
    pub fn purge_stale(&self, older_than: Duration) -> Vec<String> {
        let cutoff = now_millis() - older_than.as_millis() as i64;
        let mut purged: Vec<String> = self
            .devices
            .iter()
            .filter(|d| d.stale && d.last_seen <= cutoff)
            .map(|d| d.id.clone())
            .collect();
        purged.sort();

        for id in &purged {
            self.devices.remove(id);
            self.classifications.retain(|k, _| &k.device_id != id);
            self.profiles.retain(|k, _| &k.device_id != id);
            let removed: Vec<String> = {
                let mut tags = self.tags.write();
                let paths = tags.iter().filter(|t| &t.device_id == id).map(|t| t.uns_path.clone()).collect();
                tags.retain(|t| &t.device_id != id);
                paths
            };
            for path in removed {
                self.append(id, None, Change::TagRemoved { uns_path: path });
            }
            info!(category = "registry", device = %id, "Stale device purged");
            self.append(id, None, Change::DevicePurged);
        }
        if !purged.is_empty() {
            let groups = derive_groups(&self.tags.read());
            *self.groups.write() = groups;
        }
        purged
    }

    /// Recompute tags for every known classification.
    ///
    /// Paths already assigned stay locked while the sensor type holds; the
    /// allocation runs in key order so it does not depend on the order
    /// proposals arrived in. Returns namespace faults.
    pub fn rebuild_tags(&self, builder: &NamespaceBuilder) -> Vec<Fault> {
        let mut devices: Vec<DeviceRecord> = self.devices.iter().map(|d| d.clone()).collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        let classifications: Vec<Classification> = devices
            .iter()
            .flat_map(|d| d.channels.iter().map(move |c| ChannelKey::new(&d.id, &c.name)))
            .filter_map(|k| self.classification(&k))
            .collect();

        let requests: Vec<TagRequest<'_>> = classifications
            .iter()
            .filter(|c| !c.is_unknown())
            .filter_map(|c| {
                let device = devices.iter().find(|d| d.id == c.device_id)?;
                let channel = device.channel(&c.channel)?;
                Some(TagRequest {
                    device,
                    channel,
                    classification: c,
                })
            })
            .collect();

        let mut tags = self.tags.write();
        let allocation = builder.allocate(requests, &tags);

        let mut changes: Vec<(String, Option<String>, Change)> = Vec::new();
        {
            let previous: HashMap<&str, &Tag> = tags.iter().map(|t| (t.uns_path.as_str(), t)).collect();
            let current: HashMap<&str, &Tag> = allocation.tags.iter().map(|t| (t.uns_path.as_str(), t)).collect();
            for old in tags.iter() {
                if current.get(old.uns_path.as_str()).map_or(true, |new| new.key() != old.key()) {
                    changes.push((old.device_id.clone(), None, Change::TagRemoved { uns_path: old.uns_path.clone() }));
                }
            }
            for new in &allocation.tags {
                let uns_path = new.uns_path.clone();
                let change = match previous.get(new.uns_path.as_str()) {
                    Some(old) if old.key() == new.key() && *old == new => continue,
                    Some(old) if old.key() == new.key() => Change::TagUpdated { uns_path },
                    _ => Change::TagAssigned { uns_path },
                };
                changes.push((new.device_id.clone(), Some(new.channel.clone()), change));
            }
        }

        *tags = allocation.tags;
        let groups = derive_groups(&tags);
        drop(tags);
        *self.groups.write() = groups;

        for (device, channel, change) in changes {
            self.append(&device, channel.as_deref(), change);
        }
        allocation.faults
    }

    /// Materialized view, sorted for stable output.
    pub fn get_current_view(&self) -> CurrentView {
        let mut devices: Vec<DeviceRecord> = self.devices.iter().map(|d| d.clone()).collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        let mut classifications: Vec<Classification> = self.classifications.iter().map(|c| c.clone()).collect();
        classifications.sort_by_key(|c| c.key());
        CurrentView {
            version: self.version(),
            devices,
            classifications,
            tags: self.tags.read().clone(),
            groups: self.groups.read().clone(),
        }
    }

    pub fn snapshot(&self, cycle: u64) -> RegistrySnapshot {
        RegistrySnapshot {
            cycle,
            taken_at: now_millis(),
            view: self.get_current_view(),
        }
    }

    /// Replace the whole state with a snapshot's view. Profile history is
    /// not part of a snapshot and starts empty.
    pub fn restore(&self, snapshot: RegistrySnapshot) {
        let view = snapshot.view;
        self.devices.clear();
        self.classifications.clear();
        self.profiles.clear();
        for device in view.devices {
            self.devices.insert(device.id.clone(), device);
        }
        for classification in view.classifications {
            self.classifications.insert(classification.key(), classification);
        }
        *self.tags.write() = view.tags;
        *self.groups.write() = view.groups;
        self.version.fetch_max(view.version, Ordering::SeqCst);
        info!(
            category = "registry",
            cycle = snapshot.cycle,
            devices = self.devices.len(),
            "Registry restored from snapshot"
        );
        self.append("", None, Change::Restored { cycle: snapshot.cycle });
    }
}

//! Unified namespace tag builder.
//!
//! Paths have the shape `location/equipment_group/sensor_type/index`. The
//! builder derives location and group from device context and enriches tags
//! with per-type metadata; [`NamespaceBuilder::allocate`] assigns instance
//! indices so every path is unique and stays put while its channel keeps
//! its sensor type.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::warn;

use fieldscan_core::config::{DiscoveryConfig, NamespaceConfig, TagOverride};
use fieldscan_core::{
    ChannelKey, ChannelRecord, Classification, DeviceRecord, Fault, FaultKind, GroupingRule, Protocol,
    SensorTypeSpec, SignalKind, Tag,
};

/// Metadata key holding the grouping rule name.
pub const META_GROUPING_RULE: &str = "grouping_rule";
/// Metadata key holding the configured pattern that placed the device.
pub const META_GROUPING_PATTERN: &str = "grouping_pattern";

/// Replace every character outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

pub fn uns_path(location: &str, group: &str, sensor_type: &str, index: u32) -> String {
    format!("{}/{}/{}/{}", location, group, sensor_type, index)
}

fn rule_name(rule: &GroupingRule) -> &'static str {
    match rule {
        GroupingRule::Configured { .. } => "configured",
        GroupingRule::Attribute => "attribute",
        GroupingRule::NameHierarchy => "name_hierarchy",
        GroupingRule::Unassigned => "unassigned",
    }
}

/// Read the grouping rule back from tag metadata.
pub fn grouping_rule_of(tag: &Tag) -> GroupingRule {
    match tag.metadata.get(META_GROUPING_RULE).map(String::as_str) {
        Some("configured") => GroupingRule::Configured {
            pattern: tag.metadata.get(META_GROUPING_PATTERN).cloned().unwrap_or_default(),
        },
        Some("attribute") => GroupingRule::Attribute,
        Some("name_hierarchy") => GroupingRule::NameHierarchy,
        _ => GroupingRule::Unassigned,
    }
}

/// One classified channel waiting for a tag.
#[derive(Debug, Clone, Copy)]
pub struct TagRequest<'a> {
    pub device: &'a DeviceRecord,
    pub channel: &'a ChannelRecord,
    pub classification: &'a Classification,
}

impl TagRequest<'_> {
    pub fn key(&self) -> ChannelKey {
        ChannelKey::new(&self.device.id, &self.channel.name)
    }
}

/// Result of one allocation pass.
#[derive(Debug, Default)]
pub struct Allocation {
    pub tags: Vec<Tag>,
    pub faults: Vec<Fault>,
}

#[derive(Debug, Clone)]
pub struct NamespaceBuilder {
    config: NamespaceConfig,
    vocabulary: Vec<SensorTypeSpec>,
    overrides: Vec<TagOverride>,
}

impl NamespaceBuilder {
    pub fn new(config: NamespaceConfig, vocabulary: Vec<SensorTypeSpec>, overrides: Vec<TagOverride>) -> Self {
        Self {
            config,
            vocabulary,
            overrides,
        }
    }

    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self::new(
            config.namespace.clone(),
            config.effective_vocabulary(),
            config.tag_overrides.clone(),
        )
    }

    pub fn config(&self) -> &NamespaceConfig {
        &self.config
    }

    pub fn location_for(&self, device: &DeviceRecord) -> String {
        let raw = device
            .raw_attributes
            .get("location")
            .map(String::as_str)
            .unwrap_or(&self.config.location_prefix);
        sanitize_segment(raw)
    }

    /// Derive the equipment group: configured rule, then the `equipment`
    /// attribute, then the parent segment of a hierarchical name.
    pub fn group_for(&self, device: &DeviceRecord) -> (String, GroupingRule) {
        let haystack: Vec<String> = std::iter::once(device.id.as_str())
            .chain(std::iter::once(device.address.as_str()))
            .chain(device.channels.iter().filter_map(|c| c.label.as_deref()))
            .chain(device.raw_attributes.get("browse_path").map(String::as_str))
            .map(str::to_lowercase)
            .collect();
        for rule in &self.config.group_rules {
            let pattern = rule.pattern.to_lowercase();
            if haystack.iter().any(|h| h.contains(&pattern)) {
                return (
                    sanitize_segment(&rule.group),
                    GroupingRule::Configured {
                        pattern: rule.pattern.clone(),
                    },
                );
            }
        }

        if let Some(equipment) = device.raw_attributes.get("equipment").filter(|e| !e.trim().is_empty()) {
            return (sanitize_segment(equipment), GroupingRule::Attribute);
        }

        if let Some(parent) = hierarchy_parent(device) {
            return (sanitize_segment(parent), GroupingRule::NameHierarchy);
        }

        (sanitize_segment(&self.config.unassigned_group), GroupingRule::Unassigned)
    }

    fn spec(&self, name: &str) -> Option<&SensorTypeSpec> {
        self.vocabulary.iter().find(|s| s.name == name)
    }

    /// Build a tag at the given index with metadata from the vocabulary and
    /// any matching overrides.
    pub fn build_tag(&self, request: TagRequest<'_>, location: &str, group: &str, rule: &GroupingRule, index: u32) -> Tag {
        let TagRequest {
            device,
            channel,
            classification,
        } = request;
        let sensor_type = classification.sensor_type.clone();
        let spec = self.spec(sensor_type.as_str());

        let mut tag = Tag {
            uns_path: uns_path(location, group, sensor_type.as_str(), index),
            device_id: device.id.clone(),
            channel: channel.name.clone(),
            location: location.to_string(),
            equipment_group: group.to_string(),
            sensor_type,
            instance_index: index,
            signal_kind: classification
                .signal_kind
                .or(spec.map(|s| s.kind))
                .unwrap_or(SignalKind::Analog),
            unit: spec.and_then(|s| s.unit.clone()),
            range_min: spec.and_then(|s| s.range_min),
            range_max: spec.and_then(|s| s.range_max),
            alarm_thresholds: spec.map(|s| s.alarms.clone()).unwrap_or_default(),
            source_probe: device.source_probe.clone(),
            metadata: BTreeMap::new(),
        };

        for o in self.overrides.iter().filter(|o| o.matches(&device.id, &channel.name)) {
            if let Some(unit) = &o.unit {
                tag.unit = Some(unit.clone());
            }
            if o.range_min.is_some() {
                tag.range_min = o.range_min;
            }
            if o.range_max.is_some() {
                tag.range_max = o.range_max;
            }
            if let Some(alarms) = &o.alarms {
                tag.alarm_thresholds = alarms.clone();
            }
        }

        let meta = &mut tag.metadata;
        meta.insert("protocol".to_string(), device.protocol.to_string());
        meta.insert("address".to_string(), device.address.clone());
        meta.insert(META_GROUPING_RULE.to_string(), rule_name(rule).to_string());
        if let GroupingRule::Configured { pattern } = rule {
            meta.insert(META_GROUPING_PATTERN.to_string(), pattern.clone());
        }
        if let Some(label) = &channel.label {
            meta.insert("label".to_string(), label.clone());
        }
        if let Some(data_type) = &channel.data_type {
            meta.insert("data_type".to_string(), data_type.clone());
        }
        if let Some(hint) = &channel.signal_hint {
            meta.insert("signal_hint".to_string(), hint.clone());
        }
        tag
    }

    /// Assign tags to classified channels.
    ///
    /// A channel whose previous tag has the same sensor type keeps its whole
    /// path, even if its name or attributes changed since. Everything else
    /// takes the lowest free index for its location and type. Requests are
    /// processed in key order so the outcome does not depend on input order.
    pub fn allocate(&self, mut requests: Vec<TagRequest<'_>>, previous: &[Tag]) -> Allocation {
        requests.sort_by_key(|r| r.key());
        let previous: HashMap<ChannelKey, &Tag> = previous.iter().map(|t| (t.key(), t)).collect();

        let mut used_paths: HashSet<String> = HashSet::new();
        let mut used_index: HashMap<(String, String), BTreeSet<u32>> = HashMap::new();
        let mut out = Allocation::default();
        let mut pending: Vec<(TagRequest<'_>, bool)> = Vec::new();

        for request in requests {
            if request.classification.is_unknown() {
                continue;
            }
            let Some(prev) = previous
                .get(&request.key())
                .filter(|t| t.sensor_type == request.classification.sensor_type)
            else {
                pending.push((request, false));
                continue;
            };
            if used_paths.contains(&prev.uns_path) {
                warn!(category = "namespace", path = %prev.uns_path, key = %request.key(), "UNS path collision");
                out.faults.push(
                    Fault::new(
                        FaultKind::NamespaceCollision,
                        "namespace",
                        format!("{} already assigned; {} moved to the unassigned branch", prev.uns_path, request.key()),
                    )
                    .with_device(&request.device.id),
                );
                pending.push((request, true));
                continue;
            }
            let rule = grouping_rule_of(prev);
            let tag = self.build_tag(request, &prev.location, &prev.equipment_group, &rule, prev.instance_index);
            used_paths.insert(tag.uns_path.clone());
            used_index
                .entry((tag.location.clone(), tag.sensor_type.to_string()))
                .or_default()
                .insert(tag.instance_index);
            out.tags.push(tag);
        }

        for (request, collided) in pending {
            let location = self.location_for(request.device);
            let (group, rule) = if collided {
                (sanitize_segment(&self.config.unassigned_group), GroupingRule::Unassigned)
            } else {
                self.group_for(request.device)
            };
            let indices = used_index
                .entry((location.clone(), request.classification.sensor_type.to_string()))
                .or_default();
            let index = lowest_free(indices);
            indices.insert(index);
            let tag = self.build_tag(request, &location, &group, &rule, index);
            used_paths.insert(tag.uns_path.clone());
            out.tags.push(tag);
        }

        out.tags.sort_by(|a, b| a.uns_path.cmp(&b.uns_path));
        out
    }
}

fn lowest_free(used: &BTreeSet<u32>) -> u32 {
    (0..).find(|i| !used.contains(i)).unwrap_or(0)
}

/// Parent segment of the device's hierarchical name, if it has one.
fn hierarchy_parent(device: &DeviceRecord) -> Option<&str> {
    match device.protocol {
        // The object itself is the equipment; its variables are the channels.
        Protocol::OpcUa => device
            .raw_attributes
            .get("browse_path")
            .and_then(|p| p.rsplit('/').find(|s| !s.is_empty())),
        Protocol::Mqtt => {
            let segments: Vec<&str> = device.address.split('/').filter(|s| !s.is_empty()).collect();
            // A scalar topic names the signal; a JSON topic names the equipment.
            let scalar = device.channels.iter().all(|c| c.name == "value");
            if scalar {
                segments.len().checked_sub(2).map(|i| segments[i])
            } else {
                segments.last().copied()
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldscan_core::config::GroupRule;
    use fieldscan_core::{builtin_vocabulary, AlarmThresholds, ChannelKind, SensorType};

    fn builder(rules: Vec<GroupRule>, overrides: Vec<TagOverride>) -> NamespaceBuilder {
        let config = NamespaceConfig {
            group_rules: rules,
            ..Default::default()
        };
        NamespaceBuilder::new(config, builtin_vocabulary(), overrides)
    }

    fn modbus(unit: u8, label: Option<&str>) -> DeviceRecord {
        let mut channel = ChannelRecord::new("hr:0", ChannelKind::HoldingRegister);
        if let Some(l) = label {
            channel = channel.with_label(l);
        }
        DeviceRecord::new(format!("modbus:sim/{}", unit), Protocol::Modbus, format!("sim/{}", unit), "mb")
            .with_channel(channel)
    }

    fn classified(device: &DeviceRecord, sensor_type: &str) -> Classification {
        Classification {
            device_id: device.id.clone(),
            channel: device.channels[0].name.clone(),
            sensor_type: SensorType::new(sensor_type),
            signal_kind: None,
            confidence: 0.9,
            evidence: vec![],
            classified_at: 0,
        }
    }

    fn allocate(b: &NamespaceBuilder, pairs: &[(DeviceRecord, Classification)], previous: &[Tag]) -> Allocation {
        let requests = pairs
            .iter()
            .map(|(d, c)| TagRequest {
                device: d,
                channel: &d.channels[0],
                classification: c,
            })
            .collect();
        b.allocate(requests, previous)
    }

    #[test]
    fn test_sanitize_segment() {
        assert_eq!(sanitize_segment("Boiler #1"), "Boiler__1");
        assert_eq!(sanitize_segment("line-2_a"), "line-2_a");
        assert_eq!(sanitize_segment("  "), "_");
        assert_eq!(sanitize_segment("Kühlung"), "K_hlung");
    }

    #[test]
    fn test_default_path_and_metadata() {
        let b = builder(vec![], vec![]);
        let dev = modbus(4, Some("TEMP"));
        let c = classified(&dev, "temperature");
        let alloc = allocate(&b, &[(dev, c)], &[]);
        let tag = &alloc.tags[0];
        assert_eq!(tag.uns_path, "Plant/Unassigned/temperature/0");
        assert_eq!(tag.unit.as_deref(), Some("°C"));
        assert_eq!(tag.signal_kind, SignalKind::Analog);
        assert_eq!(tag.alarm_thresholds.high, Some(80.0));
        assert_eq!(tag.metadata["label"], "TEMP");
        assert_eq!(tag.metadata[META_GROUPING_RULE], "unassigned");
    }

    #[test]
    fn test_collisions_increment_index() {
        let b = builder(vec![], vec![]);
        let pairs: Vec<_> = (1..=3)
            .map(|u| {
                let d = modbus(u, None);
                let c = classified(&d, "pressure");
                (d, c)
            })
            .collect();
        let alloc = allocate(&b, &pairs, &[]);
        let paths: Vec<&str> = alloc.tags.iter().map(|t| t.uns_path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "Plant/Unassigned/pressure/0",
                "Plant/Unassigned/pressure/1",
                "Plant/Unassigned/pressure/2"
            ]
        );
        assert!(alloc.faults.is_empty());
    }

    #[test]
    fn test_path_locked_across_rename() {
        let b = builder(vec![GroupRule {
            pattern: "boiler".to_string(),
            group: "Boiler".to_string(),
        }], vec![]);
        let dev = modbus(4, Some("TEMP"));
        let c = classified(&dev, "temperature");
        let first = allocate(&b, &[(dev.clone(), c.clone())], &[]);
        assert_eq!(first.tags[0].uns_path, "Plant/Unassigned/temperature/0");

        // Relabelled so the configured rule would now match.
        let renamed = modbus(4, Some("Boiler TEMP"));
        let second = allocate(&b, &[(renamed, c)], &first.tags);
        assert_eq!(second.tags[0].uns_path, "Plant/Unassigned/temperature/0");
        assert_eq!(second.tags[0].metadata["label"], "Boiler TEMP");
    }

    #[test]
    fn test_reclassified_channel_gets_new_path() {
        let b = builder(vec![], vec![]);
        let dev = modbus(2, None);
        let first = allocate(&b, &[(dev.clone(), classified(&dev, "pressure"))], &[]);
        let second = allocate(&b, &[(dev.clone(), classified(&dev, "flow"))], &first.tags);
        assert_eq!(second.tags[0].uns_path, "Plant/Unassigned/flow/0");
    }

    #[test]
    fn test_freed_index_is_reused_and_order_independent() {
        let b = builder(vec![], vec![]);
        let pairs: Vec<_> = (1..=2)
            .map(|u| {
                let d = modbus(u, None);
                let c = classified(&d, "pressure");
                (d, c)
            })
            .collect();
        let first = allocate(&b, &pairs, &[]);
        // Device 1 disappears, device 3 arrives; device 2 keeps index 1.
        let d3 = modbus(3, None);
        let c3 = classified(&d3, "pressure");
        let second = allocate(&b, &[(d3, c3), pairs[1].clone()], &first.tags);
        let by_device: HashMap<&str, &str> = second
            .tags
            .iter()
            .map(|t| (t.device_id.as_str(), t.uns_path.as_str()))
            .collect();
        assert_eq!(by_device["modbus:sim/2"], "Plant/Unassigned/pressure/1");
        assert_eq!(by_device["modbus:sim/3"], "Plant/Unassigned/pressure/0");
    }

    #[test]
    fn test_duplicate_previous_path_is_a_collision() {
        let b = builder(vec![], vec![]);
        let d1 = modbus(1, None);
        let d2 = modbus(2, None);
        let c1 = classified(&d1, "pressure");
        let c2 = classified(&d2, "pressure");
        let first = allocate(&b, &[(d1.clone(), c1.clone())], &[]);
        // A restored registry claims one path for two channels.
        let mut duplicate = first.tags[0].clone();
        duplicate.device_id = d2.id.clone();
        let alloc = allocate(&b, &[(d2, c2), (d1, c1)], &[first.tags[0].clone(), duplicate]);

        assert_eq!(alloc.faults.len(), 1);
        assert_eq!(alloc.faults[0].kind, FaultKind::NamespaceCollision);
        assert_eq!(alloc.faults[0].device_id.as_deref(), Some("modbus:sim/2"));
        let paths: Vec<&str> = alloc.tags.iter().map(|t| t.uns_path.as_str()).collect();
        assert_eq!(paths, vec!["Plant/Unassigned/pressure/0", "Plant/Unassigned/pressure/1"]);
        assert_eq!(alloc.tags[1].metadata[META_GROUPING_RULE], "unassigned");
    }

    #[test]
    fn test_group_derivation_order() {
        let b = builder(vec![GroupRule {
            pattern: "PUMP".to_string(),
            group: "Pump Skid".to_string(),
        }], vec![]);
        let configured = modbus(1, Some("pump_pressure"));
        assert_eq!(
            b.group_for(&configured),
            ("Pump_Skid".to_string(), GroupingRule::Configured { pattern: "PUMP".to_string() })
        );

        let attr = modbus(2, None).with_attribute("equipment", "Chiller 2");
        assert_eq!(b.group_for(&attr), ("Chiller_2".to_string(), GroupingRule::Attribute));

        let opc = DeviceRecord::new("opcua:e/ns=2;s=B1", Protocol::OpcUa, "e/ns=2;s=B1", "opc")
            .with_attribute("browse_path", "Plant/Boiler1");
        assert_eq!(b.group_for(&opc), ("Boiler1".to_string(), GroupingRule::NameHierarchy));

        let topic = DeviceRecord::new("mqtt:b/site/boiler/temp", Protocol::Mqtt, "site/boiler/temp", "mq")
            .with_channel(ChannelRecord::new("value", ChannelKind::Topic));
        assert_eq!(b.group_for(&topic).0, "boiler");

        let json_topic = DeviceRecord::new("mqtt:b/site/dryer", Protocol::Mqtt, "site/dryer", "mq")
            .with_channel(ChannelRecord::new("temp", ChannelKind::Topic));
        assert_eq!(b.group_for(&json_topic).0, "dryer");

        assert_eq!(b.group_for(&modbus(3, None)).1, GroupingRule::Unassigned);
    }

    #[test]
    fn test_location_attribute_and_overrides() {
        let overrides = vec![TagOverride {
            device: "modbus:sim/*".to_string(),
            channel: Some("hr:0".to_string()),
            unit: Some("°F".to_string()),
            range_min: Some(0.0),
            range_max: None,
            alarms: Some(AlarmThresholds {
                high: Some(180.0),
                ..Default::default()
            }),
        }];
        let b = builder(vec![], overrides);
        let dev = modbus(4, Some("TEMP")).with_attribute("location", "Site A");
        let c = classified(&dev, "temperature");
        let alloc = allocate(&b, &[(dev, c)], &[]);
        let tag = &alloc.tags[0];
        assert_eq!(tag.location, "Site_A");
        assert_eq!(tag.uns_path, "Site_A/Unassigned/temperature/0");
        assert_eq!(tag.unit.as_deref(), Some("°F"));
        assert_eq!(tag.range_min, Some(0.0));
        assert_eq!(tag.range_max, Some(120.0));
        assert_eq!(tag.alarm_thresholds.high, Some(180.0));
        assert_eq!(tag.alarm_thresholds.high_high, None);
    }

    #[test]
    fn test_unknown_gets_no_tag() {
        let b = builder(vec![], vec![]);
        let dev = modbus(5, None);
        let c = classified(&dev, SensorType::UNKNOWN);
        assert!(allocate(&b, &[(dev, c)], &[]).tags.is_empty());
    }
}

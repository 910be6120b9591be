//! Incremental artifact generation.
//!
//! Artifacts are rebuilt from the registry view on every pass, but only
//! groups whose SHA-256 fingerprint moved since the last pass are reported
//! as changed.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::debug;

use fieldscan_core::config::ArtifactConfig;
use fieldscan_core::{CurrentView, EquipmentGroup, Tag};

use crate::error::Result;
use crate::model::{
    AlertCondition, AlertRule, ComparisonOperator, DashboardLayout, GenerationReport, GroupArtifacts,
    Severity, Widget, WidgetPosition, WidgetRange, WidgetType, WiringBinding,
};

/// Dashboard grid width.
pub const GRID_COLUMNS: u32 = 12;

/// Lay out one widget per tag, left to right, wrapping at the grid width.
pub fn build_dashboard(group: &EquipmentGroup, tags: &[&Tag]) -> DashboardLayout {
    let (mut x, mut y, mut row_height) = (0u32, 0u32, 0u32);
    let widgets = tags
        .iter()
        .map(|tag| {
            let widget_type = WidgetType::for_kind(tag.signal_kind);
            let (w, h) = widget_type.size();
            if x + w > GRID_COLUMNS {
                x = 0;
                y += row_height;
                row_height = 0;
            }
            let position = WidgetPosition { x, y, w, h };
            x += w;
            row_height = row_height.max(h);

            let range = (tag.range_min.is_some() || tag.range_max.is_some()).then_some(WidgetRange {
                min: tag.range_min,
                max: tag.range_max,
            });
            Widget {
                id: format!("w-{}", tag.uns_path.replace('/', "-")),
                tag: tag.uns_path.clone(),
                widget_type,
                title: tag
                    .metadata
                    .get("label")
                    .cloned()
                    .unwrap_or_else(|| format!("{} {}", tag.sensor_type, tag.instance_index)),
                unit: tag.unit.clone(),
                range,
                position,
            }
        })
        .collect();

    DashboardLayout {
        equipment_group: group.group_id.clone(),
        location: group.location.clone(),
        columns: GRID_COLUMNS,
        widgets,
    }
}

/// Alert rules from a tag's alarm thresholds.
pub fn build_alerts(tag: &Tag, config: &ArtifactConfig) -> Vec<AlertRule> {
    let t = &tag.alarm_thresholds;
    let limits = [
        ("high_high", t.high_high, ComparisonOperator::GreaterThan, Severity::Critical),
        ("high", t.high, ComparisonOperator::GreaterThan, Severity::Warning),
        ("low", t.low, ComparisonOperator::LessThan, Severity::Warning),
        ("low_low", t.low_low, ComparisonOperator::LessThan, Severity::Critical),
    ];
    limits
        .into_iter()
        .filter_map(|(name, threshold, operator, severity)| {
            let condition = AlertCondition {
                operator,
                threshold: threshold?,
            };
            let channels = match severity {
                Severity::Warning => &config.warning_channels,
                Severity::Critical => &config.critical_channels,
            };
            Some(AlertRule {
                id: format!("{}:{}", tag.uns_path, name),
                tag: tag.uns_path.clone(),
                expression: condition.to_string(),
                condition,
                severity,
                notification_channels: channels.clone(),
            })
        })
        .collect()
}

pub fn build_wiring(tag: &Tag) -> WiringBinding {
    WiringBinding {
        source_probe: tag.source_probe.clone(),
        source_channel: tag.key().to_string(),
        target_tag: tag.uns_path.clone(),
    }
}

/// Build the artifacts of every group in a view, keyed by group id.
pub fn build_all(view: &CurrentView, config: &ArtifactConfig) -> BTreeMap<String, GroupArtifacts> {
    let mut by_group: HashMap<String, Vec<&Tag>> = HashMap::new();
    for tag in &view.tags {
        by_group
            .entry(format!("{}/{}", tag.location, tag.equipment_group))
            .or_default()
            .push(tag);
    }

    view.groups
        .iter()
        .map(|group| {
            let mut tags = by_group.remove(&group.group_id).unwrap_or_default();
            tags.sort_by(|a, b| a.uns_path.cmp(&b.uns_path));

            let artifacts = GroupArtifacts {
                group_id: group.group_id.clone(),
                member_device_ids: group.member_device_ids.clone(),
                dashboard: build_dashboard(group, &tags),
                alerts: tags.iter().flat_map(|t| build_alerts(t, config)).collect(),
                wiring: tags.iter().map(|t| build_wiring(t)).collect(),
            };
            (group.group_id.clone(), artifacts)
        })
        .collect()
}

/// SHA-256 over the serialized group artifacts.
pub fn fingerprint(artifacts: &GroupArtifacts) -> Result<String> {
    let json = serde_json::to_vec(artifacts)?;
    let mut hasher = Sha256::new();
    hasher.update(&json);
    Ok(format!("{:x}", hasher.finalize()))
}

pub struct ArtifactGenerator {
    config: ArtifactConfig,
    fingerprints: Mutex<BTreeMap<String, String>>,
    /// Removals from rejected reports, replayed on the next pass.
    pending_removals: Mutex<BTreeSet<String>>,
}

impl ArtifactGenerator {
    pub fn new(config: ArtifactConfig) -> Self {
        Self {
            config,
            fingerprints: Mutex::new(BTreeMap::new()),
            pending_removals: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn config(&self) -> &ArtifactConfig {
        &self.config
    }

    /// Rebuild from a view and report only what changed since the last call.
    pub fn generate(&self, view: &CurrentView) -> Result<GenerationReport> {
        let built = build_all(view, &self.config);
        let mut fresh = BTreeMap::new();
        for (group_id, artifacts) in &built {
            fresh.insert(group_id.clone(), fingerprint(artifacts)?);
        }

        let mut known = self.fingerprints.lock();
        let mut pending = self.pending_removals.lock();
        let mut report = GenerationReport::default();
        for (group_id, artifacts) in built {
            if known.get(&group_id) == fresh.get(&group_id) {
                report.unchanged += 1;
            } else {
                debug!(category = "artifacts", group = %group_id, "Group artifacts changed");
                report.changed.push(artifacts);
            }
        }
        let removed: BTreeSet<String> = known
            .keys()
            .chain(pending.iter())
            .filter(|g| !fresh.contains_key(*g))
            .cloned()
            .collect();
        report.removed = removed.into_iter().collect();
        pending.clear();
        *known = fresh;
        Ok(report)
    }

    /// Mark a report as not applied: every group is re-emitted next pass and
    /// its removals are reported again.
    pub fn reject(&self, report: &GenerationReport) {
        let mut known = self.fingerprints.lock();
        self.pending_removals.lock().extend(report.removed.iter().cloned());
        known.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldscan_core::{AlarmThresholds, GroupingRule, SensorType, SignalKind};

    fn tag(path: &str, kind: SignalKind, alarms: AlarmThresholds) -> Tag {
        let parts: Vec<&str> = path.split('/').collect();
        Tag {
            uns_path: path.to_string(),
            device_id: format!("dev-{}", parts[2]),
            channel: "hr:0".to_string(),
            location: parts[0].to_string(),
            equipment_group: parts[1].to_string(),
            sensor_type: SensorType::new(parts[2]),
            instance_index: parts[3].parse().unwrap(),
            signal_kind: kind,
            unit: None,
            range_min: Some(0.0),
            range_max: Some(100.0),
            alarm_thresholds: alarms,
            source_probe: "line1".to_string(),
            metadata: Default::default(),
        }
    }

    fn group(id: &str) -> EquipmentGroup {
        let (location, _) = id.split_once('/').unwrap();
        EquipmentGroup {
            group_id: id.to_string(),
            location: location.to_string(),
            member_device_ids: vec![],
            grouping_rule: GroupingRule::Unassigned,
        }
    }

    #[test]
    fn test_widget_type_by_signal_kind() {
        let g = group("Plant/Boiler");
        let a = tag("Plant/Boiler/temperature/0", SignalKind::Analog, Default::default());
        let d = tag("Plant/Boiler/status/0", SignalKind::Digital, Default::default());
        let n = tag("Plant/Boiler/counter/0", SignalKind::Numeric, Default::default());
        let layout = build_dashboard(&g, &[&a, &d, &n]);
        let types: Vec<WidgetType> = layout.widgets.iter().map(|w| w.widget_type).collect();
        assert_eq!(types, vec![WidgetType::Gauge, WidgetType::Indicator, WidgetType::TrendChart]);
        // Gauge + indicator fill 5 columns; the chart needs 6 more and wraps.
        assert_eq!(layout.widgets[2].position, WidgetPosition { x: 5, y: 0, w: 6, h: 3 });
        assert_eq!(layout.widgets[0].range.unwrap().max, Some(100.0));
        assert_eq!(layout.widgets[0].title, "temperature 0");
    }

    #[test]
    fn test_wrap_to_next_row() {
        let g = group("Plant/Boiler");
        let tags: Vec<Tag> = (0..5)
            .map(|i| tag(&format!("Plant/Boiler/pressure/{}", i), SignalKind::Analog, Default::default()))
            .collect();
        let refs: Vec<&Tag> = tags.iter().collect();
        let layout = build_dashboard(&g, &refs);
        assert_eq!(layout.widgets[3].position, WidgetPosition { x: 9, y: 0, w: 3, h: 3 });
        assert_eq!(layout.widgets[4].position, WidgetPosition { x: 0, y: 3, w: 3, h: 3 });
    }

    #[test]
    fn test_alert_rules_from_thresholds() {
        let config = ArtifactConfig::default();
        let t = tag(
            "Plant/Tank/level/0",
            SignalKind::Analog,
            AlarmThresholds {
                low_low: Some(5.0),
                low: None,
                high: Some(90.0),
                high_high: Some(95.0),
            },
        );
        let rules = build_alerts(&t, &config);
        let ids: Vec<&str> = rules.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["Plant/Tank/level/0:high_high", "Plant/Tank/level/0:high", "Plant/Tank/level/0:low_low"]
        );
        assert_eq!(rules[0].severity, Severity::Critical);
        assert_eq!(rules[0].notification_channels, vec!["dashboard", "email"]);
        assert_eq!(rules[1].expression, "value > 90");
        assert_eq!(rules[2].condition.operator, ComparisonOperator::LessThan);
        assert!(build_alerts(&tag("Plant/Tank/status/0", SignalKind::Digital, Default::default()), &config).is_empty());
    }

    #[test]
    fn test_wiring_binding() {
        let t = tag("Plant/Boiler/temperature/0", SignalKind::Analog, Default::default());
        let wiring = build_wiring(&t);
        assert_eq!(wiring.source_channel, "dev-temperature#hr:0");
        assert_eq!(wiring.target_tag, "Plant/Boiler/temperature/0");
        assert_eq!(wiring.source_probe, "line1");
    }
}

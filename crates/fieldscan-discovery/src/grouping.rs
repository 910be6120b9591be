//! Equipment grouping over published tags.

use std::collections::{BTreeMap, BTreeSet};

use fieldscan_core::{EquipmentGroup, GroupingRule, Tag};

use crate::namespace::grouping_rule_of;

/// Collect tags into equipment groups keyed by `location/group`.
///
/// A group's rule is the one recorded on its first tag in path order.
pub fn derive_groups(tags: &[Tag]) -> Vec<EquipmentGroup> {
    let mut groups: BTreeMap<(String, String), (BTreeSet<String>, Option<GroupingRule>)> = BTreeMap::new();
    let mut sorted: Vec<&Tag> = tags.iter().collect();
    sorted.sort_by(|a, b| a.uns_path.cmp(&b.uns_path));

    for tag in sorted {
        let entry = groups
            .entry((tag.location.clone(), tag.equipment_group.clone()))
            .or_default();
        entry.0.insert(tag.device_id.clone());
        if entry.1.is_none() {
            entry.1 = Some(grouping_rule_of(tag));
        }
    }

    groups
        .into_iter()
        .map(|((location, group), (members, rule))| EquipmentGroup {
            group_id: format!("{}/{}", location, group),
            location,
            member_device_ids: members.into_iter().collect(),
            grouping_rule: rule.unwrap_or(GroupingRule::Unassigned),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::META_GROUPING_RULE;
    use fieldscan_core::{AlarmThresholds, SensorType, SignalKind};

    fn tag(device: &str, channel: &str, location: &str, group: &str, index: u32, rule: &str) -> Tag {
        let mut metadata = BTreeMap::new();
        metadata.insert(META_GROUPING_RULE.to_string(), rule.to_string());
        Tag {
            uns_path: format!("{}/{}/temperature/{}", location, group, index),
            device_id: device.to_string(),
            channel: channel.to_string(),
            location: location.to_string(),
            equipment_group: group.to_string(),
            sensor_type: SensorType::new("temperature"),
            instance_index: index,
            signal_kind: SignalKind::Analog,
            unit: None,
            range_min: None,
            range_max: None,
            alarm_thresholds: AlarmThresholds::default(),
            source_probe: "p".to_string(),
            metadata,
        }
    }

    #[test]
    fn test_groups_by_location_and_group() {
        let tags = vec![
            tag("opc:b1", "TT101", "Plant", "Boiler1", 0, "name_hierarchy"),
            tag("opc:b1", "TT102", "Plant", "Boiler1", 1, "name_hierarchy"),
            tag("modbus:4", "hr:0", "Plant", "Unassigned", 2, "unassigned"),
            tag("modbus:9", "hr:0", "Yard", "Unassigned", 0, "unassigned"),
        ];
        let groups = derive_groups(&tags);
        let ids: Vec<&str> = groups.iter().map(|g| g.group_id.as_str()).collect();
        assert_eq!(ids, vec!["Plant/Boiler1", "Plant/Unassigned", "Yard/Unassigned"]);
        assert_eq!(groups[0].member_device_ids, vec!["opc:b1"]);
        assert_eq!(groups[0].grouping_rule, GroupingRule::NameHierarchy);
        assert_eq!(groups[2].location, "Yard");
    }

    #[test]
    fn test_no_tags_no_groups() {
        assert!(derive_groups(&[]).is_empty());
    }
}

//! Generated artifact documents.

use std::fmt;

use serde::{Deserialize, Serialize};

use fieldscan_core::SignalKind;

/// Widget used to render one tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WidgetType {
    Gauge,
    Indicator,
    TrendChart,
}

impl WidgetType {
    pub fn for_kind(kind: SignalKind) -> Self {
        match kind {
            SignalKind::Analog => WidgetType::Gauge,
            SignalKind::Digital => WidgetType::Indicator,
            SignalKind::Numeric => WidgetType::TrendChart,
        }
    }

    /// Grid footprint `(w, h)`.
    pub fn size(&self) -> (u32, u32) {
        match self {
            WidgetType::Gauge => (3, 3),
            WidgetType::Indicator => (2, 2),
            WidgetType::TrendChart => (6, 3),
        }
    }
}

/// Widget position on the dashboard grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetPosition {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WidgetRange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Widget {
    pub id: String,
    /// UNS path of the bound tag
    pub tag: String,
    pub widget_type: WidgetType,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<WidgetRange>,
    pub position: WidgetPosition,
}

/// Dashboard layout for one equipment group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardLayout {
    pub equipment_group: String,
    pub location: String,
    pub columns: u32,
    pub widgets: Vec<Widget>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOperator {
    GreaterThan,
    LessThan,
}

impl ComparisonOperator {
    pub fn as_str(&self) -> &str {
        match self {
            Self::GreaterThan => ">",
            Self::LessThan => "<",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlertCondition {
    pub operator: ComparisonOperator,
    pub threshold: f64,
}

impl fmt::Display for AlertCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "value {} {}", self.operator.as_str(), self.threshold)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub tag: String,
    pub condition: AlertCondition,
    /// Human-readable form of `condition`
    pub expression: String,
    pub severity: Severity,
    pub notification_channels: Vec<String>,
}

/// Binding of a probe channel to the tag it feeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WiringBinding {
    pub source_probe: String,
    /// `device_id#channel`
    pub source_channel: String,
    pub target_tag: String,
}

/// Everything generated for one equipment group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupArtifacts {
    pub group_id: String,
    pub member_device_ids: Vec<String>,
    pub dashboard: DashboardLayout,
    pub alerts: Vec<AlertRule>,
    pub wiring: Vec<WiringBinding>,
}

/// Outcome of one incremental generation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationReport {
    /// Groups whose artifacts changed and were re-emitted
    pub changed: Vec<GroupArtifacts>,
    /// Groups that no longer exist
    pub removed: Vec<String>,
    pub unchanged: usize,
}

impl GenerationReport {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

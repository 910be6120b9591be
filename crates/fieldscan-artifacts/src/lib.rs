//! Dashboard, alert and wiring artifacts derived from the published tag set.
//!
//! Generation is incremental: each equipment group is fingerprinted and only
//! groups whose fingerprint moved are re-emitted.

pub mod error;
pub mod generator;
pub mod model;
pub mod sink;

pub use error::{ArtifactError, Result};
pub use generator::{build_alerts, build_all, build_dashboard, build_wiring, fingerprint, ArtifactGenerator};
pub use model::{
    AlertCondition, AlertRule, ComparisonOperator, DashboardLayout, GenerationReport, GroupArtifacts,
    Severity, Widget, WidgetPosition, WidgetRange, WidgetType, WiringBinding,
};
pub use sink::FileSink;

//! Signal analysis and naming for fieldscan.
//!
//! - [`profiler`]: per-channel summary statistics and drift detection
//! - [`classifier`]: confidence-scored sensor type proposals
//! - [`namespace`]: unified namespace paths and tag metadata
//! - [`grouping`]: equipment groups for dashboard composition

pub mod classifier;
pub mod grouping;
pub mod namespace;
pub mod profiler;

pub use classifier::{Candidate, Classifier};
pub use grouping::derive_groups;
pub use namespace::{sanitize_segment, uns_path, Allocation, NamespaceBuilder, TagRequest};
pub use profiler::{detect_drift, numeric_value, Drift, SignalProfiler};

//! Built-in sensor type vocabulary.
//!
//! Each entry describes one semantic sensor type: the keywords that name it,
//! the physical envelope its values must fall into, and the default
//! unit/range/alarm metadata attached to tags of that type. Configuration can
//! replace any entry by name or add new ones.

use serde::{Deserialize, Serialize};

use crate::types::{AlarmThresholds, SensorType, SignalKind};

/// Definition of one classifiable sensor type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorTypeSpec {
    /// Type name, used as the UNS path segment
    pub name: String,
    pub kind: SignalKind,
    /// Naming-pattern vocabulary (lowercase)
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Physically plausible value envelope
    pub envelope_min: f64,
    pub envelope_max: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Default display range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_max: Option<f64>,
    #[serde(default)]
    pub alarms: AlarmThresholds,
}

impl SensorTypeSpec {
    pub fn new(name: impl Into<String>, kind: SignalKind, envelope: (f64, f64)) -> Self {
        Self {
            name: name.into(),
            kind,
            keywords: Vec::new(),
            envelope_min: envelope.0,
            envelope_max: envelope.1,
            unit: None,
            range_min: None,
            range_max: None,
            alarms: AlarmThresholds::default(),
        }
    }

    pub fn with_keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords = keywords.iter().map(|k| k.to_lowercase()).collect();
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.range_min = Some(min);
        self.range_max = Some(max);
        self
    }

    pub fn with_alarms(mut self, alarms: AlarmThresholds) -> Self {
        self.alarms = alarms;
        self
    }

    pub fn sensor_type(&self) -> SensorType {
        SensorType::new(&self.name)
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.envelope_min && value <= self.envelope_max
    }
}

fn high(high: f64, high_high: f64) -> AlarmThresholds {
    AlarmThresholds {
        high: Some(high),
        high_high: Some(high_high),
        ..Default::default()
    }
}

/// Get all built-in sensor types.
pub fn builtin_vocabulary() -> Vec<SensorTypeSpec> {
    vec![
        SensorTypeSpec::new("temperature", SignalKind::Analog, (-60.0, 1500.0))
            .with_keywords(&["temperature", "temp", "tmp", "thermo", "rtd", "tc", "tt", "te", "ti"])
            .with_unit("°C")
            .with_range(-20.0, 120.0)
            .with_alarms(high(80.0, 95.0)),
        SensorTypeSpec::new("pressure", SignalKind::Analog, (-1.0, 1000.0))
            .with_keywords(&["pressure", "press", "psi", "bar", "kpa", "pt", "pi"])
            .with_unit("bar")
            .with_range(0.0, 16.0)
            .with_alarms(high(10.0, 14.0)),
        SensorTypeSpec::new("humidity", SignalKind::Analog, (0.0, 100.0))
            .with_keywords(&["humidity", "hum", "rh", "moisture"])
            .with_unit("%RH")
            .with_range(0.0, 100.0)
            .with_alarms(high(85.0, 95.0)),
        SensorTypeSpec::new("flow", SignalKind::Analog, (0.0, 100_000.0))
            .with_keywords(&["flow", "lpm", "gpm", "ft", "fi", "fit"])
            .with_unit("m³/h")
            .with_range(0.0, 100.0),
        SensorTypeSpec::new("level", SignalKind::Analog, (0.0, 100_000.0))
            .with_keywords(&["level", "lvl", "tank", "lt", "li"])
            .with_unit("%")
            .with_range(0.0, 100.0)
            .with_alarms(AlarmThresholds {
                low_low: Some(5.0),
                low: Some(10.0),
                high: Some(90.0),
                high_high: Some(95.0),
            }),
        SensorTypeSpec::new("vibration", SignalKind::Analog, (0.0, 1000.0))
            .with_keywords(&["vibration", "vib", "accel", "velocity"])
            .with_unit("mm/s")
            .with_range(0.0, 50.0)
            .with_alarms(high(7.1, 11.0)),
        SensorTypeSpec::new("voltage", SignalKind::Analog, (-1000.0, 50_000.0))
            .with_keywords(&["voltage", "volt", "vac", "vdc"])
            .with_unit("V")
            .with_range(0.0, 480.0),
        SensorTypeSpec::new("current", SignalKind::Analog, (-10_000.0, 10_000.0))
            .with_keywords(&["current", "amps", "amp"])
            .with_unit("A")
            .with_range(0.0, 100.0),
        SensorTypeSpec::new("power", SignalKind::Analog, (-1_000_000.0, 1_000_000.0))
            .with_keywords(&["power", "watt", "kw", "pwr"])
            .with_unit("kW")
            .with_range(0.0, 1000.0),
        SensorTypeSpec::new("speed", SignalKind::Analog, (0.0, 100_000.0))
            .with_keywords(&["speed", "rpm", "freq", "hz"])
            .with_unit("rpm")
            .with_range(0.0, 3600.0),
        SensorTypeSpec::new("status", SignalKind::Digital, (0.0, 1.0))
            .with_keywords(&[
                "status", "state", "running", "run", "alarm", "fault", "trip", "switch", "di", "do",
            ])
            .with_range(0.0, 1.0),
        SensorTypeSpec::new("counter", SignalKind::Numeric, (0.0, 1e12))
            .with_keywords(&["counter", "count", "total", "totalizer", "pulse", "cycles"]),
    ]
}

/// Merge configured entries over the built-in table; configured entries win by name.
pub fn merge_vocabulary(base: Vec<SensorTypeSpec>, overrides: &[SensorTypeSpec]) -> Vec<SensorTypeSpec> {
    let mut merged = base;
    for spec in overrides {
        match merged.iter_mut().find(|s| s.name == spec.name) {
            Some(existing) => *existing = spec.clone(),
            None => merged.push(spec.clone()),
        }
    }
    merged
}

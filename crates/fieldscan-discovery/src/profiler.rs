//! Signal profiler.
//!
//! Reduces a channel's recent samples to summary statistics: central
//! tendency, spread, sample rate, noise class and latency. Malformed
//! samples are counted as defects and excluded from every statistic.

use serde_json::Value;

use fieldscan_core::{now_millis, ChannelRecord, NoiseClass, Sample, SignalProfile};

/// Zero-crossing rate above which a varying signal counts as noisy.
const NOISY_CROSSING_RATE: f64 = 0.5;

/// Coerce a raw sample value into a number.
///
/// Numbers pass through, booleans map to 0/1, and strings are accepted when
/// they parse as a number or spell a two-state word.
pub fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(v) = s.parse::<f64>() {
                return v.is_finite().then_some(v);
            }
            match s.to_lowercase().as_str() {
                "true" | "on" | "yes" | "open" | "running" => Some(1.0),
                "false" | "off" | "no" | "closed" | "stopped" => Some(0.0),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Statistics engine for channel samples.
#[derive(Debug, Clone)]
pub struct SignalProfiler {
    /// Minimum valid samples before variance is reported
    min_samples: usize,
}

impl SignalProfiler {
    pub fn new() -> Self {
        Self { min_samples: 2 }
    }

    /// Variance needs at least two samples; smaller values are raised to 2.
    pub fn with_min_samples(mut self, min: usize) -> Self {
        self.min_samples = min.max(2);
        self
    }

    /// Profile one channel of a device.
    pub fn profile(&self, device_id: &str, channel: &ChannelRecord) -> SignalProfile {
        let mut profile = self.profile_samples(device_id, &channel.name, &channel.samples);
        profile.response_latency_ms = channel.response_latency_ms;
        profile
    }

    /// Profile a raw sample series.
    pub fn profile_samples(&self, device_id: &str, channel: &str, samples: &[Sample]) -> SignalProfile {
        let mut valid: Vec<(i64, f64)> = Vec::with_capacity(samples.len());
        let mut defects = 0usize;
        for sample in samples {
            match numeric_value(&sample.value) {
                Some(v) => valid.push((sample.timestamp, v)),
                None => defects += 1,
            }
        }

        let values: Vec<f64> = valid.iter().map(|(_, v)| *v).collect();
        let count = values.len();
        let mut profile = SignalProfile {
            device_id: device_id.to_string(),
            channel: channel.to_string(),
            mean: 0.0,
            variance: None,
            min: 0.0,
            max: 0.0,
            sample_rate: 0.0,
            noise_class: NoiseClass::Insufficient,
            sample_count: count,
            distinct_values: 0,
            is_binary: false,
            zero_crossing_rate: 0.0,
            response_latency_ms: None,
            defects,
            computed_at: now_millis(),
        };
        if count == 0 {
            return profile;
        }

        let mean = values.iter().sum::<f64>() / count as f64;
        profile.mean = mean;
        profile.min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        profile.max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        profile.distinct_values = distinct_count(&values);
        profile.is_binary = values.iter().all(|v| *v == 0.0 || *v == 1.0);

        if count >= self.min_samples {
            let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
            profile.variance = Some(variance);
            profile.zero_crossing_rate = zero_crossing_rate(&values, mean);

            let first = valid.iter().map(|(t, _)| *t).min().unwrap_or(0);
            let last = valid.iter().map(|(t, _)| *t).max().unwrap_or(0);
            if last > first {
                profile.sample_rate = (count - 1) as f64 / ((last - first) as f64 / 1000.0);
            }

            profile.noise_class = if profile.distinct_values == 1 {
                NoiseClass::Constant
            } else if profile.is_binary {
                NoiseClass::Binary
            } else if profile.zero_crossing_rate > NOISY_CROSSING_RATE {
                NoiseClass::Noisy
            } else {
                NoiseClass::Smooth
            };
        }
        profile
    }
}

impl Default for SignalProfiler {
    fn default() -> Self {
        Self::new()
    }
}

fn distinct_count(values: &[f64]) -> usize {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted.dedup();
    sorted.len()
}

/// Fraction of consecutive sample pairs whose deviation from the mean
/// changes sign. Samples sitting exactly on the mean carry no sign.
fn zero_crossing_rate(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let signs: Vec<f64> = values
        .iter()
        .map(|v| v - mean)
        .filter(|d| *d != 0.0)
        .map(f64::signum)
        .collect();
    let crossings = signs.windows(2).filter(|w| w[0] != w[1]).count();
    crossings as f64 / (values.len() - 1) as f64
}

/// Mean shift of a fresh profile against the retained history.
#[derive(Debug, Clone, PartialEq)]
pub struct Drift {
    pub previous_mean: f64,
    pub current_mean: f64,
}

/// Compare a fresh profile with earlier ones.
///
/// Drift is reported when the mean moves by more than `threshold` times the
/// historical span. A flat history uses the magnitude of its mean instead.
pub fn detect_drift(history: &[SignalProfile], latest: &SignalProfile, threshold: f64) -> Option<Drift> {
    let earlier: Vec<&SignalProfile> = history.iter().filter(|p| p.has_values()).collect();
    if earlier.len() < 2 || !latest.has_values() {
        return None;
    }
    let previous_mean = earlier.iter().map(|p| p.mean).sum::<f64>() / earlier.len() as f64;
    let low = earlier.iter().map(|p| p.min).fold(f64::INFINITY, f64::min);
    let high = earlier.iter().map(|p| p.max).fold(f64::NEG_INFINITY, f64::max);
    let scale = if high > low { high - low } else { previous_mean.abs().max(1.0) };

    let shift = (latest.mean - previous_mean).abs();
    (shift > threshold * scale).then(|| Drift {
        previous_mean,
        current_mean: latest.mean,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn series(values: &[Value]) -> Vec<Sample> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| Sample::new(i as i64 * 100, v.clone()))
            .collect()
    }

    #[test]
    fn test_numeric_value_coercion() {
        assert_eq!(numeric_value(&json!(4.5)), Some(4.5));
        assert_eq!(numeric_value(&json!(true)), Some(1.0));
        assert_eq!(numeric_value(&json!(" 12.5 ")), Some(12.5));
        assert_eq!(numeric_value(&json!("OFF")), Some(0.0));
        assert_eq!(numeric_value(&json!("n/a")), None);
        assert_eq!(numeric_value(&json!(null)), None);
        assert_eq!(numeric_value(&json!({"v": 1})), None);
    }

    #[test]
    fn test_smooth_ramp() {
        let samples = series(&[json!(400), json!(450), json!(500), json!(550), json!(600)]);
        let p = SignalProfiler::new().profile_samples("d", "hr:0", &samples);
        assert_eq!(p.sample_count, 5);
        assert_eq!(p.mean, 500.0);
        assert_eq!(p.min, 400.0);
        assert_eq!(p.max, 600.0);
        assert_eq!(p.variance, Some(5000.0));
        assert_eq!(p.noise_class, NoiseClass::Smooth);
        assert!((p.sample_rate - 10.0).abs() < 1e-9);
        assert!(!p.is_binary);
    }

    #[test]
    fn test_binary_and_constant() {
        let profiler = SignalProfiler::new();
        let binary = profiler.profile_samples("d", "c", &series(&[json!(0), json!(1), json!(1), json!(0)]));
        assert_eq!(binary.noise_class, NoiseClass::Binary);
        assert!(binary.is_binary);
        assert_eq!(binary.distinct_values, 2);

        let constant = profiler.profile_samples("d", "c", &series(&[json!(7), json!(7), json!(7)]));
        assert_eq!(constant.noise_class, NoiseClass::Constant);
        assert_eq!(constant.variance, Some(0.0));
    }

    #[test]
    fn test_noisy_signal() {
        let samples = series(&[json!(10), json!(13), json!(9), json!(12), json!(8), json!(13)]);
        let p = SignalProfiler::new().profile_samples("d", "c", &samples);
        assert_eq!(p.noise_class, NoiseClass::Noisy);
        assert!(p.zero_crossing_rate > 0.5);
    }

    #[test]
    fn test_single_sample_has_no_variance() {
        let p = SignalProfiler::new().profile_samples("d", "c", &series(&[json!(21.5)]));
        assert_eq!(p.sample_count, 1);
        assert_eq!(p.variance, None);
        assert_eq!(p.noise_class, NoiseClass::Insufficient);
        assert_eq!(p.mean, 21.5);
    }

    #[test]
    fn test_min_samples_gates_variance() {
        let samples = series(&[json!(400), json!(450), json!(500)]);
        let strict = SignalProfiler::new().with_min_samples(5).profile_samples("d", "c", &samples);
        assert_eq!(strict.variance, None);
        assert_eq!(strict.noise_class, NoiseClass::Insufficient);
        assert_eq!(strict.mean, 450.0);

        let floored = SignalProfiler::new().with_min_samples(0).profile_samples("d", "c", &series(&[json!(1)]));
        assert_eq!(floored.variance, None);
        assert!(SignalProfiler::new().with_min_samples(3).profile_samples("d", "c", &samples).variance.is_some());
    }

    #[test]
    fn test_malformed_samples_are_defects() {
        let samples = series(&[json!(20), json!("garbage"), json!(null), json!(22)]);
        let p = SignalProfiler::new().profile_samples("d", "c", &samples);
        assert_eq!(p.defects, 2);
        assert_eq!(p.sample_count, 2);
        assert_eq!(p.mean, 21.0);
    }

    #[test]
    fn test_empty_series() {
        let p = SignalProfiler::new().profile_samples("d", "c", &[]);
        assert!(!p.has_values());
        assert_eq!(p.variance, None);
    }

    #[test]
    fn test_drift_detection() {
        let profiler = SignalProfiler::new();
        let history: Vec<SignalProfile> = (0..3)
            .map(|_| profiler.profile_samples("d", "c", &series(&[json!(20), json!(22), json!(21)])))
            .collect();
        let steady = profiler.profile_samples("d", "c", &series(&[json!(21), json!(21.5)]));
        assert!(detect_drift(&history, &steady, 0.25).is_none());

        let shifted = profiler.profile_samples("d", "c", &series(&[json!(40), json!(41)]));
        let drift = detect_drift(&history, &shifted, 0.25).unwrap();
        assert!((drift.previous_mean - 21.0).abs() < 1e-9);
        assert_eq!(drift.current_mean, 40.5);

        assert!(detect_drift(&history[..1], &shifted, 0.25).is_none());
    }
}

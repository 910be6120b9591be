//! Sensor type classifier.
//!
//! Scores every vocabulary entry against a channel using four independent
//! factors and proposes the best one:
//!
//! | Factor  | Evidence                                           |
//! |---------|----------------------------------------------------|
//! | naming  | vocabulary keywords in labels, topics, browse names |
//! | range   | share of samples inside the type's value envelope  |
//! | prior   | what the protocol's data point kind suggests       |
//! | profile | how the noise class fits the type's signal kind    |
//!
//! A factor without evidence (no label, no samples) is left out and the
//! remaining weights are renormalized. Proposals below the confidence floor
//! become `unknown`. The classifier is stateless; hysteresis against the
//! stored classification is applied by the registry.

use std::cmp::Ordering;

use tracing::debug;

use fieldscan_core::config::ClassifierConfig;
use fieldscan_core::{
    now_millis, ChannelKind, ChannelRecord, Classification, DeviceRecord, Fault, FaultKind,
    NoiseClass, Protocol, SensorType, SensorTypeSpec, SignalKind, SignalProfile,
};

const TIE_EPSILON: f64 = 1e-9;

/// Score of one vocabulary entry for one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub sensor_type: SensorType,
    pub kind: SignalKind,
    pub confidence: f64,
    pub prior: f64,
    /// Length of the longest matching keyword
    pub specificity: usize,
    pub evidence: Vec<String>,
}

/// Naming hint tokens for a channel: its label, a non-synthetic channel
/// name, and the device's hierarchical name.
pub fn naming_tokens(device: &DeviceRecord, channel: &ChannelRecord) -> Vec<String> {
    let mut text = String::new();
    if let Some(label) = &channel.label {
        text.push_str(label);
        text.push(' ');
    }
    // Register names like `hr:0` are generated by the probe.
    let synthetic = matches!(
        channel.kind,
        ChannelKind::Coil | ChannelKind::DiscreteInput | ChannelKind::HoldingRegister | ChannelKind::InputRegister
    );
    if !synthetic && channel.label.as_deref() != Some(channel.name.as_str()) {
        text.push_str(&channel.name);
        text.push(' ');
    }
    match device.protocol {
        Protocol::Mqtt => text.push_str(&device.address),
        Protocol::OpcUa => {
            if let Some(path) = device.raw_attributes.get("browse_path") {
                text.push_str(path);
            }
        }
        _ => {}
    }
    tokenize(&text)
}

fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            // Split camelCase: `BoilerTemp` -> `boiler`, `temp`.
            if c.is_ascii_uppercase() && prev_lower && !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            prev_lower = c.is_ascii_lowercase();
            current.push(c.to_ascii_lowercase());
        } else {
            prev_lower = false;
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Whether `token` names `keyword`: an exact match, a long keyword used as
/// a prefix, or an instrument tag such as `TT101`.
fn keyword_matches(token: &str, keyword: &str) -> bool {
    if token == keyword {
        return true;
    }
    match token.strip_prefix(keyword) {
        Some(rest) => keyword.len() >= 4 || (!rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())),
        None => false,
    }
}

/// Protocol prior for a signal kind.
fn protocol_prior(channel: &ChannelRecord, spec: &SensorTypeSpec) -> (f64, String) {
    let kind = spec.kind;
    let (score, reason) = match channel.kind {
        ChannelKind::Coil | ChannelKind::DiscreteInput => {
            (if kind == SignalKind::Digital { 0.95 } else { 0.05 }, "bit point")
        }
        ChannelKind::HoldingRegister | ChannelKind::InputRegister => match kind {
            SignalKind::Analog => (0.6, "register"),
            _ => (0.4, "register"),
        },
        ChannelKind::Variable => {
            let boolean = channel
                .data_type
                .as_deref()
                .is_some_and(|t| t.eq_ignore_ascii_case("boolean"));
            match (boolean, kind) {
                (true, SignalKind::Digital) => (0.9, "boolean variable"),
                (true, _) => (0.1, "boolean variable"),
                (false, SignalKind::Analog) => (0.7, "numeric variable"),
                (false, SignalKind::Numeric) => (0.5, "numeric variable"),
                (false, SignalKind::Digital) => (0.3, "numeric variable"),
            }
        }
        ChannelKind::Topic => (0.5, "topic"),
        ChannelKind::HubPort => match channel.signal_hint.as_deref() {
            Some(hint) if hint.eq_ignore_ascii_case(&spec.name) => (0.9, "hardware hint"),
            _ => (0.1, "hardware hint"),
        },
    };
    (score, format!("prior: {} suggests {:?} ({:.2})", reason, kind, score))
}

/// How well a noise class fits a signal kind.
fn profile_fit(profile: &SignalProfile, kind: SignalKind) -> f64 {
    match (kind, profile.noise_class) {
        (SignalKind::Digital, NoiseClass::Binary) => 1.0,
        (SignalKind::Digital, NoiseClass::Constant | NoiseClass::Insufficient) => {
            if profile.is_binary {
                0.7
            } else {
                0.0
            }
        }
        (SignalKind::Digital, _) => 0.0,
        (SignalKind::Analog, NoiseClass::Smooth) => 1.0,
        (SignalKind::Analog, NoiseClass::Noisy) => 0.7,
        (SignalKind::Analog, NoiseClass::Constant | NoiseClass::Insufficient) => 0.5,
        (SignalKind::Analog, NoiseClass::Binary) => 0.1,
        (SignalKind::Numeric, NoiseClass::Smooth) => 0.6,
        (SignalKind::Numeric, NoiseClass::Constant | NoiseClass::Insufficient) => 0.4,
        (SignalKind::Numeric, NoiseClass::Noisy) => 0.3,
        (SignalKind::Numeric, NoiseClass::Binary) => 0.1,
    }
}

pub struct Classifier {
    vocabulary: Vec<SensorTypeSpec>,
    config: ClassifierConfig,
}

impl Classifier {
    pub fn new(vocabulary: Vec<SensorTypeSpec>, config: ClassifierConfig) -> Self {
        Self { vocabulary, config }
    }

    pub fn vocabulary(&self) -> &[SensorTypeSpec] {
        &self.vocabulary
    }

    pub fn spec(&self, sensor_type: &SensorType) -> Option<&SensorTypeSpec> {
        self.vocabulary.iter().find(|s| s.name == sensor_type.as_str())
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Score every vocabulary entry, best first.
    pub fn score(&self, device: &DeviceRecord, channel: &ChannelRecord, profile: &SignalProfile) -> Vec<Candidate> {
        let weights = &self.config.weights;
        let tokens = naming_tokens(device, channel);
        let sample_values: Vec<f64> = channel
            .samples
            .iter()
            .filter_map(|s| crate::profiler::numeric_value(&s.value))
            .collect();

        // Keyword hits are scored per type, but the naming factor has evidence
        // only when some type matched at all.
        let hits: Vec<Option<(String, String)>> = self
            .vocabulary
            .iter()
            .map(|spec| {
                let mut best: Option<(String, String)> = None;
                for token in &tokens {
                    for keyword in &spec.keywords {
                        if keyword_matches(token, keyword)
                            && best.as_ref().map_or(true, |(k, _)| keyword.len() > k.len())
                        {
                            best = Some((keyword.clone(), token.clone()));
                        }
                    }
                }
                best
            })
            .collect();
        let naming_evidence = hits.iter().any(Option::is_some);

        let mut candidates: Vec<Candidate> = self
            .vocabulary
            .iter()
            .zip(hits)
            .map(|(spec, hit)| {
                let mut total = 0.0;
                let mut weight = 0.0;
                let mut evidence = Vec::new();

                if naming_evidence {
                    weight += weights.naming;
                    if let Some((keyword, token)) = &hit {
                        total += weights.naming;
                        evidence.push(format!("naming: keyword '{}' in '{}'", keyword, token));
                    }
                }

                if !sample_values.is_empty() {
                    let inside = sample_values.iter().filter(|v| spec.contains(**v)).count();
                    let fit = inside as f64 / sample_values.len() as f64;
                    weight += weights.range;
                    total += weights.range * fit;
                    evidence.push(format!(
                        "range: {}/{} samples within [{}, {}]",
                        inside,
                        sample_values.len(),
                        spec.envelope_min,
                        spec.envelope_max
                    ));
                }

                let (prior, prior_evidence) = protocol_prior(channel, spec);
                weight += weights.prior;
                total += weights.prior * prior;
                evidence.push(prior_evidence);

                if profile.has_values() {
                    let fit = profile_fit(profile, spec.kind);
                    weight += weights.profile;
                    total += weights.profile * fit;
                    evidence.push(format!(
                        "profile: {:?} signal fits {:?} ({:.2})",
                        profile.noise_class, spec.kind, fit
                    ));
                }

                Candidate {
                    sensor_type: spec.sensor_type(),
                    kind: spec.kind,
                    confidence: if weight > 0.0 { total / weight } else { 0.0 },
                    prior,
                    specificity: hit.map(|(k, _)| k.len()).unwrap_or(0),
                    evidence,
                }
            })
            .collect();

        candidates.sort_by(compare_candidates);
        candidates
    }

    /// Propose a classification for one channel.
    ///
    /// Returns an `InsufficientEvidence` fault alongside an `unknown`
    /// proposal when no type clears the confidence floor.
    pub fn classify(
        &self,
        device: &DeviceRecord,
        channel: &ChannelRecord,
        profile: &SignalProfile,
    ) -> (Classification, Option<Fault>) {
        let candidates = self.score(device, channel, profile);
        let now = now_millis();
        let mut classification = Classification {
            device_id: device.id.clone(),
            channel: channel.name.clone(),
            sensor_type: SensorType::unknown(),
            signal_kind: None,
            confidence: 0.0,
            evidence: Vec::new(),
            classified_at: now,
        };

        let Some(best) = candidates.into_iter().next() else {
            classification.evidence.push("no sensor types configured".to_string());
            let fault = Fault::new(FaultKind::InsufficientEvidence, "classifier", "empty vocabulary")
                .with_device(&device.id);
            return (classification, Some(fault));
        };

        classification.confidence = best.confidence;
        if best.confidence >= self.config.confidence_floor {
            debug!(
                category = "classifier",
                device = %device.id,
                channel = %channel.name,
                sensor_type = %best.sensor_type,
                confidence = best.confidence,
                "Channel classified"
            );
            classification.sensor_type = best.sensor_type;
            classification.signal_kind = Some(best.kind);
            classification.evidence = best.evidence;
            return (classification, None);
        }

        let message = format!(
            "best candidate {} at {:.2} is below floor {:.2}",
            best.sensor_type, best.confidence, self.config.confidence_floor
        );
        classification.evidence = best.evidence;
        classification.evidence.push(message.clone());
        let fault = Fault::new(FaultKind::InsufficientEvidence, "classifier", format!("{}#{}: {}", device.id, channel.name, message))
            .with_device(&device.id);
        (classification, Some(fault))
    }
}

/// Higher confidence first, then the stronger protocol prior, then the more
/// specific keyword, then the type name.
fn compare_candidates(a: &Candidate, b: &Candidate) -> Ordering {
    if (a.confidence - b.confidence).abs() > TIE_EPSILON {
        return b.confidence.total_cmp(&a.confidence);
    }
    b.prior
        .total_cmp(&a.prior)
        .then_with(|| b.specificity.cmp(&a.specificity))
        .then_with(|| a.sensor_type.cmp(&b.sensor_type))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiler::SignalProfiler;
    use fieldscan_core::builtin_vocabulary;
    use fieldscan_core::Sample;

    fn classifier() -> Classifier {
        Classifier::new(builtin_vocabulary(), ClassifierConfig::default())
    }

    fn register(values: &[u16], label: Option<&str>) -> (DeviceRecord, ChannelRecord) {
        let samples = values
            .iter()
            .enumerate()
            .map(|(i, v)| Sample::new(i as i64 * 100, *v))
            .collect();
        let mut channel = ChannelRecord::new("hr:0", ChannelKind::HoldingRegister).with_samples(samples);
        if let Some(label) = label {
            channel = channel.with_label(label);
        }
        let device = DeviceRecord::new("modbus:sim/2", Protocol::Modbus, "sim/2", "mb").with_channel(channel.clone());
        (device, channel)
    }

    fn run(device: &DeviceRecord, channel: &ChannelRecord) -> (Classification, Option<Fault>) {
        let profile = SignalProfiler::new().profile(&device.id, channel);
        classifier().classify(device, channel, &profile)
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("BoilerTemp TT-101"), vec!["boiler", "temp", "tt", "101"]);
        assert_eq!(tokenize("plant/line1/PT101"), vec!["plant", "line1", "pt101"]);
    }

    #[test]
    fn test_keyword_matching() {
        assert!(keyword_matches("temp", "temp"));
        assert!(keyword_matches("temperature", "temp"));
        assert!(keyword_matches("tt101", "tt"));
        assert!(!keyword_matches("ttx", "tt"));
        assert!(!keyword_matches("runner", "run"));
    }

    #[test]
    fn test_binary_register_is_status() {
        let (device, channel) = register(&[0, 0, 1, 0, 1], None);
        let (c, fault) = run(&device, &channel);
        assert!(fault.is_none());
        assert_eq!(c.sensor_type.as_str(), "status");
        assert_eq!(c.signal_kind, Some(SignalKind::Digital));
        assert!(c.confidence >= 0.8, "confidence {}", c.confidence);
    }

    #[test]
    fn test_labelled_register_is_temperature() {
        let (device, channel) = register(&[400, 450, 500, 550, 600], Some("TEMP"));
        let (c, _) = run(&device, &channel);
        assert_eq!(c.sensor_type.as_str(), "temperature");
        assert!((c.confidence - 0.94).abs() < 1e-6, "confidence {}", c.confidence);
        assert!(c.evidence.iter().any(|e| e.contains("keyword 'temp'")));
    }

    #[test]
    fn test_below_floor_is_unknown() {
        let config = ClassifierConfig {
            confidence_floor: 0.95,
            ..Default::default()
        };
        let classifier = Classifier::new(builtin_vocabulary(), config);
        let (device, channel) = register(&[400, 450, 500], None);
        let profile = SignalProfiler::new().profile(&device.id, &channel);
        let (c, fault) = classifier.classify(&device, &channel, &profile);
        assert!(c.is_unknown());
        assert!(c.signal_kind.is_none());
        assert_eq!(fault.unwrap().kind, FaultKind::InsufficientEvidence);
        assert!(c.evidence.last().unwrap().contains("below floor"));
    }

    #[test]
    fn test_out_of_envelope_lowers_confidence() {
        let (device, channel) = register(&[2000, 2100, 2200], Some("TEMP"));
        let in_range = {
            let (d, ch) = register(&[20, 21, 22], Some("TEMP"));
            run(&d, &ch).0.confidence
        };
        let (c, _) = run(&device, &channel);
        assert!(c.confidence < in_range);
    }

    #[test]
    fn test_hub_port_hint_without_samples() {
        let channel = ChannelRecord::new("signal", ChannelKind::HubPort).with_signal_hint("pressure");
        let device = DeviceRecord::new("usb:1-1.2", Protocol::Usb, "1-1.2", "hub").with_channel(channel.clone());
        let (c, _) = run(&device, &channel);
        assert_eq!(c.sensor_type.as_str(), "pressure");
        assert!((c.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_mqtt_topic_naming() {
        let channel = ChannelRecord::new("value", ChannelKind::Topic)
            .with_label("humidity")
            .with_samples(vec![Sample::new(0, 45.0), Sample::new(1000, 46.0)]);
        let device = DeviceRecord::new("mqtt:b/plant/room/humidity", Protocol::Mqtt, "plant/room/humidity", "mq")
            .with_channel(channel.clone());
        let (c, _) = run(&device, &channel);
        assert_eq!(c.sensor_type.as_str(), "humidity");
    }

    #[test]
    fn test_ties_break_on_prior_then_name() {
        let a = Candidate {
            sensor_type: SensorType::new("b"),
            kind: SignalKind::Analog,
            confidence: 0.7,
            prior: 0.6,
            specificity: 0,
            evidence: vec![],
        };
        let mut b = a.clone();
        b.sensor_type = SensorType::new("a");
        b.prior = 0.4;
        let mut c = a.clone();
        c.sensor_type = SensorType::new("a");
        let mut list = vec![b.clone(), a.clone(), c.clone()];
        list.sort_by(compare_candidates);
        assert_eq!(list, vec![c, a, b]);
    }
}

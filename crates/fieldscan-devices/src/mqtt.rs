//! MQTT topic sniffer.
//!
//! Subscribes to a wildcard filter for a bounded window. Every topic seen is a
//! virtual device; JSON object payloads contribute one channel per scalar
//! field, anything else a single `value` channel.
//!
//! Each channel keeps a bounded tail of samples. Topics are pushed to the scan
//! sink when a topic or channel first appears, then at most once per flush
//! interval, and a last time when the window ends or the scan is dropped.

use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::Value;
use tracing::{debug, info, warn};

use fieldscan_core::config::MqttProbeConfig;
use fieldscan_core::{now_millis, ChannelKind, ChannelRecord, DeviceRecord, Protocol, Sample};

use crate::error::{ProbeError, ProbeResult};
use crate::probe::ScanSink;

/// A message observed on the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: i64,
}

impl TopicMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: now_millis(),
        }
    }
}

pub type MessageStream = Pin<Box<dyn Stream<Item = TopicMessage> + Send>>;

/// Source of broker messages for one sniff window.
#[async_trait]
pub trait TopicFeed: Send + Sync {
    async fn open(&self, filter: &str) -> ProbeResult<MessageStream>;

    fn broker(&self) -> String;
}

/// Live broker connection through rumqttc.
pub struct BrokerFeed {
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
    connect_timeout: Duration,
}

impl BrokerFeed {
    pub fn new(config: &MqttProbeConfig) -> Self {
        let credentials = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            (Some(user), None) => Some((user.clone(), String::new())),
            _ => None,
        };
        Self {
            host: config.host.clone(),
            port: config.port,
            credentials,
            connect_timeout: Duration::from_millis(config.timeout_ms.min(5_000)),
        }
    }
}

#[async_trait]
impl TopicFeed for BrokerFeed {
    async fn open(&self, filter: &str) -> ProbeResult<MessageStream> {
        let client_id = format!("fieldscan-{}", uuid::Uuid::new_v4().simple());
        let mut options = MqttOptions::new(client_id, &self.host, self.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);
        if let Some((user, pass)) = &self.credentials {
            options.set_credentials(user, pass);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);

        // Wait for CONNACK so an unreachable broker fails the probe instead of
        // looking like a quiet one.
        let connected = tokio::time::timeout(self.connect_timeout, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(_) => continue,
                    Err(e) => return Err(ProbeError::Unavailable(e.to_string())),
                }
            }
        })
        .await;
        match connected {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(ProbeError::Unavailable(format!(
                    "{}:{}: no CONNACK within {} ms",
                    self.host,
                    self.port,
                    self.connect_timeout.as_millis()
                )))
            }
        }

        client
            .subscribe(filter, QoS::AtMostOnce)
            .await
            .map_err(|e| ProbeError::Protocol(e.to_string()))?;
        debug!(category = "mqtt", broker = %self.broker(), filter, "Subscribed");

        let stream = async_stream::stream! {
            // Dropping the client ends the session with the stream.
            let _client = client;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        yield TopicMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                            received_at: now_millis(),
                        };
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(category = "mqtt", error = %e, "Broker connection lost");
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    fn broker(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Replays a fixed list of messages, for offline runs and tests.
pub struct ReplayFeed {
    broker: String,
    messages: Vec<TopicMessage>,
}

impl ReplayFeed {
    pub fn new(broker: impl Into<String>, messages: Vec<TopicMessage>) -> Self {
        Self {
            broker: broker.into(),
            messages,
        }
    }
}

#[async_trait]
impl TopicFeed for ReplayFeed {
    async fn open(&self, filter: &str) -> ProbeResult<MessageStream> {
        let filter = filter.to_string();
        let messages: Vec<TopicMessage> = self
            .messages
            .iter()
            .filter(|m| topic_matches(&filter, &m.topic))
            .cloned()
            .collect();
        Ok(Box::pin(futures::stream::iter(messages)))
    }

    fn broker(&self) -> String {
        self.broker.clone()
    }
}

/// MQTT topic filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(a), Some(b)) if a == b => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Scalar fields of a payload: `(channel, label, value)`.
fn payload_fields(topic: &str, payload: &[u8]) -> Vec<(String, String, Value)> {
    let leaf = topic.rsplit('/').next().unwrap_or(topic).to_string();
    let text = String::from_utf8_lossy(payload);
    match serde_json::from_str::<Value>(text.trim()) {
        Ok(Value::Object(map)) => map
            .into_iter()
            .filter(|(_, v)| matches!(v, Value::Number(_) | Value::Bool(_) | Value::String(_)))
            .map(|(k, v)| (k.clone(), format!("{} {}", leaf, k), v))
            .collect(),
        Ok(Value::Array(_)) | Ok(Value::Null) => vec![("value".to_string(), leaf, Value::Null)],
        Ok(scalar) => vec![("value".to_string(), leaf, scalar)],
        // Not JSON: keep the raw text, the profiler decides whether it is usable.
        Err(_) => vec![("value".to_string(), leaf, Value::String(text.trim().to_string()))],
    }
}

#[derive(Default)]
struct TopicState {
    first_seen: i64,
    channels: BTreeMap<String, (String, VecDeque<Sample>)>,
    /// Samples arrived since the last push to the sink
    dirty: bool,
}

/// Topics seen in one sniff window. Dropping it pushes pending updates, so a
/// scan cut off by its timeout still reports every sample it kept.
struct Sniff<'a> {
    probe: &'a MqttProbe,
    sink: &'a ScanSink,
    topics: BTreeMap<String, TopicState>,
}

impl Sniff<'_> {
    /// Record one message. Returns true when it opened a new topic or channel.
    fn observe(&mut self, message: &TopicMessage) -> bool {
        let probe = self.probe;
        let config = &probe.config;
        if !self.topics.contains_key(&message.topic) && self.topics.len() >= config.max_topics {
            return false;
        }
        let mut opened = false;
        let state = self.topics.entry(message.topic.clone()).or_insert_with(|| {
            opened = true;
            TopicState {
                first_seen: message.received_at,
                ..Default::default()
            }
        });
        for (channel, label, value) in payload_fields(&message.topic, &message.payload) {
            let (_, samples) = state.channels.entry(channel).or_insert_with(|| {
                opened = true;
                (label, VecDeque::new())
            });
            if samples.len() >= config.max_samples_per_channel {
                samples.pop_front();
            }
            samples.push_back(Sample::new(message.received_at, value));
        }
        state.dirty = true;
        if opened {
            self.push(&message.topic);
        }
        opened
    }

    fn push(&mut self, topic: &str) {
        if let Some(state) = self.topics.get_mut(topic) {
            state.dirty = false;
            self.sink.upsert(self.probe.record(topic, state));
        }
    }

    /// Push every topic updated since its last push.
    fn flush(&mut self) -> usize {
        let mut flushed = 0;
        for (topic, state) in self.topics.iter_mut().filter(|(_, s)| s.dirty) {
            state.dirty = false;
            self.sink.upsert(self.probe.record(topic, state));
            flushed += 1;
        }
        flushed
    }
}

impl Drop for Sniff<'_> {
    fn drop(&mut self) {
        let flushed = self.flush();
        if flushed > 0 {
            debug!(category = "mqtt", probe = %self.probe.config.name, topics = flushed, "Final flush");
        }
    }
}

pub struct MqttProbe {
    config: MqttProbeConfig,
    feed: Arc<dyn TopicFeed>,
}

impl MqttProbe {
    pub fn new(config: MqttProbeConfig, feed: Arc<dyn TopicFeed>) -> Self {
        Self { config, feed }
    }

    pub fn connect(config: MqttProbeConfig) -> Self {
        let feed = BrokerFeed::new(&config);
        Self::new(config, Arc::new(feed))
    }

    pub fn config(&self) -> &MqttProbeConfig {
        &self.config
    }

    pub fn device_id(&self, topic: &str) -> String {
        format!("mqtt:{}/{}", self.feed.broker(), topic)
    }

    fn record(&self, topic: &str, state: &TopicState) -> DeviceRecord {
        let mut record = DeviceRecord::new(self.device_id(topic), Protocol::Mqtt, topic, &self.config.name)
            .with_attribute("broker", self.feed.broker())
            .with_attribute("topic", topic);
        record.discovered_at = state.first_seen;
        for (name, (label, samples)) in &state.channels {
            record = record.with_channel(
                ChannelRecord::new(name.clone(), ChannelKind::Topic)
                    .with_label(label.clone())
                    .with_samples(samples.iter().cloned().collect()),
            );
        }
        record
    }

    pub(crate) async fn enumerate(&self, sink: &ScanSink) -> ProbeResult<()> {
        let mut stream = self.feed.open(&self.config.filter).await?;
        let flush_every = Duration::from_millis(self.config.flush_interval_ms);
        let deadline = tokio::time::Instant::now() + Duration::from_millis(self.config.window_ms);
        let mut next_flush = tokio::time::Instant::now() + flush_every;
        let mut sniff = Sniff {
            probe: self,
            sink,
            topics: BTreeMap::new(),
        };

        loop {
            let message = match tokio::time::timeout_at(deadline, stream.next()).await {
                Ok(Some(message)) => message,
                Ok(None) | Err(_) => break,
            };
            sniff.observe(&message);
            if tokio::time::Instant::now() >= next_flush {
                sniff.flush();
                next_flush = tokio::time::Instant::now() + flush_every;
            }
        }

        info!(
            category = "mqtt",
            probe = %self.config.name,
            topics = sniff.topics.len(),
            "Sniff window closed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MqttProbeConfig {
        MqttProbeConfig {
            name: "mq".to_string(),
            host: "broker".to_string(),
            port: 1883,
            username: None,
            password: None,
            filter: "plant/#".to_string(),
            window_ms: 200,
            max_topics: 10,
            max_samples_per_channel: 256,
            flush_interval_ms: 1_000,
            location: None,
            timeout_ms: 1_000,
        }
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("#", "a/b"));
        assert!(topic_matches("plant/+/temp", "plant/line1/temp"));
        assert!(!topic_matches("plant/+/temp", "plant/line1/hum"));
        assert!(topic_matches("plant/#", "plant/line1/temp"));
        assert!(!topic_matches("plant/a", "plant/a/b"));
    }

    #[test]
    fn test_payload_fields() {
        let fields = payload_fields("plant/boiler/env", br#"{"temp": 21.5, "ok": true, "meta": {"x": 1}}"#);
        let names: Vec<&str> = fields.iter().map(|f| f.0.as_str()).collect();
        assert_eq!(names, vec!["ok", "temp"]);
        assert_eq!(fields[1].1, "env temp");

        let scalar = payload_fields("plant/boiler/pressure", b"4.2");
        assert_eq!(scalar[0].0, "value");
        assert_eq!(scalar[0].1, "pressure");
        assert_eq!(scalar[0].2, serde_json::json!(4.2));

        let text = payload_fields("plant/door", b"OPEN");
        assert_eq!(text[0].2, serde_json::json!("OPEN"));
    }

    #[tokio::test]
    async fn test_sniff_builds_virtual_devices() {
        let feed = ReplayFeed::new(
            "broker:1883",
            vec![
                TopicMessage::new("plant/boiler/temperature", "80.1"),
                TopicMessage::new("plant/boiler/temperature", "80.4"),
                TopicMessage::new("plant/pump/state", r#"{"running": 1, "rpm": 1450}"#),
                TopicMessage::new("other/ignored", "1"),
            ],
        );
        let probe = MqttProbe::new(config(), Arc::new(feed));
        let sink = ScanSink::new();
        probe.enumerate(&sink).await.unwrap();
        let (records, _) = sink.drain();
        assert_eq!(records.len(), 2);
        let temp = records
            .iter()
            .find(|r| r.id == "mqtt:broker:1883/plant/boiler/temperature")
            .unwrap();
        assert_eq!(temp.channel("value").unwrap().samples.len(), 2);
        let pump = records.iter().find(|r| r.address == "plant/pump/state").unwrap();
        assert_eq!(pump.channels.len(), 2);
    }

    #[tokio::test]
    async fn test_samples_capped_per_channel() {
        let mut cfg = config();
        cfg.max_samples_per_channel = 16;
        let messages = (0..1_000)
            .map(|i| TopicMessage::new("plant/boiler/temperature", i.to_string()))
            .collect();
        let probe = MqttProbe::new(cfg, Arc::new(ReplayFeed::new("broker:1883", messages)));
        let sink = ScanSink::new();
        probe.enumerate(&sink).await.unwrap();
        let (records, _) = sink.drain();
        let samples = &records[0].channel("value").unwrap().samples;
        assert_eq!(samples.len(), 16);
        assert_eq!(samples[0].value, serde_json::json!(984));
        assert_eq!(samples[15].value, serde_json::json!(999));
    }

    #[test]
    fn test_sink_updated_on_first_sight_then_on_flush() {
        let probe = MqttProbe::new(config(), Arc::new(ReplayFeed::new("broker:1883", Vec::new())));
        let sink = ScanSink::new();
        let samples_in_sink = |sink: &ScanSink, channel: &str| {
            let (records, _) = sink.drain();
            let count = records[0].channel(channel).map(|c| c.samples.len());
            for r in records {
                sink.upsert(r);
            }
            count
        };

        let mut sniff = Sniff {
            probe: &probe,
            sink: &sink,
            topics: BTreeMap::new(),
        };
        assert!(sniff.observe(&TopicMessage::new("plant/pump", r#"{"rpm": 1450}"#)));
        assert!(!sniff.observe(&TopicMessage::new("plant/pump", r#"{"rpm": 1460}"#)));
        assert_eq!(samples_in_sink(&sink, "rpm"), Some(1));

        // A new channel on a known topic is pushed right away.
        assert!(sniff.observe(&TopicMessage::new("plant/pump", r#"{"rpm": 1470, "amps": 3.1}"#)));
        assert_eq!(samples_in_sink(&sink, "rpm"), Some(3));

        assert!(!sniff.observe(&TopicMessage::new("plant/pump", r#"{"rpm": 1480}"#)));
        assert_eq!(sniff.flush(), 1);
        assert_eq!(sniff.flush(), 0);
        assert_eq!(samples_in_sink(&sink, "rpm"), Some(4));

        assert!(!sniff.observe(&TopicMessage::new("plant/pump", r#"{"rpm": 1490}"#)));
        drop(sniff);
        assert_eq!(samples_in_sink(&sink, "rpm"), Some(5));
        assert_eq!(samples_in_sink(&sink, "amps"), Some(1));
    }

    #[tokio::test]
    async fn test_max_topics_cap() {
        let mut cfg = config();
        cfg.max_topics = 1;
        let feed = ReplayFeed::new(
            "broker:1883",
            vec![TopicMessage::new("plant/a", "1"), TopicMessage::new("plant/b", "2")],
        );
        let probe = MqttProbe::new(cfg, Arc::new(feed));
        let sink = ScanSink::new();
        probe.enumerate(&sink).await.unwrap();
        assert_eq!(sink.len(), 1);
    }
}

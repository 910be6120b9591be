//! OPC-UA address-space browser.
//!
//! The probe walks the node tree from a root node down to a depth limit.
//! Every object that owns variables becomes a device and its variables become
//! channels. Session handling lives behind [`NodeBrowser`]; the bundled
//! [`NodesetBrowser`] serves an exported address space from a JSON file.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use fieldscan_core::config::OpcUaProbeConfig;
use fieldscan_core::{now_millis, ChannelKind, ChannelRecord, DeviceRecord, Protocol, Sample};

use crate::error::{ProbeError, ProbeResult};
use crate::probe::{ChannelSamples, ScanSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeClass {
    Object,
    Variable,
}

/// Reference returned by a browse call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRef {
    pub node_id: String,
    pub browse_name: String,
    pub node_class: NodeClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
}

/// Browse and read services of an OPC-UA session.
#[async_trait]
pub trait NodeBrowser: Send + Sync {
    /// Forward hierarchical references of `node_id`.
    async fn browse(&self, node_id: &str) -> ProbeResult<Vec<NodeRef>>;

    /// Current value attribute of a variable.
    async fn read_value(&self, node_id: &str) -> ProbeResult<serde_json::Value>;
}

/// One node of an exported address space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodesetNode {
    pub node_id: String,
    pub browse_name: String,
    pub node_class: NodeClass,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub data_type: Option<String>,
    /// Values returned by successive reads, cycling.
    #[serde(default)]
    pub values: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Nodeset {
    pub nodes: Vec<NodesetNode>,
}

/// [`NodeBrowser`] over an in-memory nodeset.
pub struct NodesetBrowser {
    nodes: HashMap<String, NodesetNode>,
    children: HashMap<String, Vec<String>>,
    cursors: Mutex<HashMap<String, usize>>,
}

impl NodesetBrowser {
    pub fn new(nodeset: Nodeset) -> Self {
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for node in &nodeset.nodes {
            if let Some(parent) = &node.parent {
                children.entry(parent.clone()).or_default().push(node.node_id.clone());
            }
        }
        Self {
            nodes: nodeset
                .nodes
                .into_iter()
                .map(|n| (n.node_id.clone(), n))
                .collect(),
            children,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn load(path: &Path) -> ProbeResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProbeError::InvalidConfig(format!("nodeset {}: {}", path.display(), e)))?;
        let nodeset: Nodeset = serde_json::from_str(&content)
            .map_err(|e| ProbeError::InvalidConfig(format!("nodeset {}: {}", path.display(), e)))?;
        Ok(Self::new(nodeset))
    }
}

#[async_trait]
impl NodeBrowser for NodesetBrowser {
    async fn browse(&self, node_id: &str) -> ProbeResult<Vec<NodeRef>> {
        let child_ids = match self.children.get(node_id) {
            Some(ids) => ids,
            None if self.nodes.contains_key(node_id) => return Ok(Vec::new()),
            None => return Err(ProbeError::Protocol(format!("BadNodeIdUnknown: {}", node_id))),
        };
        Ok(child_ids
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .map(|n| NodeRef {
                node_id: n.node_id.clone(),
                browse_name: n.browse_name.clone(),
                node_class: n.node_class,
                data_type: n.data_type.clone(),
            })
            .collect())
    }

    async fn read_value(&self, node_id: &str) -> ProbeResult<serde_json::Value> {
        let node = self
            .nodes
            .get(node_id)
            .ok_or_else(|| ProbeError::Protocol(format!("BadNodeIdUnknown: {}", node_id)))?;
        if node.values.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(node_id.to_string()).or_insert(0);
        let value = node.values[*cursor % node.values.len()].clone();
        *cursor += 1;
        Ok(value)
    }
}

/// Object that owns variables, found during the walk.
struct FoundObject {
    node_id: String,
    path: Vec<String>,
    variables: Vec<NodeRef>,
}

pub struct OpcUaProbe {
    config: OpcUaProbeConfig,
    browser: Arc<dyn NodeBrowser>,
}

impl OpcUaProbe {
    pub fn new(config: OpcUaProbeConfig, browser: Arc<dyn NodeBrowser>) -> Self {
        Self { config, browser }
    }

    pub fn from_config(config: OpcUaProbeConfig) -> ProbeResult<Self> {
        let nodeset = config.nodeset.clone().ok_or_else(|| {
            ProbeError::InvalidConfig(format!(
                "probe '{}': no nodeset configured for {}",
                config.name, config.endpoint
            ))
        })?;
        let browser = NodesetBrowser::load(&nodeset)?;
        Ok(Self::new(config, Arc::new(browser)))
    }

    pub fn config(&self) -> &OpcUaProbeConfig {
        &self.config
    }

    pub fn device_id(&self, node_id: &str) -> String {
        format!("opcua:{}/{}", self.config.endpoint, node_id)
    }

    /// Depth-first walk from the root, bounded by `max_depth`.
    async fn walk(&self, sink: &ScanSink) -> ProbeResult<Vec<FoundObject>> {
        let root_children = self
            .browser
            .browse(&self.config.root_node)
            .await
            .map_err(|e| ProbeError::Unavailable(format!("{}: {}", self.config.endpoint, e)))?;

        let mut found = Vec::new();
        let mut stack: Vec<(String, Vec<String>, Vec<NodeRef>, usize)> =
            vec![(self.config.root_node.clone(), Vec::new(), root_children, 1)];

        while let Some((node_id, path, children, depth)) = stack.pop() {
            let variables: Vec<NodeRef> = children
                .iter()
                .filter(|c| c.node_class == NodeClass::Variable)
                .cloned()
                .collect();
            if !variables.is_empty() {
                found.push(FoundObject {
                    node_id: node_id.clone(),
                    path: path.clone(),
                    variables,
                });
            }
            if depth >= self.config.max_depth {
                continue;
            }
            for child in children.iter().filter(|c| c.node_class == NodeClass::Object).rev() {
                match self.browser.browse(&child.node_id).await {
                    Ok(grandchildren) => {
                        let mut child_path = path.clone();
                        child_path.push(child.browse_name.clone());
                        stack.push((child.node_id.clone(), child_path, grandchildren, depth + 1));
                    }
                    Err(e) => {
                        debug!(category = "opcua", node = %child.node_id, error = %e, "Browse failed");
                        sink.fault(e.to_fault(&self.config.name).with_device(self.device_id(&child.node_id)));
                    }
                }
            }
        }
        Ok(found)
    }

    pub(crate) async fn enumerate(&self, sink: &ScanSink) -> ProbeResult<()> {
        let objects = self.walk(sink).await?;
        for object in objects {
            let mut series: BTreeMap<String, Vec<Sample>> = BTreeMap::new();
            let mut latency: BTreeMap<String, f64> = BTreeMap::new();
            for round in 0..self.config.samples_per_scan.max(1) {
                for var in &object.variables {
                    let started = Instant::now();
                    match self.browser.read_value(&var.node_id).await {
                        Ok(value) => {
                            if round == 0 {
                                latency.insert(var.node_id.clone(), started.elapsed().as_secs_f64() * 1000.0);
                            }
                            series
                                .entry(var.node_id.clone())
                                .or_default()
                                .push(Sample::new(now_millis(), value));
                        }
                        Err(e) => {
                            sink.fault(e.to_fault(&self.config.name).with_device(self.device_id(&object.node_id)));
                        }
                    }
                }
            }

            let browse_path = object.path.join("/");
            let mut record = DeviceRecord::new(
                self.device_id(&object.node_id),
                Protocol::OpcUa,
                format!("{}/{}", self.config.endpoint, object.node_id),
                &self.config.name,
            )
            .with_attribute("endpoint", self.config.endpoint.clone())
            .with_attribute("node_id", object.node_id.clone());
            if !browse_path.is_empty() {
                record = record.with_attribute("browse_path", browse_path);
            }

            let mut seen = std::collections::HashSet::new();
            for var in object.variables {
                // Browse names are not unique; fall back to the node id.
                let name = if seen.insert(var.browse_name.clone()) {
                    var.browse_name.clone()
                } else {
                    var.node_id.clone()
                };
                let mut channel = ChannelRecord::new(name, ChannelKind::Variable)
                    .with_label(var.browse_name.clone())
                    .with_samples(series.remove(&var.node_id).unwrap_or_default());
                if let Some(dt) = &var.data_type {
                    channel = channel.with_data_type(dt.clone());
                }
                if let Some(ms) = latency.get(&var.node_id) {
                    channel = channel.with_latency(*ms);
                }
                record = record.with_channel(channel);
            }

            info!(
                category = "opcua",
                probe = %self.config.name,
                device = %record.id,
                channels = record.channels.len(),
                "OPC-UA object found"
            );
            sink.upsert(record);
        }
        Ok(())
    }

    pub(crate) async fn sample(&self, device_id: &str, duration: Duration) -> ProbeResult<ChannelSamples> {
        let prefix = format!("opcua:{}/", self.config.endpoint);
        let node_id = device_id
            .strip_prefix(&prefix)
            .ok_or_else(|| ProbeError::NotFound(device_id.to_string()))?;
        let variables: Vec<NodeRef> = self
            .browser
            .browse(node_id)
            .await?
            .into_iter()
            .filter(|c| c.node_class == NodeClass::Variable)
            .collect();
        if variables.is_empty() {
            return Err(ProbeError::NotFound(device_id.to_string()));
        }

        let deadline = Instant::now() + duration;
        let mut out: ChannelSamples = BTreeMap::new();
        loop {
            for var in &variables {
                let value = self.browser.read_value(&var.node_id).await?;
                out.entry(var.browse_name.clone())
                    .or_default()
                    .push(Sample::new(now_millis(), value));
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100).min(duration)).await;
        }
        Ok(out)
    }
}

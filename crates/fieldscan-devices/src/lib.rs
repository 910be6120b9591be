//! Protocol probes for fieldscan.
//!
//! Each probe discovers devices and channels over one protocol family:
//! - USB hub enumeration (sysfs)
//! - Modbus TCP register scanning
//! - OPC-UA address-space browsing
//! - MQTT topic sniffing
//! - TCP service scanning across a subnet

pub mod error;
pub mod modbus;
pub mod mqtt;
pub mod network;
pub mod opcua;
pub mod probe;
pub mod usb;

pub use error::{ProbeError, ProbeResult};
pub use modbus::{ModbusProbe, ModbusTransport, SimulatedTransport, SimulatedUnit, TcpTransport};
pub use mqtt::{BrokerFeed, MqttProbe, ReplayFeed, TopicFeed, TopicMessage};
pub use network::{parse_ip_range, NetworkProbe};
pub use opcua::{NodeBrowser, NodeClass, NodeRef, Nodeset, NodesetBrowser, OpcUaProbe};
pub use probe::{ChannelSamples, ProbeCapabilities, ProtocolProbe, ScanOutcome, ScanSink};
pub use usb::UsbProbe;

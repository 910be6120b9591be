//! Modbus transports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use fieldscan_core::config::{RegisterTable, MODBUS_ADDRESS_SPACE};

use super::codec::{self, MbapHeader, MBAP_HEADER_LEN};
use crate::error::{ProbeError, ProbeResult};

/// Register access used by the Modbus probe.
///
/// A unit that does not answer yields `ProbeError::Timeout`; an unreachable
/// endpoint yields `ProbeError::Unavailable`.
#[async_trait]
pub trait ModbusTransport: Send + Sync {
    async fn read(&self, unit: u8, table: RegisterTable, start: u16, count: u16) -> ProbeResult<Vec<u16>>;

    /// Human-readable endpoint for record addresses.
    fn endpoint(&self) -> String;
}

/// Modbus TCP client over a single persistent connection.
pub struct TcpTransport {
    host: String,
    port: u16,
    request_timeout: Duration,
    conn: tokio::sync::Mutex<Option<TcpStream>>,
    transaction_id: AtomicU16,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, port: u16, request_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            request_timeout,
            conn: tokio::sync::Mutex::new(None),
            transaction_id: AtomicU16::new(1),
        }
    }

    async fn connect(&self) -> ProbeResult<TcpStream> {
        let addr = format!("{}:{}", self.host, self.port);
        match tokio::time::timeout(self.request_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                // Small request/response frames.
                let _ = stream.set_nodelay(true);
                debug!(category = "modbus", endpoint = %addr, "Connected");
                Ok(stream)
            }
            Ok(Err(e)) => Err(ProbeError::Unavailable(format!("{}: {}", addr, e))),
            Err(_) => Err(ProbeError::Unavailable(format!("{}: connect timed out", addr))),
        }
    }

    /// Send one ADU and return the response PDU.
    async fn transact(&self, unit: u8, adu: Vec<u8>, transaction_id: u16) -> ProbeResult<Vec<u8>> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(ProbeError::Unavailable("no connection".to_string()));
        };

        let exchange = exchange(stream, &adu, unit, transaction_id);
        match tokio::time::timeout(self.request_timeout, exchange).await {
            Ok(Ok(pdu)) => Ok(pdu),
            Ok(Err(e)) => {
                // Framing is lost after an I/O or decode error.
                *guard = None;
                Err(e)
            }
            Err(_) => Err(ProbeError::Timeout(format!(
                "unit {} did not answer within {} ms",
                unit,
                self.request_timeout.as_millis()
            ))),
        }
    }

    fn next_transaction(&self) -> u16 {
        self.transaction_id.fetch_add(1, Ordering::Relaxed)
    }
}

async fn exchange(stream: &mut TcpStream, adu: &[u8], unit: u8, transaction_id: u16) -> ProbeResult<Vec<u8>> {
    stream.write_all(adu).await?;
    loop {
        let mut header = [0u8; MBAP_HEADER_LEN];
        stream.read_exact(&mut header).await?;
        let header = MbapHeader::parse(&header)?;
        let mut pdu = vec![0u8; header.pdu_len()];
        stream.read_exact(&mut pdu).await?;
        // Late answers to an earlier, timed-out request are skipped.
        if header.transaction_id == transaction_id && header.unit == unit {
            return Ok(pdu);
        }
    }
}

#[async_trait]
impl ModbusTransport for TcpTransport {
    async fn read(&self, unit: u8, table: RegisterTable, start: u16, count: u16) -> ProbeResult<Vec<u16>> {
        let tid = self.next_transaction();
        let pdu = self
            .transact(unit, codec::encode_read(tid, unit, table, start, count), tid)
            .await?;
        codec::decode_read(table, count, &pdu)
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One simulated slave: a register map whose values cycle through a sequence per read.
#[derive(Debug, Clone, Default)]
pub struct SimulatedUnit {
    points: HashMap<(RegisterTable, u16), Vec<u16>>,
}

impl SimulatedUnit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map an address to a value sequence, returned one per read.
    pub fn point(mut self, table: RegisterTable, address: u16, values: Vec<u16>) -> Self {
        self.points.insert((table, address), values);
        self
    }

    pub fn holding(self, address: u16, values: Vec<u16>) -> Self {
        self.point(RegisterTable::Holding, address, values)
    }

    pub fn coil(self, address: u16, values: Vec<u16>) -> Self {
        self.point(RegisterTable::Coil, address, values)
    }
}

/// In-memory Modbus network used to run the probe without hardware.
pub struct SimulatedTransport {
    endpoint: String,
    units: HashMap<u8, SimulatedUnit>,
    cursors: Mutex<HashMap<(u8, RegisterTable, u16), usize>>,
}

impl SimulatedTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            units: HashMap::new(),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_unit(mut self, unit: u8, slave: SimulatedUnit) -> Self {
        self.units.insert(unit, slave);
        self
    }
}

#[async_trait]
impl ModbusTransport for SimulatedTransport {
    async fn read(&self, unit: u8, table: RegisterTable, start: u16, count: u16) -> ProbeResult<Vec<u16>> {
        let slave = self
            .units
            .get(&unit)
            .ok_or_else(|| ProbeError::Timeout(format!("unit {} did not answer", unit)))?;
        let mut cursors = self.cursors.lock();
        let mut out = Vec::with_capacity(count as usize);
        let end = (start as u32 + count as u32).min(MODBUS_ADDRESS_SPACE);
        for address in (start as u32..end).map(|a| a as u16) {
            let values = slave.points.get(&(table, address)).ok_or(ProbeError::Exception {
                function: codec::read_function(table),
                code: 0x02,
            })?;
            let cursor = cursors.entry((unit, table, address)).or_insert(0);
            out.push(values.get(*cursor % values.len().max(1)).copied().unwrap_or(0));
            *cursor += 1;
        }
        Ok(out)
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_simulated_sequences_cycle() {
        let transport = SimulatedTransport::new("sim:502")
            .with_unit(2, SimulatedUnit::new().holding(0, vec![0, 1]));
        let a = transport.read(2, RegisterTable::Holding, 0, 1).await.unwrap();
        let b = transport.read(2, RegisterTable::Holding, 0, 1).await.unwrap();
        let c = transport.read(2, RegisterTable::Holding, 0, 1).await.unwrap();
        assert_eq!((a[0], b[0], c[0]), (0, 1, 0));
        assert!(matches!(
            transport.read(3, RegisterTable::Holding, 0, 1).await,
            Err(ProbeError::Timeout(_))
        ));
        assert!(matches!(
            transport.read(2, RegisterTable::Holding, 5, 1).await,
            Err(ProbeError::Exception { code: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_tcp_transport_reads_from_loopback_slave() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 12];
            socket.read_exact(&mut request).await.unwrap();
            let tid = u16::from_be_bytes([request[0], request[1]]);
            let pdu = codec::encode_read_response(RegisterTable::Holding, &[512]);
            socket
                .write_all(&codec::encode_adu(tid, request[6], &pdu))
                .await
                .unwrap();
        });

        let transport = TcpTransport::new("127.0.0.1", port, Duration::from_millis(500));
        let values = transport.read(4, RegisterTable::Holding, 0, 1).await.unwrap();
        assert_eq!(values, vec![512]);
        assert_eq!(transport.endpoint(), format!("127.0.0.1:{}", port));
    }

    #[tokio::test]
    async fn test_tcp_transport_unreachable() {
        // Bind then drop to get a port with nothing listening.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let transport = TcpTransport::new("127.0.0.1", port, Duration::from_millis(200));
        let err = transport.read(1, RegisterTable::Holding, 0, 1).await.unwrap_err();
        assert!(matches!(err, ProbeError::Unavailable(_)));
    }
}

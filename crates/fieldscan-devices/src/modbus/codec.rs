//! Modbus TCP (MBAP) framing.
//!
//! Only the four read functions are handled; the scanner never writes.

use fieldscan_core::config::RegisterTable;

use crate::error::{ProbeError, ProbeResult};

/// MBAP header length (transaction, protocol, length, unit).
pub const MBAP_HEADER_LEN: usize = 7;

/// Largest PDU allowed by the protocol.
pub const MAX_PDU_LEN: usize = 253;

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;

pub fn read_function(table: RegisterTable) -> u8 {
    match table {
        RegisterTable::Coil => FC_READ_COILS,
        RegisterTable::DiscreteInput => FC_READ_DISCRETE_INPUTS,
        RegisterTable::Holding => FC_READ_HOLDING_REGISTERS,
        RegisterTable::Input => FC_READ_INPUT_REGISTERS,
    }
}

pub fn is_bit_table(table: RegisterTable) -> bool {
    matches!(table, RegisterTable::Coil | RegisterTable::DiscreteInput)
}

fn frame(transaction_id: u16, unit: u8, pdu: &[u8]) -> Vec<u8> {
    let length = (pdu.len() + 1) as u16;
    let mut out = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    out.extend_from_slice(&transaction_id.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&length.to_be_bytes());
    out.push(unit);
    out.extend_from_slice(pdu);
    out
}

/// Encode a read request ADU.
pub fn encode_read(transaction_id: u16, unit: u8, table: RegisterTable, start: u16, count: u16) -> Vec<u8> {
    let mut pdu = vec![read_function(table)];
    pdu.extend_from_slice(&start.to_be_bytes());
    pdu.extend_from_slice(&count.to_be_bytes());
    frame(transaction_id, unit, &pdu)
}

/// Parsed MBAP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Bytes following the length field (unit id + PDU).
    pub length: u16,
    pub unit: u8,
}

impl MbapHeader {
    pub fn parse(bytes: &[u8; MBAP_HEADER_LEN]) -> ProbeResult<Self> {
        let header = Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit: bytes[6],
        };
        if header.protocol_id != 0 {
            return Err(ProbeError::Protocol(format!(
                "unexpected protocol id {}",
                header.protocol_id
            )));
        }
        if header.length < 2 || header.pdu_len() > MAX_PDU_LEN {
            return Err(ProbeError::Protocol(format!("invalid MBAP length {}", header.length)));
        }
        Ok(header)
    }

    pub fn pdu_len(&self) -> usize {
        self.length as usize - 1
    }
}

fn check_exception(function: u8, pdu: &[u8]) -> ProbeResult<()> {
    match pdu.first() {
        None => Err(ProbeError::Protocol("empty PDU".to_string())),
        Some(&fc) if fc == function | 0x80 => Err(ProbeError::Exception {
            function,
            code: pdu.get(1).copied().unwrap_or(0),
        }),
        Some(&fc) if fc != function => Err(ProbeError::Protocol(format!(
            "function mismatch: sent 0x{:02x}, got 0x{:02x}",
            function, fc
        ))),
        Some(_) => Ok(()),
    }
}

/// Decode a read response PDU into one value per address.
///
/// Bit tables yield 0/1 values.
pub fn decode_read(table: RegisterTable, count: u16, pdu: &[u8]) -> ProbeResult<Vec<u16>> {
    check_exception(read_function(table), pdu)?;
    let byte_count = *pdu
        .get(1)
        .ok_or_else(|| ProbeError::Protocol("missing byte count".to_string()))? as usize;
    let data = pdu
        .get(2..2 + byte_count)
        .ok_or_else(|| ProbeError::Protocol("truncated read response".to_string()))?;

    if is_bit_table(table) {
        let needed = (count as usize).div_ceil(8);
        if data.len() < needed {
            return Err(ProbeError::Protocol(format!(
                "expected {} bytes of bits, got {}",
                needed,
                data.len()
            )));
        }
        Ok((0..count as usize)
            .map(|i| ((data[i / 8] >> (i % 8)) & 1) as u16)
            .collect())
    } else {
        if data.len() != count as usize * 2 {
            return Err(ProbeError::Protocol(format!(
                "expected {} register bytes, got {}",
                count as usize * 2,
                data.len()
            )));
        }
        Ok(data
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }
}

/// Encode a read response PDU; used by the simulated slave in tests.
pub fn encode_read_response(table: RegisterTable, values: &[u16]) -> Vec<u8> {
    let mut pdu = vec![read_function(table)];
    if is_bit_table(table) {
        let mut bytes = vec![0u8; values.len().div_ceil(8)];
        for (i, v) in values.iter().enumerate() {
            if *v != 0 {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }
        pdu.push(bytes.len() as u8);
        pdu.extend_from_slice(&bytes);
    } else {
        pdu.push((values.len() * 2) as u8);
        for v in values {
            pdu.extend_from_slice(&v.to_be_bytes());
        }
    }
    pdu
}

/// Wrap a PDU in an MBAP header.
pub fn encode_adu(transaction_id: u16, unit: u8, pdu: &[u8]) -> Vec<u8> {
    frame(transaction_id, unit, pdu)
}

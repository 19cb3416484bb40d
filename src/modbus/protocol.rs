use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::utils::error::ModbusError;

// [Transaction ID(2)][Protocol ID(2)][Length(2)][Unit ID(1)]
pub const MBAP_HEADER_LEN: usize = 7;
pub const MODBUS_PROTOCOL_ID: u16 = 0;
// Unit id + largest PDU
pub const MAX_MBAP_LENGTH: usize = 254;

const EXCEPTION_FLAG: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RegisterKind {
    Holding,
    #[default]
    Input,
}

impl RegisterKind {
    pub fn function_code(&self) -> u8 {
        match self {
            RegisterKind::Holding => 0x03,
            RegisterKind::Input => 0x04,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusRequest {
    pub transaction_id: u16,
    pub unit: u8,
    pub kind: RegisterKind,
    pub start_addr: u16,
    pub count: u16,
}

impl ModbusRequest {
    pub fn encode(&self) -> Bytes {
        let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + 5);
        frame.put_u16(self.transaction_id);
        frame.put_u16(MODBUS_PROTOCOL_ID);
        frame.put_u16(6);
        frame.put_u8(self.unit);
        frame.put_u8(self.kind.function_code());
        frame.put_u16(self.start_addr);
        frame.put_u16(self.count);
        frame.freeze()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusResponse {
    Registers(Vec<u16>),
    Exception(u8),
}

/// Length of the frame remainder announced by an MBAP header.
pub fn frame_length(header: &[u8; MBAP_HEADER_LEN]) -> Result<usize, ModbusError> {
    let protocol_id = u16::from_be_bytes([header[2], header[3]]);
    if protocol_id != MODBUS_PROTOCOL_ID {
        return Err(ModbusError::InvalidResponse(format!(
            "Invalid protocol id: {}",
            protocol_id
        )));
    }

    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    if length < 2 || length > MAX_MBAP_LENGTH {
        return Err(ModbusError::InvalidResponse(format!(
            "Invalid frame length: {}",
            length
        )));
    }

    // The length field counts the unit id, which is already part of the header.
    Ok(length - 1)
}

/// Decodes a complete response frame (header and PDU) to `request`.
pub fn decode_response(request: &ModbusRequest, frame: &[u8]) -> Result<ModbusResponse, ModbusError> {
    if frame.len() < MBAP_HEADER_LEN + 2 {
        return Err(ModbusError::InvalidResponse("Frame too short".to_string()));
    }

    let transaction_id = u16::from_be_bytes([frame[0], frame[1]]);
    if transaction_id != request.transaction_id {
        return Err(ModbusError::InvalidResponse(format!(
            "Transaction id mismatch: expected {}, received {}",
            request.transaction_id, transaction_id
        )));
    }

    let unit = frame[6];
    if unit != request.unit {
        return Err(ModbusError::InvalidResponse(format!(
            "Unit id mismatch: expected {}, received {}",
            request.unit, unit
        )));
    }

    let pdu = &frame[MBAP_HEADER_LEN..];
    let function = request.kind.function_code();

    if pdu[0] == function | EXCEPTION_FLAG {
        return Ok(ModbusResponse::Exception(pdu[1]));
    }
    if pdu[0] != function {
        return Err(ModbusError::InvalidResponse(format!(
            "Function code mismatch: expected 0x{:02X}, received 0x{:02X}",
            function, pdu[0]
        )));
    }

    let byte_count = pdu[1] as usize;
    let data = &pdu[2..];
    if byte_count != data.len() || byte_count != request.count as usize * 2 {
        return Err(ModbusError::InvalidResponse(format!(
            "Byte count mismatch: expected {}, header {}, received {}",
            request.count as usize * 2,
            byte_count,
            data.len()
        )));
    }

    Ok(ModbusResponse::Registers(
        data.chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect(),
    ))
}

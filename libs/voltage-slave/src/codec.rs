//! Modbus frame codecs
//!
//! A [`FrameCodec`] turns a growing receive buffer into whole request frames
//! and turns response PDUs back into wire bytes. The dispatch path is shared by
//! every transport; only framing differs. [`TcpFrameCodec`] implements MBAP
//! framing (Modbus TCP).
//!
//! ```text
//! Header:  TransactionId u16 | ProtocolId u16 (=0) | Length u16
//! ADU:     Header | UnitId u8 | PDU
//! ```
//!
//! All integers are big-endian and `Length = 1 + len(PDU)`.

use bytes::{BufMut, BytesMut};
use tracing::debug;

use crate::constants::{MAX_MBAP_LENGTH, MBAP_HEADER_LEN};
use crate::error::{ExceptionCode, Result, SlaveError};
use crate::pdu::ModbusPdu;

/// Modbus TCP MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    /// Transaction identifier
    pub transaction_id: u16,
    /// Protocol identifier (fixed to 0)
    pub protocol_id: u16,
    /// Byte count of unit id + PDU
    pub length: u16,
}

impl MbapHeader {
    /// Header for a frame carrying `pdu_len` PDU bytes
    pub fn for_pdu(transaction_id: u16, pdu_len: usize) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            length: (1 + pdu_len) as u16,
        }
    }

    /// Decode a header from the front of `bytes`.
    ///
    /// Returns `Ok(None)` while fewer than 6 bytes are available. A header that
    /// can never start a valid frame is a framing error.
    pub fn try_decode(bytes: &[u8]) -> Result<Option<Self>> {
        if bytes.len() < MBAP_HEADER_LEN {
            return Ok(None);
        }

        let header = Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
        };

        if header.protocol_id != 0 {
            return Err(SlaveError::framing(format!(
                "Invalid protocol ID: {} (expected 0)",
                header.protocol_id
            )));
        }

        if header.length == 0 || header.length as usize > MAX_MBAP_LENGTH {
            return Err(SlaveError::framing(format!(
                "Invalid MBAP length: {} (valid range 1..={})",
                header.length, MAX_MBAP_LENGTH
            )));
        }

        Ok(Some(header))
    }

    /// Write the 6 header bytes
    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        dst.put_u16(self.transaction_id);
        dst.put_u16(self.protocol_id);
        dst.put_u16(self.length);
    }

    /// Total frame size described by this header
    #[inline]
    pub fn frame_len(&self) -> usize {
        MBAP_HEADER_LEN + self.length as usize
    }
}

/// A complete frame borrowed from the receive buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame<'a> {
    pub transaction_id: u16,
    pub unit_id: u8,
    /// PDU bytes (function code + function data)
    pub pdu: &'a [u8],
    /// Bytes of the buffer this frame occupies
    pub len: usize,
}

/// Decoded request or response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusMessage {
    pub transaction_id: u16,
    /// Unit identifier the message is addressed to (0 = broadcast)
    pub slave_address: u8,
    pub function_code: u8,
    /// Full PDU, function code included
    pub pdu: ModbusPdu,
}

impl ModbusMessage {
    /// Message from a PDU; fails if the PDU carries no function code
    pub fn new(transaction_id: u16, slave_address: u8, pdu: ModbusPdu) -> Result<Self> {
        let function_code = pdu
            .function_code()
            .ok_or_else(|| SlaveError::malformed("Empty PDU"))?;
        Ok(Self {
            transaction_id,
            slave_address,
            function_code,
            pdu,
        })
    }

    /// Exception response answering `request`
    pub fn exception(request: &ModbusMessage, code: ExceptionCode) -> Self {
        Self::response_to(request, ModbusPdu::exception(request.function_code, code))
    }

    /// Response to `request` carrying `pdu`, same transaction and unit
    pub fn response_to(request: &ModbusMessage, pdu: ModbusPdu) -> Self {
        Self {
            transaction_id: request.transaction_id,
            slave_address: request.slave_address,
            function_code: pdu.function_code().unwrap_or(request.function_code),
            pdu,
        }
    }

    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.slave_address == crate::constants::BROADCAST_UNIT_ID
    }
}

/// Transport-specific framing
pub trait FrameCodec: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Bytes needed before a frame's total length is known
    fn header_len(&self) -> usize;

    /// Locate one complete frame at the front of `buf`.
    ///
    /// `Ok(None)` means more bytes are needed. Nothing is copied before the
    /// whole frame is present.
    fn try_extract_frame<'a>(&self, buf: &'a [u8]) -> Result<Option<RawFrame<'a>>>;

    /// Turn an extracted frame into a request message
    fn decode_request(&self, frame: &RawFrame<'_>) -> Result<ModbusMessage>;

    /// Append the wire form of a response to `dst`
    fn encode_response(
        &self,
        transaction_id: u16,
        unit_id: u8,
        pdu: &ModbusPdu,
        dst: &mut BytesMut,
    );
}

/// MBAP framing for Modbus TCP
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpFrameCodec;

impl FrameCodec for TcpFrameCodec {
    fn name(&self) -> &'static str {
        "modbus-tcp"
    }

    fn header_len(&self) -> usize {
        MBAP_HEADER_LEN
    }

    fn try_extract_frame<'a>(&self, buf: &'a [u8]) -> Result<Option<RawFrame<'a>>> {
        let header = match MbapHeader::try_decode(buf)? {
            Some(header) => header,
            None => return Ok(None),
        };

        let frame_len = header.frame_len();
        if buf.len() < frame_len {
            return Ok(None);
        }

        Ok(Some(RawFrame {
            transaction_id: header.transaction_id,
            unit_id: buf[MBAP_HEADER_LEN],
            pdu: &buf[MBAP_HEADER_LEN + 1..frame_len],
            len: frame_len,
        }))
    }

    fn decode_request(&self, frame: &RawFrame<'_>) -> Result<ModbusMessage> {
        let pdu = ModbusPdu::from_slice(frame.pdu)?;
        let message = ModbusMessage::new(frame.transaction_id, frame.unit_id, pdu)?;
        debug!(
            "Request decoded: tx={}, unit={}, FC={:02X}, pdu_len={}",
            message.transaction_id,
            message.slave_address,
            message.function_code,
            message.pdu.len()
        );
        Ok(message)
    }

    fn encode_response(
        &self,
        transaction_id: u16,
        unit_id: u8,
        pdu: &ModbusPdu,
        dst: &mut BytesMut,
    ) {
        let header = MbapHeader::for_pdu(transaction_id, pdu.len());
        dst.reserve(header.frame_len());
        header.encode(dst);
        dst.put_u8(unit_id);
        dst.put_slice(pdu.as_slice());
    }
}

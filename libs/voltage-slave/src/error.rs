//! Slave Engine Error Types
//!
//! Core error types for the Modbus slave engine, plus the mapping from
//! errors to Modbus exception codes.

use std::fmt;

use thiserror::Error;

/// Result type for voltage-slave operations
pub type Result<T> = std::result::Result<T, SlaveError>;

/// Modbus exception codes returned in `fc | 0x80` responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
}

impl ExceptionCode {
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::IllegalFunction => "Illegal Function",
            Self::IllegalDataAddress => "Illegal Data Address",
            Self::IllegalDataValue => "Illegal Data Value",
        };
        write!(f, "{} ({:02X})", name, self.as_u8())
    }
}

/// Slave engine errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SlaveError {
    /// Malformed MBAP header or truncated stream
    #[error("Framing error: {0}")]
    Framing(String),

    /// PDU shorter than required or count/byte-count mismatch
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// No handler registered for the function code
    #[error("Unsupported function code: 0x{0:02X}")]
    UnsupportedFunctionCode(u8),

    /// Range outside the point table
    #[error("Address out of range: start={start}, count={count}, size={size}")]
    AddressOutOfRange { start: u16, count: usize, size: usize },

    /// Unit id already registered
    #[error("Duplicate unit id: {0}")]
    DuplicateUnitId(u8),

    /// Unit id outside 1..=247
    #[error("Invalid unit id: {0}")]
    InvalidUnitId(u8),

    /// Unexpected handler failure on a unicast request
    #[error("Handler failed for unit {unit_id}: {message}")]
    UnicastHandler { unit_id: u8, message: String },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for SlaveError {
    fn from(err: std::io::Error) -> Self {
        SlaveError::Io(err.to_string())
    }
}

// Helper methods for creating errors
impl SlaveError {
    pub fn framing(msg: impl Into<String>) -> Self {
        SlaveError::Framing(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        SlaveError::MalformedRequest(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        SlaveError::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        SlaveError::Internal(msg.into())
    }

    /// Exception code to answer with, if this error has one.
    ///
    /// Errors without a mapping are not reportable on the wire.
    pub fn exception_code(&self) -> Option<ExceptionCode> {
        match self {
            SlaveError::UnsupportedFunctionCode(_) => Some(ExceptionCode::IllegalFunction),
            SlaveError::AddressOutOfRange { .. } => Some(ExceptionCode::IllegalDataAddress),
            SlaveError::MalformedRequest(_) => Some(ExceptionCode::IllegalDataValue),
            _ => None,
        }
    }

    /// Whether this error terminates the connection it occurred on.
    ///
    /// Anything that cannot be reported to the peer as an exception is fatal.
    pub fn is_fatal_for_connection(&self) -> bool {
        self.exception_code().is_none()
    }
}

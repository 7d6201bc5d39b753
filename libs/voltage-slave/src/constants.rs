//! Modbus protocol constants based on official specification
//!
//! These constants are derived from the official Modbus specification:
//! - Maximum PDU size: 253 bytes (inherited from RS485 ADU limit of 256 bytes)
//! - Register/coil limits are calculated to fit within the PDU size constraint

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Modbus MBAP header length for TCP
/// Format: Transaction ID(2) + Protocol ID(2) + Length(2) = 6 bytes
/// The Unit ID that follows is counted by the Length field, not here.
pub const MBAP_HEADER_LEN: usize = 6;

/// Maximum PDU (Protocol Data Unit) size per Modbus specification
/// RS485 ADU (256 bytes) - Slave Address (1 byte) - CRC (2 bytes) = 253 bytes
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (Unit ID + PDU)
/// = 1 (Unit ID) + 253 (Max PDU) = 254 bytes
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Largest complete Modbus TCP frame: 6 + 254 = 260 bytes
pub const MAX_TCP_FRAME_LEN: usize = MBAP_HEADER_LEN + MAX_MBAP_LENGTH;

/// Default per-connection read chunk size
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

// ============================================================================
// Point Space Constants
// ============================================================================

/// Number of addressable points in each point space (addresses 0..=65535)
pub const MAX_POINTS: usize = 65536;

/// Unit identifier reserved for broadcast requests
pub const BROADCAST_UNIT_ID: u8 = 0;

/// Highest unit identifier a slave may be registered under
pub const MAX_UNIT_ID: u8 = 247;

// ============================================================================
// Function Codes
// ============================================================================

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_DIAGNOSTICS: u8 = 0x08;
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
pub const FC_READ_WRITE_MULTIPLE_REGISTERS: u8 = 0x17;

/// Bit set in the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

/// FC05 payload for ON
pub const COIL_ON: u16 = 0xFF00;
/// FC05 payload for OFF
pub const COIL_OFF: u16 = 0x0000;

// ============================================================================
// Register Operation Limits
// ============================================================================

/// Maximum number of registers for FC03/FC04 (Read Holding/Input Registers)
///
/// Calculation for response PDU:
/// - Function Code: 1 byte
/// - Byte Count: 1 byte
/// - Register Data: N × 2 bytes
/// - Therefore: N ≤ (253 - 2) / 2 = 125.5 → 125 registers
pub const MODBUS_MAX_READ_REGISTERS: usize = 125;

/// Maximum number of registers for FC16 (Write Multiple Registers)
///
/// Calculation for request PDU:
/// - Function Code (1) + Starting Address (2) + Quantity (2) + Byte Count (1)
/// - Register Values: N × 2 bytes
/// - Therefore: N ≤ (253 - 6) / 2 = 123.5 → 123 registers
pub const MODBUS_MAX_WRITE_REGISTERS: usize = 123;

/// Maximum number of registers written by FC23 (Read/Write Multiple Registers)
///
/// Request PDU: FC (1) + Read Start (2) + Read Qty (2) + Write Start (2)
/// + Write Qty (2) + Byte Count (1) + N × 2 ≤ 253 → N ≤ 121
pub const MODBUS_MAX_RW_WRITE_REGISTERS: usize = 121;

// ============================================================================
// Coil Operation Limits
// ============================================================================

/// Maximum number of coils for FC01/FC02 (Read Coils/Discrete Inputs)
pub const MODBUS_MAX_READ_COILS: usize = 2000;

/// Maximum number of coils for FC15 (Write Multiple Coils)
pub const MODBUS_MAX_WRITE_COILS: usize = 1968;

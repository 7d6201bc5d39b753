//! Built-in function handlers
//!
//! One handler per supported public function code. Decoding enforces the
//! quantity limits of the Modbus application protocol (v1.1b3); any violation
//! is a `MalformedRequest`, which the network answers with exception 03.

use std::sync::Arc;

use crate::constants::*;
use crate::error::{Result, SlaveError};
use crate::pdu::{ModbusPdu, PduBuilder};
use crate::registry::{FunctionHandler, FunctionService};
use crate::store::{BitTable, PointStore, RegisterTable};

/// Every built-in handler keyed by its function code
pub fn builtin_handlers() -> Vec<(u8, Arc<dyn FunctionHandler>)> {
    vec![
        entry(FC_READ_COILS, ReadBits::new(FC_READ_COILS, BitTable::Coils)),
        entry(
            FC_READ_DISCRETE_INPUTS,
            ReadBits::new(FC_READ_DISCRETE_INPUTS, BitTable::DiscreteInputs),
        ),
        entry(
            FC_READ_HOLDING_REGISTERS,
            ReadRegisters::new(FC_READ_HOLDING_REGISTERS, RegisterTable::HoldingRegisters),
        ),
        entry(
            FC_READ_INPUT_REGISTERS,
            ReadRegisters::new(FC_READ_INPUT_REGISTERS, RegisterTable::InputRegisters),
        ),
        entry(FC_WRITE_SINGLE_COIL, WriteSingleCoil),
        entry(FC_WRITE_SINGLE_REGISTER, WriteSingleRegister),
        entry(FC_DIAGNOSTICS, Diagnostics),
        entry(FC_WRITE_MULTIPLE_COILS, WriteMultipleCoils),
        entry(FC_WRITE_MULTIPLE_REGISTERS, WriteMultipleRegisters),
        entry(FC_READ_WRITE_MULTIPLE_REGISTERS, ReadWriteMultipleRegisters),
    ]
}

fn entry<H: FunctionHandler + 'static>(code: u8, handler: H) -> (u8, Arc<dyn FunctionHandler>) {
    (code, Arc::new(handler))
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Pack bits LSB-first, eight per byte
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; bits.len().div_ceil(8)];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            packed[i / 8] |= 1 << (i % 8);
        }
    }
    packed
}

/// Unpack `count` bits LSB-first
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| (bytes[i / 8] >> (i % 8)) & 1 == 1)
        .collect()
}

fn require_len(pdu: &ModbusPdu, min: usize) -> Result<&[u8]> {
    let data = pdu.data();
    if data.len() < min {
        return Err(SlaveError::malformed(format!(
            "FC{:02X} needs at least {} data bytes, got {}",
            pdu.function_code().unwrap_or(0),
            min,
            data.len()
        )));
    }
    Ok(data)
}

fn check_quantity(what: &str, quantity: u16, max: usize) -> Result<usize> {
    let quantity = quantity as usize;
    if quantity == 0 || quantity > max {
        return Err(SlaveError::malformed(format!(
            "{} quantity {} out of range 1..={}",
            what, quantity, max
        )));
    }
    Ok(quantity)
}

/// Byte count field must match both the quantity and the bytes present
fn check_byte_count(data: &[u8], header_len: usize, expected: usize) -> Result<&[u8]> {
    let declared = data[header_len - 1] as usize;
    let supplied = data.len() - header_len;
    if declared != expected || supplied != declared {
        return Err(SlaveError::malformed(format!(
            "Byte count mismatch: declared {}, expected {}, supplied {}",
            declared, expected, supplied
        )));
    }
    Ok(&data[header_len..])
}

fn be_words(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

/// Start address and quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeRequest {
    pub start: u16,
    pub quantity: usize,
}

/// Address and the value written there
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SingleWrite {
    pub address: u16,
    pub value: u16,
}

// ============================================================================
// FC01 / FC02
// ============================================================================

/// Read Coils (01) and Read Discrete Inputs (02)
#[derive(Debug, Clone, Copy)]
pub struct ReadBits {
    function_code: u8,
    table: BitTable,
}

impl ReadBits {
    pub fn new(function_code: u8, table: BitTable) -> Self {
        Self {
            function_code,
            table,
        }
    }
}

impl FunctionService for ReadBits {
    type Request = RangeRequest;

    fn name(&self) -> &'static str {
        match self.table {
            BitTable::Coils => "Read Coils",
            BitTable::DiscreteInputs => "Read Discrete Inputs",
        }
    }

    fn decode_request(&self, pdu: &ModbusPdu) -> Result<RangeRequest> {
        require_len(pdu, 4)?;
        let start = pdu.data_u16(0)?;
        let quantity = check_quantity("Read bits", pdu.data_u16(2)?, MODBUS_MAX_READ_COILS)?;
        Ok(RangeRequest { start, quantity })
    }

    fn handle(&self, request: RangeRequest, store: &PointStore) -> Result<ModbusPdu> {
        let bits = store.read_bits(self.table, request.start, request.quantity)?;
        let packed = pack_bits(&bits);
        Ok(PduBuilder::new()
            .function_code(self.function_code)?
            .byte(packed.len() as u8)?
            .data(&packed)?
            .build())
    }
}

// ============================================================================
// FC03 / FC04
// ============================================================================

/// Read Holding Registers (03) and Read Input Registers (04)
#[derive(Debug, Clone, Copy)]
pub struct ReadRegisters {
    function_code: u8,
    table: RegisterTable,
}

impl ReadRegisters {
    pub fn new(function_code: u8, table: RegisterTable) -> Self {
        Self {
            function_code,
            table,
        }
    }
}

impl FunctionService for ReadRegisters {
    type Request = RangeRequest;

    fn name(&self) -> &'static str {
        match self.table {
            RegisterTable::HoldingRegisters => "Read Holding Registers",
            RegisterTable::InputRegisters => "Read Input Registers",
        }
    }

    fn decode_request(&self, pdu: &ModbusPdu) -> Result<RangeRequest> {
        require_len(pdu, 4)?;
        let start = pdu.data_u16(0)?;
        let quantity = check_quantity(
            "Read registers",
            pdu.data_u16(2)?,
            MODBUS_MAX_READ_REGISTERS,
        )?;
        Ok(RangeRequest { start, quantity })
    }

    fn handle(&self, request: RangeRequest, store: &PointStore) -> Result<ModbusPdu> {
        let values = store.read_registers(self.table, request.start, request.quantity)?;
        Ok(PduBuilder::new()
            .function_code(self.function_code)?
            .byte((values.len() * 2) as u8)?
            .registers(&values)?
            .build())
    }
}

// ============================================================================
// FC05 / FC06
// ============================================================================

/// Write Single Coil (05); the response echoes the request
#[derive(Debug, Clone, Copy)]
pub struct WriteSingleCoil;

impl FunctionService for WriteSingleCoil {
    type Request = SingleWrite;

    fn name(&self) -> &'static str {
        "Write Single Coil"
    }

    fn decode_request(&self, pdu: &ModbusPdu) -> Result<SingleWrite> {
        require_len(pdu, 4)?;
        let address = pdu.data_u16(0)?;
        let value = pdu.data_u16(2)?;
        if value != COIL_ON && value != COIL_OFF {
            return Err(SlaveError::malformed(format!(
                "Coil value 0x{:04X} is neither 0xFF00 nor 0x0000",
                value
            )));
        }
        Ok(SingleWrite { address, value })
    }

    fn handle(&self, request: SingleWrite, store: &PointStore) -> Result<ModbusPdu> {
        store.write_bits(
            BitTable::Coils,
            request.address,
            &[request.value == COIL_ON],
        )?;
        Ok(PduBuilder::new()
            .function_code(FC_WRITE_SINGLE_COIL)?
            .address(request.address)?
            .quantity(request.value)?
            .build())
    }
}

/// Write Single Register (06); the response echoes the request
#[derive(Debug, Clone, Copy)]
pub struct WriteSingleRegister;

impl FunctionService for WriteSingleRegister {
    type Request = SingleWrite;

    fn name(&self) -> &'static str {
        "Write Single Register"
    }

    fn decode_request(&self, pdu: &ModbusPdu) -> Result<SingleWrite> {
        require_len(pdu, 4)?;
        Ok(SingleWrite {
            address: pdu.data_u16(0)?,
            value: pdu.data_u16(2)?,
        })
    }

    fn handle(&self, request: SingleWrite, store: &PointStore) -> Result<ModbusPdu> {
        store.write_registers(
            RegisterTable::HoldingRegisters,
            request.address,
            &[request.value],
        )?;
        Ok(PduBuilder::new()
            .function_code(FC_WRITE_SINGLE_REGISTER)?
            .address(request.address)?
            .quantity(request.value)?
            .build())
    }
}

// ============================================================================
// FC08
// ============================================================================

/// Diagnostics (08); the sub-function and its data are echoed unchanged
#[derive(Debug, Clone, Copy)]
pub struct Diagnostics;

impl FunctionService for Diagnostics {
    type Request = ModbusPdu;

    fn name(&self) -> &'static str {
        "Diagnostics"
    }

    fn decode_request(&self, pdu: &ModbusPdu) -> Result<ModbusPdu> {
        require_len(pdu, 2)?;
        Ok(pdu.clone())
    }

    fn handle(&self, request: ModbusPdu, _store: &PointStore) -> Result<ModbusPdu> {
        Ok(request)
    }
}

// ============================================================================
// FC0F / FC10
// ============================================================================

/// Coils to write starting at `start`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoilsWrite {
    pub start: u16,
    pub values: Vec<bool>,
}

/// Registers to write starting at `start`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistersWrite {
    pub start: u16,
    pub values: Vec<u16>,
}

/// Write Multiple Coils (0F); the response echoes start and quantity
#[derive(Debug, Clone, Copy)]
pub struct WriteMultipleCoils;

impl FunctionService for WriteMultipleCoils {
    type Request = CoilsWrite;

    fn name(&self) -> &'static str {
        "Write Multiple Coils"
    }

    fn decode_request(&self, pdu: &ModbusPdu) -> Result<CoilsWrite> {
        let data = require_len(pdu, 5)?;
        let start = pdu.data_u16(0)?;
        let quantity = check_quantity("Write coils", pdu.data_u16(2)?, MODBUS_MAX_WRITE_COILS)?;
        let payload = check_byte_count(data, 5, quantity.div_ceil(8))?;
        Ok(CoilsWrite {
            start,
            values: unpack_bits(payload, quantity),
        })
    }

    fn handle(&self, request: CoilsWrite, store: &PointStore) -> Result<ModbusPdu> {
        store.write_bits(BitTable::Coils, request.start, &request.values)?;
        Ok(PduBuilder::new()
            .function_code(FC_WRITE_MULTIPLE_COILS)?
            .address(request.start)?
            .quantity(request.values.len() as u16)?
            .build())
    }
}

/// Write Multiple Registers (10); the response echoes start and quantity
#[derive(Debug, Clone, Copy)]
pub struct WriteMultipleRegisters;

impl FunctionService for WriteMultipleRegisters {
    type Request = RegistersWrite;

    fn name(&self) -> &'static str {
        "Write Multiple Registers"
    }

    fn decode_request(&self, pdu: &ModbusPdu) -> Result<RegistersWrite> {
        let data = require_len(pdu, 5)?;
        let start = pdu.data_u16(0)?;
        let quantity = check_quantity(
            "Write registers",
            pdu.data_u16(2)?,
            MODBUS_MAX_WRITE_REGISTERS,
        )?;
        let payload = check_byte_count(data, 5, quantity * 2)?;
        Ok(RegistersWrite {
            start,
            values: be_words(payload),
        })
    }

    fn handle(&self, request: RegistersWrite, store: &PointStore) -> Result<ModbusPdu> {
        store.write_registers(RegisterTable::HoldingRegisters, request.start, &request.values)?;
        Ok(PduBuilder::new()
            .function_code(FC_WRITE_MULTIPLE_REGISTERS)?
            .address(request.start)?
            .quantity(request.values.len() as u16)?
            .build())
    }
}

// ============================================================================
// FC17
// ============================================================================

/// Decoded Read/Write Multiple Registers request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadWriteRequest {
    pub read: RangeRequest,
    pub write: RegistersWrite,
}

/// Read/Write Multiple Registers (17); the write lands before the read
#[derive(Debug, Clone, Copy)]
pub struct ReadWriteMultipleRegisters;

impl FunctionService for ReadWriteMultipleRegisters {
    type Request = ReadWriteRequest;

    fn name(&self) -> &'static str {
        "Read/Write Multiple Registers"
    }

    fn decode_request(&self, pdu: &ModbusPdu) -> Result<ReadWriteRequest> {
        let data = require_len(pdu, 9)?;
        let read_start = pdu.data_u16(0)?;
        let read_quantity = check_quantity(
            "Read registers",
            pdu.data_u16(2)?,
            MODBUS_MAX_READ_REGISTERS,
        )?;
        let write_start = pdu.data_u16(4)?;
        let write_quantity = check_quantity(
            "Write registers",
            pdu.data_u16(6)?,
            MODBUS_MAX_RW_WRITE_REGISTERS,
        )?;
        let payload = check_byte_count(data, 9, write_quantity * 2)?;
        Ok(ReadWriteRequest {
            read: RangeRequest {
                start: read_start,
                quantity: read_quantity,
            },
            write: RegistersWrite {
                start: write_start,
                values: be_words(payload),
            },
        })
    }

    fn handle(&self, request: ReadWriteRequest, store: &PointStore) -> Result<ModbusPdu> {
        let values = store.write_then_read_registers(
            request.write.start,
            &request.write.values,
            request.read.start,
            request.read.quantity,
        )?;
        Ok(PduBuilder::new()
            .function_code(FC_READ_WRITE_MULTIPLE_REGISTERS)?
            .byte((values.len() * 2) as u8)?
            .registers(&values)?
            .build())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::store::StoreLayout;

    fn apply<S: FunctionService>(service: &S, bytes: &[u8], store: &PointStore) -> Result<Vec<u8>> {
        let pdu = ModbusPdu::from_slice(bytes).unwrap();
        FunctionHandler::apply(service, &pdu, store).map(|r| r.as_slice().to_vec())
    }

    #[test]
    fn test_pack_bits_lsb_first() {
        let bits = [true, false, true, true, false, false, true, false, true, true];
        assert_eq!(pack_bits(&bits), vec![0b0100_1101, 0b0000_0011]);
        assert_eq!(unpack_bits(&pack_bits(&bits), bits.len()), bits.to_vec());
        assert!(pack_bits(&[]).is_empty());
    }

    #[test]
    fn test_read_holding_registers() {
        let store = PointStore::default();
        store
            .write_registers(RegisterTable::HoldingRegisters, 1, &[0x1234])
            .unwrap();
        let handler = ReadRegisters::new(0x03, RegisterTable::HoldingRegisters);

        let response = apply(&handler, &[0x03, 0x00, 0x00, 0x00, 0x02], &store).unwrap();
        assert_eq!(response, vec![0x03, 0x04, 0x00, 0x00, 0x12, 0x34]);
    }

    #[test]
    fn test_read_input_registers_uses_own_table() {
        let store = PointStore::default();
        store
            .write_registers(RegisterTable::InputRegisters, 0, &[7])
            .unwrap();
        let handler = ReadRegisters::new(0x04, RegisterTable::InputRegisters);

        let response = apply(&handler, &[0x04, 0x00, 0x00, 0x00, 0x01], &store).unwrap();
        assert_eq!(response, vec![0x04, 0x02, 0x00, 0x07]);
    }

    #[test]
    fn test_read_quantity_limits() {
        let store = PointStore::default();
        let handler = ReadRegisters::new(0x03, RegisterTable::HoldingRegisters);

        assert!(apply(&handler, &[0x03, 0x00, 0x00, 0x00, 125], &store).is_ok());
        let err = apply(&handler, &[0x03, 0x00, 0x00, 0x00, 126], &store).unwrap_err();
        assert!(matches!(err, SlaveError::MalformedRequest(_)));
        let err = apply(&handler, &[0x03, 0x00, 0x00, 0x00, 0x00], &store).unwrap_err();
        assert!(matches!(err, SlaveError::MalformedRequest(_)));
    }

    #[test]
    fn test_short_pdu_is_malformed() {
        let store = PointStore::default();
        let handler = ReadBits::new(0x01, BitTable::Coils);
        let err = apply(&handler, &[0x01, 0x00, 0x00, 0x00], &store).unwrap_err();
        assert!(matches!(err, SlaveError::MalformedRequest(_)));
    }

    #[test]
    fn test_read_coils_out_of_range() {
        let store = PointStore::new(StoreLayout::uniform(16)).unwrap();
        let handler = ReadBits::new(0x01, BitTable::Coils);
        let err = apply(&handler, &[0x01, 0x00, 0x0F, 0x00, 0x02], &store).unwrap_err();
        assert!(matches!(err, SlaveError::AddressOutOfRange { .. }));
    }

    #[test]
    fn test_read_discrete_inputs_packs_bits() {
        let store = PointStore::default();
        store
            .write_bits(BitTable::DiscreteInputs, 2, &[true, true])
            .unwrap();
        let handler = ReadBits::new(0x02, BitTable::DiscreteInputs);
        let response = apply(&handler, &[0x02, 0x00, 0x00, 0x00, 0x0A], &store).unwrap();
        assert_eq!(response, vec![0x02, 0x02, 0b0000_1100, 0x00]);
    }

    #[test]
    fn test_write_single_coil() {
        let store = PointStore::default();
        let request = [0x05, 0x00, 0x03, 0xFF, 0x00];
        assert_eq!(apply(&WriteSingleCoil, &request, &store).unwrap(), request.to_vec());
        assert_eq!(store.read_bits(BitTable::Coils, 3, 1).unwrap(), vec![true]);

        let err = apply(&WriteSingleCoil, &[0x05, 0x00, 0x03, 0x12, 0x34], &store).unwrap_err();
        assert!(matches!(err, SlaveError::MalformedRequest(_)));
    }

    #[test]
    fn test_write_single_register_echo() {
        let store = PointStore::default();
        let request = [0x06, 0x00, 0x0A, 0x00, 0x2A];
        assert_eq!(
            apply(&WriteSingleRegister, &request, &store).unwrap(),
            request.to_vec()
        );
        assert_eq!(
            store
                .read_registers(RegisterTable::HoldingRegisters, 10, 1)
                .unwrap(),
            vec![42]
        );
    }

    #[test]
    fn test_write_multiple_coils() {
        let store = PointStore::default();
        // 10 coils from address 20: 0xCD 0x01
        let request = [0x0F, 0x00, 0x14, 0x00, 0x0A, 0x02, 0xCD, 0x01];
        let response = apply(&WriteMultipleCoils, &request, &store).unwrap();
        assert_eq!(response, vec![0x0F, 0x00, 0x14, 0x00, 0x0A]);
        assert_eq!(
            store.read_bits(BitTable::Coils, 20, 10).unwrap(),
            vec![true, false, true, true, false, false, true, true, true, false]
        );
    }

    #[test]
    fn test_write_multiple_coils_byte_count_mismatch() {
        let store = PointStore::default();
        let declared_wrong = [0x0F, 0x00, 0x00, 0x00, 0x0A, 0x01, 0xCD];
        assert!(matches!(
            apply(&WriteMultipleCoils, &declared_wrong, &store).unwrap_err(),
            SlaveError::MalformedRequest(_)
        ));
        let truncated = [0x0F, 0x00, 0x00, 0x00, 0x0A, 0x02, 0xCD];
        assert!(apply(&WriteMultipleCoils, &truncated, &store).is_err());
    }

    #[test]
    fn test_write_multiple_registers() {
        let store = PointStore::default();
        let request = [0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02];
        let response = apply(&WriteMultipleRegisters, &request, &store).unwrap();
        assert_eq!(response, vec![0x10, 0x00, 0x01, 0x00, 0x02]);
        assert_eq!(
            store
                .read_registers(RegisterTable::HoldingRegisters, 1, 2)
                .unwrap(),
            vec![0x000A, 0x0102]
        );

        let mismatch = [0x10, 0x00, 0x01, 0x00, 0x02, 0x02, 0x00, 0x0A];
        assert!(matches!(
            apply(&WriteMultipleRegisters, &mismatch, &store).unwrap_err(),
            SlaveError::MalformedRequest(_)
        ));
    }

    #[test]
    fn test_read_write_multiple_registers_writes_first() {
        let store = PointStore::default();
        // read 3 @ 0, write 2 @ 1: [0x00FF, 0x0100]
        let request = [
            0x17, 0x00, 0x00, 0x00, 0x03, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0xFF, 0x01, 0x00,
        ];
        let response = apply(&ReadWriteMultipleRegisters, &request, &store).unwrap();
        assert_eq!(
            response,
            vec![0x17, 0x06, 0x00, 0x00, 0x00, 0xFF, 0x01, 0x00]
        );
    }

    #[test]
    fn test_diagnostics_echo() {
        let store = PointStore::default();
        let request = [0x08, 0x00, 0x00, 0xA5, 0x37];
        assert_eq!(apply(&Diagnostics, &request, &store).unwrap(), request.to_vec());
        assert!(apply(&Diagnostics, &[0x08, 0x00], &store).is_err());
    }
}

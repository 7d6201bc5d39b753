//! In-memory point store for one slave
//!
//! Four independently addressed point spaces, each sized at construction and
//! addressed 0..size (size <= 65536). All four tables sit behind a single lock
//! so that a write-then-read request observes its own write and nothing else.
//!
//! Point events are published while that lock is still held, so subscribers
//! see write events in the order the writes were applied.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::constants::MAX_POINTS;
use crate::error::{Result, SlaveError};

/// Capacity of the point event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Point space identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointType {
    Coils,
    DiscreteInputs,
    HoldingRegisters,
    InputRegisters,
}

impl std::fmt::Display for PointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PointType::Coils => "coils",
            PointType::DiscreteInputs => "discrete_inputs",
            PointType::HoldingRegisters => "holding_registers",
            PointType::InputRegisters => "input_registers",
        };
        f.write_str(name)
    }
}

/// Single-bit point spaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitTable {
    Coils,
    DiscreteInputs,
}

/// 16-bit point spaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterTable {
    HoldingRegisters,
    InputRegisters,
}

impl From<BitTable> for PointType {
    fn from(table: BitTable) -> Self {
        match table {
            BitTable::Coils => PointType::Coils,
            BitTable::DiscreteInputs => PointType::DiscreteInputs,
        }
    }
}

impl From<RegisterTable> for PointType {
    fn from(table: RegisterTable) -> Self {
        match table {
            RegisterTable::HoldingRegisters => PointType::HoldingRegisters,
            RegisterTable::InputRegisters => PointType::InputRegisters,
        }
    }
}

/// Whether a range was read or written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointEventKind {
    Read,
    Written,
}

/// Values of the accessed range
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointValues {
    Bits(Vec<bool>),
    Registers(Vec<u16>),
}

impl PointValues {
    pub fn len(&self) -> usize {
        match self {
            PointValues::Bits(bits) => bits.len(),
            PointValues::Registers(registers) => registers.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Notification emitted after every successful range access
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointEvent {
    pub kind: PointEventKind,
    pub point_type: PointType,
    pub start_address: u16,
    /// Values read, or values as written
    pub values: PointValues,
}

impl PointEvent {
    /// Number of points in the range
    pub fn count(&self) -> usize {
        self.values.len()
    }
}

fn default_table_size() -> usize {
    MAX_POINTS
}

/// Size of each point table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreLayout {
    #[serde(default = "default_table_size")]
    pub coils: usize,
    #[serde(default = "default_table_size")]
    pub discrete_inputs: usize,
    #[serde(default = "default_table_size")]
    pub holding_registers: usize,
    #[serde(default = "default_table_size")]
    pub input_registers: usize,
}

impl Default for StoreLayout {
    fn default() -> Self {
        Self::uniform(MAX_POINTS)
    }
}

impl StoreLayout {
    /// Same size for all four tables
    pub fn uniform(size: usize) -> Self {
        Self {
            coils: size,
            discrete_inputs: size,
            holding_registers: size,
            input_registers: size,
        }
    }

    pub fn size_of(&self, point_type: PointType) -> usize {
        match point_type {
            PointType::Coils => self.coils,
            PointType::DiscreteInputs => self.discrete_inputs,
            PointType::HoldingRegisters => self.holding_registers,
            PointType::InputRegisters => self.input_registers,
        }
    }

    /// Every table must hold 1..=65536 points
    pub fn validate(&self) -> Result<()> {
        for point_type in [
            PointType::Coils,
            PointType::DiscreteInputs,
            PointType::HoldingRegisters,
            PointType::InputRegisters,
        ] {
            let size = self.size_of(point_type);
            if size == 0 || size > MAX_POINTS {
                return Err(SlaveError::config(format!(
                    "{} size {} out of range 1..={}",
                    point_type, size, MAX_POINTS
                )));
            }
        }
        Ok(())
    }
}

struct Tables {
    coils: Vec<bool>,
    discrete_inputs: Vec<bool>,
    holding_registers: Vec<u16>,
    input_registers: Vec<u16>,
}

impl Tables {
    fn bits(&self, table: BitTable) -> &[bool] {
        match table {
            BitTable::Coils => &self.coils,
            BitTable::DiscreteInputs => &self.discrete_inputs,
        }
    }

    fn bits_mut(&mut self, table: BitTable) -> &mut [bool] {
        match table {
            BitTable::Coils => &mut self.coils,
            BitTable::DiscreteInputs => &mut self.discrete_inputs,
        }
    }

    fn registers(&self, table: RegisterTable) -> &[u16] {
        match table {
            RegisterTable::HoldingRegisters => &self.holding_registers,
            RegisterTable::InputRegisters => &self.input_registers,
        }
    }

    fn registers_mut(&mut self, table: RegisterTable) -> &mut [u16] {
        match table {
            RegisterTable::HoldingRegisters => &mut self.holding_registers,
            RegisterTable::InputRegisters => &mut self.input_registers,
        }
    }
}

/// Simulated device memory for one slave
pub struct PointStore {
    layout: StoreLayout,
    tables: RwLock<Tables>,
    events: broadcast::Sender<PointEvent>,
}

impl std::fmt::Debug for PointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointStore")
            .field("layout", &self.layout)
            .field("subscribers", &self.events.receiver_count())
            .finish()
    }
}

impl Default for PointStore {
    fn default() -> Self {
        Self::with_layout(StoreLayout::default())
    }
}

impl PointStore {
    /// Create a zeroed store; fails if any table size is outside 1..=65536
    pub fn new(layout: StoreLayout) -> Result<Self> {
        layout.validate()?;
        Ok(Self::with_layout(layout))
    }

    fn with_layout(layout: StoreLayout) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tables: RwLock::new(Tables {
                coils: vec![false; layout.coils],
                discrete_inputs: vec![false; layout.discrete_inputs],
                holding_registers: vec![0; layout.holding_registers],
                input_registers: vec![0; layout.input_registers],
            }),
            layout,
            events,
        }
    }

    pub fn layout(&self) -> StoreLayout {
        self.layout
    }

    /// Receive a [`PointEvent`] for every successful access from now on
    pub fn subscribe(&self) -> broadcast::Receiver<PointEvent> {
        self.events.subscribe()
    }

    pub fn read_bits(&self, table: BitTable, start: u16, count: usize) -> Result<Vec<bool>> {
        let tables = self.tables.read();
        let slot = tables.bits(table);
        let range = check_range(table.into(), start, count, slot.len())?;
        let values = slot[range].to_vec();
        self.emit(PointEventKind::Read, table.into(), start, || {
            PointValues::Bits(values.clone())
        });
        Ok(values)
    }

    /// Replace `values.len()` bits starting at `start`
    pub fn write_bits(&self, table: BitTable, start: u16, values: &[bool]) -> Result<()> {
        let mut tables = self.tables.write();
        let slot = tables.bits_mut(table);
        let range = check_range(table.into(), start, values.len(), slot.len())?;
        slot[range].copy_from_slice(values);
        self.emit(PointEventKind::Written, table.into(), start, || {
            PointValues::Bits(values.to_vec())
        });
        Ok(())
    }

    pub fn read_registers(
        &self,
        table: RegisterTable,
        start: u16,
        count: usize,
    ) -> Result<Vec<u16>> {
        let tables = self.tables.read();
        let slot = tables.registers(table);
        let range = check_range(table.into(), start, count, slot.len())?;
        let values = slot[range].to_vec();
        self.emit(PointEventKind::Read, table.into(), start, || {
            PointValues::Registers(values.clone())
        });
        Ok(values)
    }

    /// Replace `values.len()` registers starting at `start`
    pub fn write_registers(&self, table: RegisterTable, start: u16, values: &[u16]) -> Result<()> {
        let mut tables = self.tables.write();
        let slot = tables.registers_mut(table);
        let range = check_range(table.into(), start, values.len(), slot.len())?;
        slot[range].copy_from_slice(values);
        self.emit(PointEventKind::Written, table.into(), start, || {
            PointValues::Registers(values.to_vec())
        });
        Ok(())
    }

    /// Write holding registers, then read holding registers, under one lock.
    ///
    /// Both ranges are checked before anything is written.
    pub fn write_then_read_registers(
        &self,
        write_start: u16,
        values: &[u16],
        read_start: u16,
        read_count: usize,
    ) -> Result<Vec<u16>> {
        let point_type = PointType::HoldingRegisters;
        let mut tables = self.tables.write();
        let size = tables.holding_registers.len();
        let write_range = check_range(point_type, write_start, values.len(), size)?;
        let read_range = check_range(point_type, read_start, read_count, size)?;
        tables.holding_registers[write_range].copy_from_slice(values);
        let result = tables.holding_registers[read_range].to_vec();

        self.emit(PointEventKind::Written, point_type, write_start, || {
            PointValues::Registers(values.to_vec())
        });
        self.emit(PointEventKind::Read, point_type, read_start, || {
            PointValues::Registers(result.clone())
        });
        Ok(result)
    }

    /// Publish an event; callers hold the table lock.
    ///
    /// `values` is only evaluated when someone is subscribed.
    fn emit<F>(&self, kind: PointEventKind, point_type: PointType, start_address: u16, values: F)
    where
        F: FnOnce() -> PointValues,
    {
        if self.events.receiver_count() == 0 {
            return;
        }
        let values = values();
        trace!(
            "Point event: {:?} {} start={} count={}",
            kind,
            point_type,
            start_address,
            values.len()
        );
        // Subscriber may drop between the count check and the send
        let _ = self.events.send(PointEvent {
            kind,
            point_type,
            start_address,
            values,
        });
    }
}

fn check_range(
    point_type: PointType,
    start: u16,
    count: usize,
    size: usize,
) -> Result<std::ops::Range<usize>> {
    let begin = start as usize;
    let end = begin + count;
    if end > MAX_POINTS || end > size {
        trace!(
            "Range rejected: {} start={} count={} size={}",
            point_type,
            start,
            count,
            size
        );
        return Err(SlaveError::AddressOutOfRange { start, count, size });
    }
    Ok(begin..end)
}

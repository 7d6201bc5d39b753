//! VoltageEMS Modbus Slave Engine
//!
//! Modbus-over-TCP slave (server) engine: MBAP framing, a per-function-code
//! handler registry, simulated device memory, unit-id routing with broadcast
//! semantics and a per-connection request loop.
//!
//! # Architecture
//!
//! ```text
//! ConnectionLoop ─▶ FrameCodec::try_extract_frame ─▶ SlaveNetwork::dispatch
//!       ▲                                                  │
//!       │                                      Slave::apply_request
//!       │                                                  │
//!  FrameCodec::encode_response ◀── response PDU ◀── FunctionRegistry ─▶ PointStore
//! ```
//!
//! The engine does not accept sockets itself. The hosting service owns the
//! listener and hands each accepted stream to [`ConnectionLoop::run`], or
//! feeds raw bytes to [`handle_bytes`] directly.

pub mod codec;
pub mod connection;
pub mod constants;
pub mod error;
pub mod functions;
pub mod hex;
pub mod pdu;
pub mod registry;
pub mod slave;
pub mod store;

pub use codec::{FrameCodec, MbapHeader, ModbusMessage, RawFrame, TcpFrameCodec};
pub use connection::{
    handle_bytes, ConnectionLoop, ConnectionPhase, ConnectionState, ConnectionStats,
    HandleOutcome,
};
pub use error::{ExceptionCode, Result, SlaveError};
pub use pdu::{ModbusPdu, PduBuilder};
pub use registry::{FunctionHandler, FunctionRegistry, FunctionRegistryBuilder, FunctionService};
pub use slave::{Slave, SlaveNetwork};
pub use store::{
    BitTable, PointEvent, PointEventKind, PointStore, PointType, PointValues, RegisterTable,
    StoreLayout,
};

//! Slaves and the network that routes requests to them

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::codec::ModbusMessage;
use crate::constants::{BROADCAST_UNIT_ID, MAX_UNIT_ID};
use crate::error::{Result, SlaveError};
use crate::pdu::function_code_description;
use crate::registry::FunctionRegistry;
use crate::store::PointStore;

/// A unit identifier bound to one point store
#[derive(Debug)]
pub struct Slave {
    unit_id: u8,
    store: Arc<PointStore>,
    registry: Arc<FunctionRegistry>,
}

impl Slave {
    pub fn new(unit_id: u8, store: Arc<PointStore>, registry: Arc<FunctionRegistry>) -> Self {
        Self {
            unit_id,
            store,
            registry,
        }
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    /// Point store backing this slave
    pub fn store(&self) -> &Arc<PointStore> {
        &self.store
    }

    /// Run `request` against this slave's store.
    ///
    /// The response carries this slave's unit id; its transaction id is 0 and
    /// is filled in by the caller.
    pub fn apply_request(&self, request: &ModbusMessage) -> Result<ModbusMessage> {
        let fc = request.function_code;
        if request.pdu.is_exception() {
            return Err(SlaveError::UnsupportedFunctionCode(fc));
        }

        let handler = self
            .registry
            .lookup(fc)
            .ok_or(SlaveError::UnsupportedFunctionCode(fc))?;

        let pdu = handler.apply(&request.pdu, &self.store)?;
        Ok(ModbusMessage {
            transaction_id: 0,
            slave_address: self.unit_id,
            function_code: pdu.function_code().unwrap_or(fc),
            pdu,
        })
    }
}

/// All slaves hosted on this endpoint, shared by every connection
#[derive(Debug)]
pub struct SlaveNetwork {
    registry: Arc<FunctionRegistry>,
    slaves: RwLock<HashMap<u8, Arc<Slave>>>,
}

impl SlaveNetwork {
    pub fn new(registry: Arc<FunctionRegistry>) -> Self {
        Self {
            registry,
            slaves: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    /// Register a slave under `unit_id` (1..=247)
    pub fn add_slave(&self, unit_id: u8, store: Arc<PointStore>) -> Result<Arc<Slave>> {
        if unit_id == BROADCAST_UNIT_ID || unit_id > MAX_UNIT_ID {
            return Err(SlaveError::InvalidUnitId(unit_id));
        }

        let slave = Arc::new(Slave::new(unit_id, store, Arc::clone(&self.registry)));
        {
            let mut slaves = self.slaves.write();
            if slaves.contains_key(&unit_id) {
                return Err(SlaveError::DuplicateUnitId(unit_id));
            }
            slaves.insert(unit_id, Arc::clone(&slave));
        }

        info!("Slave {} added", unit_id);
        Ok(slave)
    }

    /// Remove a slave; no-op when absent
    pub fn remove_slave(&self, unit_id: u8) -> Option<Arc<Slave>> {
        let removed = self.slaves.write().remove(&unit_id);
        if removed.is_some() {
            info!("Slave {} removed", unit_id);
        }
        removed
    }

    pub fn get_slave(&self, unit_id: u8) -> Option<Arc<Slave>> {
        self.slaves.read().get(&unit_id).cloned()
    }

    /// Registered unit ids in ascending order
    pub fn unit_ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.slaves.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.slaves.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slaves.read().is_empty()
    }

    /// Route a request and produce the response to send, if any.
    ///
    /// - Broadcast (unit 0): applied to every slave, failures logged per slave,
    ///   never answered.
    /// - Unknown unit: ignored.
    /// - Known unit: errors with an exception mapping become exception
    ///   responses; any other error is returned as `UnicastHandler`.
    ///
    /// No lock is held while handlers run.
    pub fn dispatch(&self, request: &ModbusMessage) -> Result<Option<ModbusMessage>> {
        if request.is_broadcast() {
            self.broadcast(request);
            return Ok(None);
        }

        let Some(slave) = self.get_slave(request.slave_address) else {
            debug!(
                "Request for unknown unit {} ignored (FC={:02X})",
                request.slave_address, request.function_code
            );
            return Ok(None);
        };

        match slave.apply_request(request) {
            Ok(mut response) => {
                response.transaction_id = request.transaction_id;
                Ok(Some(response))
            },
            Err(err) => match err.exception_code() {
                Some(code) => {
                    debug!(
                        "Unit {} FC={:02X} ({}) answered with exception {}: {}",
                        request.slave_address,
                        request.function_code,
                        function_code_description(request.function_code),
                        code,
                        err
                    );
                    Ok(Some(ModbusMessage::exception(request, code)))
                },
                None => {
                    warn!(
                        "Unit {} FC={:02X} handler failed: {}",
                        request.slave_address, request.function_code, err
                    );
                    Err(SlaveError::UnicastHandler {
                        unit_id: request.slave_address,
                        message: err.to_string(),
                    })
                },
            },
        }
    }

    /// Log-and-continue: one slave failing never stops its siblings
    fn broadcast(&self, request: &ModbusMessage) {
        let snapshot: Vec<Arc<Slave>> = self.slaves.read().values().cloned().collect();

        let mut applied = 0usize;
        for slave in &snapshot {
            match slave.apply_request(request) {
                Ok(_) => applied += 1,
                Err(err) => {
                    error!(
                        "Broadcast FC={:02X} failed on unit {}: {}",
                        request.function_code,
                        slave.unit_id(),
                        err
                    );
                },
            }
        }

        debug!(
            "Broadcast FC={:02X} applied to {}/{} slaves",
            request.function_code,
            applied,
            snapshot.len()
        );
    }
}

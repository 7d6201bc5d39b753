//! TCP hosting for the slave network
//!
//! Accepts connections, filters peers against the allow-list and runs one
//! `ConnectionLoop` task per client. All tasks share the server's
//! cancellation token, so cancelling it stops the accept loop and every open
//! connection.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use voltage_slave::{
    ConnectionLoop, FunctionRegistry, PointEventKind, PointValues, SlaveNetwork,
};

use crate::config::{ServiceConfig, SlavesrvConfig};
use crate::Result;

/// Back-off after a failed accept (e.g. file descriptor exhaustion)
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Build the slave network described by `config`, with seeded stores
pub fn build_network(config: &SlavesrvConfig) -> Result<Arc<SlaveNetwork>> {
    let registry = Arc::new(FunctionRegistry::default());
    let network = Arc::new(SlaveNetwork::new(registry));

    for slave in &config.slaves {
        let store = slave
            .build_store()
            .with_context(|| format!("Failed to build store for unit {}", slave.unit_id))?;
        network.add_slave(slave.unit_id, store)?;
    }

    Ok(network)
}

/// Max values rendered per event log line
const LOGGED_VALUES: usize = 16;

/// `[1, 0, 1]` for bits, `[0x002A, 0x0001]` for registers; long ranges are cut
pub fn format_values(values: &PointValues) -> String {
    let mut items: Vec<String> = match values {
        PointValues::Bits(bits) => bits
            .iter()
            .take(LOGGED_VALUES)
            .map(|bit| u8::from(*bit).to_string())
            .collect(),
        PointValues::Registers(registers) => registers
            .iter()
            .take(LOGGED_VALUES)
            .map(|register| format!("0x{:04X}", register))
            .collect(),
    };
    if values.len() > LOGGED_VALUES {
        items.push(format!("... +{}", values.len() - LOGGED_VALUES));
    }
    format!("[{}]", items.join(", "))
}

/// Log written point ranges, with their values, of every registered slave at debug level
pub fn spawn_point_event_loggers(
    network: &SlaveNetwork,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    network
        .unit_ids()
        .into_iter()
        .filter_map(|unit_id| network.get_slave(unit_id))
        .map(|slave| {
            let unit_id = slave.unit_id();
            let mut events = slave.store().subscribe();
            let cancel = cancel.clone();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = events.recv() => match event {
                            Ok(event) if event.kind == PointEventKind::Written => {
                                debug!(
                                    "Unit {} {} written: start={} count={} values={}",
                                    unit_id,
                                    event.point_type,
                                    event.start_address,
                                    event.count(),
                                    format_values(&event.values)
                                );
                            },
                            Ok(_) => {},
                            Err(RecvError::Lagged(skipped)) => {
                                warn!(
                                    "Unit {} event logger lagged, {} events skipped",
                                    unit_id, skipped
                                );
                            },
                            Err(RecvError::Closed) => break,
                        },
                    }
                }
            })
        })
        .collect()
}

/// Accept loop serving a `SlaveNetwork`
pub struct SlaveServer {
    network: Arc<SlaveNetwork>,
    allowed_clients: HashSet<IpAddr>,
    read_buffer_size: usize,
    cancel: CancellationToken,
}

impl SlaveServer {
    pub fn new(
        config: &ServiceConfig,
        network: Arc<SlaveNetwork>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            network,
            allowed_clients: config.allowed_clients.iter().copied().collect(),
            read_buffer_size: config.read_buffer_size,
            cancel,
        }
    }

    /// Bind the configured address
    pub async fn bind(config: &ServiceConfig) -> Result<TcpListener> {
        TcpListener::bind(&config.bind_address)
            .await
            .with_context(|| format!("Failed to bind to {}", config.bind_address))
    }

    /// An empty allow-list admits every peer
    pub fn is_allowed(&self, peer: &SocketAddr) -> bool {
        self.allowed_clients.is_empty() || self.allowed_clients.contains(&peer.ip())
    }

    /// Serve until the cancellation token fires, then wait for open
    /// connections to wind down.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        info!("Modbus slave server listening on {}", local);

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if !self.is_allowed(&peer) {
                            warn!("Rejected connection from {} (not in allowed clients)", peer);
                            continue;
                        }

                        info!("Accepted Modbus connection from {}", peer);
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                        }

                        let connection = ConnectionLoop::new(
                            Arc::clone(&self.network),
                            self.cancel.child_token(),
                        )
                        .read_buffer_size(self.read_buffer_size);

                        connections.spawn(async move {
                            let peer = peer.to_string();
                            if let Err(e) = connection.run(stream, &peer).await {
                                debug!("Connection task for {} ended: {}", peer, e);
                            }
                        });
                    },
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                    },
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!("Connection task failed: {}", e);
                    }
                },
            }
        }

        info!(
            "Accept loop stopped, waiting for {} open connection(s)",
            connections.len()
        );
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                error!("Connection task failed: {}", e);
            }
        }
        info!("Modbus slave server stopped");

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::{SeedRange, SlaveConfig};
    use voltage_slave::{RegisterTable, StoreLayout};

    fn service(allowed: &[&str]) -> ServiceConfig {
        ServiceConfig {
            allowed_clients: allowed.iter().map(|ip| ip.parse().unwrap()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_allow_list() {
        let network = Arc::new(SlaveNetwork::new(Arc::new(FunctionRegistry::default())));

        let open = SlaveServer::new(
            &service(&[]),
            Arc::clone(&network),
            CancellationToken::new(),
        );
        assert!(open.is_allowed(&"10.0.0.9:40000".parse().unwrap()));

        let restricted = SlaveServer::new(
            &service(&["127.0.0.1", "::1"]),
            network,
            CancellationToken::new(),
        );
        assert!(restricted.is_allowed(&"127.0.0.1:40000".parse().unwrap()));
        assert!(restricted.is_allowed(&"[::1]:40000".parse().unwrap()));
        assert!(!restricted.is_allowed(&"10.0.0.9:40000".parse().unwrap()));
    }

    #[test]
    fn test_build_network_registers_seeded_slaves() {
        let mut first = SlaveConfig {
            unit_id: 1,
            layout: StoreLayout::uniform(16),
            seed: Default::default(),
        };
        first.seed.holding_registers = vec![SeedRange {
            address: 2,
            values: vec![7, 8],
        }];
        let second = SlaveConfig {
            unit_id: 9,
            layout: StoreLayout::default(),
            seed: Default::default(),
        };
        let config = SlavesrvConfig {
            slaves: vec![first, second],
            ..Default::default()
        };

        let network = build_network(&config).unwrap();
        assert_eq!(network.unit_ids(), vec![1, 9]);

        let store = Arc::clone(network.get_slave(1).unwrap().store());
        assert_eq!(store.layout(), StoreLayout::uniform(16));
        assert_eq!(
            store
                .read_registers(RegisterTable::HoldingRegisters, 2, 2)
                .unwrap(),
            vec![7, 8]
        );
    }

    #[test]
    fn test_format_values() {
        assert_eq!(
            format_values(&PointValues::Bits(vec![true, false, true])),
            "[1, 0, 1]"
        );
        assert_eq!(
            format_values(&PointValues::Registers(vec![42, 0xBEEF])),
            "[0x002A, 0xBEEF]"
        );

        let long = format_values(&PointValues::Registers(vec![0; LOGGED_VALUES + 4]));
        assert!(long.ends_with(", ... +4]"));
    }

    #[tokio::test]
    async fn test_event_loggers_stop_on_cancel() {
        let config = SlavesrvConfig {
            slaves: vec![SlaveConfig {
                unit_id: 3,
                layout: StoreLayout::uniform(8),
                seed: Default::default(),
            }],
            ..Default::default()
        };
        let network = build_network(&config).unwrap();
        let cancel = CancellationToken::new();

        let handles = spawn_point_event_loggers(&network, cancel.clone());
        assert_eq!(handles.len(), 1);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}

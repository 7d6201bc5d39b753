//! slavesrv integration tests over real TCP sockets

// Allow unwrap() in tests for cleaner test code
#![allow(clippy::disallowed_methods)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use slavesrv::config::{SeedRange, ServiceConfig, SlaveConfig, SlavesrvConfig};
use slavesrv::server::{self, SlaveServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use voltage_slave::{RegisterTable, StoreLayout};

fn test_config(allowed_clients: &[&str]) -> SlavesrvConfig {
    let mut slave = SlaveConfig {
        unit_id: 1,
        layout: StoreLayout::uniform(256),
        seed: Default::default(),
    };
    slave.seed.holding_registers = vec![SeedRange {
        address: 0,
        values: vec![0x1234, 0x5678],
    }];

    SlavesrvConfig {
        service: ServiceConfig {
            bind_address: "127.0.0.1:0".to_string(),
            allowed_clients: allowed_clients.iter().map(|ip| ip.parse().unwrap()).collect(),
            read_buffer_size: 16,
        },
        slaves: vec![slave],
        ..Default::default()
    }
}

struct RunningServer {
    addr: std::net::SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<anyhow::Result<()>>,
    network: Arc<voltage_slave::SlaveNetwork>,
}

async fn start(config: &SlavesrvConfig) -> RunningServer {
    config.validate().unwrap();
    let network = server::build_network(config).unwrap();
    let cancel = CancellationToken::new();

    let listener = TcpListener::bind(&config.service.bind_address)
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let server = SlaveServer::new(&config.service, Arc::clone(&network), cancel.clone());
    let task = tokio::spawn(async move { server.serve(listener).await });

    RunningServer {
        addr,
        cancel,
        task,
        network,
    }
}

#[tokio::test]
async fn test_serves_seeded_registers_and_writes() {
    let running = start(&test_config(&[])).await;
    let mut client = TcpStream::connect(running.addr).await.unwrap();

    // FC03 read 2 holding registers from 0
    client
        .write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x02])
        .await
        .unwrap();
    let mut response = [0u8; 13];
    client.read_exact(&mut response).await.unwrap();
    assert_eq!(
        response,
        [0x00, 0x01, 0x00, 0x00, 0x00, 0x07, 0x01, 0x03, 0x04, 0x12, 0x34, 0x56, 0x78]
    );

    // FC06 write 42 to register 10
    let write = [0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x0A, 0x00, 0x2A];
    client.write_all(&write).await.unwrap();
    let mut response = [0u8; 12];
    client.read_exact(&mut response).await.unwrap();
    assert_eq!(response, write);

    let store = Arc::clone(running.network.get_slave(1).unwrap().store());
    assert_eq!(
        store
            .read_registers(RegisterTable::HoldingRegisters, 10, 1)
            .unwrap(),
        vec![42]
    );

    running.cancel.cancel();
    running.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_out_of_layout_read_answers_exception() {
    let running = start(&test_config(&[])).await;
    let mut client = TcpStream::connect(running.addr).await.unwrap();

    // Layout holds 256 registers; 0x00FF + 2 runs past the end
    client
        .write_all(&[0x00, 0x07, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0xFF, 0x00, 0x02])
        .await
        .unwrap();
    let mut response = [0u8; 9];
    client.read_exact(&mut response).await.unwrap();
    assert_eq!(
        response,
        [0x00, 0x07, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02]
    );

    running.cancel.cancel();
    running.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_rejects_peer_not_in_allowed_clients() {
    let running = start(&test_config(&["192.0.2.10"])).await;
    let mut client = TcpStream::connect(running.addr).await.unwrap();

    let _ = client
        .write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01])
        .await;
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .unwrap();
    // Dropped right after accept: EOF or reset, never a response
    assert!(matches!(read, Ok(0) | Err(_)));

    running.cancel.cancel();
    running.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_cancel_closes_open_connections() {
    let running = start(&test_config(&[])).await;
    let mut client = TcpStream::connect(running.addr).await.unwrap();

    // Round trip first so the connection task is known to be running
    let write = [0x00, 0x03, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x01, 0x00, 0x01];
    client.write_all(&write).await.unwrap();
    let mut response = [0u8; 12];
    client.read_exact(&mut response).await.unwrap();

    running.cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), running.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[test]
fn test_bundled_config_is_valid() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/slavesrv.yaml");
    let config = SlavesrvConfig::load(&path).unwrap();
    config.validate().unwrap();

    assert_eq!(config.slaves.len(), 2);
    let network = server::build_network(&config).unwrap();
    assert_eq!(network.unit_ids(), vec![1, 2]);
    assert_eq!(network.get_slave(2).unwrap().store().layout().coils, 1024);
}

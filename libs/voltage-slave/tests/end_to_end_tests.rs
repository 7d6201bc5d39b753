//! End-to-end tests for the slave engine
//!
//! Requests travel as raw MBAP bytes, either through `handle_bytes` directly
//! or over an in-memory duplex stream driven by `ConnectionLoop`.

// Allow unwrap() in tests for cleaner test code
#![allow(clippy::disallowed_methods)]

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use voltage_slave::{
    handle_bytes, ConnectionLoop, ConnectionState, FunctionRegistry, PointStore, RegisterTable,
    SlaveError, SlaveNetwork, TcpFrameCodec,
};

const READ_HOLDING_0_2: [u8; 12] = [
    0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x02,
];
const WRITE_REGISTER_10_42: [u8; 12] = [
    0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x0A, 0x00, 0x2A,
];

fn network_with_unit_1() -> (Arc<SlaveNetwork>, Arc<PointStore>) {
    let network = Arc::new(SlaveNetwork::new(Arc::new(FunctionRegistry::default())));
    let store = Arc::new(PointStore::default());
    network.add_slave(1, Arc::clone(&store)).unwrap();
    (network, store)
}

/// Feed `chunks` one by one, draining after each, and collect all output
fn feed(network: &SlaveNetwork, chunks: &[&[u8]]) -> Vec<u8> {
    let mut state = ConnectionState::new();
    let mut out = Vec::new();
    for chunk in chunks {
        let mut incoming = *chunk;
        loop {
            let outcome = handle_bytes(network, &TcpFrameCodec, &mut state, incoming).unwrap();
            incoming = &[];
            out.extend_from_slice(&outcome.outgoing);
            state.mark_written();
            if outcome.consumed == 0 {
                break;
            }
        }
    }
    out
}

// ============================================================================
// handle_bytes
// ============================================================================

#[test]
fn test_read_holding_registers_zero_store() {
    let (network, _) = network_with_unit_1();
    let out = feed(&network, &[&READ_HOLDING_0_2]);
    // Length = unit id + 6 PDU bytes
    assert_eq!(
        out,
        vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x07, 0x01, 0x03, 0x04, 0x00, 0x00, 0x00, 0x00]
    );
}

#[test]
fn test_write_single_register_scenario() {
    let (network, store) = network_with_unit_1();
    let out = feed(&network, &[&WRITE_REGISTER_10_42]);

    assert_eq!(out, WRITE_REGISTER_10_42.to_vec());
    assert_eq!(
        store
            .read_registers(RegisterTable::HoldingRegisters, 10, 1)
            .unwrap(),
        vec![42]
    );
}

#[test]
fn test_split_delivery_matches_whole_delivery() {
    let mut request = WRITE_REGISTER_10_42.to_vec();
    request.extend_from_slice(&READ_HOLDING_0_2);

    let (whole_network, _) = network_with_unit_1();
    let expected = feed(&whole_network, &[&request]);

    for cut in 1..request.len() {
        let (network, store) = network_with_unit_1();
        let out = feed(&network, &[&request[..cut], &request[cut..]]);
        assert_eq!(out, expected, "split at byte {}", cut);
        assert_eq!(
            store
                .read_registers(RegisterTable::HoldingRegisters, 10, 1)
                .unwrap(),
            vec![42]
        );
    }
}

#[test]
fn test_unknown_function_code_answers_illegal_function() {
    let (network, _) = network_with_unit_1();
    let request = [0x00, 0x09, 0x00, 0x00, 0x00, 0x03, 0x01, 0x99, 0x00];
    let out = feed(&network, &[&request, &WRITE_REGISTER_10_42]);

    let mut expected = vec![0x00, 0x09, 0x00, 0x00, 0x00, 0x03, 0x01, 0x99 | 0x80, 0x01];
    expected.extend_from_slice(&WRITE_REGISTER_10_42);
    assert_eq!(out, expected);
}

#[test]
fn test_broadcast_applies_everywhere_and_is_silent() {
    let (network, store_1) = network_with_unit_1();
    let store_2 = Arc::new(PointStore::default());
    network.add_slave(2, Arc::clone(&store_2)).unwrap();

    // FC10 to unit 0: registers 100..102 = [1, 2]
    let request = [
        0x00, 0x05, 0x00, 0x00, 0x00, 0x0B, 0x00, 0x10, 0x00, 0x64, 0x00, 0x02, 0x04, 0x00,
        0x01, 0x00, 0x02,
    ];
    let out = feed(&network, &[&request]);
    assert!(out.is_empty());

    for store in [store_1, store_2] {
        assert_eq!(
            store
                .read_registers(RegisterTable::HoldingRegisters, 100, 2)
                .unwrap(),
            vec![1, 2]
        );
    }
}

#[test]
fn test_unknown_unit_is_silent() {
    let (network, _) = network_with_unit_1();
    let mut request = READ_HOLDING_0_2;
    request[6] = 0x11;
    assert!(feed(&network, &[&request]).is_empty());
}

#[test]
fn test_out_of_range_read_answers_illegal_address() {
    let (network, _) = network_with_unit_1();
    // Start 0xFFFF, quantity 2
    let request = [0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x04, 0xFF, 0xFF, 0x00, 0x02];
    let out = feed(&network, &[&request]);
    assert_eq!(out, vec![0x00, 0x02, 0x00, 0x00, 0x00, 0x03, 0x01, 0x84, 0x02]);
}

#[test]
fn test_bad_protocol_id_is_fatal() {
    let (network, _) = network_with_unit_1();
    let mut request = READ_HOLDING_0_2;
    request[3] = 0x01;

    let mut state = ConnectionState::new();
    let err = handle_bytes(&network, &TcpFrameCodec, &mut state, &request).unwrap_err();
    assert!(matches!(err, SlaveError::Framing(_)));
}

// ============================================================================
// ConnectionLoop over a duplex stream
// ============================================================================

#[tokio::test]
async fn test_connection_loop_round_trip() {
    let (network, store) = network_with_unit_1();
    let (mut client, server) = tokio::io::duplex(1024);
    let cancel = CancellationToken::new();

    let connection = ConnectionLoop::new(Arc::clone(&network), cancel.clone());
    let task = tokio::spawn(async move { connection.run(server, "duplex").await });

    // Header and body in separate writes
    client.write_all(&WRITE_REGISTER_10_42[..5]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    client.write_all(&WRITE_REGISTER_10_42[5..]).await.unwrap();

    let mut response = [0u8; 12];
    client.read_exact(&mut response).await.unwrap();
    assert_eq!(response, WRITE_REGISTER_10_42);

    client.write_all(&READ_HOLDING_0_2).await.unwrap();
    let mut response = [0u8; 13];
    client.read_exact(&mut response).await.unwrap();
    assert_eq!(&response[7..], &[0x03, 0x04, 0x00, 0x00, 0x00, 0x00]);

    drop(client);
    let stats = task.await.unwrap().unwrap();
    assert_eq!(stats.frames_received, 2);
    assert_eq!(stats.responses_sent, 2);
    assert_eq!(stats.bytes_received, 24);
    assert_eq!(stats.bytes_sent, 25);
    assert_eq!(
        store
            .read_registers(RegisterTable::HoldingRegisters, 10, 1)
            .unwrap(),
        vec![42]
    );
}

#[tokio::test]
async fn test_connection_loop_cancellation() {
    let (network, _) = network_with_unit_1();
    let (_client, server) = tokio::io::duplex(64);
    let cancel = CancellationToken::new();

    let connection = ConnectionLoop::new(network, cancel.clone());
    let task = tokio::spawn(async move { connection.run(server, "duplex").await });

    cancel.cancel();
    let stats = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(stats.frames_received, 0);
}

#[tokio::test]
async fn test_connection_loop_eof_mid_frame() {
    let (network, _) = network_with_unit_1();
    let (mut client, server) = tokio::io::duplex(64);

    let connection = ConnectionLoop::new(network, CancellationToken::new());
    let task = tokio::spawn(async move { connection.run(server, "duplex").await });

    client.write_all(&READ_HOLDING_0_2[..8]).await.unwrap();
    drop(client);

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, SlaveError::Framing(_)));
}

#[tokio::test]
async fn test_framing_error_closes_only_that_connection() {
    let (network, _) = network_with_unit_1();
    let cancel = CancellationToken::new();

    let (mut bad_client, bad_server) = tokio::io::duplex(64);
    let (mut good_client, good_server) = tokio::io::duplex(64);

    let bad = ConnectionLoop::new(Arc::clone(&network), cancel.clone());
    let good = ConnectionLoop::new(Arc::clone(&network), cancel.clone());
    let bad_task = tokio::spawn(async move { bad.run(bad_server, "bad").await });
    let good_task = tokio::spawn(async move { good.run(good_server, "good").await });

    bad_client
        .write_all(&[0x00, 0x01, 0xAB, 0xCD, 0x00, 0x06])
        .await
        .unwrap();
    assert!(bad_task.await.unwrap().is_err());

    // Closed connection yields EOF to its peer
    let mut buf = [0u8; 1];
    assert_eq!(bad_client.read(&mut buf).await.unwrap(), 0);

    good_client.write_all(&WRITE_REGISTER_10_42).await.unwrap();
    let mut response = [0u8; 12];
    good_client.read_exact(&mut response).await.unwrap();
    assert_eq!(response, WRITE_REGISTER_10_42);

    cancel.cancel();
    assert!(good_task.await.unwrap().is_ok());
}

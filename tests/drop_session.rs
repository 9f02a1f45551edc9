//! End-to-end drops: negotiate through a signaling store, then move a file.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use peerdrop::net::{
    ConnectionNegotiator, ConnectionState, DirSignalingStore, LoopbackHub, MemorySignalingStore,
    OutgoingFile, SignalingStore, TcpConfig, TransferConfig, TransferEngine, TransferError,
    TransportFactory,
};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(20);

fn sample_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 256) as u8).collect()
}

/// Runs a full host/joiner drop and returns the received bytes
async fn drop_file<S, F>(store: S, host_factory: F, joiner_factory: F, data: Vec<u8>) -> Vec<u8>
where
    S: SignalingStore + Clone,
    F: TransportFactory,
{
    let host = ConnectionNegotiator::new(store.clone(), host_factory);
    let joiner = ConnectionNegotiator::new(store.clone(), joiner_factory);

    let code = host.create_connection().await.unwrap();
    let joined = joiner.join_connection(code.as_str()).await.unwrap();
    let hosted = host.complete_connection().await.unwrap();
    hosted.wait_open().await.unwrap();
    joined.wait_open().await.unwrap();

    let sender = TransferEngine::new(hosted);
    let receiver = TransferEngine::new(joined);
    let (tx, mut rx) = mpsc::unbounded_channel();
    receiver.on_file_received(move |file| {
        let _ = tx.send(file);
    });

    let mut percents = Vec::new();
    let progress = sender
        .send_file(
            OutgoingFile::new("holiday.jpg", "image/jpeg", data),
            |p| percents.push(p.percent()),
        )
        .await
        .unwrap();
    assert!(progress.is_complete());
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(percents.last().copied(), Some(100.0));

    let file = rx.recv().await.unwrap();
    assert_eq!(file.name.as_ref(), "holiday.jpg");
    assert_eq!(file.media_type.as_ref(), "image/jpeg");

    receiver.close();
    host.teardown().await;
    joiner.teardown().await;
    assert_eq!(store.get(&format!("p2p_offer_{code}")).await.unwrap(), None);
    assert_eq!(store.get(&format!("p2p_answer_{code}")).await.unwrap(), None);

    file.data.to_vec()
}

#[tokio::test]
async fn test_loopback_drop_through_memory_store() {
    let hub = LoopbackHub::new();
    let data = sample_data(50_000);

    let received = timeout(
        TEST_TIMEOUT,
        drop_file(MemorySignalingStore::new(), hub.clone(), hub.clone(), data.clone()),
    )
    .await
    .unwrap();
    assert_eq!(received, data);
    assert_eq!(hub.pending(), 0);
}

#[tokio::test]
async fn test_tcp_drop_through_signal_directory() {
    let temp_dir = TempDir::new().unwrap();
    let store = DirSignalingStore::open(temp_dir.path()).await.unwrap();
    let factory = TcpConfig {
        bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        ..TcpConfig::default()
    };
    let data = sample_data(300_000);

    let received = timeout(
        TEST_TIMEOUT,
        drop_file(store, factory.clone(), factory, data.clone()),
    )
    .await
    .unwrap();
    assert_eq!(received, data);
}

#[tokio::test]
async fn test_transfer_fails_after_peer_leaves() {
    let store = MemorySignalingStore::new();
    let hub = LoopbackHub::new();
    let host = ConnectionNegotiator::new(store.clone(), hub.clone());
    let joiner = ConnectionNegotiator::new(store, hub);

    let code = host.create_connection().await.unwrap();
    let joined = joiner.join_connection(code.as_str()).await.unwrap();
    let hosted = host.complete_connection().await.unwrap();

    let sender = TransferEngine::with_config(hosted, TransferConfig::with_chunk_size(1024));
    let (tx, mut rx) = mpsc::unbounded_channel();
    sender.on_connection_state_change(move |state| {
        let _ = tx.send(state);
    });

    drop(joined);
    assert_eq!(rx.recv().await, Some(ConnectionState::Closed));

    let result = sender
        .send_file(OutgoingFile::new("late.txt", "text/plain", vec![1u8; 4096]), |_| {})
        .await;
    assert!(matches!(result, Err(TransferError::ChannelNotReady)));
}

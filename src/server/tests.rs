use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::io::DuplexStream;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use super::*;
use crate::error::SyncError;
use crate::protocol::{
    BoxedStream, ControlStream, Envelope, FileSyncMessage, FramedTransport, ProtocolError,
    SignalAction, SignalMessage,
};
use crate::types::{EvictionPolicy, ServerConfig};

fn local_config() -> ServerConfig {
    ServerConfig::builder()
        .bind_addr("127.0.0.1:0")
        .handshake_timeout(Duration::from_secs(2))
        .reply_timeout(Duration::from_secs(2))
        .build()
}

fn peer(port: u16) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 1], port))
}

fn boxed(stream: impl ControlStream + 'static) -> FramedTransport<BoxedStream> {
    FramedTransport::new(Box::new(stream))
}

/// Register an in-memory client and return the client's end
async fn add_duplex_client(server: &SyncServer, port: u16) -> FramedTransport<DuplexStream> {
    let (server_io, client_io) = tokio::io::duplex(64 * 1024);
    server.registry().register(peer(port), boxed(server_io)).await;
    FramedTransport::new(client_io)
}

/// Register a client whose writes fail
async fn add_failing_client(server: &SyncServer, port: u16) -> Arc<ClientHandle> {
    let mut builder = tokio_test::io::Builder::new();
    for _ in 0..3 {
        builder.write_error(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
    }
    let mock = builder.build();
    server.registry().register(peer(port), boxed(mock)).await
}

async fn expect_signal(client: &mut FramedTransport<DuplexStream>) -> SignalMessage {
    match client.receive_envelope().await.unwrap() {
        Envelope::Signal(signal) => signal,
        other => panic!("expected signal, got {other:?}"),
    }
}

async fn next_event(events: &mut broadcast::Receiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap()
}

/// Answer one who-has query; on `Missing`, read the pushed file
async fn answer_who_has(mut client: FramedTransport<DuplexStream>, have: bool) -> Option<Vec<u8>> {
    match client.receive_envelope().await.unwrap() {
        Envelope::FileSync(FileSyncMessage::WhoHas { .. }) => {}
        other => panic!("expected who-has, got {other:?}"),
    }

    let reply = if have {
        FileSyncMessage::Have
    } else {
        FileSyncMessage::Missing
    };
    client.send_envelope(&reply.into()).await.unwrap();
    if have {
        return None;
    }

    let size = match client.receive_envelope().await.unwrap() {
        Envelope::FileSync(FileSyncMessage::FileSend { file_size, .. }) => file_size,
        other => panic!("expected file send, got {other:?}"),
    };
    let content = client.receive_raw(size as usize).await.unwrap();
    Some(content.to_vec())
}

fn write_temp_file(dir: &tempfile::TempDir, name: &str, len: usize) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let content: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
    std::fs::write(&path, content).unwrap();
    path
}

// --- registry ---

#[tokio::test]
async fn test_registry_register_and_remove() {
    let registry = ClientRegistry::new();
    assert!(registry.is_empty().await);

    let (a, _a_peer) = tokio::io::duplex(64);
    let (b, _b_peer) = tokio::io::duplex(64);
    let first = registry.register(peer(1), boxed(a)).await;
    let second = registry.register(peer(2), boxed(b)).await;

    assert_ne!(first.id(), second.id());
    assert_eq!(registry.len().await, 2);

    let ids: Vec<_> = registry.snapshot().await.iter().map(|h| h.id()).collect();
    assert_eq!(ids, vec![first.id(), second.id()]);

    assert!(registry.remove(first.id()).await.is_some());
    assert!(registry.remove(first.id()).await.is_none());
    assert!(registry.get(first.id()).await.is_none());
    assert_eq!(registry.get(second.id()).await.unwrap().addr(), peer(2));

    assert_eq!(registry.drain().await.len(), 1);
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_snapshot_is_unaffected_by_later_registration() {
    let registry = ClientRegistry::new();
    let (a, _a_peer) = tokio::io::duplex(64);
    registry.register(peer(1), boxed(a)).await;

    let snapshot = registry.snapshot().await;
    let (b, _b_peer) = tokio::io::duplex(64);
    registry.register(peer(2), boxed(b)).await;

    assert_eq!(snapshot.len(), 1);
    assert_eq!(registry.len().await, 2);
}

#[test]
fn test_client_id_display() {
    assert_eq!(ClientId(7).to_string(), "client-7");
}

// --- broadcast ---

#[tokio::test]
async fn test_broadcast_reaches_every_client() {
    let server = SyncServer::new(local_config());
    let mut clients = Vec::new();
    for port in 1..=3 {
        clients.push(add_duplex_client(&server, port).await);
    }

    let before = SystemTime::now();
    let report = server
        .broadcast_signal(SignalAction::Play, Some("song.mp3"), 5)
        .await
        .unwrap();
    assert_eq!(report.delivered, vec![peer(1), peer(2), peer(3)]);
    assert!(report.is_complete());

    for client in &mut clients {
        let signal = expect_signal(client).await;
        assert_eq!(signal.action, SignalAction::Play);
        assert_eq!(signal.file_name.as_deref(), Some("song.mp3"));
        assert_eq!(signal.delay_seconds, 5);
        let target = signal.target_instant();
        assert!(target >= before + Duration::from_secs(4));
    }
}

#[tokio::test]
async fn test_broadcast_isolates_failing_client() {
    let server = SyncServer::new(local_config());
    let mut first = add_duplex_client(&server, 1).await;
    let failing = add_failing_client(&server, 2).await;
    let mut third = add_duplex_client(&server, 3).await;

    let report = server.signal_stop().await.unwrap();
    assert_eq!(report.delivered, vec![peer(1), peer(3)]);
    assert_eq!(report.failed, vec![peer(2)]);
    assert!(!report.is_complete());

    assert_eq!(expect_signal(&mut first).await.action, SignalAction::Stop);
    assert_eq!(expect_signal(&mut third).await.action, SignalAction::Stop);

    // Default policy keeps the failed handle for the next pass
    assert_eq!(server.registry().len().await, 3);
    assert_eq!(failing.consecutive_failures(), 1);
}

#[tokio::test]
async fn test_broadcast_evicts_after_consecutive_failures() {
    let config = ServerConfig {
        eviction: EvictionPolicy::AfterConsecutiveFailures(2),
        ..local_config()
    };
    let server = SyncServer::new(config);
    let mut events = server.subscribe();
    let _good = add_duplex_client(&server, 1).await;
    let failing = add_failing_client(&server, 2).await;

    server.signal_pause().await.unwrap();
    assert_eq!(server.registry().len().await, 2);

    let report = server.signal_resume().await.unwrap();
    assert_eq!(report.failed, vec![peer(2)]);
    assert_eq!(server.registry().len().await, 1);
    assert!(server.registry().get(failing.id()).await.is_none());

    match next_event(&mut events).await {
        ServerEvent::ClientRemoved { id, addr, .. } => {
            assert_eq!(id, failing.id());
            assert_eq!(addr, peer(2));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_broadcast_to_closed_client() {
    let server = SyncServer::new(local_config());
    let closed = add_duplex_client(&server, 1).await;
    let mut open = add_duplex_client(&server, 2).await;
    drop(closed);

    let report = server.signal_stop().await.unwrap();
    assert_eq!(report.delivered, vec![peer(2)]);
    assert_eq!(report.failed, vec![peer(1)]);
    assert_eq!(expect_signal(&mut open).await.action, SignalAction::Stop);
}

#[tokio::test]
async fn test_broadcast_play_requires_file_name() {
    let server = SyncServer::new(local_config());
    let err = server
        .broadcast_signal(SignalAction::Play, None, 5)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::InvalidParameter { .. }));
}

#[tokio::test]
async fn test_broadcast_without_clients() {
    let server = SyncServer::new(local_config());
    let report = server.signal_pause().await.unwrap();
    assert!(report.delivered.is_empty());
    assert!(report.failed.is_empty());
}

#[tokio::test]
async fn test_control_signals_use_default_delay() {
    let config = ServerConfig::builder()
        .bind_addr("127.0.0.1:0")
        .default_delay_seconds(2)
        .build();
    let server = SyncServer::new(config);
    let mut client = add_duplex_client(&server, 1).await;

    server.signal_pause().await.unwrap();
    let signal = expect_signal(&mut client).await;
    assert_eq!(signal.action, SignalAction::Pause);
    assert_eq!(signal.delay_seconds, 2);
    assert_eq!(signal.file_name, None);
}

#[tokio::test]
async fn test_broadcast_uses_configured_clock() {
    let server = SyncServer::new(local_config()).with_clock(
        crate::testing::FixedOffsetClock::ahead(Duration::from_secs(3600)),
    );
    let mut client = add_duplex_client(&server, 1).await;

    server.signal_stop().await.unwrap();
    let signal = expect_signal(&mut client).await;
    let sent_at = signal.target_instant() - Duration::from_secs(5);
    assert!(sent_at > SystemTime::now() + Duration::from_secs(3590));
}

// --- file sync ---

#[tokio::test]
async fn test_sync_file_pushes_only_to_missing_clients() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_temp_file(&dir, "song.mp3", 2048);

    let server = SyncServer::new(local_config());
    let has = add_duplex_client(&server, 1).await;
    let lacks = add_duplex_client(&server, 2).await;

    let has_task = tokio::spawn(answer_who_has(has, true));
    let lacks_task = tokio::spawn(answer_who_has(lacks, false));

    let report = server.sync_file(&path).await.unwrap();
    assert_eq!(report.up_to_date, vec![peer(1)]);
    assert_eq!(report.pushed, vec![peer(2)]);
    assert!(report.is_complete());

    assert!(has_task.await.unwrap().is_none());
    assert_eq!(
        lacks_task.await.unwrap().unwrap(),
        std::fs::read(&path).unwrap()
    );
}

#[tokio::test]
async fn test_sync_file_queries_before_pushing() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_temp_file(&dir, "song.mp3", 64);

    let server = SyncServer::new(local_config());
    let mut fast = add_duplex_client(&server, 1).await;
    let mut slow = add_duplex_client(&server, 2).await;

    let fast_task = tokio::spawn(async move {
        fast.receive_envelope().await.unwrap();
        fast.send_envelope(&FileSyncMessage::Missing.into())
            .await
            .unwrap();
        fast.receive_envelope().await.unwrap();
        tokio::time::Instant::now()
    });
    let slow_task = tokio::spawn(async move {
        slow.receive_envelope().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let replied_at = tokio::time::Instant::now();
        slow.send_envelope(&FileSyncMessage::Have.into())
            .await
            .unwrap();
        replied_at
    });

    let report = server.sync_file(&path).await.unwrap();
    assert_eq!(report.pushed, vec![peer(1)]);

    let pushed_at = fast_task.await.unwrap();
    let slow_replied_at = slow_task.await.unwrap();
    assert!(pushed_at >= slow_replied_at);
}

#[tokio::test]
async fn test_sync_file_reply_timeout_removes_client() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_temp_file(&dir, "song.mp3", 16);

    let config = ServerConfig {
        reply_timeout: Duration::from_millis(50),
        ..local_config()
    };
    let server = SyncServer::new(config);
    let _silent = add_duplex_client(&server, 1).await;
    let lacks = add_duplex_client(&server, 2).await;
    let lacks_task = tokio::spawn(answer_who_has(lacks, false));

    let report = server.sync_file(&path).await.unwrap();
    assert_eq!(report.failed, vec![peer(1)]);
    assert_eq!(report.pushed, vec![peer(2)]);
    assert_eq!(server.registry().len().await, 1);
    assert_eq!(lacks_task.await.unwrap().unwrap().len(), 16);
}

#[tokio::test]
async fn test_sync_file_isolates_failed_query() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_temp_file(&dir, "song.mp3", 8);

    let server = SyncServer::new(local_config());
    add_failing_client(&server, 1).await;
    let lacks = add_duplex_client(&server, 2).await;
    let lacks_task = tokio::spawn(answer_who_has(lacks, false));

    let report = server.sync_file(&path).await.unwrap();
    assert_eq!(report.failed, vec![peer(1)]);
    assert_eq!(report.pushed, vec![peer(2)]);
    assert!(lacks_task.await.unwrap().is_some());
}

#[tokio::test]
async fn test_sync_file_unexpected_reply() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_temp_file(&dir, "song.mp3", 8);

    let server = SyncServer::new(local_config());
    let mut confused = add_duplex_client(&server, 1).await;
    let task = tokio::spawn(async move {
        confused.receive_envelope().await.unwrap();
        let signal = SignalMessage::control(SignalAction::Stop, SystemTime::now(), 0);
        confused.send_envelope(&signal.into()).await.unwrap();
        confused
    });

    let report = server.sync_file(&path).await.unwrap();
    assert_eq!(report.failed, vec![peer(1)]);
    assert!(report.pushed.is_empty());
    task.await.unwrap();
}

#[tokio::test]
async fn test_sync_missing_local_file() {
    let dir = tempfile::tempdir().unwrap();
    let server = SyncServer::new(local_config());

    let err = server
        .sync_file(dir.path().join("absent.mp3"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Repository { .. }));
}

#[tokio::test]
async fn test_serve_and_play() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_temp_file(&dir, "track.ogg", 100);

    let server = SyncServer::new(local_config());
    let client = add_duplex_client(&server, 1).await;

    let task = tokio::spawn(async move {
        let mut client = client;
        match client.receive_envelope().await.unwrap() {
            Envelope::FileSync(FileSyncMessage::WhoHas {
                file_name,
                file_size,
            }) => {
                assert_eq!(file_name, "track.ogg");
                assert_eq!(file_size, 100);
            }
            other => panic!("unexpected {other:?}"),
        }
        client
            .send_envelope(&FileSyncMessage::Missing.into())
            .await
            .unwrap();
        client.receive_envelope().await.unwrap();
        client.receive_raw(100).await.unwrap();
        expect_signal(&mut client).await
    });

    let (sync, play) = server.serve_and_play(&path).await.unwrap();
    assert_eq!(sync.pushed, vec![peer(1)]);
    assert_eq!(play.delivered, vec![peer(1)]);

    let signal = task.await.unwrap();
    assert_eq!(signal.action, SignalAction::Play);
    assert_eq!(signal.file_name.as_deref(), Some("track.ogg"));
    assert_eq!(signal.delay_seconds, 5);
}

// --- accept loop ---

async fn greet(addr: SocketAddr, greeting: &[u8]) -> FramedTransport<TcpStream> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut transport = FramedTransport::new(stream);
    transport.send(greeting).await.unwrap();
    transport
}

#[tokio::test]
async fn test_server_registers_greeted_clients() {
    let mut server = SyncServer::new(local_config());
    let mut events = server.subscribe();
    let addr = server.start().await.unwrap();
    assert_eq!(server.state(), ServerState::Listening);
    assert_eq!(next_event(&mut events).await, ServerEvent::Listening { addr });

    let mut client = greet(addr, b"hello").await;
    let local = client.get_ref().local_addr().unwrap();
    match next_event(&mut events).await {
        ServerEvent::ClientRegistered { addr, .. } => assert_eq!(addr, local),
        other => panic!("unexpected event {other:?}"),
    }

    let report = server.signal_pause().await.unwrap();
    assert_eq!(report.delivered, vec![local]);
    match client.receive_envelope().await.unwrap() {
        Envelope::Signal(signal) => assert_eq!(signal.action, SignalAction::Pause),
        other => panic!("unexpected {other:?}"),
    }

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_server_rejects_wrong_greeting() {
    let mut server = SyncServer::new(local_config());
    let addr = server.start().await.unwrap();

    let mut client = greet(addr, b"goodbye").await;
    let result = tokio::time::timeout(Duration::from_secs(5), client.receive())
        .await
        .unwrap();
    assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    assert!(server.registry().is_empty().await);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_server_handshake_timeout() {
    let config = ServerConfig::builder()
        .bind_addr("127.0.0.1:0")
        .handshake_timeout(Duration::from_millis(50))
        .build();
    let mut server = SyncServer::new(config);
    let addr = server.start().await.unwrap();

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut silent = FramedTransport::new(stream);
    let result = tokio::time::timeout(Duration::from_secs(5), silent.receive())
        .await
        .unwrap();
    assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    assert!(server.registry().is_empty().await);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_server_stop_closes_everything() {
    let mut server = SyncServer::new(local_config());
    let mut events = server.subscribe();
    let addr = server.start().await.unwrap();
    next_event(&mut events).await;

    let mut client = greet(addr, b"hello").await;
    next_event(&mut events).await;

    tokio::time::timeout(Duration::from_secs(5), server.stop())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(server.registry().is_empty().await);

    assert!(matches!(
        next_event(&mut events).await,
        ServerEvent::ClientRemoved { .. }
    ));
    assert_eq!(next_event(&mut events).await, ServerEvent::Stopped);

    let result = tokio::time::timeout(Duration::from_secs(5), client.receive())
        .await
        .unwrap();
    assert!(result.is_err());

    // Listener is gone
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_stop_after_abandoned_sync_is_prompt() {
    let mut server = SyncServer::new(
        ServerConfig::builder()
            .bind_addr("127.0.0.1:0")
            .reply_timeout(Duration::from_secs(30))
            .build(),
    );
    server.start().await.unwrap();

    // Client never answers, so the query holds the handle's transport
    let _silent = add_duplex_client(&server, 7000).await;
    let dir = tempfile::tempdir().unwrap();
    let path = write_temp_file(&dir, "song.mp3", 64);

    let abandoned = tokio::time::timeout(Duration::from_millis(100), server.sync_file(&path)).await;
    assert!(abandoned.is_err());

    tokio::time::timeout(Duration::from_secs(2), server.stop())
        .await
        .expect("stop waited on a released transport")
        .unwrap();
    assert!(server.registry().is_empty().await);
}

#[tokio::test]
async fn test_server_start_twice_and_stop_unstarted() {
    let mut server = SyncServer::new(local_config());
    assert!(matches!(server.stop().await, Err(SyncError::NotRunning)));

    server.start().await.unwrap();
    assert!(matches!(server.start().await, Err(SyncError::AlreadyRunning)));
    server.stop().await.unwrap();

    // Restartable
    server.start().await.unwrap();
    server.stop().await.unwrap();
}

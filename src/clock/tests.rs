use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::net::UdpSocket;

use super::*;
use crate::error::{Result, SyncError};
use crate::types::{ClockClientConfig, ClockServiceConfig};

fn local_service_config() -> ClockServiceConfig {
    ClockServiceConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        queue_poll_timeout: Duration::from_millis(20),
        ..ClockServiceConfig::default()
    }
}

// --- timestamps ---

#[test]
fn test_timestamp_unix_epoch() {
    let ts = NtpTimestamp::from_system_time(UNIX_EPOCH);
    assert_eq!(u64::from(ts.seconds), NTP_EPOCH_OFFSET);
    assert_eq!(ts.fraction, 0);
}

#[test]
fn test_timestamp_half_second_fraction() {
    let ts = NtpTimestamp::from_system_time(UNIX_EPOCH + Duration::from_millis(500));
    assert_eq!(ts.fraction, 0x8000_0000);
}

#[test]
fn test_timestamp_system_time_conversion() {
    let time = UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_789);
    let back = NtpTimestamp::from_system_time(time).to_system_time();

    let drift = time
        .duration_since(back)
        .unwrap_or_else(|e| e.duration());
    assert!(drift < Duration::from_micros(1), "drift {drift:?}");
}

#[test]
fn test_timestamp_era_rollover() {
    // 2040-01-01 falls in NTP era 1, where seconds have wrapped
    let time = UNIX_EPOCH + Duration::from_secs(2_208_988_800);
    let ts = NtpTimestamp::from_system_time(time);
    assert!(u64::from(ts.seconds) < NTP_EPOCH_OFFSET);
    assert_eq!(ts.to_system_time(), time);
}

#[test]
fn test_timestamp_offset_millis() {
    let base = NtpTimestamp {
        seconds: 3_900_000_000,
        fraction: 0,
    };
    let later = base.offset_millis(1500);
    assert_eq!(later.diff_micros(&base), 1_500_000);

    let earlier = base.offset_millis(-250);
    assert_eq!(earlier.diff_micros(&base), -250_000);
}

#[test]
fn test_timestamp_bytes() {
    let ts = NtpTimestamp {
        seconds: 0x0102_0304,
        fraction: 0x0506_0708,
    };
    assert_eq!(ts.encode(), [1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(NtpTimestamp::decode(ts.encode()), ts);
}

// --- packets ---

#[test]
fn test_request_layout() {
    let tx = NtpTimestamp {
        seconds: 0xAABB_CCDD,
        fraction: 0x1122_3344,
    };
    let bytes = NtpPacket::request(tx).encode();

    assert_eq!(bytes.len(), 48);
    // LI 0, VN 4, mode 3
    assert_eq!(bytes[0], 0x23);
    assert_eq!(&bytes[40..48], &tx.encode());
    assert!(bytes[1..40].iter().all(|b| *b == 0));
}

#[test]
fn test_response_fields() {
    let request = NtpPacket::request(NtpTimestamp {
        seconds: 7,
        fraction: 9,
    });
    let recv = NtpTimestamp {
        seconds: 100,
        fraction: 1,
    };
    let tx = NtpTimestamp {
        seconds: 100,
        fraction: 2,
    };

    let bytes = NtpPacket::response(&request, recv, tx).encode();
    // LI 0, VN 4, mode 4
    assert_eq!(bytes[0], 0x24);
    assert_eq!(bytes[1], 2);
    assert_eq!(bytes[2], 10);

    let decoded = NtpPacket::decode(&bytes).unwrap();
    assert_eq!(decoded.mode, NtpMode::Server);
    assert_eq!(decoded.origin_time, request.transmit_time);
    assert_eq!(decoded.reference_time, recv);
    assert_eq!(decoded.receive_time, recv);
    assert_eq!(decoded.transmit_time, tx);
}

#[test]
fn test_decode_short_packet() {
    let err = NtpPacket::decode(&[0x23; 47]).unwrap_err();
    assert!(matches!(
        err,
        NtpDecodeError::BufferTooSmall {
            needed: 48,
            have: 47
        }
    ));
}

#[test]
fn test_decode_ignores_extension_bytes() {
    let mut bytes = NtpPacket::request(NtpTimestamp::now()).encode().to_vec();
    bytes.extend_from_slice(&[0xFF; 20]);
    assert_eq!(NtpPacket::decode(&bytes).unwrap().mode, NtpMode::Client);
}

// --- service and client ---

#[tokio::test]
async fn test_service_answers_query() {
    let mut service = ClockService::new(local_service_config());
    let addr = service.start().await.unwrap();
    assert_eq!(service.state(), ServiceState::Running);

    let before = SystemTime::now();
    let sample = query(addr, Duration::from_secs(2)).await.unwrap();
    let after = SystemTime::now();

    assert!(sample.server_received_at <= sample.server_transmitted_at);
    let authoritative = sample.authoritative_instant();
    assert!(authoritative + Duration::from_millis(5) >= before);
    assert!(authoritative <= after + Duration::from_millis(5));

    service.stop().await.unwrap();
    assert_eq!(service.state(), ServiceState::Stopped);
}

#[tokio::test]
async fn test_service_echoes_origin() {
    let mut service = ClockService::new(local_service_config());
    let addr = service.start().await.unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let tx = NtpTimestamp {
        seconds: 0xDEAD_BEEF,
        fraction: 0x0BAD_F00D,
    };
    socket
        .send_to(&NtpPacket::request(tx).encode(), addr)
        .await
        .unwrap();

    let mut buf = [0u8; 128];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(len, 48);
    assert_eq!(&buf[24..32], &tx.encode());
    assert_eq!(buf[0] & 0x07, 4);

    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_service_drops_short_and_server_datagrams() {
    let mut service = ClockService::new(local_service_config());
    let addr = service.start().await.unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(&[0x23; 10], addr).await.unwrap();

    let mut server_mode = NtpPacket::request(NtpTimestamp::now());
    server_mode.mode = NtpMode::Server;
    socket.send_to(&server_mode.encode(), addr).await.unwrap();

    let mut buf = [0u8; 128];
    let reply =
        tokio::time::timeout(Duration::from_millis(200), socket.recv_from(&mut buf)).await;
    assert!(reply.is_err(), "no reply expected");

    // The service is still healthy afterwards
    query(addr, Duration::from_secs(2)).await.unwrap();
    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_service_clock_offset() {
    let mut service = ClockService::new(ClockServiceConfig {
        clock_offset_millis: 60_000,
        ..local_service_config()
    });
    let addr = service.start().await.unwrap();

    let sample = query(addr, Duration::from_secs(2)).await.unwrap();
    let ahead = sample
        .authoritative_instant()
        .duration_since(SystemTime::now())
        .unwrap();
    assert!(ahead > Duration::from_secs(59), "ahead by {ahead:?}");

    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_service_start_twice_and_stop_unstarted() {
    let mut service = ClockService::new(local_service_config());
    assert!(matches!(service.stop().await, Err(SyncError::NotRunning)));

    service.start().await.unwrap();
    assert!(matches!(service.start().await, Err(SyncError::AlreadyRunning)));
    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_query_timeout() {
    // Bound but never answered
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = silent.local_addr().unwrap();

    let err = query(addr, Duration::from_millis(50)).await.unwrap_err();
    assert!(matches!(err, SyncError::ClockQueryTimeout { .. }));
    assert!(err.is_recoverable());
}

#[tokio::test]
async fn test_query_ignores_mismatched_origin() {
    let fake = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = fake.local_addr().unwrap();

    let responder = tokio::spawn(async move {
        let mut buf = [0u8; 128];
        let (len, peer) = fake.recv_from(&mut buf).await.unwrap();
        let request = NtpPacket::decode(&buf[..len]).unwrap();

        // A stale reply first, then the real one
        let stale = NtpPacket::request(NtpTimestamp {
            seconds: 1,
            fraction: 1,
        });
        let t = NtpTimestamp::now();
        fake.send_to(&NtpPacket::response(&stale, t, t).encode(), peer)
            .await
            .unwrap();

        let marker = NtpTimestamp {
            seconds: 3_999_999_999,
            fraction: 0,
        };
        fake.send_to(&NtpPacket::response(&request, marker, marker).encode(), peer)
            .await
            .unwrap();
    });

    let sample = query(addr, Duration::from_secs(2)).await.unwrap();
    assert_eq!(sample.server_transmitted_at.seconds, 3_999_999_999);
    responder.await.unwrap();
}

#[tokio::test]
async fn test_client_retries_then_fails() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client = ClockClient::new(ClockClientConfig {
        server: silent.local_addr().unwrap().to_string(),
        query_timeout: Duration::from_millis(30),
        attempts: 2,
        ..ClockClientConfig::default()
    });

    let err = client.query_with_retry().await.unwrap_err();
    assert!(matches!(err, SyncError::ClockQueryTimeout { .. }));
}

#[tokio::test]
async fn test_client_as_authoritative_clock() {
    let mut service = ClockService::new(local_service_config());
    let addr = service.start().await.unwrap();

    let client = ClockClient::new(ClockClientConfig {
        server: addr.to_string(),
        ..ClockClientConfig::default()
    });
    let now = AuthoritativeClock::now(&client).await.unwrap();
    let local = SystemTime::now();
    let skew = local.duration_since(now).unwrap_or_else(|e| e.duration());
    assert!(skew < Duration::from_secs(1));

    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_client_unresolvable_server() {
    let client = ClockClient::new(ClockClientConfig {
        server: "not an address".to_string(),
        ..ClockClientConfig::default()
    });
    assert!(matches!(
        client.query().await,
        Err(SyncError::ClockResolve { .. })
    ));
}

#[test]
fn test_sample_offset_and_round_trip() {
    let t1 = NtpTimestamp {
        seconds: 1000,
        fraction: 0,
    };
    let sample = ClockSample {
        request_sent_at_local: t1,
        server_received_at: t1.offset_millis(1125),
        server_transmitted_at: t1.offset_millis(1375),
    };
    let t4 = t1.offset_millis(500);

    // Server runs 1s ahead, 125ms each way, 250ms processing
    assert_eq!(sample.round_trip_micros(t4), 250_000);
    assert_eq!(sample.offset_micros(t4), 1_000_000);
}

// --- scheduling ---

/// Clock that advances with tokio's (pausable) timer
struct TimerClock {
    base: SystemTime,
    start: tokio::time::Instant,
    reads: AtomicU32,
    slice: Duration,
}

impl TimerClock {
    fn new(slice: Duration) -> Self {
        Self {
            base: UNIX_EPOCH + Duration::from_secs(1_700_000_000),
            start: tokio::time::Instant::now(),
            reads: AtomicU32::new(0),
            slice,
        }
    }
}

#[async_trait]
impl AuthoritativeClock for TimerClock {
    async fn now(&self) -> Result<SystemTime> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.base + self.start.elapsed())
    }

    fn max_sleep_slice(&self) -> Duration {
        self.slice
    }
}

struct BrokenClock;

#[async_trait]
impl AuthoritativeClock for BrokenClock {
    async fn now(&self) -> Result<SystemTime> {
        Err(SyncError::ClockQueryTimeout {
            server: "nowhere".to_string(),
            timeout: Duration::from_secs(1),
        })
    }
}

#[test]
fn test_remaining_wait() {
    let now = UNIX_EPOCH + Duration::from_secs(100);
    assert_eq!(
        remaining_wait(now + Duration::from_secs(5), now),
        Duration::from_secs(5)
    );
    assert_eq!(
        remaining_wait(now - Duration::from_secs(5), now),
        Duration::ZERO
    );
}

#[tokio::test(start_paused = true)]
async fn test_wait_until_future_target() {
    let clock = TimerClock::new(Duration::MAX);
    let target = clock.base + Duration::from_secs(5);

    let slept = wait_until(&clock, target).await.unwrap();
    assert_eq!(slept, Duration::from_secs(5));
    assert!(clock.start.elapsed() >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_wait_until_past_target_returns_immediately() {
    let clock = TimerClock::new(Duration::MAX);
    let target = clock.base - Duration::from_secs(5);

    let slept = wait_until(&clock, target).await.unwrap();
    assert_eq!(slept, Duration::ZERO);
    assert_eq!(clock.reads.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_wait_until_slices_long_waits() {
    let clock = TimerClock::new(Duration::from_secs(2));
    let target = clock.base + Duration::from_secs(5);

    wait_until(&clock, target).await.unwrap();
    // 2s + 2s + 1s, then a final read at the target
    assert_eq!(clock.reads.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_wait_until_propagates_clock_error() {
    let err = wait_until(&BrokenClock, SystemTime::now()).await.unwrap_err();
    assert!(matches!(err, SyncError::ClockQueryTimeout { .. }));
}

#[tokio::test]
async fn test_system_clock() {
    let before = SystemTime::now();
    let now = SystemClock.now().await.unwrap();
    assert!(now >= before);
}

//! Clock queries against a clock service

use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::net::UdpSocket;

use super::packet::{NtpMode, NtpPacket};
use super::schedule::AuthoritativeClock;
use super::timestamp::NtpTimestamp;
use crate::error::{Result, SyncError};
use crate::types::ClockClientConfig;

/// Timestamps gathered by one clock query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSample {
    /// Local time the request was sent (t1)
    pub request_sent_at_local: NtpTimestamp,
    /// Server time the request arrived (t2)
    pub server_received_at: NtpTimestamp,
    /// Server time the reply was built (t3)
    pub server_transmitted_at: NtpTimestamp,
}

impl ClockSample {
    /// The authoritative instant: the server's clock at reply time
    #[must_use]
    pub fn authoritative_instant(&self) -> SystemTime {
        self.server_transmitted_at.to_system_time()
    }

    /// Estimated server-minus-local offset in microseconds, given the local
    /// time the reply arrived (t4)
    ///
    /// offset = ((t2 - t1) + (t3 - t4)) / 2
    #[must_use]
    pub fn offset_micros(&self, reply_received_local: NtpTimestamp) -> i64 {
        let t2_t1 = self
            .server_received_at
            .diff_micros(&self.request_sent_at_local);
        let t3_t4 = self
            .server_transmitted_at
            .diff_micros(&reply_received_local);
        (t2_t1 + t3_t4) / 2
    }

    /// Round-trip delay in microseconds, excluding server processing time
    ///
    /// delay = (t4 - t1) - (t3 - t2)
    #[must_use]
    pub fn round_trip_micros(&self, reply_received_local: NtpTimestamp) -> u64 {
        let total = reply_received_local.diff_micros(&self.request_sent_at_local);
        let server = self
            .server_transmitted_at
            .diff_micros(&self.server_received_at);
        u64::try_from(total - server).unwrap_or(0)
    }
}

/// Client for a clock service
#[derive(Debug, Clone)]
pub struct ClockClient {
    config: ClockClientConfig,
}

impl ClockClient {
    /// Create a client
    #[must_use]
    pub fn new(config: ClockClientConfig) -> Self {
        Self { config }
    }

    /// Client configuration
    #[must_use]
    pub fn config(&self) -> &ClockClientConfig {
        &self.config
    }

    /// Query the configured server once
    ///
    /// # Errors
    ///
    /// Returns `SyncError::ClockQueryTimeout` if no matching reply arrives
    /// within the query timeout.
    pub async fn query(&self) -> Result<ClockSample> {
        let server = resolve(&self.config.server).await?;
        query(server, self.config.query_timeout).await
    }

    /// Query with the configured number of attempts
    ///
    /// # Errors
    ///
    /// Returns the last `SyncError::ClockQueryTimeout` if every attempt
    /// times out; other errors are returned immediately.
    pub async fn query_with_retry(&self) -> Result<ClockSample> {
        let attempts = self.config.attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.query().await {
                Err(e @ SyncError::ClockQueryTimeout { .. }) if attempt < attempts => {
                    tracing::warn!(
                        server = %self.config.server,
                        attempt,
                        attempts,
                        "Clock query failed, retrying: {}",
                        e
                    );
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[async_trait]
impl AuthoritativeClock for ClockClient {
    async fn now(&self) -> Result<SystemTime> {
        Ok(self.query_with_retry().await?.authoritative_instant())
    }

    fn max_sleep_slice(&self) -> Duration {
        self.config.max_sleep_slice
    }
}

/// Send one request to `server` and wait for its reply
///
/// Replies whose origin timestamp does not echo this request are ignored.
///
/// # Errors
///
/// Returns `SyncError::ClockQueryTimeout` if no matching reply arrives in
/// `timeout`, or a socket error.
pub async fn query(server: SocketAddr, timeout: Duration) -> Result<ClockSample> {
    let bind_addr = if server.is_ipv6() {
        "[::]:0"
    } else {
        "0.0.0.0:0"
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(server).await?;

    let sent_at = NtpTimestamp::now();
    socket.send(&NtpPacket::request(sent_at).encode()).await?;

    let exchange = async {
        let mut buf = [0u8; 512];
        loop {
            let len = socket.recv(&mut buf).await?;
            match NtpPacket::decode(&buf[..len]) {
                Ok(reply) if reply.mode == NtpMode::Server && reply.origin_time == sent_at => {
                    return Ok::<_, SyncError>(reply);
                }
                Ok(_) => tracing::debug!(peer = %server, "Ignoring unmatched clock reply"),
                Err(e) => tracing::debug!(peer = %server, "Ignoring bad clock reply: {}", e),
            }
        }
    };

    let reply = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| SyncError::ClockQueryTimeout {
            server: server.to_string(),
            timeout,
        })??;

    let sample = ClockSample {
        request_sent_at_local: sent_at,
        server_received_at: reply.receive_time,
        server_transmitted_at: reply.transmit_time,
    };

    let received_at = NtpTimestamp::now();
    tracing::debug!(
        peer = %server,
        offset_us = sample.offset_micros(received_at),
        rtt_us = sample.round_trip_micros(received_at),
        "Clock sample"
    );

    Ok(sample)
}

async fn resolve(server: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(server)
        .await
        .map_err(|_| SyncError::ClockResolve {
            server: server.to_string(),
        })?
        .next()
        .ok_or_else(|| SyncError::ClockResolve {
            server: server.to_string(),
        })
}

//! Clock service listener
//!
//! Two cooperating tasks share one UDP socket. The capture task stamps every
//! datagram with its arrival time the moment `recv_from` returns and queues
//! it; the responder task drains the queue and answers. Queue backlog
//! therefore never leaks into the receive timestamp.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::packet::{NtpMode, NtpPacket};
use super::timestamp::NtpTimestamp;
use crate::error::{Result, SyncError};
use crate::types::ClockServiceConfig;

/// Datagram captured by the receive stage
#[derive(Debug)]
struct CapturedDatagram {
    payload: Vec<u8>,
    sender: SocketAddr,
    arrival: NtpTimestamp,
}

/// Clock service state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Not listening
    Stopped,
    /// Answering clock queries
    Running,
}

/// NTP-style clock service
pub struct ClockService {
    config: ClockServiceConfig,
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl ClockService {
    /// Create a stopped service
    #[must_use]
    pub fn new(config: ClockServiceConfig) -> Self {
        Self {
            config,
            cancel: None,
            tasks: Vec::new(),
            local_addr: None,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ServiceState {
        if self.cancel.is_some() {
            ServiceState::Running
        } else {
            ServiceState::Stopped
        }
    }

    /// Bound address while running
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the socket and spawn the capture and responder tasks
    ///
    /// # Errors
    ///
    /// Returns `SyncError::AlreadyRunning` if started twice, or the bind error.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.cancel.is_some() {
            return Err(SyncError::AlreadyRunning);
        }

        let socket = Arc::new(UdpSocket::bind(&self.config.bind_addr).await?);
        let local_addr = socket.local_addr()?;

        let cancel = CancellationToken::new();
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        let capture = tokio::spawn(capture_loop(
            socket.clone(),
            queue_tx,
            cancel.clone(),
            self.config.clone(),
        ));
        let responder = tokio::spawn(respond_loop(
            socket,
            queue_rx,
            cancel.clone(),
            self.config.clone(),
        ));

        tracing::info!(addr = %local_addr, "Clock service listening");

        self.cancel = Some(cancel);
        self.tasks = vec![capture, responder];
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Stop both stages and wait for them to exit
    ///
    /// # Errors
    ///
    /// Returns `SyncError::NotRunning` if the service was not started.
    pub async fn stop(&mut self) -> Result<()> {
        let cancel = self.cancel.take().ok_or(SyncError::NotRunning)?;
        cancel.cancel();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!("Clock service task ended abnormally: {}", e);
            }
        }

        tracing::info!("Clock service stopped");
        self.local_addr = None;
        Ok(())
    }
}

impl Drop for ClockService {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

/// Service clock, including the configured simulation offset
fn service_now(config: &ClockServiceConfig) -> NtpTimestamp {
    NtpTimestamp::now().offset_millis(config.clock_offset_millis)
}

async fn capture_loop(
    socket: Arc<UdpSocket>,
    queue: mpsc::UnboundedSender<CapturedDatagram>,
    cancel: CancellationToken,
    config: ClockServiceConfig,
) {
    let mut buf = vec![0u8; config.recv_buf_size];

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, sender)) => {
                        let arrival = service_now(&config);
                        let datagram = CapturedDatagram {
                            payload: buf[..len].to_vec(),
                            sender,
                            arrival,
                        };
                        if queue.send(datagram).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // ICMP errors from earlier replies surface here on some platforms
                        tracing::debug!("Clock service receive error: {}", e);
                    }
                }
            }
        }
    }

    tracing::debug!("Clock capture stage exiting");
}

async fn respond_loop(
    socket: Arc<UdpSocket>,
    mut queue: mpsc::UnboundedReceiver<CapturedDatagram>,
    cancel: CancellationToken,
    config: ClockServiceConfig,
) {
    while !cancel.is_cancelled() {
        let datagram =
            match tokio::time::timeout(config.queue_poll_timeout, queue.recv()).await {
                Ok(Some(datagram)) => datagram,
                Ok(None) => break,
                Err(_) => continue,
            };

        let Some(response) = build_response(&datagram, &config) else {
            continue;
        };

        if let Err(e) = socket.send_to(&response, datagram.sender).await {
            tracing::warn!(peer = %datagram.sender, "Failed to send clock reply: {}", e);
        }
    }

    tracing::debug!("Clock responder stage exiting");
}

fn build_response(
    datagram: &CapturedDatagram,
    config: &ClockServiceConfig,
) -> Option<[u8; NtpPacket::SIZE]> {
    let request = match NtpPacket::decode(&datagram.payload) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(peer = %datagram.sender, "Dropping clock datagram: {}", e);
            return None;
        }
    };

    if request.mode != NtpMode::Client {
        tracing::debug!(
            peer = %datagram.sender,
            mode = ?request.mode,
            "Dropping non-client clock datagram"
        );
        return None;
    }

    let response = NtpPacket::response(&request, datagram.arrival, service_now(config));
    Some(response.encode())
}

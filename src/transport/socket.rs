//! TCP socket wrapper for the DCS transport.
//!
//! [`Transport`] is the single owner of the socket. The write half sits behind
//! the socket lock so frames never interleave on the wire; the read half has
//! its own lock, held for at most one bounded poll. Writes are bounded too,
//! so no lock is held longer than the send timeout.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};

use super::error::{TransportError, TransportResult};
use crate::core::{
    CONNECT_TIMEOUT, RECV_BUFFER_SIZE, SEND_TIMEOUT, SOCKET_RETRIES, SOCKET_RETRY_WAIT,
};

/// Connect retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    /// Retries after the first failed attempt.
    pub retries: u32,
    /// Pause between attempts.
    pub retry_wait: Duration,
    /// Upper bound for one attempt.
    pub connect_timeout: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            retries: SOCKET_RETRIES,
            retry_wait: SOCKET_RETRY_WAIT,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

/// Bytes read from one socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Generation of the socket the bytes came from.
    pub generation: u64,
    /// Bytes read.
    pub bytes: Vec<u8>,
}

/// Byte-level TCP transport with open/closed state.
#[derive(Debug)]
pub struct Transport {
    /// Log prefix.
    label: String,
    /// Socket lock: write half.
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Read half.
    reader: Mutex<Option<OwnedReadHalf>>,
    open: AtomicBool,
    /// Bumped on every successful open.
    generation: AtomicU64,
    recv_buffer_size: usize,
    send_timeout: Duration,
}

impl Transport {
    /// Create a closed transport.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            open: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            recv_buffer_size: RECV_BUFFER_SIZE,
            send_timeout: SEND_TIMEOUT,
        }
    }

    /// Set the upper bound for one [`send`](Self::send).
    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    /// Whether a socket is currently open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Counter that changes whenever a new socket is opened.
    ///
    /// Lets readers discard bytes buffered from a previous connection.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Resolve `host` and connect, retrying per `policy`.
    ///
    /// A no-op if the transport is already open.
    pub async fn open(&self, host: &str, port: u16, policy: &ConnectPolicy) -> TransportResult<()> {
        if self.is_open() {
            return Ok(());
        }

        debug!("[{}] no socket, opening...", self.label);
        let addrs: Vec<SocketAddr> = match tokio::net::lookup_host((host, port)).await {
            Ok(addrs) => addrs.collect(),
            Err(e) => {
                warn!("[{}] host {} not found: {}", self.label, host, e);
                return Err(TransportError::HostNotFound {
                    host: host.to_string(),
                    source: Some(e),
                });
            }
        };
        if addrs.is_empty() {
            return Err(TransportError::HostNotFound {
                host: host.to_string(),
                source: None,
            });
        }

        let attempts = policy.retries + 1;
        for attempt in 1..=attempts {
            for addr in &addrs {
                debug!("[{}] connecting to {} (attempt {})", self.label, addr, attempt);
                match timeout(policy.connect_timeout, TcpStream::connect(addr)).await {
                    Ok(Ok(stream)) => {
                        self.install(stream).await;
                        info!("[{}] socket connected to {}", self.label, addr);
                        return Ok(());
                    }
                    Ok(Err(e)) => warn!("[{}] cannot connect to {}: {}", self.label, addr, e),
                    Err(_) => warn!("[{}] connect to {} timed out", self.label, addr),
                }
            }
            if attempt < attempts {
                sleep(policy.retry_wait).await;
            }
        }

        info!("[{}] opening socket failed after {} attempts", self.label, attempts);
        Err(TransportError::RetriesExhausted {
            addr: format!("{}:{}", host, port),
            attempts,
        })
    }

    async fn install(&self, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("[{}] cannot set TCP_NODELAY: {}", self.label, e);
        }
        let (read_half, write_half) = stream.into_split();
        let mut writer = self.writer.lock().await;
        let mut reader = self.reader.lock().await;
        *writer = Some(write_half);
        *reader = Some(read_half);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.open.store(true, Ordering::Release);
    }

    /// Write all bytes under the socket lock.
    ///
    /// A write failure, or a write still pending after the send timeout,
    /// closes the socket.
    pub async fn send(&self, bytes: &[u8]) -> TransportResult<()> {
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(TransportError::NotConnected);
        };

        let error = match timeout(self.send_timeout, stream.write_all(bytes)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => {
                warn!("[{}] write failed, closing socket: {}", self.label, e);
                TransportError::Io(e)
            }
            Err(_) => {
                warn!(
                    "[{}] write stalled for {:?}, closing socket",
                    self.label, self.send_timeout
                );
                TransportError::SendTimeout {
                    after: self.send_timeout,
                }
            }
        };
        *writer = None;
        self.open.store(false, Ordering::Release);
        Err(error)
    }

    /// Read whatever is available, waiting at most `wait`.
    ///
    /// Returns `Ok(None)` when there is no data right now or no socket.
    /// A zero-byte read means the peer closed; the socket is closed and
    /// [`TransportError::ConnectionClosed`] is returned.
    pub async fn recv(&self, wait: Duration) -> TransportResult<Option<Chunk>> {
        let mut reader = self.reader.lock().await;
        let generation = self.generation();
        let Some(stream) = reader.as_mut() else {
            return Ok(None);
        };

        let mut buf = vec![0u8; self.recv_buffer_size];
        let read = timeout(wait, stream.read(&mut buf)).await;
        match read {
            Err(_) => Ok(None),
            Ok(Ok(0)) => {
                *reader = None;
                drop(reader);
                self.open.store(false, Ordering::Release);
                self.writer.lock().await.take();
                Err(TransportError::ConnectionClosed)
            }
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(Some(Chunk {
                    generation,
                    bytes: buf,
                }))
            }
            Ok(Err(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Ok(Err(e)) => Err(TransportError::Io(e)),
        }
    }

    /// Close the socket. Safe to call when already closed.
    ///
    /// Waits at most the send timeout for a writer in progress.
    pub async fn close(&self) {
        self.open.store(false, Ordering::Release);
        match timeout(self.send_timeout, self.writer.lock()).await {
            Ok(mut writer) => match writer.take() {
                Some(mut stream) => {
                    if let Ok(Err(e)) = timeout(self.send_timeout, stream.shutdown()).await {
                        debug!("[{}] shutdown: {}", self.label, e);
                    }
                    info!("[{}] socket closed", self.label);
                }
                None => debug!("[{}] socket is already closed", self.label),
            },
            Err(_) => warn!("[{}] writer busy, socket left to the pending send", self.label),
        }
        self.reader.lock().await.take();
    }
}

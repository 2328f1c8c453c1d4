//! High-level DCS client API.
//!
//! [`DcsClient`] owns one session with the cloud: it connects, runs the
//! receiver and dispatch tasks, sends telemetry and is supervised by an
//! externally scheduled [`watchdog`](DcsClient::watchdog).

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::timeout;

use super::config::{ClientConfig, DcsClientBuilder};
use super::dispatch::run_dispatcher;
use super::receiver::run_receiver;
use super::session::{ConnectionPhase, Session};
use crate::ack::RegisterError;
use crate::core::{ConfigError, Device, DeviceError, FrameError, InstructionError};
use crate::transport::{MessageType, Serial, TransportError};

/// Errors that can occur in the DCS client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Operation needs an established session.
    #[error("not connected")]
    NotConnected,

    /// Socket could not be opened.
    #[error("connection failed: {0}")]
    Connect(#[source] TransportError),

    /// Socket opened but the setup handshake was not acknowledged.
    #[error("handshake failed: {0}")]
    HandshakeFailed(#[source] Box<ClientError>),

    /// Write to a closed or failing socket.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Frame could not be built or read.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Malformed setup-change instruction.
    #[error("invalid instruction: {0}")]
    Instruction(#[from] InstructionError),

    /// No acknowledgement within the ack timeout.
    #[error("no ack received for tid {tid}")]
    AckTimeout {
        /// Transaction id of the request.
        tid: u16,
    },

    /// Tid could not be registered.
    #[error("request registration failed: {0}")]
    Register(#[from] RegisterError),

    /// The device collaborator failed.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// No log data was computed before sending.
    #[error("no log data loaded")]
    NoLogData,

    /// Response tid outside 1..=65535.
    #[error("tid out of range (1-65535)")]
    InvalidTid,
}

/// Device-side client of the DCS protocol.
///
/// Cheap to clone; clones share one session.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use dcs_client::client::DcsClient;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let client = DcsClient::new("1201002005050001", "41424142414241424142414241424142", "my-pv.live", 50333)?;
/// client.connect().await?;
/// client.send_data().await?;
///
/// let mut ticker = tokio::time::interval(Duration::from_secs(10));
/// loop {
///     ticker.tick().await;
///     client.watchdog().await;
/// }
/// # }
/// ```
#[derive(Clone)]
pub struct DcsClient {
    session: Arc<Session>,
}

impl fmt::Debug for DcsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DcsClient")
            .field("label", &self.session.label)
            .field("phase", &self.session.phase())
            .finish_non_exhaustive()
    }
}

impl DcsClient {
    /// Create a client, validating every argument.
    pub fn new(serial: &str, crypto_key: &str, server: &str, port: u32) -> Result<Self, ConfigError> {
        DcsClientBuilder::new()
            .serial(serial)
            .crypto_key(crypto_key)
            .server(server)
            .port(port)
            .build()
            .map(Self::with_config)
    }

    /// Start a configuration builder.
    pub fn builder() -> DcsClientBuilder {
        DcsClientBuilder::new()
    }

    /// Create a client from a validated configuration.
    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            session: Arc::new(Session::new(config)),
        }
    }

    /// Attach the device whose data this client reports.
    pub fn set_device(&self, device: Arc<dyn Device>) {
        self.session.set_device(device);
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the session and perform the setup handshake.
    ///
    /// Succeeds immediately if already connected.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let _lifecycle = self.session.lifecycle.lock().await;
        self.connect_locked().await
    }

    /// Close the session and stop the background tasks.
    ///
    /// The watchdog will not reconnect afterwards.
    pub async fn disconnect(&self) {
        let _lifecycle = self.session.lifecycle.lock().await;
        let s = &self.session;
        s.set_keep_connected(false);
        s.set_phase(ConnectionPhase::Disconnected);
        self.stop_workers().await;
        self.teardown().await;
        info!("[{}] disconnected", s.label);
    }

    /// Drop the current socket and connect again.
    ///
    /// The background tasks keep running. If connecting fails the
    /// reconnect intent is left untouched so the watchdog tries again.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        let _lifecycle = self.session.lifecycle.lock().await;
        self.reconnect_locked().await
    }

    async fn reconnect_locked(&self) -> Result<(), ClientError> {
        let s = &self.session;
        s.set_phase(ConnectionPhase::Reconnecting);
        self.teardown().await;
        info!("[{}] disconnected, ready to reconnect", s.label);
        self.connect_locked().await
    }

    async fn connect_locked(&self) -> Result<(), ClientError> {
        let s = &self.session;
        if s.is_connected() {
            return Ok(());
        }
        info!("[{}] connecting...", s.label);

        s.set_phase(ConnectionPhase::Connecting);
        s.reset_received();
        self.start_workers().await;

        let policy = s.config.timeouts.connect_policy();
        if let Err(e) = s.transport.open(&s.config.server, s.config.port, &policy).await {
            error!("[{}] connection failed, no socket available: {}", s.label, e);
            s.set_phase(ConnectionPhase::Disconnected);
            return Err(ClientError::Connect(e));
        }
        s.tracker.clear();

        match self.handshake().await {
            Ok(tid) => {
                s.set_phase(ConnectionPhase::Connected);
                s.set_keep_connected(true);
                info!("[{}] connected (TID {})", s.label, tid);
                Ok(())
            }
            Err(e) => {
                warn!("[{}] failed to connect, check encryption key: {}", s.label, e);
                s.transport.close().await;
                s.set_phase(ConnectionPhase::Disconnected);
                Err(ClientError::HandshakeFailed(Box::new(e)))
            }
        }
    }

    async fn handshake(&self) -> Result<u16, ClientError> {
        let setup = self.session.setup()?;
        info!("[{}] sending setup: {}", self.session.label, setup);
        self.session.request(MessageType::Setup, setup).await
    }

    /// Close the socket, fail pending requests and drop queued frames.
    async fn teardown(&self) {
        let s = &self.session;
        s.transport.close().await;
        s.tracker.wake_all();
        s.clear_inbox().await;
    }

    async fn start_workers(&self) {
        let s = &self.session;
        let mut workers = s.workers.lock().await;
        if workers.is_running() {
            debug!("[{}] workers already running", s.label);
            return;
        }

        debug!("[{}] workers starting...", s.label);
        let (shutdown, stop) = watch::channel(false);
        workers.receiver = Some(tokio::spawn(run_receiver(Arc::downgrade(s), stop.clone())));
        workers.dispatcher = Some(tokio::spawn(run_dispatcher(Arc::downgrade(s), stop)));
        workers.shutdown = Some(shutdown);
    }

    async fn stop_workers(&self) {
        let s = &self.session;
        let (shutdown, receiver, dispatcher) = {
            let mut workers = s.workers.lock().await;
            (
                workers.shutdown.take(),
                workers.receiver.take(),
                workers.dispatcher.take(),
            )
        };
        let Some(shutdown) = shutdown else {
            return;
        };

        debug!("[{}] workers stopping...", s.label);
        let _ = shutdown.send(true);
        for (name, handle) in [("receiver", receiver), ("dispatcher", dispatcher)] {
            let Some(mut handle) = handle else {
                continue;
            };
            if timeout(s.config.timeouts.join, &mut handle).await.is_err() {
                warn!("[{}] {} did not stop in time, aborting", s.label, name);
                handle.abort();
            } else {
                debug!("[{}] {} stopped", s.label, name);
            }
        }
    }

    // =========================================================================
    // Requests
    // =========================================================================

    fn ensure_connected(&self, what: &str) -> Result<(), ClientError> {
        if self.session.is_connected() {
            Ok(())
        } else {
            error!("[{}] error sending {}, not connected", self.session.label, what);
            Err(ClientError::NotConnected)
        }
    }

    /// Send current device data and wait for the ack.
    ///
    /// Returns the tid used.
    pub async fn send_data(&self) -> Result<u16, ClientError> {
        self.ensure_connected("data")?;
        let data = self.session.current_data()?;
        info!("[{}] sending data: {}", self.session.label, data);
        self.session.request(MessageType::CurrentData, data).await
    }

    /// Send the device setup and wait for the ack.
    pub async fn send_setup(&self) -> Result<u16, ClientError> {
        self.ensure_connected("setup")?;
        let setup = self.session.setup()?;
        info!("[{}] sending setup: {}", self.session.label, setup);
        self.session.request(MessageType::Setup, setup).await
    }

    /// Send the log data cached by [`load_log_data`](Self::load_log_data)
    /// and wait for the ack.
    pub async fn send_log_data(&self) -> Result<u16, ClientError> {
        let Some(log_data) = self.session.log_data() else {
            warn!("[{}] cannot send log data, nothing loaded", self.session.label);
            return Err(ClientError::NoLogData);
        };
        self.ensure_connected("log data")?;
        info!("[{}] sending log data: {}", self.session.label, log_data);
        self.session.request(MessageType::LogData, log_data).await
    }

    /// Ask the device to materialize its log data and cache it.
    pub fn load_log_data(&self) -> Result<(), ClientError> {
        Ok(self.session.load_log_data()?)
    }

    /// Ask the device to clear its log. Failures are logged.
    pub fn clear_log_data(&self) {
        self.session.clear_log_data();
    }

    // =========================================================================
    // Supervision
    // =========================================================================

    /// One supervision pass; call it periodically.
    ///
    /// Restarts dead background tasks, then reconnects once if nothing was
    /// received for longer than the keep-alive timeout or if the session
    /// should be connected but is not. Overlapping calls return at once.
    pub async fn watchdog(&self) {
        let s = &self.session;
        let Ok(_running) = s.watchdog.try_lock() else {
            debug!("[{}] watchdog already running", s.label);
            return;
        };
        debug!("[{}] watchdog running...", s.label);

        {
            let mut workers = s.workers.lock().await;
            let Some(stop) = workers.shutdown.as_ref().map(|tx| tx.subscribe()) else {
                return;
            };
            if workers.receiver.as_ref().is_some_and(|h| h.is_finished()) {
                warn!("[{}] receiver died, restarting...", s.label);
                workers.receiver = Some(tokio::spawn(run_receiver(Arc::downgrade(s), stop.clone())));
            }
            if workers.dispatcher.as_ref().is_some_and(|h| h.is_finished()) {
                warn!("[{}] dispatcher died, restarting...", s.label);
                workers.dispatcher = Some(tokio::spawn(run_dispatcher(Arc::downgrade(s), stop)));
            }
        }

        let keep_alive = s.config.timeouts.keep_alive;
        let silent = s.last_received().is_some_and(|at| at.elapsed() > keep_alive);
        let lost = s.keep_connected() && !s.is_connected();

        if silent {
            error!(
                "[{}] no message received for more than {:?}, reconnecting...",
                s.label, keep_alive
            );
        } else if lost {
            info!("[{}] disconnection detected, reconnecting...", s.label);
        }
        if silent || lost {
            if let Err(e) = self.reconnect().await {
                warn!("[{}] cannot reconnect: {}", s.label, e);
            }
        }

        debug!("[{}] inbound queue size: {}", s.label, s.inbox_len());
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Server host.
    pub fn server(&self) -> &str {
        &self.session.config.server
    }

    /// Server port.
    pub fn port(&self) -> u16 {
        self.session.config.port
    }

    /// Device serial.
    pub fn serial(&self) -> Serial {
        self.session.config.serial
    }

    /// Connected, with an open socket.
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> ConnectionPhase {
        self.session.phase()
    }

    /// Whether the watchdog should keep the session up.
    pub fn keep_connected(&self) -> bool {
        self.session.keep_connected()
    }

    /// When the last frame was received on the current connection.
    pub fn last_received(&self) -> Option<Instant> {
        self.session.last_received()
    }

    /// When the last frame was written.
    pub fn last_sent(&self) -> Option<Instant> {
        self.session.last_sent()
    }

    /// Requests waiting for an ack.
    pub fn pending_requests(&self) -> usize {
        self.session.tracker.len()
    }
}

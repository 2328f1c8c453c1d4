//! Shared session state.
//!
//! One [`Session`] lives behind an `Arc` for the lifetime of a client and is
//! shared by the public handle, the receiver task and the dispatch task.

use std::num::NonZeroU16;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::client::ClientError;
use super::config::ClientConfig;
use crate::ack::RequestTracker;
use crate::core::{lock, Device, DeviceError, RECEIVE_QUEUE_SIZE};
use crate::transport::{FrameCodec, Message, MessageType, Transport};

/// Connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// No session with the cloud.
    Disconnected,
    /// Socket open, handshake in progress.
    Connecting,
    /// Handshake acknowledged.
    Connected,
    /// Tearing down before connecting again.
    Reconnecting,
}

/// A frame accepted by the receiver, payload still encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Inbound {
    pub tid: u16,
    pub msg_type: u8,
    pub ack: bool,
    pub payload: Vec<u8>,
    /// Socket generation the frame arrived on.
    pub generation: u64,
}

/// Handles of the background tasks.
#[derive(Debug, Default)]
pub(crate) struct Workers {
    pub shutdown: Option<watch::Sender<bool>>,
    pub receiver: Option<JoinHandle<()>>,
    pub dispatcher: Option<JoinHandle<()>>,
}

impl Workers {
    pub fn is_running(&self) -> bool {
        self.shutdown.is_some()
    }
}

/// Session state shared between the client handle and its tasks.
pub(crate) struct Session {
    pub config: ClientConfig,
    /// `serial@host:port`.
    pub label: String,
    pub codec: FrameCodec,
    pub transport: Transport,
    pub tracker: RequestTracker,

    device: Mutex<Option<Arc<dyn Device>>>,
    phase: Mutex<ConnectionPhase>,
    keep_connected: AtomicBool,
    last_received: Mutex<Option<Instant>>,
    last_sent: Mutex<Option<Instant>>,
    log_data: Mutex<Option<Value>>,

    pub inbox_tx: mpsc::Sender<Inbound>,
    pub inbox_rx: tokio::sync::Mutex<mpsc::Receiver<Inbound>>,

    /// Supervision lock.
    pub workers: tokio::sync::Mutex<Workers>,
    /// Serialises connect, disconnect and reconnect.
    pub lifecycle: tokio::sync::Mutex<()>,
    /// Held while a watchdog pass runs.
    pub watchdog: tokio::sync::Mutex<()>,
}

impl Session {
    pub fn new(config: ClientConfig) -> Self {
        let label = config.label();
        let codec = FrameCodec::new(config.serial, &config.crypto_key);
        let (inbox_tx, inbox_rx) = mpsc::channel(RECEIVE_QUEUE_SIZE);

        Self {
            transport: Transport::new(label.clone()).with_send_timeout(config.timeouts.send),
            tracker: RequestTracker::with_block_time(config.timeouts.tid_block),
            label,
            codec,
            config,
            device: Mutex::new(None),
            phase: Mutex::new(ConnectionPhase::Disconnected),
            keep_connected: AtomicBool::new(false),
            last_received: Mutex::new(None),
            last_sent: Mutex::new(None),
            log_data: Mutex::new(None),
            inbox_tx,
            inbox_rx: tokio::sync::Mutex::new(inbox_rx),
            workers: tokio::sync::Mutex::new(Workers::default()),
            lifecycle: tokio::sync::Mutex::new(()),
            watchdog: tokio::sync::Mutex::new(()),
        }
    }

    // =========================================================================
    // State
    // =========================================================================

    pub fn phase(&self) -> ConnectionPhase {
        *lock(&self.phase)
    }

    pub fn set_phase(&self, phase: ConnectionPhase) {
        let mut current = lock(&self.phase);
        if *current != phase {
            debug!("[{}] {:?} -> {:?}", self.label, *current, phase);
            *current = phase;
        }
    }

    /// Connected and the socket is still open.
    pub fn is_connected(&self) -> bool {
        self.phase() == ConnectionPhase::Connected && self.transport.is_open()
    }

    /// Drop to `Disconnected` after the socket died underneath a session.
    pub fn mark_disconnected(&self) {
        let mut phase = lock(&self.phase);
        if *phase == ConnectionPhase::Connected {
            warn!("[{}] connection lost", self.label);
            *phase = ConnectionPhase::Disconnected;
        }
    }

    pub fn keep_connected(&self) -> bool {
        self.keep_connected.load(Ordering::Acquire)
    }

    pub fn set_keep_connected(&self, keep: bool) {
        self.keep_connected.store(keep, Ordering::Release);
    }

    pub fn last_received(&self) -> Option<Instant> {
        *lock(&self.last_received)
    }

    pub fn touch_received(&self) {
        *lock(&self.last_received) = Some(Instant::now());
    }

    pub fn reset_received(&self) {
        *lock(&self.last_received) = None;
    }

    pub fn last_sent(&self) -> Option<Instant> {
        *lock(&self.last_sent)
    }

    /// Discard queued inbound frames.
    ///
    /// The dispatcher releases the queue after every poll, so this waits at
    /// most one receive poll interval.
    pub async fn clear_inbox(&self) {
        let mut inbox = self.inbox_rx.lock().await;
        let mut dropped = 0;
        while inbox.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!("[{}] dropped {} queued messages", self.label, dropped);
        }
    }

    /// Frames waiting for the dispatcher.
    pub fn inbox_len(&self) -> usize {
        self.inbox_tx.max_capacity() - self.inbox_tx.capacity()
    }

    // =========================================================================
    // Device
    // =========================================================================

    pub fn set_device(&self, device: Arc<dyn Device>) {
        *lock(&self.device) = Some(device);
    }

    pub fn device(&self) -> Option<Arc<dyn Device>> {
        lock(&self.device).clone()
    }

    fn health(&self) -> u8 {
        match self.device() {
            Some(device) => device.health_state().unwrap_or_else(|e| {
                debug!("[{}] cannot read health state: {}", self.label, e);
                0
            }),
            None => 0,
        }
    }

    pub fn setup(&self) -> Result<Value, DeviceError> {
        match self.device() {
            Some(device) => device.setup(),
            None => {
                warn!("[{}] device not found, using placeholder setup", self.label);
                Ok(json!({
                    "device": "ConnectionTest",
                    "fwversion": "1.0.0",
                    "serialno": self.config.serial.to_string(),
                }))
            }
        }
    }

    pub fn current_data(&self) -> Result<Value, DeviceError> {
        match self.device() {
            Some(device) => device.current_data(),
            None => {
                warn!("[{}] device not found, using placeholder data", self.label);
                Ok(json!({ "power": seconds_of_minute() * 100 }))
            }
        }
    }

    /// Ask the device for log data and cache it.
    pub fn load_log_data(&self) -> Result<(), DeviceError> {
        let data = match self.device() {
            Some(device) => device.log_data()?,
            None => {
                warn!("[{}] device not found, using placeholder log data", self.label);
                json!({ "i_power": seconds_of_minute() * 100 })
            }
        };
        *lock(&self.log_data) = Some(data);
        Ok(())
    }

    pub fn log_data(&self) -> Option<Value> {
        lock(&self.log_data).clone()
    }

    pub fn clear_log_data(&self) {
        match self.device() {
            Some(device) => {
                if let Err(e) = device.clear_log() {
                    warn!("[{}] cannot clear log data: {}", self.label, e);
                }
            }
            None => warn!("[{}] device not found, nothing to clear", self.label),
        }
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Encode and write one frame under the socket lock.
    pub async fn transmit(&self, msg: &Message) -> Result<(), ClientError> {
        let frame = self.codec.encode(msg, self.health())?;
        if let Err(e) = self.transport.send(&frame).await {
            if e.is_fatal() {
                self.mark_disconnected();
            }
            return Err(e.into());
        }
        *lock(&self.last_sent) = Some(Instant::now());
        debug!(
            "[{}] TID {}: type {} transmitted ({} bytes)",
            self.label,
            msg.tid,
            msg.msg_type.as_byte(),
            frame.len()
        );
        Ok(())
    }

    /// Send a request under a fresh tid and wait for its ack.
    pub async fn request(&self, msg_type: MessageType, payload: Value) -> Result<u16, ClientError> {
        let tid = self.tracker.new_tid();
        if let Err(e) = self.tracker.register(tid) {
            self.tracker.remove(tid);
            return Err(e.into());
        }

        if let Err(e) = self.transmit(&Message::new(msg_type, tid, Some(payload))).await {
            self.tracker.remove(tid);
            return Err(e);
        }

        if self.tracker.wait_for_ack(tid, self.config.timeouts.ack).await {
            debug!("[{}] TID {}: acknowledged", self.label, tid);
            Ok(tid)
        } else {
            warn!("[{}] TID {}: type {} no ack received", self.label, tid, msg_type.as_byte());
            Err(ClientError::AckTimeout { tid })
        }
    }

    /// Answer a cloud request, echoing its tid. Never waits for an ack.
    pub async fn respond(
        &self,
        msg_type: MessageType,
        tid: u16,
        payload: Option<Value>,
    ) -> Result<(), ClientError> {
        let tid = NonZeroU16::new(tid).ok_or(ClientError::InvalidTid)?;
        self.transmit(&Message::new(msg_type, tid.get(), payload)).await
    }

    /// Positive or negative acknowledgement for `tid`.
    pub async fn send_ack(&self, tid: u16, positive: bool) -> Result<(), ClientError> {
        let tid = NonZeroU16::new(tid).ok_or(ClientError::InvalidTid)?;
        if !positive {
            info!("[{}] TID {}: sending nack", self.label, tid);
        }
        self.transmit(&Message::ack(tid.get(), positive)).await
    }
}

fn seconds_of_minute() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() % 60)
        .unwrap_or(0)
}

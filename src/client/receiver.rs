//! Receiver task: socket bytes in, inbound frames out.

use std::sync::Weak;

use log::{debug, error, warn};
use tokio::sync::watch;
use tokio::time::sleep;

use super::session::{Inbound, Session};
use crate::transport::{RawFrame, TransportError};

/// Read from the transport, reassemble frames and queue them for dispatch.
///
/// Runs until `shutdown` flips or the session is dropped. Read errors never
/// end the loop; reconnecting is left to the watchdog.
pub(crate) async fn run_receiver(session: Weak<Session>, mut shutdown: watch::Receiver<bool>) {
    let mut buffer: Vec<u8> = Vec::new();
    let mut generation = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }
        let Some(session) = session.upgrade() else {
            break;
        };
        let poll = session.config.timeouts.receive_poll;

        match session.transport.recv(poll).await {
            Ok(Some(chunk)) => {
                if chunk.generation != generation {
                    if !buffer.is_empty() {
                        debug!(
                            "[{}] discarding {} bytes from previous socket",
                            session.label,
                            buffer.len()
                        );
                    }
                    buffer.clear();
                    generation = chunk.generation;
                }
                buffer.extend_from_slice(&chunk.bytes);
            }
            Ok(None) => {
                if !session.transport.is_open() {
                    tokio::select! {
                        _ = sleep(poll) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
            Err(TransportError::ConnectionClosed) => {
                warn!("[{}] connection closed by server", session.label);
                buffer.clear();
                session.mark_disconnected();
            }
            Err(e) => {
                error!("[{}] error receiving data: {}", session.label, e);
                tokio::select! {
                    _ = sleep(session.config.timeouts.retry_wait) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        while let Some(frame) = session.codec.take_frame(&mut buffer) {
            if !accept(&session, frame, generation, &mut shutdown).await {
                return;
            }
        }
    }
    debug!("receiver stopped");
}

/// Validate one frame and queue it. Returns `false` once shutting down.
async fn accept(
    session: &Session,
    frame: RawFrame,
    generation: u64,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let header = frame.header;
    if header.serial != session.codec.serial() {
        warn!("[{}] invalid serial in received data: {}", session.label, header.serial);
        return true;
    }

    debug!(
        "[{}] received TID {}; type {}; payload {} bytes",
        session.label, header.tid, header.msg_type, header.payload_len
    );
    session.touch_received();

    let inbound = Inbound {
        tid: header.tid,
        msg_type: header.msg_type,
        ack: header.ack,
        payload: frame.payload,
        generation,
    };
    tokio::select! {
        sent = session.inbox_tx.send(inbound) => sent.is_ok(),
        _ = shutdown.changed() => false,
    }
}

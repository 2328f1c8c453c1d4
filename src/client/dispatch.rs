//! Dispatch task: handles cloud messages queued by the receiver.

use std::sync::Weak;

use log::{debug, error, info, warn};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::time::sleep;

use super::client::ClientError;
use super::session::{Inbound, Session};
use crate::core::{FrameError, InstructionError};
use crate::transport::MessageType;

/// Drain the inbound queue and handle each message.
///
/// A failing handler is logged; it never stops the loop.
pub(crate) async fn run_dispatcher(session: Weak<Session>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let Some(session) = session.upgrade() else {
            break;
        };
        let idle = session.config.timeouts.receive_poll;

        let next = {
            let mut inbox = session.inbox_rx.lock().await;
            tokio::select! {
                next = inbox.recv() => next,
                _ = shutdown.changed() => break,
                _ = sleep(idle) => continue,
            }
        };
        let Some(inbound) = next else {
            break;
        };

        debug!(
            "[{}] handling TID {}; type {}",
            session.label, inbound.tid, inbound.msg_type
        );
        if let Err(e) = dispatch(&session, inbound).await {
            error!("[{}] error handling message: {}", session.label, e);
        }
    }
    debug!("dispatcher stopped");
}

/// Handle one inbound message.
pub(crate) async fn dispatch(session: &Session, inbound: Inbound) -> Result<(), ClientError> {
    let tid = inbound.tid;
    if inbound.generation != session.transport.generation() {
        debug!(
            "[{}] TID {}: dropping type {} from previous socket",
            session.label, tid, inbound.msg_type
        );
        return Ok(());
    }
    let Some(msg_type) = MessageType::from_byte(inbound.msg_type) else {
        info!(
            "[{}] TID {}: unknown message type {} ignored",
            session.label, tid, inbound.msg_type
        );
        return Ok(());
    };

    match msg_type {
        MessageType::AckNack => {
            if inbound.ack {
                debug!("[{}] TID {}: received ack", session.label, tid);
            } else {
                warn!("[{}] TID {}: received nack", session.label, tid);
            }
            session.tracker.on_ack(tid);
            Ok(())
        }
        MessageType::KeepAlive => {
            debug!("[{}] TID {}: received keep-alive", session.label, tid);
            session.send_ack(tid, true).await
        }
        MessageType::RequestCurrentData => {
            info!("[{}] TID {}: received current data request", session.label, tid);
            match session.current_data() {
                Ok(data) => {
                    session
                        .respond(MessageType::CurrentData, tid, Some(data))
                        .await
                }
                Err(e) => {
                    warn!("[{}] TID {}: cannot read current data: {}", session.label, tid, e);
                    session.send_ack(tid, false).await
                }
            }
        }
        MessageType::SetupChange => {
            info!("[{}] TID {}: received setup change", session.label, tid);
            if let Err(e) = change_setup(session, &inbound.payload) {
                warn!("[{}] TID {}: setup change rejected: {}", session.label, tid, e);
                return session.send_ack(tid, false).await;
            }
            match session.setup() {
                Ok(setup) => session.respond(MessageType::Setup, tid, Some(setup)).await,
                Err(e) => {
                    warn!("[{}] TID {}: cannot read setup: {}", session.label, tid, e);
                    session.send_ack(tid, false).await
                }
            }
        }
        MessageType::RequestLogCompute => {
            info!("[{}] TID {}: computing log data", session.label, tid);
            match session.load_log_data() {
                Ok(()) => {
                    let acked = session.send_ack(tid, true).await;
                    session.clear_log_data();
                    acked
                }
                Err(e) => {
                    warn!("[{}] TID {}: cannot get log data: {}", session.label, tid, e);
                    session.send_ack(tid, false).await
                }
            }
        }
        MessageType::RequestLogSend => {
            info!("[{}] TID {}: sending log data", session.label, tid);
            let result = match session.log_data() {
                Some(data) => session.respond(MessageType::LogData, tid, Some(data)).await,
                None => Err(ClientError::NoLogData),
            };
            if let Err(e) = result {
                warn!("[{}] TID {}: cannot send log data: {}", session.label, tid, e);
                return session.send_ack(tid, false).await;
            }
            Ok(())
        }
        MessageType::CurrentData | MessageType::LogData | MessageType::Setup => {
            info!(
                "[{}] TID {}: unexpected message type {} ignored",
                session.label, tid, inbound.msg_type
            );
            Ok(())
        }
    }
}

/// Decrypt, parse and apply a setup change.
///
/// Nothing is applied unless the whole instruction parses.
fn change_setup(session: &Session, payload: &[u8]) -> Result<(), ClientError> {
    let plain = session.codec.decrypt_payload(payload).map_err(FrameError::from)?;
    let changes = parse_setup_changes(&plain)?;
    debug!("[{}] setup changes: {:?}", session.label, changes);

    let Some(device) = session.device() else {
        warn!("[{}] device not found, settings not applied", session.label);
        for (field, value) in &changes {
            info!("[{}] field {} = {}", session.label, field, value);
        }
        return Ok(());
    };
    for (field, value) in &changes {
        device.set_setup_value(field, *value)?;
    }
    Ok(())
}

/// Parse a decrypted setup-change instruction into `(field, value)` pairs.
///
/// Accepts either a JSON object of integers or a query string, where the
/// pairs are taken from after the first `?` up to the next `/`:
///
/// ```text
/// "/setup?power=2000&mode=1/"    ->  [("power", 2000), ("mode", 1)]
/// {"power": 2000, "mode": 1}     ->  [("power", 2000), ("mode", 1)]
/// ```
pub fn parse_setup_changes(plain: &[u8]) -> Result<Vec<(String, i64)>, InstructionError> {
    let end = plain.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    let text = std::str::from_utf8(&plain[..end]).map_err(|_| InstructionError::NotUtf8)?;
    let text = text.trim();

    let changes = if text.starts_with('{') {
        parse_json(text)?
    } else {
        parse_query(text)?
    };

    if changes.is_empty() {
        return Err(InstructionError::Empty);
    }
    Ok(changes)
}

fn parse_json(text: &str) -> Result<Vec<(String, i64)>, InstructionError> {
    let object: Map<String, Value> =
        serde_json::from_str(text).map_err(|e| InstructionError::Json(e.to_string()))?;

    object
        .into_iter()
        .map(|(field, value)| match value.as_i64() {
            Some(int) => Ok((field, int)),
            None => Err(InstructionError::InvalidValue {
                field,
                value: value.to_string(),
            }),
        })
        .collect()
}

fn parse_query(text: &str) -> Result<Vec<(String, i64)>, InstructionError> {
    let query = text.split_once('?').map_or(text, |(_, rest)| rest);
    let query = query.split_once('/').map_or(query, |(pairs, _)| pairs);

    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (field, value) = pair
                .split_once('=')
                .filter(|(field, _)| !field.is_empty())
                .ok_or_else(|| InstructionError::MalformedPair(pair.to_string()))?;
            let int = value
                .trim()
                .parse::<i64>()
                .map_err(|_| InstructionError::InvalidValue {
                    field: field.to_string(),
                    value: value.to_string(),
                })?;
            Ok((field.to_string(), int))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde_json::json;
    use tokio::net::{TcpListener, TcpStream};

    use crate::client::DcsClientBuilder;
    use crate::core::{Device, DeviceError, HEADER_SIZE};
    use crate::crypto::CryptoKey;
    use crate::transport::{FrameCodec, FrameHeader, Message, Serial};

    const SERIAL: &str = "1201002005050001";
    const KEY: &str = "41424142414241424142414241424142";

    #[derive(Default)]
    struct RecordingDevice {
        applied: Mutex<Vec<(String, i64)>>,
        cleared: Mutex<u32>,
        fail_log: bool,
    }

    impl Device for RecordingDevice {
        fn current_data(&self) -> Result<Value, DeviceError> {
            Ok(json!({"power": 1500}))
        }
        fn setup(&self) -> Result<Value, DeviceError> {
            let applied = self.applied.lock().unwrap();
            let mut setup = Map::new();
            for (field, value) in applied.iter() {
                setup.insert(field.clone(), json!(value));
            }
            Ok(Value::Object(setup))
        }
        fn set_setup_value(&self, field: &str, value: i64) -> Result<(), DeviceError> {
            if field == "locked" {
                return Err(DeviceError::new("field is read-only"));
            }
            self.applied.lock().unwrap().push((field.to_string(), value));
            Ok(())
        }
        fn log_data(&self) -> Result<Value, DeviceError> {
            if self.fail_log {
                return Err(DeviceError::new("no log"));
            }
            Ok(json!({"i_power": 42}))
        }
        fn clear_log(&self) -> Result<(), DeviceError> {
            *self.cleared.lock().unwrap() += 1;
            Ok(())
        }
        fn health_state(&self) -> Result<u8, DeviceError> {
            Ok(3)
        }
    }

    fn codec() -> FrameCodec {
        FrameCodec::new(
            Serial::parse(SERIAL).unwrap(),
            &CryptoKey::from_hex(KEY).unwrap(),
        )
    }

    async fn connected_session() -> (Arc<Session>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = DcsClientBuilder::new()
            .serial(SERIAL)
            .crypto_key(KEY)
            .server("127.0.0.1")
            .port(u32::from(port))
            .build()
            .unwrap();
        let policy = config.timeouts.connect_policy();
        let session = Arc::new(Session::new(config));
        let (open, accepted) = tokio::join!(
            session.transport.open("127.0.0.1", port, &policy),
            listener.accept()
        );
        open.unwrap();
        (session, accepted.unwrap().0)
    }

    async fn read_reply(peer: &mut TcpStream) -> (FrameHeader, Message) {
        use tokio::io::AsyncReadExt;

        let mut header = [0u8; HEADER_SIZE];
        tokio::time::timeout(Duration::from_secs(2), peer.read_exact(&mut header))
            .await
            .unwrap()
            .unwrap();
        let parsed = FrameHeader::from_bytes(&header).unwrap();
        let mut frame = header.to_vec();
        frame.resize(parsed.frame_len(), 0);
        peer.read_exact(&mut frame[HEADER_SIZE..]).await.unwrap();
        codec().decode(&frame).unwrap()
    }

    fn inbound(msg_type: MessageType, tid: u16, payload: Option<Value>) -> Inbound {
        let bytes = codec()
            .encode(&Message::new(msg_type, tid, payload), 0)
            .unwrap();
        Inbound {
            tid,
            msg_type: msg_type.as_byte(),
            ack: true,
            payload: bytes[HEADER_SIZE..].to_vec(),
            generation: 1,
        }
    }

    #[test]
    fn test_parse_query_string() {
        let changes = parse_setup_changes(b"/setup.jsn?power=2000&mode=1/extra").unwrap();
        assert_eq!(changes, vec![("power".to_string(), 2000), ("mode".to_string(), 1)]);

        let changes = parse_setup_changes(b"?ww1target=-5&\0\0\0").unwrap();
        assert_eq!(changes, vec![("ww1target".to_string(), -5)]);

        let changes = parse_setup_changes(b"\"?boost=1/\"").unwrap();
        assert_eq!(changes, vec![("boost".to_string(), 1)]);
    }

    #[test]
    fn test_parse_json_object() {
        let changes = parse_setup_changes(br#"{"power": 2000}"#).unwrap();
        assert_eq!(changes, vec![("power".to_string(), 2000)]);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            parse_setup_changes(br#"{"power": 20"#),
            Err(InstructionError::Json(_))
        ));
        assert_eq!(
            parse_setup_changes(br#"{"power": "high"}"#),
            Err(InstructionError::InvalidValue {
                field: "power".into(),
                value: "\"high\"".into()
            })
        );
        assert_eq!(
            parse_setup_changes(b"?power=2000&mode/"),
            Err(InstructionError::MalformedPair("mode".into()))
        );
        assert_eq!(
            parse_setup_changes(b"?power=2.5/"),
            Err(InstructionError::InvalidValue {
                field: "power".into(),
                value: "2.5".into()
            })
        );
        assert_eq!(parse_setup_changes(b"?/"), Err(InstructionError::Empty));
        assert_eq!(parse_setup_changes(b"{}"), Err(InstructionError::Empty));
        assert_eq!(parse_setup_changes(&[0xff, 0xfe]), Err(InstructionError::NotUtf8));
    }

    #[tokio::test]
    async fn test_keep_alive_is_acked() {
        let (session, mut peer) = connected_session().await;
        dispatch(&session, inbound(MessageType::KeepAlive, 77, None))
            .await
            .unwrap();

        let (header, msg) = read_reply(&mut peer).await;
        assert_eq!(msg.msg_type, MessageType::AckNack);
        assert_eq!(msg.tid, 77);
        assert!(header.ack);
        assert_eq!(header.payload_len, 0);
        assert!(session.tracker.is_empty());
    }

    #[tokio::test]
    async fn test_current_data_request() {
        let (session, mut peer) = connected_session().await;
        session.set_device(Arc::new(RecordingDevice::default()));
        dispatch(&session, inbound(MessageType::RequestCurrentData, 9, None))
            .await
            .unwrap();

        let (header, msg) = read_reply(&mut peer).await;
        assert_eq!(msg.msg_type, MessageType::CurrentData);
        assert_eq!(msg.tid, 9);
        assert_eq!(msg.payload, Some(json!({"power": 1500})));
        assert_eq!(header.health, 3);
    }

    #[tokio::test]
    async fn test_setup_change_applied_and_answered() {
        let (session, mut peer) = connected_session().await;
        let device = Arc::new(RecordingDevice::default());
        session.set_device(device.clone());

        let msg = inbound(MessageType::SetupChange, 300, Some(json!("/x?power=2000&mode=2/")));
        dispatch(&session, msg).await.unwrap();

        let (_, reply) = read_reply(&mut peer).await;
        assert_eq!(reply.msg_type, MessageType::Setup);
        assert_eq!(reply.tid, 300);
        assert_eq!(reply.payload, Some(json!({"power": 2000, "mode": 2})));
        assert_eq!(device.applied.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_setup_change_is_nacked() {
        let (session, mut peer) = connected_session().await;
        let device = Arc::new(RecordingDevice::default());
        session.set_device(device.clone());

        let payload = codec()
            .encrypt_payload(br#"{"power": 20"#.to_vec())
            .unwrap();
        let msg = Inbound {
            tid: 301,
            msg_type: MessageType::SetupChange.as_byte(),
            ack: true,
            payload,
            generation: 1,
        };
        dispatch(&session, msg).await.unwrap();

        let (header, reply) = read_reply(&mut peer).await;
        assert_eq!(reply.msg_type, MessageType::AckNack);
        assert_eq!(reply.tid, 301);
        assert!(!header.ack);
        assert!(device.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_setup_change_device_failure_is_nacked() {
        let (session, mut peer) = connected_session().await;
        session.set_device(Arc::new(RecordingDevice::default()));

        let msg = inbound(MessageType::SetupChange, 302, Some(json!("?locked=1/")));
        dispatch(&session, msg).await.unwrap();

        let (header, reply) = read_reply(&mut peer).await;
        assert_eq!(reply.msg_type, MessageType::AckNack);
        assert!(!header.ack);
    }

    #[tokio::test]
    async fn test_log_compute_then_send() {
        let (session, mut peer) = connected_session().await;
        let device = Arc::new(RecordingDevice::default());
        session.set_device(device.clone());

        dispatch(&session, inbound(MessageType::RequestLogCompute, 40, None))
            .await
            .unwrap();
        let (header, reply) = read_reply(&mut peer).await;
        assert_eq!((reply.msg_type, reply.tid), (MessageType::AckNack, 40));
        assert!(header.ack);
        assert_eq!(*device.cleared.lock().unwrap(), 1);

        dispatch(&session, inbound(MessageType::RequestLogSend, 41, None))
            .await
            .unwrap();
        let (_, reply) = read_reply(&mut peer).await;
        assert_eq!(reply.msg_type, MessageType::LogData);
        assert_eq!(reply.tid, 41);
        assert_eq!(reply.payload, Some(json!({"i_power": 42})));
    }

    #[tokio::test]
    async fn test_log_is_cleared_when_ack_cannot_be_written() {
        let (session, _peer) = connected_session().await;
        let device = Arc::new(RecordingDevice::default());
        session.set_device(device.clone());
        session.transport.close().await;

        let result = dispatch(&session, inbound(MessageType::RequestLogCompute, 45, None)).await;
        assert!(matches!(result, Err(ClientError::Transport(_))));
        assert_eq!(*device.cleared.lock().unwrap(), 1);
        assert!(session.log_data().is_some());
    }

    #[tokio::test]
    async fn test_frame_from_previous_socket_is_dropped() {
        let (session, mut peer) = connected_session().await;
        session.set_device(Arc::new(RecordingDevice::default()));

        let stale = Inbound {
            generation: 0,
            ..inbound(MessageType::RequestCurrentData, 60, None)
        };
        dispatch(&session, stale).await.unwrap();
        assert!(session.last_sent().is_none());

        dispatch(&session, inbound(MessageType::KeepAlive, 61, None))
            .await
            .unwrap();
        let (_, reply) = read_reply(&mut peer).await;
        assert_eq!((reply.msg_type, reply.tid), (MessageType::AckNack, 61));
    }

    #[tokio::test]
    async fn test_log_failures_are_nacked() {
        let (session, mut peer) = connected_session().await;
        session.set_device(Arc::new(RecordingDevice {
            fail_log: true,
            ..Default::default()
        }));

        dispatch(&session, inbound(MessageType::RequestLogSend, 50, None))
            .await
            .unwrap();
        let (header, reply) = read_reply(&mut peer).await;
        assert_eq!((reply.msg_type, reply.tid), (MessageType::AckNack, 50));
        assert!(!header.ack);

        dispatch(&session, inbound(MessageType::RequestLogCompute, 51, None))
            .await
            .unwrap();
        let (header, reply) = read_reply(&mut peer).await;
        assert_eq!((reply.msg_type, reply.tid), (MessageType::AckNack, 51));
        assert!(!header.ack);
    }

    #[tokio::test]
    async fn test_ack_releases_pending_request() {
        let (session, _peer) = connected_session().await;
        let tid = session.tracker.new_tid();
        session.tracker.register(tid).unwrap();

        dispatch(&session, inbound(MessageType::AckNack, tid, None))
            .await
            .unwrap();
        assert!(session
            .tracker
            .wait_for_ack(tid, Duration::from_millis(10))
            .await);
    }

    #[tokio::test]
    async fn test_unknown_type_is_ignored() {
        let (session, _peer) = connected_session().await;
        let msg = Inbound {
            tid: 5,
            msg_type: 42,
            ack: true,
            payload: Vec::new(),
            generation: 1,
        };
        dispatch(&session, msg).await.unwrap();
        assert!(session.last_sent().is_none());
    }
}

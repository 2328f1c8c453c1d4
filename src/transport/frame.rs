//! Frame encoding and decoding for the DCS wire protocol.
//!
//! Every frame is a fixed 32-byte header followed by an optional encrypted
//! payload. Multi-byte integers are little-endian.
//!
//! ```text
//! +-----------+--------+--------+-----------+--------+--------+-----------+
//! | Serial    | TID    | Type   | Length    | Ack    | Health | Reserved  |
//! | 16 bytes  | LE16   | 1 byte | LE16      | 1 byte | 1 byte | 9 bytes   |
//! +-----------+--------+--------+-----------+--------+--------+-----------+
//! ```
//!
//! Payload encryption: the JSON text is zero-padded to a block multiple,
//! prefixed with 8 random bytes, then XTEA-CBC encrypted under a random IV
//! that is never transmitted. The receiver discards the first decrypted
//! block, so the IV it feeds the decryptor (bytes 32..40 of the ciphertext,
//! or zeros when the ciphertext is shorter) does not affect the result.

use std::fmt;

use serde_json::Value;

use crate::core::{
    CryptoError, FrameError, ACK_NEGATIVE, ACK_POSITIVE, BLOCK_SIZE, HEADER_SIZE,
    MAX_PAYLOAD_SIZE, PAYLOAD_VECTOR_SIZE, SERIAL_LEN,
};
use crate::crypto::{random_block, CryptoKey, Xtea};

/// Offset of the decryptor IV inside the encrypted payload.
const IV_OFFSET: usize = 32;

/// Message type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Current readings (device → cloud).
    CurrentData = 1,
    /// Log records (device → cloud).
    LogData = 2,
    /// Setup snapshot (device → cloud, also the connect proof).
    Setup = 3,
    /// Cloud asks for current readings.
    RequestCurrentData = 4,
    /// Cloud changes setup values.
    SetupChange = 5,
    /// Cloud asks the device to compute log data.
    RequestLogCompute = 6,
    /// Cloud asks for the computed log data.
    RequestLogSend = 7,
    /// Keep-alive ping.
    KeepAlive = 8,
    /// Positive or negative acknowledgement.
    AckNack = 9,
}

impl MessageType {
    /// Parse a message type from a byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::CurrentData),
            2 => Some(Self::LogData),
            3 => Some(Self::Setup),
            4 => Some(Self::RequestCurrentData),
            5 => Some(Self::SetupChange),
            6 => Some(Self::RequestLogCompute),
            7 => Some(Self::RequestLogSend),
            8 => Some(Self::KeepAlive),
            9 => Some(Self::AckNack),
            _ => None,
        }
    }

    /// Convert to the wire byte.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Device identity: exactly 16 printable ASCII characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Serial([u8; SERIAL_LEN]);

impl Serial {
    /// Validate and wrap a serial string.
    pub fn parse(serial: &str) -> Option<Self> {
        let bytes: [u8; SERIAL_LEN] = serial.as_bytes().try_into().ok()?;
        if !bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            return None;
        }
        Some(Self(bytes))
    }

    /// Create from raw header bytes without validation.
    pub fn from_bytes(bytes: [u8; SERIAL_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw bytes as carried in the header.
    pub fn as_bytes(&self) -> &[u8; SERIAL_LEN] {
        &self.0
    }

    /// Serial as text (lossy for bytes received off the wire).
    pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl fmt::Debug for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Serial({:?})", self.as_str())
    }
}

/// Frame header (32 bytes, unencrypted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Device serial.
    pub serial: Serial,
    /// Transaction id.
    pub tid: u16,
    /// Raw message type (unknown values are passed through).
    pub msg_type: u8,
    /// Encrypted payload length.
    pub payload_len: u16,
    /// `true` for normal frames and positive acks, `false` for a nack.
    pub ack: bool,
    /// Device health byte.
    pub health: u8,
}

impl FrameHeader {
    /// Serialize header to bytes (32 bytes).
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..16].copy_from_slice(self.serial.as_bytes());
        buf[16..18].copy_from_slice(&self.tid.to_le_bytes());
        buf[18] = self.msg_type;
        buf[19..21].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[21] = if self.ack { ACK_POSITIVE } else { ACK_NEGATIVE };
        buf[22] = self.health;
        buf
    }

    /// Parse header from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Incomplete {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let mut serial = [0u8; SERIAL_LEN];
        serial.copy_from_slice(&bytes[0..16]);

        Ok(Self {
            serial: Serial::from_bytes(serial),
            tid: u16::from_le_bytes([bytes[16], bytes[17]]),
            msg_type: bytes[18],
            payload_len: u16::from_le_bytes([bytes[19], bytes[20]]),
            ack: bytes[21] != ACK_NEGATIVE,
            health: bytes[22],
        })
    }

    /// Total frame size described by this header.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_len as usize
    }

    /// Known message type, if any.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_byte(self.msg_type)
    }
}

/// A frame split off the receive buffer, payload still encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Parsed header.
    pub header: FrameHeader,
    /// Encrypted payload (`header.payload_len` bytes).
    pub payload: Vec<u8>,
}

/// A logical message, payload in the clear.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Message type.
    pub msg_type: MessageType,
    /// Transaction id.
    pub tid: u16,
    /// JSON payload, absent for empty frames.
    pub payload: Option<Value>,
    /// `false` marks a negative acknowledgement.
    pub ack: bool,
}

impl Message {
    /// A message with payload.
    pub fn new(msg_type: MessageType, tid: u16, payload: Option<Value>) -> Self {
        Self {
            msg_type,
            tid,
            payload,
            ack: true,
        }
    }

    /// A positive (`ack = true`) or negative acknowledgement for `tid`.
    pub fn ack(tid: u16, ack: bool) -> Self {
        Self {
            msg_type: MessageType::AckNack,
            tid,
            payload: None,
            ack,
        }
    }
}

/// Encodes and decodes frames for one device identity and key.
#[derive(Clone)]
pub struct FrameCodec {
    serial: Serial,
    cipher: Xtea,
}

impl fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameCodec")
            .field("serial", &self.serial)
            .finish_non_exhaustive()
    }
}

impl FrameCodec {
    /// Create a codec for a serial and key.
    pub fn new(serial: Serial, key: &CryptoKey) -> Self {
        Self {
            serial,
            cipher: Xtea::new(key),
        }
    }

    /// Serial stamped into every encoded header.
    pub fn serial(&self) -> Serial {
        self.serial
    }

    /// Encode a message into wire bytes.
    pub fn encode(&self, msg: &Message, health: u8) -> Result<Vec<u8>, FrameError> {
        let plain = match &msg.payload {
            Some(value) => serde_json::to_vec(value).map_err(FrameError::Serialize)?,
            None => Vec::new(),
        };
        let payload = self.encrypt_payload(plain)?;

        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let header = FrameHeader {
            serial: self.serial,
            tid: msg.tid,
            msg_type: msg.msg_type.as_byte(),
            payload_len: payload.len() as u16,
            ack: msg.ack,
            health,
        };

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decode one complete frame.
    pub fn decode(&self, bytes: &[u8]) -> Result<(FrameHeader, Message), FrameError> {
        let header = FrameHeader::from_bytes(bytes)?;
        if bytes.len() < header.frame_len() {
            return Err(FrameError::Incomplete {
                expected: header.frame_len(),
                actual: bytes.len(),
            });
        }
        let msg_type = header
            .message_type()
            .ok_or_else(|| FrameError::Decode(format!("unknown message type {}", header.msg_type)))?;

        let plain = self.decrypt_payload(&bytes[HEADER_SIZE..header.frame_len()])?;
        let payload = if plain.is_empty() {
            None
        } else {
            Some(serde_json::from_slice(&plain).map_err(|e| FrameError::Decode(e.to_string()))?)
        };

        Ok((
            header,
            Message {
                msg_type,
                tid: header.tid,
                payload,
                ack: header.ack,
            },
        ))
    }

    /// Split the next complete frame off the front of `buffer`.
    ///
    /// Returns `None` while the buffer holds less than a full frame.
    pub fn take_frame(&self, buffer: &mut Vec<u8>) -> Option<RawFrame> {
        let header = FrameHeader::from_bytes(buffer).ok()?;
        let frame_len = header.frame_len();
        if buffer.len() < frame_len {
            return None;
        }
        let payload = buffer[HEADER_SIZE..frame_len].to_vec();
        buffer.drain(..frame_len);
        Some(RawFrame { header, payload })
    }

    /// Encrypt serialized payload bytes; empty stays empty.
    pub fn encrypt_payload(&self, mut plain: Vec<u8>) -> Result<Vec<u8>, CryptoError> {
        if plain.is_empty() {
            return Ok(plain);
        }
        let padded_len = plain.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
        plain.resize(padded_len, 0);

        let mut block = Vec::with_capacity(PAYLOAD_VECTOR_SIZE + plain.len());
        block.extend_from_slice(&random_block());
        block.extend_from_slice(&plain);

        self.cipher.cbc_encrypt(random_block(), &block)
    }

    /// Decrypt a payload, stripping the leading vector and trailing padding.
    pub fn decrypt_payload(&self, encrypted: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if encrypted.is_empty() {
            return Ok(Vec::new());
        }
        let mut iv = [0u8; BLOCK_SIZE];
        if let Some(material) = encrypted.get(IV_OFFSET..IV_OFFSET + BLOCK_SIZE) {
            iv.copy_from_slice(material);
        }

        let mut plain = self.cipher.cbc_decrypt(iv, encrypted)?;
        plain.drain(..PAYLOAD_VECTOR_SIZE.min(plain.len()));
        while plain.last() == Some(&0) {
            plain.pop();
        }
        Ok(plain)
    }
}

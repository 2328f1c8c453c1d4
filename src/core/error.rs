//! Error types for the DCS client.

use thiserror::Error;

/// Errors raised while validating the client configuration.
///
/// These are reported by [`DcsClientBuilder::build`](crate::client::DcsClientBuilder::build),
/// never deferred to connect time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Serial is not exactly 16 printable ASCII characters.
    #[error("invalid serial {0:?}: expected 16 printable ASCII characters")]
    InvalidSerial(String),

    /// Crypto key is not 32 hex digits.
    #[error("invalid crypto key: expected 32 hex digits")]
    InvalidCryptoKey,

    /// No server host given.
    #[error("server host is required")]
    MissingServer,

    /// Port outside 1..=65535.
    #[error("port out of range: {0}")]
    InvalidPort(u32),
}

/// Errors in the cipher layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key material has the wrong length.
    #[error("invalid key length: expected 16 bytes, got {0}")]
    InvalidKeyLength(usize),

    /// Key string is not valid hex.
    #[error("invalid key encoding")]
    InvalidKeyEncoding,

    /// Input is not a whole number of cipher blocks.
    #[error("input length {0} is not a multiple of the block size")]
    UnalignedInput(usize),
}

/// Errors while encoding or decoding a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Not enough bytes buffered yet; retry once more bytes arrive.
    #[error("incomplete frame: need {expected} bytes, have {actual}")]
    Incomplete {
        /// Bytes needed.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Encrypted payload does not fit the 16-bit length field.
    #[error("payload too large: {size} bytes exceeds {max}")]
    PayloadTooLarge {
        /// Encrypted payload size.
        size: usize,
        /// Largest representable size.
        max: usize,
    },

    /// Payload could not be serialized.
    #[error("cannot serialize payload: {0}")]
    Serialize(#[source] serde_json::Error),

    /// Payload could not be decrypted or parsed.
    #[error("cannot decode payload: {0}")]
    Decode(String),

    /// Cipher failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// A malformed setup-change instruction from the cloud.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InstructionError {
    /// Plaintext is not UTF-8.
    #[error("setup change is not valid UTF-8")]
    NotUtf8,

    /// JSON form could not be parsed.
    #[error("malformed setup change JSON: {0}")]
    Json(String),

    /// A `field=value` pair is missing its `=` or field name.
    #[error("malformed setup change pair {0:?}")]
    MalformedPair(String),

    /// A value is not an integer.
    #[error("setup value for {field:?} is not an integer: {value}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Offending value as received.
        value: String,
    },

    /// Nothing to apply.
    #[error("setup change carries no values")]
    Empty,
}

/// Failure reported by the attached [`Device`](super::Device).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("device error: {0}")]
pub struct DeviceError(pub String);

impl DeviceError {
    /// Create a device error from any message.
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

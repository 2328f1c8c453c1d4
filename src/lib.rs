//! # DCS Client
//!
//! Device-side client for the DCS cloud protocol.
//!
//! A field device keeps one long-lived TCP session with the cloud, reports
//! telemetry over it and receives configuration changes and data requests.
//! Every frame carries a 32-byte clear-text header followed by a JSON payload
//! encrypted with XTEA in CBC mode:
//!
//! ```text
//! +----------------+-----+------+--------+-----+--------+----------+---------------------+
//! | serial (16)    | tid | type | length | ack | health | reserved | payload (length)    |
//! | ASCII          | u16 | u8   | u16    | u8  | u8     | 9 zeros  | XTEA-CBC, 8-aligned |
//! +----------------+-----+------+--------+-----+--------+----------+---------------------+
//! ```
//!
//! Requests originated by the device carry a random transaction id (tid) and
//! are acknowledged by the cloud with a type 9 frame echoing that tid.
//!
//! ## Modules
//!
//! - [`core`]: constants, error types and the [`Device`](core::Device) contract
//! - [`crypto`]: key handling and the XTEA cipher
//! - [`transport`]: frame codec and the TCP socket owner
//! - [`ack`]: tid allocation and ack correlation
//! - [`client`]: the [`DcsClient`](client::DcsClient) facade, its background
//!   tasks and configuration
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use dcs_client::prelude::*;
//! use serde_json::{json, Value};
//!
//! struct Heater;
//!
//! impl Device for Heater {
//!     fn current_data(&self) -> Result<Value, DeviceError> {
//!         Ok(json!({ "power": 1200 }))
//!     }
//!     fn setup(&self) -> Result<Value, DeviceError> {
//!         Ok(json!({ "device": "AC-THOR", "fwversion": "2.1.0" }))
//!     }
//!     fn set_setup_value(&self, _field: &str, _value: i64) -> Result<(), DeviceError> {
//!         Ok(())
//!     }
//!     fn log_data(&self) -> Result<Value, DeviceError> {
//!         Ok(json!({ "i_power": 1200 }))
//!     }
//!     fn clear_log(&self) -> Result<(), DeviceError> {
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DcsClientBuilder::new()
//!     .serial("1201002005050001")
//!     .crypto_key("41424142414241424142414241424142")
//!     .server("my-pv.live")
//!     .port(50333)
//!     .build()?;
//!
//! let client = DcsClient::with_config(config);
//! client.set_device(Arc::new(Heater));
//! client.connect().await?;
//! client.send_data().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod ack;
pub mod client;
pub mod core;
pub mod crypto;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{ConfigError, Device, DeviceError, FrameError, InstructionError};

    pub use crate::transport::{FrameCodec, Message, MessageType, Serial, TransportError};

    pub use crate::crypto::CryptoKey;

    pub use crate::client::{
        ClientConfig, ClientError, ConnectionPhase, DcsClient, DcsClientBuilder, Timeouts,
    };
}

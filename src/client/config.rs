//! Client configuration and builder.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{
    ConfigError, ACK_TIMEOUT, CONNECT_TIMEOUT, JOIN_TIMEOUT, KEEPALIVE_TIMEOUT,
    RECEIVE_POLL_INTERVAL, SEND_TIMEOUT, SOCKET_RETRIES, SOCKET_RETRY_WAIT, TID_BLOCK_TIME,
};
use crate::crypto::CryptoKey;
use crate::transport::{ConnectPolicy, Serial};

/// Timing knobs of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// How long a request waits for its ack.
    pub ack: Duration,
    /// How long one frame write may take before the socket is dropped.
    pub send: Duration,
    /// Silence after which the watchdog reconnects.
    pub keep_alive: Duration,
    /// Age after which a pending tid is swept.
    pub tid_block: Duration,
    /// Connect retries after the first attempt.
    pub connect_retries: u32,
    /// Pause between connect attempts, and after a failed read.
    pub retry_wait: Duration,
    /// Upper bound for one connect attempt.
    pub connect: Duration,
    /// How long disconnect waits for each worker to stop.
    pub join: Duration,
    /// Receive poll interval.
    pub receive_poll: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ack: ACK_TIMEOUT,
            send: SEND_TIMEOUT,
            keep_alive: KEEPALIVE_TIMEOUT,
            tid_block: TID_BLOCK_TIME,
            connect_retries: SOCKET_RETRIES,
            retry_wait: SOCKET_RETRY_WAIT,
            connect: CONNECT_TIMEOUT,
            join: JOIN_TIMEOUT,
            receive_poll: RECEIVE_POLL_INTERVAL,
        }
    }
}

impl Timeouts {
    /// Connect policy derived from these timeouts.
    pub fn connect_policy(&self) -> ConnectPolicy {
        ConnectPolicy {
            retries: self.connect_retries,
            retry_wait: self.retry_wait,
            connect_timeout: self.connect,
        }
    }
}

/// Validated client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Device identity.
    pub serial: Serial,
    /// Session key.
    pub crypto_key: CryptoKey,
    /// Cloud host name or address.
    pub server: String,
    /// Cloud port.
    pub port: u16,
    /// Timing knobs.
    pub timeouts: Timeouts,
}

impl ClientConfig {
    /// `serial@host:port`, used as log prefix.
    pub fn label(&self) -> String {
        format!("{}@{}:{}", self.serial, self.server, self.port)
    }
}

/// Builder for [`ClientConfig`].
///
/// ```
/// use dcs_client::client::DcsClientBuilder;
///
/// let config = DcsClientBuilder::new()
///     .serial("1201002005050001")
///     .crypto_key("41424142414241424142414241424142")
///     .server("dcs.example.com")
///     .port(10001)
///     .build()
///     .unwrap();
/// assert_eq!(config.port, 10001);
/// ```
#[derive(Debug, Clone, Default)]
pub struct DcsClientBuilder {
    serial: String,
    crypto_key: String,
    server: String,
    port: u32,
    timeouts: Timeouts,
}

impl DcsClientBuilder {
    /// Create a new client builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the 16-character device serial.
    pub fn serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = serial.into();
        self
    }

    /// Set the 32-hex-digit crypto key.
    pub fn crypto_key(mut self, key: impl Into<String>) -> Self {
        self.crypto_key = key.into();
        self
    }

    /// Set the server host.
    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.server = server.into();
        self
    }

    /// Set the server port.
    pub fn port(mut self, port: u32) -> Self {
        self.port = port;
        self
    }

    /// Replace all timing knobs.
    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set the ack timeout.
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.ack = timeout;
        self
    }

    /// Set the keep-alive timeout.
    pub fn keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.keep_alive = timeout;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        let serial = Serial::parse(&self.serial).ok_or(ConfigError::InvalidSerial(self.serial))?;
        let crypto_key =
            CryptoKey::from_hex(&self.crypto_key).map_err(|_| ConfigError::InvalidCryptoKey)?;

        let server = self.server.trim();
        if server.is_empty() {
            return Err(ConfigError::MissingServer);
        }

        let port = u16::try_from(self.port)
            .ok()
            .filter(|port| *port != 0)
            .ok_or(ConfigError::InvalidPort(self.port))?;

        Ok(ClientConfig {
            serial,
            crypto_key,
            server: server.to_string(),
            port,
            timeouts: self.timeouts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> DcsClientBuilder {
        DcsClientBuilder::new()
            .serial("1201002005050001")
            .crypto_key("41424142414241424142414241424142")
            .server("localhost")
            .port(10001)
    }

    #[test]
    fn test_build_valid() {
        let config = valid().build().unwrap();
        assert_eq!(config.serial.as_str(), "1201002005050001");
        assert_eq!(config.crypto_key.as_bytes(), b"ABABABABABABABAB");
        assert_eq!(config.server, "localhost");
        assert_eq!(config.port, 10001);
        assert_eq!(config.timeouts, Timeouts::default());
        assert_eq!(config.label(), "1201002005050001@localhost:10001");
    }

    #[test]
    fn test_invalid_serial() {
        for serial in ["", "120100200505000", "12010020050500011", "1201002005050\u{e9}1"] {
            let err = valid().serial(serial).build().unwrap_err();
            assert_eq!(err, ConfigError::InvalidSerial(serial.to_string()));
        }
    }

    #[test]
    fn test_invalid_key() {
        for key in ["", "4142", "414241424142414241424142414241424", "ZZ424142414241424142414241424142"] {
            assert_eq!(
                valid().crypto_key(key).build().unwrap_err(),
                ConfigError::InvalidCryptoKey
            );
        }
    }

    #[test]
    fn test_missing_server() {
        assert_eq!(valid().server("  ").build().unwrap_err(), ConfigError::MissingServer);
    }

    #[test]
    fn test_invalid_port() {
        assert_eq!(valid().port(0).build().unwrap_err(), ConfigError::InvalidPort(0));
        assert_eq!(
            valid().port(65536).build().unwrap_err(),
            ConfigError::InvalidPort(65536)
        );
        assert_eq!(valid().port(65535).build().unwrap().port, 65535);
        assert_eq!(valid().port(1).build().unwrap().port, 1);
    }

    #[test]
    fn test_timeout_overrides() {
        let config = valid()
            .ack_timeout(Duration::from_millis(200))
            .keep_alive_timeout(Duration::from_secs(1))
            .build()
            .unwrap();
        assert_eq!(config.timeouts.ack, Duration::from_millis(200));
        assert_eq!(config.timeouts.keep_alive, Duration::from_secs(1));

        let policy = config.timeouts.connect_policy();
        assert_eq!(policy.retries, SOCKET_RETRIES);
        assert_eq!(policy.connect_timeout, CONNECT_TIMEOUT);
    }

    #[test]
    fn test_timeouts_from_json_uses_defaults() {
        let timeouts: Timeouts =
            serde_json::from_str(r#"{"ack":{"secs":1,"nanos":0}}"#).unwrap();
        assert_eq!(timeouts.ack, Duration::from_secs(1));
        assert_eq!(timeouts.keep_alive, KEEPALIVE_TIMEOUT);
    }
}

//! Protocol constants for the DCS wire format and session timing.
//!
//! Wire values are fixed by the cloud side and MUST NOT be changed. Timing
//! values are the defaults used by [`Timeouts`](crate::client::Timeouts).

use std::time::Duration;

// =============================================================================
// IDENTITY AND KEYS
// =============================================================================

/// Device serial length in ASCII characters.
pub const SERIAL_LEN: usize = 16;

/// Crypto key length as configured (hex digits).
pub const CRYPTO_KEY_HEX_LEN: usize = 32;

/// Crypto key length in raw bytes.
pub const CRYPTO_KEY_SIZE: usize = 16;

/// Cipher block size (64-bit block cipher).
pub const BLOCK_SIZE: usize = 8;

/// Size of the random vector prepended to every non-empty plaintext.
pub const PAYLOAD_VECTOR_SIZE: usize = 8;

// =============================================================================
// FRAME LAYOUT
// =============================================================================

/// Fixed frame header size.
pub const HEADER_SIZE: usize = 32;

/// Number of reserved zero bytes closing the header.
pub const HEADER_RESERVED_SIZE: usize = 9;

/// Largest encrypted payload the 16-bit length field can describe.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Ack byte value for a positive acknowledgement (and every normal frame).
pub const ACK_POSITIVE: u8 = 0x01;

/// Ack byte value for a negative acknowledgement.
pub const ACK_NEGATIVE: u8 = 0x00;

// =============================================================================
// TIMING
// =============================================================================

/// How long a request waits for its acknowledgement.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// Upper bound for writing one frame to the socket.
pub const SEND_TIMEOUT: Duration = ACK_TIMEOUT;

/// Reconnect if nothing was received for this long.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(25);

/// Pending requests older than this are swept regardless of state.
pub const TID_BLOCK_TIME: Duration = Duration::from_secs(90);

/// Connect retries after the first failed attempt.
pub const SOCKET_RETRIES: u32 = 3;

/// Pause between connect attempts and after receive errors.
pub const SOCKET_RETRY_WAIT: Duration = Duration::from_secs(1);

/// Upper bound for a single TCP connect attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long stopping waits for a worker task before aborting it.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Bounded wait of one receiver poll.
pub const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// BUFFERS
// =============================================================================

/// Capacity of the inbound message queue.
pub const RECEIVE_QUEUE_SIZE: usize = 10;

/// Bytes requested from the socket per read.
pub const RECV_BUFFER_SIZE: usize = 2048;

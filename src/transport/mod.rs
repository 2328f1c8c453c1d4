//! DCS Protocol - Transport Layer
//!
//! - **Frame encoding/decoding**: [`FrameCodec`], [`FrameHeader`] and the
//!   encrypted payload convention
//! - **Socket ownership**: [`Transport`], the single source of truth for
//!   whether a socket is open
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │    Client (dispatch, ack tracking)      │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │   32-byte header, XTEA-CBC payload      │
//! ├─────────────────────────────────────────┤
//! │              TCP                        │
//! └─────────────────────────────────────────┘
//! ```

mod error;
mod frame;
mod socket;

pub use error::*;
pub use frame::*;
pub use socket::*;

//! TCP link between the hub and its charging stations.
//!
//! A station opens the connection and sends a fixed-size hello carrying its
//! serial number. After that both sides exchange length-prefixed frames:
//! commands from the hub are answered one at a time, while the station
//! pushes telemetry whenever it likes.

mod connection;
mod frame;
mod handshake;
pub mod messages;
mod server;

use thiserror::Error;

pub use crate::connection::{LinkSettings, StationConnection, serve_connection};
pub use crate::frame::{Frame, FrameCodec, MAX_PAYLOAD};
pub use crate::handshake::{HELLO_LEN, Hello, read_hello};
pub use crate::server::StationServer;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame of {len} bytes exceeds the limit")]
    FrameTooLarge { len: usize },
    #[error("Unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("Malformed {what} payload of {len} bytes")]
    Malformed { what: &'static str, len: usize },
    #[error("Invalid {field} value {value}")]
    InvalidValue { field: &'static str, value: u8 },
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("Expected {expected}, got {got}")]
    UnexpectedReply { expected: &'static str, got: String },
    #[error("Request {request_type} rejected with status {status}")]
    Rejected { request_type: u8, status: u8 },
    #[error("Connection closed")]
    Closed,
}

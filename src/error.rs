//! Error types for the desk control stack.

use thiserror::Error;

/// Malformed DPG notification or telemetry payload.
///
/// These are contained at the notification boundary: a bad payload is
/// logged and dropped, it never tears down the link.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// DPG control packets must carry 0x01 in the first byte.
    #[error("DPG packet preamble must be 0x01, got {0:#04x}")]
    BadPreamble(u8),
    /// Payload is the wrong size for what it claims to be.
    #[error("unexpected payload length: {0}")]
    BadLength(usize),
}

/// Connection and transport failures, propagated unmodified above the
/// single built-in reconnect attempt.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("no Bluetooth adapter available")]
    AdapterUnavailable,

    #[error("desk {0} not found on the adapter")]
    DeviceNotFound(String),

    /// Both the initial connect and its one retry failed.
    #[error("connection failed after retry")]
    ConnectFailed(#[source] btleplug::Error),

    #[error("characteristic {0} not found on the device")]
    CharacteristicNotFound(&'static str),

    #[error("not connected")]
    NotConnected,

    #[error(transparent)]
    Transport(#[from] btleplug::Error),
}

/// A queried field never arrived within the wait ceiling.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

/// Umbrella error returned by the public desk API.
#[derive(Error, Debug)]
pub enum DeskError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("favorite position {0} does not exist")]
    InvalidFavoriteSlot(u8),
}

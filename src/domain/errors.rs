//! Error types shared by the transport, referee and result store.
//!
//! Not every failure is an error here: an ignored send, a defaulted sensor
//! frame and a false start are logged or modelled as duel outcomes instead.

use thiserror::Error;

/// Failures of the wireless link. All of them leave the session in
/// `Failed` or `Disconnected`; nothing reconnects on its own.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Bluetooth is OFF")]
    Unavailable,

    #[error("No device named \"{0}...\" found")]
    DiscoveryTimeout(String),

    #[error("Connection failed (status={0})")]
    ConnectFailure(i32),

    #[error("Service discovery failed (status={0})")]
    DiscoveryFailed(i32),

    #[error("Connected, but {0} not found")]
    CapabilityMissing(String),

    #[error("Bluetooth backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum DuelError {
    #[error("Duel in progress!")]
    AlreadyInProgress,
}

/// Result store failures. Advisory only: they never touch duel state.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to save duel result: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to read duel results: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to encode duel result: {0}")]
    Encode(#[from] serde_json::Error),
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the stream client.
//!
//! Errors are categorized by where they occur on the wire path. Transport
//! and protocol errors are emitted as signals on the endpoint's error
//! channel, never returned synchronously from a read or write call.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Io` | Yes | Socket errors, connection loss, timeouts |
//! | `Protocol` | No | The store replied with an `-ERR` frame |
//! | `Frame` | No | Declared bulk-string length did not match the payload |
//! | `Handshake` | No | HELLO / CLIENT ID negotiation failed |
//! | `Config` | No | Endpoint configuration invalid |
//! | `Closed` | No | Operation on an endpoint that has shut down |
//! | `ShutdownTimeout` | No | The final-reply race timed out during teardown |
//!
//! # Retry Behavior
//!
//! Use [`StreamError::is_retryable()`] to decide whether an operation
//! should be reattempted. Only transport errors are retryable; the
//! supervisory reconnect loop handles those automatically when
//! `auto_reconnect` is set.

use thiserror::Error;

/// Result type alias for stream client operations.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors that can occur while talking to the store.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Socket-level error (connect failure, reset, unexpected EOF).
    ///
    /// Retryable: the supervisory loop reconnects when enabled.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The store replied with an error frame.
    ///
    /// The connection usually remains usable; the offending command is
    /// identified so callers can correlate the failure.
    #[error("Protocol error ({command}): {message}")]
    Protocol { command: String, message: String },

    /// Frame integrity violation: a bulk string declared one length but
    /// carried another. The malformed frame is discarded and decoding
    /// continues.
    #[error("Frame integrity error: {0}")]
    Frame(String),

    /// The HELLO / CLIENT ID handshake did not complete.
    ///
    /// Typically bad credentials or a store that does not speak RESP3.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The endpoint has already shut down.
    #[error("Endpoint closed")]
    Closed,

    /// Teardown raced the final reply against the configured timeout and
    /// the timeout won. The socket is still released.
    #[error("Shutdown timed out waiting for final reply")]
    ShutdownTimeout,
}

impl StreamError {
    /// Create a protocol error for a specific command.
    pub fn protocol(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a frame integrity error.
    pub fn frame(message: impl Into<String>) -> Self {
        Self::Frame(message.into())
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(_) => true, // Transport errors are retryable
            Self::Protocol { .. } => false,
            Self::Frame(_) => false, // Wire corruption
            Self::Handshake(_) => false,
            Self::Config(_) => false,
            Self::Closed => false,
            Self::ShutdownTimeout => false,
        }
    }
}

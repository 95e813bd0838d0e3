// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection lifecycle and reply framing.
//!
//! A [`Connection`] owns exactly one TCP socket. The endpoint task that
//! created it is the only writer and the only reader; there is no shared
//! mutable connection state. Endpoints publish the [`ConnectionState`]
//! transitions on a `watch` channel so callers can observe
//! `Disconnected → Connecting → Handshaking → Ready → Closing → Closed`
//! without touching the socket.
//!
//! Framing: bytes from the socket are run through the stateless decoder;
//! leftover bytes carry over between reads, and [`Connection::read_reply`]
//! returns exactly one complete reply's worth of tokens. Frame-integrity
//! errors found along the way accumulate and are drained by the endpoint
//! via [`Connection::take_frame_errors`].

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::resp::{self, Token};

/// Observable lifecycle of an endpoint's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket. Initial state, and the state between reconnect attempts.
    Disconnected,
    /// TCP connect in flight.
    Connecting,
    /// Socket open, HELLO / CLIENT ID exchange in flight.
    Handshaking,
    /// Handshake complete; commands may flow.
    Ready,
    /// Teardown started.
    Closing,
    /// Terminal. The endpoint will not reconnect.
    Closed,
}

/// One TCP connection to the store, with reply framing.
pub struct Connection {
    stream: TcpStream,
    /// Bytes read but not yet forming a complete token.
    carry: Vec<u8>,
    /// Tokens decoded but not yet forming a complete reply.
    tokens: Vec<Token>,
    /// Integrity errors found while decoding, drained by the endpoint.
    frame_errors: Vec<StreamError>,
    client_id: Option<i64>,
}

impl Connection {
    /// Open a raw TCP connection. No handshake is performed; the forced
    /// unblock path uses the socket bare.
    pub async fn connect(config: &StreamConfig) -> Result<Self> {
        let stream = TcpStream::connect(config.address()).await?;
        // Command frames are tiny; do not let them sit in Nagle's buffer.
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            carry: Vec::new(),
            tokens: Vec::new(),
            frame_errors: Vec::new(),
            client_id: None,
        })
    }

    /// Run the RESP3 handshake: `HELLO 3 [AUTH <user> <password>]`, then
    /// `CLIENT ID` to learn the id used for forced unblock.
    ///
    /// Any error reply during the handshake is fatal for the connection,
    /// whatever its error class.
    pub async fn handshake(&mut self, config: &StreamConfig) -> Result<()> {
        match &config.password {
            Some(password) => {
                self.send_command(&["HELLO", "3", "AUTH", &config.username, password])
                    .await?
            }
            None => self.send_command(&["HELLO", "3"]).await?,
        }
        let reply = self.read_reply().await?;
        if let Some(Token::Error(msg)) = reply.first() {
            return Err(StreamError::Handshake(msg.clone()));
        }

        self.send_command(&["CLIENT", "ID"]).await?;
        let reply = self.read_reply().await?;
        match reply.first() {
            Some(Token::Int(id)) => {
                self.client_id = Some(*id);
                debug!(client_id = *id, "handshake complete");
                Ok(())
            }
            Some(Token::Error(msg)) => Err(StreamError::Handshake(msg.clone())),
            other => Err(StreamError::Handshake(format!(
                "unexpected CLIENT ID reply: {:?}",
                other
            ))),
        }
    }

    /// Server-assigned client id, once the handshake has run.
    pub fn client_id(&self) -> Option<i64> {
        self.client_id
    }

    /// Encode and write one command, flushing it onto the wire.
    pub async fn send_command(&mut self, parts: &[&str]) -> Result<()> {
        let wire = resp::encode_command(parts);
        self.stream.write_all(&wire).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read exactly one complete reply.
    ///
    /// Blocks until the frame is whole; tokens beyond the frame stay queued
    /// for the next call. A closed socket mid-frame is an IO error.
    pub async fn read_reply(&mut self) -> Result<Vec<Token>> {
        loop {
            if let Some(len) = resp::frame_len(&self.tokens) {
                return Ok(self.tokens.drain(..len).collect());
            }
            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(StreamError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                )));
            }
            self.carry.extend_from_slice(&buf[..n]);
            let decoded = resp::decode(&self.carry);
            self.carry = decoded.remainder;
            self.tokens.extend(decoded.tokens);
            self.frame_errors.extend(decoded.errors);
        }
    }

    /// Drain frame-integrity errors accumulated since the last call.
    pub fn take_frame_errors(&mut self) -> Vec<StreamError> {
        std::mem::take(&mut self.frame_errors)
    }

    /// Shut down the write half, letting any final bytes flush.
    pub async fn close_write(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Translate an `-ERR` reply into a protocol error for `command`.
///
/// Non-`ERR` classes (notably `BUSYGROUP`) pass through as `None`: the store
/// is the authority on whether they matter, and the callers that can see
/// them treat them as benign.
pub fn protocol_error(reply: &[Token], command: &str) -> Option<StreamError> {
    match reply.first() {
        Some(token @ Token::Error(msg)) if token.is_err_class() => {
            Some(StreamError::protocol(command, msg.clone()))
        }
        _ => None,
    }
}

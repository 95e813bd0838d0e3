// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Consumer endpoint: blocking consumer-group reads, one entry at a time.
//!
//! A [`StreamConsumer`] spawns one task that owns the socket and drives the
//! session sequentially: connect, handshake, ensure the group exists, then
//! loop on `XREADGROUP ... BLOCK 0 COUNT 1`. There is never more than one
//! blocking read in flight; the loop issues the next read only after a slot
//! in the bounded delivery channel has been reserved, so a slow caller
//! throttles the read rate instead of growing a queue.
//!
//! Transport failures tear the session down and, with `auto_reconnect` set,
//! start a fresh one from the handshake; the group-ensure runs again on
//! every session (`BUSYGROUP` from the store is the normal answer after the
//! first time and is not an error here). Malformed frames are reported on
//! the error channel and skipped.

use futures::Stream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::connection::{protocol_error, Connection, ConnectionState};
use crate::entry::StreamEntry;
use crate::error::{Result, StreamError};
use crate::resp::{parse_read_reply, Token};
use crate::shutdown;

/// How a consumer session ended, deciding what the outer loop does next.
enum SessionEnd {
    /// Close requested. `pending_read` marks a blocking read still in
    /// flight on the connection, which teardown must interrupt.
    Shutdown {
        conn: Option<Connection>,
        pending_read: bool,
    },
    /// Transport failure; reconnect if configured.
    Disconnected,
}

/// Reading endpoint for one stream, via a consumer group.
pub struct StreamConsumer {
    entries_rx: mpsc::Receiver<StreamEntry>,
    errors_rx: Option<mpsc::UnboundedReceiver<StreamError>>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<Result<()>>>,
}

impl StreamConsumer {
    /// Validate the config and spawn the endpoint task.
    ///
    /// Returns immediately; connection progress is observable via
    /// [`state`](Self::state) and failures via [`errors`](Self::errors).
    pub fn connect(config: StreamConfig) -> Result<Self> {
        config.validate()?;
        let group = config.group_name();
        let consumer = config.consumer_name();

        let (entries_tx, entries_rx) = mpsc::channel(config.entry_buffer);
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(stream = %config.stream, group = %group, consumer = %consumer, "starting consumer");
        let task = ConsumerTask {
            config,
            group,
            consumer,
            entries_tx,
            errors_tx,
            state_tx,
            shutdown_rx,
        };
        let handle = tokio::spawn(task.run());

        Ok(Self {
            entries_rx,
            errors_rx: Some(errors_rx),
            state_rx,
            shutdown_tx,
            task: Some(handle),
        })
    }

    /// Receive the next entry. Returns `None` once the endpoint has closed
    /// and the delivery channel has drained.
    pub async fn recv(&mut self) -> Option<StreamEntry> {
        self.entries_rx.recv().await
    }

    /// The entries as a `futures::Stream`.
    pub fn entries(&mut self) -> impl Stream<Item = StreamEntry> + '_ {
        futures::stream::poll_fn(move |cx| self.entries_rx.poll_recv(cx))
    }

    /// Detach the error channel. Protocol and frame-integrity errors arrive
    /// here; transport errors too, before any reconnect attempt. Yields
    /// `None` after the first call.
    pub fn errors(&mut self) -> Option<mpsc::UnboundedReceiver<StreamError>> {
        self.errors_rx.take()
    }

    /// Watch the connection lifecycle.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Close the endpoint: stop reconnecting, interrupt any blocking read
    /// via a second connection, `QUIT`, and release the socket. Bounded by
    /// the configured shutdown timeout.
    pub async fn close(mut self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        match self.task.take() {
            Some(handle) => handle.await.map_err(|_| StreamError::Closed)?,
            None => Ok(()),
        }
    }
}

impl Drop for StreamConsumer {
    fn drop(&mut self) {
        // Unawaited teardown: the task still unblocks and quits on its own.
        let _ = self.shutdown_tx.send(true);
    }
}

struct ConsumerTask {
    config: StreamConfig,
    group: String,
    consumer: String,
    entries_tx: mpsc::Sender<StreamEntry>,
    errors_tx: mpsc::UnboundedSender<StreamError>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ConsumerTask {
    async fn run(mut self) -> Result<()> {
        let mut close_result = Ok(());
        loop {
            match self.drive_session().await {
                SessionEnd::Shutdown { conn, pending_read } => {
                    self.state_tx.send_replace(ConnectionState::Closing);
                    if let Some(conn) = conn {
                        close_result =
                            shutdown::graceful_close(conn, &self.config, pending_read).await;
                    }
                    break;
                }
                SessionEnd::Disconnected => {
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                    if !self.config.auto_reconnect {
                        break;
                    }
                    let delay = self.config.reconnect_delay_duration();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown_rx.wait_for(|stop| *stop) => break,
                    }
                }
            }
        }
        self.state_tx.send_replace(ConnectionState::Closed);
        info!(stream = %self.config.stream, "consumer closed");
        close_result
    }

    /// One connection's worth of work: connect, handshake, ensure the
    /// group, then the read loop.
    async fn drive_session(&mut self) -> SessionEnd {
        if *self.shutdown_rx.borrow() {
            return SessionEnd::Shutdown {
                conn: None,
                pending_read: false,
            };
        }

        self.state_tx.send_replace(ConnectionState::Connecting);
        let mut conn = tokio::select! {
            result = Connection::connect(&self.config) => match result {
                Ok(conn) => conn,
                Err(error) => {
                    warn!(address = %self.config.address(), error = %error, "connect failed");
                    let _ = self.errors_tx.send(error);
                    return SessionEnd::Disconnected;
                }
            },
            _ = self.shutdown_rx.wait_for(|stop| *stop) => {
                return SessionEnd::Shutdown { conn: None, pending_read: false };
            }
        };

        self.state_tx.send_replace(ConnectionState::Handshaking);
        // A store that accepts the socket but never answers must not pin
        // the task; teardown has to stay reachable through every await.
        let handshake = tokio::select! {
            result = conn.handshake(&self.config) => result,
            _ = self.shutdown_rx.wait_for(|stop| *stop) => {
                return SessionEnd::Shutdown { conn: Some(conn), pending_read: false };
            }
        };
        if let Err(error) = handshake {
            warn!(error = %error, "handshake failed");
            let retryable = error.is_retryable();
            let _ = self.errors_tx.send(error);
            if retryable {
                return SessionEnd::Disconnected;
            }
            // Bad credentials will not improve on retry.
            return SessionEnd::Shutdown {
                conn: Some(conn),
                pending_read: false,
            };
        }

        // Ensure the group before the first read. The store answers
        // BUSYGROUP once the group exists; that class is not an error.
        let sent = conn
            .send_command(&[
                "XGROUP",
                "CREATE",
                &self.config.stream,
                &self.group,
                "$",
                "MKSTREAM",
            ])
            .await;
        if let Err(error) = sent {
            let _ = self.errors_tx.send(error);
            return SessionEnd::Disconnected;
        }
        let reply = tokio::select! {
            result = conn.read_reply() => match result {
                Ok(reply) => reply,
                Err(error) => {
                    let _ = self.errors_tx.send(error);
                    return SessionEnd::Disconnected;
                }
            },
            _ = self.shutdown_rx.wait_for(|stop| *stop) => {
                return SessionEnd::Shutdown { conn: Some(conn), pending_read: false };
            }
        };
        if let Some(error) = protocol_error(&reply, "XGROUP CREATE") {
            warn!(group = %self.group, error = %error, "group create rejected");
            let _ = self.errors_tx.send(error);
        }

        self.state_tx.send_replace(ConnectionState::Ready);
        info!(stream = %self.config.stream, group = %self.group, "consumer ready");
        self.read_loop(conn).await
    }

    async fn read_loop(&mut self, mut conn: Connection) -> SessionEnd {
        loop {
            // Reserve the delivery slot first; the blocking read is only
            // issued once the entry has somewhere to go.
            let permit = tokio::select! {
                reserved = self.entries_tx.reserve() => match reserved {
                    Ok(permit) => permit,
                    // Receiver dropped: treat as close.
                    Err(_) => return SessionEnd::Shutdown {
                        conn: Some(conn),
                        pending_read: false,
                    },
                },
                _ = self.shutdown_rx.wait_for(|stop| *stop) => {
                    return SessionEnd::Shutdown { conn: Some(conn), pending_read: false };
                }
            };

            let issue = conn
                .send_command(&[
                    "XREADGROUP",
                    "GROUP",
                    &self.group,
                    &self.consumer,
                    "BLOCK",
                    "0",
                    "COUNT",
                    "1",
                    "STREAMS",
                    &self.config.stream,
                    ">",
                ])
                .await;
            if let Err(error) = issue {
                let _ = self.errors_tx.send(error);
                return SessionEnd::Disconnected;
            }

            let reply = tokio::select! {
                result = conn.read_reply() => match result {
                    Ok(reply) => reply,
                    Err(error) => {
                        let _ = self.errors_tx.send(error);
                        return SessionEnd::Disconnected;
                    }
                },
                _ = self.shutdown_rx.wait_for(|stop| *stop) => {
                    // The read is in flight; teardown must unblock it.
                    return SessionEnd::Shutdown { conn: Some(conn), pending_read: true };
                }
            };

            for error in conn.take_frame_errors() {
                warn!(error = %error, "dropped malformed frame");
                let _ = self.errors_tx.send(error);
            }

            if let Some(error) = protocol_error(&reply, "XREADGROUP") {
                warn!(error = %error, "read rejected");
                let _ = self.errors_tx.send(error);
                // A persistent rejection (NOGROUP after a server-side group
                // delete, say) must not re-issue at network speed.
                tokio::select! {
                    _ = tokio::time::sleep(self.config.reconnect_delay_duration()) => {}
                    _ = self.shutdown_rx.wait_for(|stop| *stop) => {
                        return SessionEnd::Shutdown { conn: Some(conn), pending_read: false };
                    }
                }
                continue;
            }
            if matches!(reply.first(), Some(Token::Null) | None) {
                // Unblocked or empty; re-issue.
                continue;
            }

            match parse_read_reply(&reply, &self.config.stream) {
                Some(entry) => {
                    debug!(id = %entry.id, fields = entry.fields.len(), "entry received");
                    permit.send(entry);
                }
                None => {
                    debug!("ignoring reply with unexpected shape");
                }
            }
        }
    }
}

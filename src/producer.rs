// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Producer endpoint: fire-and-forget appends.
//!
//! A [`StreamProducer`] accepts records at any time. While the connection is
//! not `Ready` they queue in arrival order; on (re)connect the queue drains
//! strictly before newer writes, so the stream sees submissions in the order
//! they were made. Once ready there is no buffering: each record becomes an
//! `XADD` immediately.
//!
//! There is no per-write acknowledgment. Replies are still read off the
//! socket; `-ERR` frames and disconnects surface on the error channel, which
//! is how liveness is observed.

use std::collections::VecDeque;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::connection::{protocol_error, Connection, ConnectionState};
use crate::entry::Record;
use crate::error::{Result, StreamError};
use crate::resp::Token;
use crate::shutdown;

enum SessionEnd {
    Shutdown { conn: Option<Connection> },
    Disconnected,
}

/// Appending endpoint for one stream.
pub struct StreamProducer {
    writes_tx: mpsc::UnboundedSender<Record>,
    errors_rx: Option<mpsc::UnboundedReceiver<StreamError>>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<Result<()>>>,
}

impl StreamProducer {
    /// Validate the config and spawn the endpoint task.
    pub fn connect(config: StreamConfig) -> Result<Self> {
        config.validate()?;

        let (writes_tx, writes_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(stream = %config.stream, "starting producer");
        let task = ProducerTask {
            config,
            writes_rx,
            errors_tx,
            state_tx,
            shutdown_rx,
            pending: VecDeque::new(),
        };
        let handle = tokio::spawn(task.run());

        Ok(Self {
            writes_tx,
            errors_rx: Some(errors_rx),
            state_rx,
            shutdown_tx,
            task: Some(handle),
        })
    }

    /// Submit a record for appending.
    ///
    /// Never blocks: the record is queued if the connection is not ready.
    /// Errors only if the record is empty or the endpoint has closed.
    pub fn write(&self, record: Record) -> Result<()> {
        if record.is_empty() {
            return Err(StreamError::Config(
                "record must contain at least one field".into(),
            ));
        }
        self.writes_tx.send(record).map_err(|_| StreamError::Closed)
    }

    /// Detach the error channel. Yields `None` after the first call.
    pub fn errors(&mut self) -> Option<mpsc::UnboundedReceiver<StreamError>> {
        self.errors_rx.take()
    }

    /// Watch the connection lifecycle.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Close the endpoint: stop reconnecting, `QUIT`, and release the
    /// socket. Queued records that never reached the wire are dropped.
    pub async fn close(mut self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        match self.task.take() {
            Some(handle) => handle.await.map_err(|_| StreamError::Closed)?,
            None => Ok(()),
        }
    }
}

impl Drop for StreamProducer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

struct ProducerTask {
    config: StreamConfig,
    writes_rx: mpsc::UnboundedReceiver<Record>,
    errors_tx: mpsc::UnboundedSender<StreamError>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    /// Records that reached the task but not the wire. Drained in order
    /// before anything newer whenever the connection becomes ready.
    pending: VecDeque<Record>,
}

enum Next {
    Write(Option<Record>),
    Reply(Result<Vec<Token>>),
    Stop,
}

impl ProducerTask {
    async fn run(mut self) -> Result<()> {
        let mut close_result = Ok(());
        loop {
            match self.drive_session().await {
                SessionEnd::Shutdown { conn } => {
                    self.state_tx.send_replace(ConnectionState::Closing);
                    if !self.pending.is_empty() {
                        warn!(dropped = self.pending.len(), "closing with unflushed records");
                    }
                    if let Some(conn) = conn {
                        close_result = shutdown::graceful_close(conn, &self.config, false).await;
                    }
                    break;
                }
                SessionEnd::Disconnected => {
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                    if !self.config.auto_reconnect {
                        break;
                    }
                    if self.wait_before_reconnect().await {
                        break;
                    }
                }
            }
        }
        self.state_tx.send_replace(ConnectionState::Closed);
        info!(stream = %self.config.stream, "producer closed");
        close_result
    }

    /// Sleep out the reconnect delay while still accepting writes into the
    /// queue. Returns true if shutdown was requested meanwhile.
    async fn wait_before_reconnect(&mut self) -> bool {
        let deadline = tokio::time::Instant::now() + self.config.reconnect_delay_duration();
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return false,
                _ = self.shutdown_rx.wait_for(|stop| *stop) => return true,
                record = self.writes_rx.recv() => match record {
                    Some(record) => self.pending.push_back(record),
                    None => return true,
                },
            }
        }
    }

    async fn drive_session(&mut self) -> SessionEnd {
        if *self.shutdown_rx.borrow() {
            return SessionEnd::Shutdown { conn: None };
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
                return SessionEnd::Shutdown { conn: None };
            }
        };

        self.state_tx.send_replace(ConnectionState::Handshaking);
        // Teardown must stay reachable even if the store never answers
        // HELLO on an accepted socket.
        let handshake = tokio::select! {
            result = conn.handshake(&self.config) => result,
            _ = self.shutdown_rx.wait_for(|stop| *stop) => {
                return SessionEnd::Shutdown { conn: Some(conn) };
            }
        };
        if let Err(error) = handshake {
            warn!(error = %error, "handshake failed");
            let retryable = error.is_retryable();
            let _ = self.errors_tx.send(error);
            if retryable {
                return SessionEnd::Disconnected;
            }
            return SessionEnd::Shutdown { conn: Some(conn) };
        }

        self.state_tx.send_replace(ConnectionState::Ready);
        info!(stream = %self.config.stream, queued = self.pending.len(), "producer ready");

        // Queued records go first, in submission order.
        while let Some(record) = self.pending.pop_front() {
            if let Err(error) = self.append(&mut conn, &record).await {
                self.pending.push_front(record);
                let _ = self.errors_tx.send(error);
                return SessionEnd::Disconnected;
            }
        }

        self.write_loop(conn).await
    }

    async fn write_loop(&mut self, mut conn: Connection) -> SessionEnd {
        loop {
            let next = tokio::select! {
                record = self.writes_rx.recv() => Next::Write(record),
                reply = conn.read_reply() => Next::Reply(reply),
                _ = self.shutdown_rx.wait_for(|stop| *stop) => Next::Stop,
            };
            match next {
                Next::Write(Some(record)) => {
                    if let Err(error) = self.append(&mut conn, &record).await {
                        self.pending.push_front(record);
                        let _ = self.errors_tx.send(error);
                        return SessionEnd::Disconnected;
                    }
                }
                Next::Write(None) | Next::Stop => {
                    return SessionEnd::Shutdown { conn: Some(conn) };
                }
                Next::Reply(Ok(reply)) => {
                    for error in conn.take_frame_errors() {
                        let _ = self.errors_tx.send(error);
                    }
                    if let Some(error) = protocol_error(&reply, "XADD") {
                        warn!(error = %error, "append rejected");
                        let _ = self.errors_tx.send(error);
                    }
                }
                Next::Reply(Err(error)) => {
                    let _ = self.errors_tx.send(error);
                    return SessionEnd::Disconnected;
                }
            }
        }
    }

    async fn append(&self, conn: &mut Connection, record: &Record) -> Result<()> {
        let args = record.to_wire_args();
        let mut parts: Vec<&str> = Vec::with_capacity(3 + args.len());
        parts.push("XADD");
        parts.push(&self.config.stream);
        parts.push("*");
        parts.extend(args.iter().map(String::as_str));
        conn.send_command(&parts).await?;
        debug!(fields = record.len(), "record appended");
        Ok(())
    }
}

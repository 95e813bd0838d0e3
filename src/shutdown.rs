// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Graceful teardown shared by both endpoints.
//!
//! Teardown must be bounded in time even when the store has gone away, and
//! the consumer's indefinitely-blocking read must be interrupted from the
//! outside: the store only notices `CLIENT UNBLOCK` arriving on a *different*
//! connection. That second connection is a one-shot background task which
//! shares nothing with the endpoint beyond the read-only client id; it never
//! handshakes, it just fires the unblock, says `QUIT` and hangs up.
//!
//! Order on the primary connection: interrupt the pending read (consumer
//! only), race the final reply against the configured timeout, then `QUIT`
//! and release the socket. Whatever goes wrong in between, the socket is
//! released and the error becomes the result of `close()`.

use tracing::{debug, warn};

use crate::config::StreamConfig;
use crate::connection::Connection;
use crate::error::{Result, StreamError};

/// Fire `CLIENT UNBLOCK <id>` at the store from a fresh connection.
///
/// Best-effort: failures are logged, not returned, since the primary
/// connection's teardown race also has the timeout as a backstop.
pub(crate) async fn send_unblock(config: &StreamConfig, client_id: i64) {
    let id = client_id.to_string();
    let attempt = async {
        let mut conn = Connection::connect(config).await?;
        conn.send_command(&["CLIENT", "UNBLOCK", &id]).await?;
        conn.send_command(&["QUIT"]).await?;
        conn.close_write().await?;
        Ok::<_, StreamError>(())
    };
    match tokio::time::timeout(config.shutdown_timeout_duration(), attempt).await {
        Ok(Ok(())) => debug!(client_id, "forced unblock sent"),
        Ok(Err(error)) => warn!(client_id, error = %error, "forced unblock failed"),
        Err(_) => warn!(client_id, "forced unblock timed out"),
    }
}

/// Tear down the primary connection.
///
/// `pending_read` is true when a blocking read is still in flight on this
/// connection; the coordinator then spawns the unblock one-shot and consumes
/// the interrupted read's reply before saying `QUIT`. Each wait races the
/// configured shutdown timeout. The socket is released on every path.
pub(crate) async fn graceful_close(
    mut conn: Connection,
    config: &StreamConfig,
    pending_read: bool,
) -> Result<()> {
    let timeout = config.shutdown_timeout_duration();
    let mut result = Ok(());

    if pending_read {
        if let Some(client_id) = conn.client_id() {
            let unblock_config = config.clone();
            tokio::spawn(async move {
                send_unblock(&unblock_config, client_id).await;
            });
        }
        // The unblocked read resolves with a null reply (or an error frame
        // if the store objected); either way the frame must be consumed
        // before QUIT, or the timeout wins.
        match tokio::time::timeout(timeout, conn.read_reply()).await {
            Ok(Ok(_reply)) => {}
            Ok(Err(error)) => result = Err(error),
            Err(_) => result = Err(StreamError::ShutdownTimeout),
        }
    }

    if result.is_ok() {
        let quit = async {
            conn.send_command(&["QUIT"]).await?;
            conn.read_reply().await?;
            Ok::<_, StreamError>(())
        };
        match tokio::time::timeout(timeout, quit).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => result = Err(error),
            Err(_) => result = Err(StreamError::ShutdownTimeout),
        }
    }

    if let Err(error) = conn.close_write().await {
        debug!(error = %error, "socket already gone at close");
    }
    result
}

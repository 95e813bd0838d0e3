// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # resp-stream
//!
//! A minimal client for append-only streams over the RESP3 wire protocol,
//! speaking directly to a raw TCP socket. No general-purpose client library
//! sits in between: the crate implements exactly the protocol subset the
//! stream commands need, and nothing else.
//!
//! Two independent endpoints:
//!
//! - [`StreamConsumer`] joins a consumer group and blocks on
//!   `XREADGROUP ... BLOCK 0 COUNT 1`, delivering entries one at a time
//!   through a bounded channel. The next blocking read is issued only after
//!   the previous entry has a delivery slot, so a slow caller throttles the
//!   read rate.
//! - [`StreamProducer`] appends records with `XADD`, fire-and-forget,
//!   queueing them in order while the connection is down.
//!
//! Both endpoints reconnect automatically, re-running the
//! `HELLO 3` / `CLIENT ID` handshake (and the consumer's group-ensure) on
//! every new connection. Teardown is bounded in time: the consumer's
//! indefinite block is interrupted with `CLIENT UNBLOCK` from a short-lived
//! second connection before `QUIT`.
//!
//! # Example
//!
//! ```rust,no_run
//! use resp_stream::{Record, StreamConfig, StreamConsumer, StreamProducer};
//!
//! # async fn demo() -> resp_stream::Result<()> {
//! let config = StreamConfig {
//!     stream: "events".into(),
//!     ..Default::default()
//! };
//!
//! let producer = StreamProducer::connect(config.clone())?;
//! producer.write(Record::new().field("kind", "signup").field("user", "u-17"))?;
//!
//! let mut consumer = StreamConsumer::connect(config)?;
//! while let Some(entry) = consumer.recv().await {
//!     println!("{}: {:?}", entry.id, entry.fields);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Out of scope
//!
//! Pub/sub, transactions, scripting, cluster redirects, TLS, multi-stream
//! multiplexing, pipelining, and acknowledgment bookkeeping (`XACK`) are all
//! deliberately absent.

pub mod config;
pub mod connection;
pub mod consumer;
pub mod entry;
pub mod error;
pub mod producer;
pub mod resp;

mod shutdown;

pub use config::StreamConfig;
pub use connection::ConnectionState;
pub use consumer::StreamConsumer;
pub use entry::{Record, StreamEntry};
pub use error::{Result, StreamError};
pub use producer::StreamProducer;

//! Shared test utilities for integration tests.
//!
//! Provides an in-process mock store speaking enough RESP3 to exercise the
//! endpoints end to end, with hooks for injecting entries, failures and
//! disconnects.

pub mod server;

pub use server::*;

//! Core types and pure logic for the Parley chat client.
//!
//! This crate is deliberately free of database and runtime dependencies. It
//! holds the data model, the [`store::RemoteStore`] adapter contract, the
//! local [`snapshot::SnapshotStore`] mirror and the derived views computed
//! from it. The engine and storage backends depend on it.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod conversation;
pub mod document;
pub mod error;
pub mod message;
pub mod notification;
pub mod snapshot;
pub mod store;
pub mod typing;
pub mod user;
pub mod view;

pub use error::{Error, Result};

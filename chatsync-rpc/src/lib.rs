//! Wire protocol and reconnecting duplex transport for the chat sync client.
//!
//! This crate knows nothing about sessions, buckets, or sync state — it only
//! speaks the framed RPC/push protocol over a websocket and reconnects when
//! the carrier drops.

#![warn(missing_docs)]
#![deny(unused_extern_crates)]

mod client;
mod error;
pub mod wire;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use client::{RpcTransport, TransportConfig};
pub use error::Error;

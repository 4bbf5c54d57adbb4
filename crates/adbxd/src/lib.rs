//! adbxd: local credential broker for database access.
//!
//! Clients authenticate over a Unix socket with the shared secret, may resume
//! a previous session with a rotating resume token, and then send JSON-RPC
//! tool calls that the query gateway checks, runs, and tokenizes.

pub mod broker;
pub mod client;
pub mod dispatch;
pub mod session;

pub use broker::Broker;
pub use client::{BrokerClient, ClientError, ClientOptions};

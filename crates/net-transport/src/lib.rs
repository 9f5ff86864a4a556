//! Network Transport - TCP endpoints for CryptoTunnel
//!
//! Client and server roles over blocking TCP sockets. Every connection runs
//! on its own OS threads: one receive loop and one key rotation timer; the
//! server adds an accept loop and a registry of live sessions.

mod client;
mod config;
mod connection;
mod error;
mod listener;
mod server;

pub use client::*;
pub use config::*;
pub use connection::{Connection, ConnectionId};
pub use error::*;
pub use listener::*;
pub use server::*;

/// Default tunnel port
pub const DEFAULT_TUNNEL_PORT: u16 = 19824;

//! Relay/mirror service for Canvas Sync.
//!
//! The relay hosts the WebSocket bus every party connects to, keeps an
//! authoritative mirror of the document, rebroadcasts mutations to everyone
//! but their sender, and exposes the automation facade over HTTP.

pub mod connection;
pub mod events;
pub mod facade;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod pending;
pub mod server;
pub mod state;

pub use facade::Automation;
pub use server::{router, serve, start_relay};
pub use state::RelayState;

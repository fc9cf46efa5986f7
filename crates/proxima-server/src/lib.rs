//! # proxima-server
//!
//! Host daemon for the proxima action engine.
//!
//! The daemon wires [`proxima_core::Engine`] to file storage and the HTTP
//! resolver, and exposes the platform boundary over HTTP so a radio stack
//! running elsewhere on the device can feed it transitions.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod logging;
pub mod resolver_client;
pub mod state;

pub use resolver_client::HttpResolver;
pub use state::{AppState, SharedState};

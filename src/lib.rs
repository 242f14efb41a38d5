//! # Robot-dog control server
//!
//! Serves a quadruped robot over two TCP ports:
//! - **Control (5001):** newline-delimited `CMD_*#param` text. Telemetry is
//!   answered inline, motion orders go through a newest-wins mailbox to a
//!   single high-priority motion executor.
//! - **Video (8001):** one viewer at a time, `[u32 LE length][JPEG]` frames.
//!
//! Background monitors guard the battery (debounced low-voltage lockout) and
//! the listeners (re-bind on closure). All hardware sits behind the traits in
//! [`hardware`]; [`hardware::sim`] provides simulated devices.

pub mod config;
pub mod error;
pub mod hardware;
pub mod monitor;
pub mod motion;
pub mod network;
pub mod protocol;
pub mod server;
pub mod utils;

pub use config::ServerConfig;
pub use error::ServerError;
pub use hardware::Hardware;
pub use server::Server;

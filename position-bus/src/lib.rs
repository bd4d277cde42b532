//! Position bus: a small pub/sub broadcast bus over raw TCP.
//!
//! Every participant publishes its latest "net position" and sees every
//! other participant's latest value in near real time. Each module focuses on
//! a concrete responsibility:
//!
//! - [`message`] defines the fixed 104-byte wire record plus async read and
//!   write helpers.
//! - [`server`] accepts connections, enforces unique identities, caches the
//!   last position per identity, and fans updates out through a worker pool.
//! - [`client`] keeps one connection to the server alive with a bounded
//!   reconnect loop and surfaces foreign updates.
//! - [`config`] and [`error`] hold the settings and error types shared by both
//!   sides.
//! - [`cli`] and [`publisher`] back the `position_bus` binary.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod publisher;
pub mod server;

pub use client::{ClientSession, SessionState};
pub use config::{ClientConfig, ServerConfig};
pub use error::BusError;
pub use message::WireMessage;
pub use server::PositionServer;

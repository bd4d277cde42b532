use std::io;

use thiserror::Error;

use crate::message::WireError;

#[derive(Debug, Error)]
pub enum BusError {
    /// Another live connection already holds this identity.
    #[error("identity '{identity}' is already registered")]
    HandshakeConflict { identity: String },

    /// Read or write failure on an established transport.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("invalid configuration: {message}")]
    Configuration { message: String },

    #[error("session is not connected")]
    NotConnected,

    #[error("session is stopped; create a new session to resume")]
    SessionStopped,

    #[error(transparent)]
    Wire(#[from] WireError),
}

impl BusError {
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

pub type Result<T, E = BusError> = std::result::Result<T, E>;

//! Fixed-width binary record exchanged by every participant.
//!
//! Byte layout of one record (104 bytes, no framing):
//!
//! ```text
//! [0, 64)    identity   UTF-8, null-padded
//! [64, 72)   position   IEEE-754 f64, little-endian
//! [72, 104)  timestamp  UTF-8, null-padded
//! ```
//!
//! Readers rely on the fixed size to split the stream, so every encoded
//! record is exactly [`WIRE_SIZE`] bytes.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const IDENTITY_LEN: usize = 64;
pub const POSITION_LEN: usize = 8;
pub const TIMESTAMP_LEN: usize = 32;
pub const WIRE_SIZE: usize = IDENTITY_LEN + POSITION_LEN + TIMESTAMP_LEN;

const POSITION_OFFSET: usize = IDENTITY_LEN;
const TIMESTAMP_OFFSET: usize = IDENTITY_LEN + POSITION_LEN;

/// `YYYY-Mon-DD HH:MM:SS`, e.g. `2024-Jan-05 14:03:22`.
const TIMESTAMP_FORMAT: &str = "%Y-%b-%d %H:%M:%S";

pub type Frame = [u8; WIRE_SIZE];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("identity is {len} bytes, the wire slot holds at most {max}", max = IDENTITY_LEN)]
    IdentityTooLong { len: usize },
}

/// One position update as carried on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    identity: String,
    position: f64,
    timestamp: String,
}

impl WireMessage {
    /// Builds a record, rejecting identities that do not fit their slot.
    ///
    /// Timestamps longer than [`TIMESTAMP_LEN`] bytes are truncated at the
    /// last character boundary that fits.
    pub fn new(
        identity: impl Into<String>,
        position: f64,
        timestamp: impl Into<String>,
    ) -> Result<Self, WireError> {
        let identity = identity.into();
        if identity.len() > IDENTITY_LEN {
            return Err(WireError::IdentityTooLong {
                len: identity.len(),
            });
        }

        let mut timestamp = timestamp.into();
        truncate_to_boundary(&mut timestamp, TIMESTAMP_LEN);

        Ok(Self {
            identity,
            position,
            timestamp,
        })
    }

    /// Record stamped with the current local time.
    pub fn now(identity: impl Into<String>, position: f64) -> Result<Self, WireError> {
        Self::new(identity, position, current_timestamp())
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    /// Relabels the record. Callers pass identities that already passed
    /// registration, so the slot bound holds.
    pub(crate) fn with_identity(mut self, identity: &str) -> Self {
        debug_assert!(identity.len() <= IDENTITY_LEN);
        self.identity.clear();
        self.identity.push_str(identity);
        self
    }

    pub fn encode(&self) -> Frame {
        let mut frame = [0u8; WIRE_SIZE];
        write_slot(&mut frame[..POSITION_OFFSET], &self.identity);
        frame[POSITION_OFFSET..TIMESTAMP_OFFSET].copy_from_slice(&self.position.to_le_bytes());
        write_slot(&mut frame[TIMESTAMP_OFFSET..], &self.timestamp);
        frame
    }

    pub fn decode(frame: &Frame) -> Self {
        let mut position = [0u8; POSITION_LEN];
        position.copy_from_slice(&frame[POSITION_OFFSET..TIMESTAMP_OFFSET]);

        Self {
            identity: read_slot(&frame[..POSITION_OFFSET]),
            position: f64::from_le_bytes(position),
            timestamp: read_slot(&frame[TIMESTAMP_OFFSET..]),
        }
    }
}

pub fn current_timestamp() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

fn write_slot(slot: &mut [u8], text: &str) {
    let bytes = text.as_bytes();
    let len = bytes.len().min(slot.len());
    slot[..len].copy_from_slice(&bytes[..len]);
}

fn read_slot(slot: &[u8]) -> String {
    let end = slot.iter().position(|&b| b == 0).unwrap_or(slot.len());
    String::from_utf8_lossy(&slot[..end]).into_owned()
}

fn truncate_to_boundary(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}

/// Reads one record.
///
/// Returns `Ok(None)` when the peer closes the stream on a record boundary and
/// an `UnexpectedEof` error when it closes mid-record.
pub async fn read_message<R>(reader: &mut R) -> io::Result<Option<WireMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut frame = [0u8; WIRE_SIZE];
    let mut filled = 0;
    while filled < WIRE_SIZE {
        let bytes = reader.read(&mut frame[filled..]).await?;
        if bytes == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream closed after {filled} of {WIRE_SIZE} record bytes"),
            ));
        }
        filled += bytes;
    }
    Ok(Some(WireMessage::decode(&frame)))
}

pub async fn write_message<W>(writer: &mut W, message: &WireMessage) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &message.encode()).await
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}

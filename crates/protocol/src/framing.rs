//! Newline-delimited JSON frame codec.
//!
//! # Frame Format
//!
//! Each frame is a single JSON document encoded on one line and terminated by
//! `\n`. JSON serialization never emits a raw newline, so the terminator is
//! unambiguous. Frames longer than [`MAX_FRAME_SIZE`] are rejected on both
//! encode and decode.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ProtocolError, Result};

/// Maximum frame size including the terminator (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Frame terminator.
pub const FRAME_TERMINATOR: u8 = b'\n';

/// Encodes and decodes newline-delimited JSON frames.
#[derive(Debug, Clone, Copy)]
pub struct LineCodec {
    max_frame_size: usize,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LineCodec {
    /// Create a codec with the default maximum frame size.
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with a custom maximum frame size.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Maximum accepted frame size.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a value into a terminated frame.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(value)?;
        bytes.push(FRAME_TERMINATOR);

        if bytes.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: bytes.len(),
                max: self.max_frame_size,
            });
        }

        Ok(bytes)
    }

    /// Decode a single frame. The trailing terminator is required; a
    /// preceding `\r` is tolerated.
    pub fn decode<T: DeserializeOwned>(&self, frame: &[u8]) -> Result<T> {
        if frame.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame_size,
            });
        }

        let body = frame
            .strip_suffix(&[FRAME_TERMINATOR])
            .ok_or(ProtocolError::IncompleteFrame)?;
        let body = body.strip_suffix(b"\r").unwrap_or(body);

        Ok(serde_json::from_slice(body)?)
    }
}

//! Wire framings.
//!
//! A codec turns a [`Command`] into the bytes written to the transport and
//! incrementally reassembles and validates the reply. The transaction queue
//! arms the codec with [`FrameCodec::encode`], feeds every arriving chunk to
//! [`FrameCodec::feed`] and writes whatever [`FrameCodec::take_reply`] yields
//! (handshake bytes) back to the device.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{
    command::Command,
    error::{ProtocolErrorKind, Result},
    types::TransactionState,
};

pub mod classic;
pub mod kettler;
pub mod premium;

pub use classic::FixedLengthCodec;
pub use kettler::LineCodec;
pub use premium::EscapedFrameCodec;

/// Outcome of feeding bytes to a codec
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeResult {
    /// Reply incomplete, buffered bytes are retained
    NeedMore,
    /// Complete, valid reply body
    Response(Bytes),
    /// Reply violates the framing rules
    FramingError {
        /// Failure category
        kind: ProtocolErrorKind,
        /// Human readable context
        detail: String,
    },
}

impl DecodeResult {
    pub(crate) fn framing(kind: ProtocolErrorKind, detail: impl Into<String>) -> Self {
        Self::FramingError {
            kind,
            detail: detail.into(),
        }
    }
}

/// A wire framing strategy
pub trait FrameCodec: Send {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Encode `command` and arm the decoder for its reply
    ///
    /// # Errors
    ///
    /// Returns [`crate::LinkError::InvalidParameters`] if the command cannot be
    /// expressed in this framing.
    fn encode(&mut self, command: &Command) -> Result<Bytes>;

    /// Feed newly arrived bytes
    fn feed(&mut self, data: &[u8]) -> DecodeResult;

    /// Handshake bytes the codec wants written back to the device
    fn take_reply(&mut self) -> Option<Bytes> {
        None
    }

    /// Phase of the armed transaction
    fn phase(&self) -> TransactionState {
        TransactionState::AwaitingFrame
    }

    /// Drop buffered bytes and disarm the decoder
    fn reset(&mut self);
}

/// Framing selected per device family at link construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecKind {
    /// Fixed-length binary with echo validation (Daum 8008 Classic)
    Classic,
    /// Escaped SOH/ETB frames with checksum and ACK/NAK (Daum 8i Premium)
    Premium,
    /// CRLF terminated ASCII lines (Kettler)
    Kettler,
}

impl CodecKind {
    /// Build a fresh codec of this kind
    #[must_use]
    pub fn build(self) -> Box<dyn FrameCodec> {
        match self {
            Self::Classic => Box::new(FixedLengthCodec::new()),
            Self::Premium => Box::new(EscapedFrameCodec::new()),
            Self::Kettler => Box::new(LineCodec::new()),
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Classic => write!(f, "classic"),
            Self::Premium => write!(f, "premium"),
            Self::Kettler => write!(f, "kettler"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_kind_build() {
        assert_eq!(CodecKind::Classic.build().name(), "classic");
        assert_eq!(CodecKind::Premium.build().name(), "premium");
        assert_eq!(CodecKind::Kettler.build().name(), "kettler");
    }

    #[test]
    fn test_premium_starts_awaiting_ack() {
        let mut codec = CodecKind::Premium.build();
        codec
            .encode(&Command::binary("V00", b"V00".to_vec()))
            .unwrap();
        assert_eq!(codec.phase(), TransactionState::AwaitingAck);

        let mut codec = CodecKind::Classic.build();
        codec
            .encode(&Command::binary("checkCockpit", vec![0x10, 0x00]).expect_reply_length(3))
            .unwrap();
        assert_eq!(codec.phase(), TransactionState::AwaitingFrame);
    }
}

//! Daum 8008 Classic fixed-length binary framing.

use bytes::{Bytes, BytesMut};
use tracing::debug;

use super::{DecodeResult, FrameCodec};
use crate::{
    command::{Command, Payload},
    error::{LinkError, ProtocolErrorKind, Result},
};

/// Fixed-length binary framing used by Daum 8008 Classic cockpits
///
/// Requests are raw byte arrays whose first byte is the opcode and whose
/// second byte is usually the bike index. A reply is exactly
/// `expected_reply_length` bytes and must start with the request opcode.
#[derive(Debug, Default)]
pub struct FixedLengthCodec {
    expected_len: usize,
    echo: Option<u8>,
    buffer: BytesMut,
}

impl FixedLengthCodec {
    /// Create an unarmed codec
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameCodec for FixedLengthCodec {
    fn name(&self) -> &'static str {
        "classic"
    }

    fn encode(&mut self, command: &Command) -> Result<Bytes> {
        let Payload::Binary(payload) = command.payload() else {
            return Err(LinkError::InvalidParameters(format!(
                "{}: classic commands must be binary",
                command.log_label()
            )));
        };
        let Some(&opcode) = payload.first() else {
            return Err(LinkError::InvalidParameters(format!(
                "{}: empty command",
                command.log_label()
            )));
        };
        let expected_len = command
            .expected_reply_length()
            .filter(|len| *len > 0)
            .ok_or_else(|| {
                LinkError::InvalidParameters(format!(
                    "{}: classic commands need an expected reply length",
                    command.log_label()
                ))
            })?;

        self.buffer.clear();
        self.expected_len = expected_len;
        self.echo = Some(opcode);
        Ok(payload.clone())
    }

    fn feed(&mut self, data: &[u8]) -> DecodeResult {
        let Some(echo) = self.echo else {
            return DecodeResult::framing(ProtocolErrorKind::MalformedFrame, "no request pending");
        };
        self.buffer.extend_from_slice(data);

        if let Some(&first) = self.buffer.first() {
            if first != echo {
                return DecodeResult::framing(
                    ProtocolErrorKind::IllegalResponse,
                    format!("expected echo {echo:#04X}, got {first:#04X}"),
                );
            }
        }

        if self.buffer.len() < self.expected_len {
            return DecodeResult::NeedMore;
        }

        let reply = self.buffer.split_to(self.expected_len).freeze();
        if !self.buffer.is_empty() {
            debug!("classic: dropping {} trailing bytes", self.buffer.len());
            self.buffer.clear();
        }
        self.echo = None;
        DecodeResult::Response(reply)
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.echo = None;
        self.expected_len = 0;
    }
}

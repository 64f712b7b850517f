//! Kettler ASCII line framing.

use bytes::{Bytes, BytesMut};
use tracing::debug;

use super::{DecodeResult, FrameCodec};
use crate::{
    command::{Command, Payload},
    error::{LinkError, ProtocolErrorKind, Result},
};

/// Default line terminator
pub const CRLF: &[u8] = b"\r\n";

/// Longest reply line accepted before the buffer is declared garbage
pub const MAX_LINE_LEN: usize = 256;

/// CRLF delimited ASCII lines used by Kettler ergometers
///
/// The reply is the first non-empty line after the request. When the command
/// declares an expected field count, the line must split into exactly that
/// many tab separated fields.
#[derive(Debug)]
pub struct LineCodec {
    terminator: Bytes,
    expected_fields: Option<usize>,
    armed: bool,
    buffer: BytesMut,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LineCodec {
    /// Create an unarmed codec
    #[must_use]
    pub fn new() -> Self {
        Self {
            terminator: Bytes::from_static(CRLF),
            expected_fields: None,
            armed: false,
            buffer: BytesMut::new(),
        }
    }

    fn find_terminator(&self) -> Option<usize> {
        self.buffer
            .windows(self.terminator.len())
            .position(|window| window == &self.terminator[..])
    }

    fn validate(&self, line: Bytes) -> DecodeResult {
        let Ok(text) = std::str::from_utf8(&line) else {
            return DecodeResult::framing(ProtocolErrorKind::MalformedFrame, "reply is not ASCII");
        };
        if let Some(expected) = self.expected_fields {
            let found = text.split('\t').count();
            if found != expected {
                return DecodeResult::framing(
                    ProtocolErrorKind::MalformedFrame,
                    format!("expected {expected} fields, got {found}"),
                );
            }
        }
        DecodeResult::Response(line)
    }
}

impl FrameCodec for LineCodec {
    fn name(&self) -> &'static str {
        "kettler"
    }

    fn encode(&mut self, command: &Command) -> Result<Bytes> {
        let Payload::Text(text) = command.payload() else {
            return Err(LinkError::InvalidParameters(format!(
                "{}: kettler commands are text lines",
                command.log_label()
            )));
        };
        if text.is_empty() || !text.is_ascii() {
            return Err(LinkError::InvalidParameters(format!(
                "{}: command must be non-empty ASCII",
                command.log_label()
            )));
        }
        let terminator = command
            .terminator()
            .cloned()
            .unwrap_or_else(|| Bytes::from_static(CRLF));
        if terminator.is_empty() {
            return Err(LinkError::InvalidParameters(format!(
                "{}: empty terminator",
                command.log_label()
            )));
        }

        let mut line = BytesMut::with_capacity(text.len() + terminator.len());
        line.extend_from_slice(text.as_bytes());
        line.extend_from_slice(&terminator);

        self.buffer.clear();
        self.terminator = terminator;
        self.expected_fields = command.expected_fields();
        self.armed = true;
        Ok(line.freeze())
    }

    fn feed(&mut self, data: &[u8]) -> DecodeResult {
        if !self.armed {
            return DecodeResult::framing(ProtocolErrorKind::MalformedFrame, "no request pending");
        }
        self.buffer.extend_from_slice(data);

        while let Some(end) = self.find_terminator() {
            let line = self.buffer.split_to(end).freeze();
            let _ = self.buffer.split_to(self.terminator.len());
            if line.is_empty() {
                continue;
            }
            if !self.buffer.is_empty() {
                debug!("kettler: dropping {} bytes after reply line", self.buffer.len());
                self.buffer.clear();
            }
            self.armed = false;
            return self.validate(line);
        }

        if self.buffer.len() > MAX_LINE_LEN {
            self.buffer.clear();
            self.armed = false;
            return DecodeResult::framing(
                ProtocolErrorKind::MalformedFrame,
                format!("no line terminator within {MAX_LINE_LEN} bytes"),
            );
        }
        DecodeResult::NeedMore
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.armed = false;
        self.expected_fields = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_command() -> Command {
        Command::text("getStatus", "ST").expect_fields(8)
    }

    #[test]
    fn test_encode_appends_crlf() {
        let mut codec = LineCodec::new();
        assert_eq!(&codec.encode(&status_command()).unwrap()[..], b"ST\r\n");
    }

    #[test]
    fn test_custom_terminator() {
        let mut codec = LineCodec::new();
        let command = Command::text("getId", "ID").with_terminator(b"\r".to_vec());
        assert_eq!(&codec.encode(&command).unwrap()[..], b"ID\r");
        assert_eq!(
            codec.feed(b"SX2\r"),
            DecodeResult::Response(Bytes::from_static(b"SX2"))
        );
    }

    #[test]
    fn test_status_line_resolves() {
        let mut codec = LineCodec::new();
        codec.encode(&status_command()).unwrap();
        assert_eq!(codec.feed(b"072\t080\t253\t012"), DecodeResult::NeedMore);
        assert_eq!(
            codec.feed(b"\t150\t034\t05:12\t148\r\n"),
            DecodeResult::Response(Bytes::from_static(
                b"072\t080\t253\t012\t150\t034\t05:12\t148"
            ))
        );
    }

    #[test]
    fn test_short_status_line_is_malformed() {
        let mut codec = LineCodec::new();
        codec.encode(&status_command()).unwrap();
        assert!(matches!(
            codec.feed(b"072\t080\t253\t012\t150\t034\t05:12\r\n"),
            DecodeResult::FramingError {
                kind: ProtocolErrorKind::MalformedFrame,
                ..
            }
        ));
    }

    #[test]
    fn test_leading_empty_lines_skipped() {
        let mut codec = LineCodec::new();
        codec.encode(&Command::text("reset", "RS")).unwrap();
        assert_eq!(
            codec.feed(b"\r\nACK\r\n"),
            DecodeResult::Response(Bytes::from_static(b"ACK"))
        );
    }

    #[test]
    fn test_unterminated_garbage_is_malformed() {
        let mut codec = LineCodec::new();
        codec.encode(&Command::text("getVersion", "VE")).unwrap();
        assert!(matches!(
            codec.feed(&[b'x'; MAX_LINE_LEN + 1]),
            DecodeResult::FramingError {
                kind: ProtocolErrorKind::MalformedFrame,
                ..
            }
        ));
    }

    #[test]
    fn test_encode_rejects_binary() {
        let mut codec = LineCodec::new();
        assert!(codec.encode(&Command::binary("raw", vec![0x10])).is_err());
        assert!(codec.encode(&Command::text("empty", "")).is_err());
    }
}

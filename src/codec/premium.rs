//! Daum Premium SOH/ETB framing with ACK/NAK handshakes.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use super::{DecodeResult, FrameCodec};
use crate::{
    command::{Command, Payload},
    error::{LinkError, ProtocolErrorKind, Result},
    types::TransactionState,
};

/// Start of frame
pub const SOH: u8 = 0x01;
/// Positive acknowledgment
pub const ACK: u8 = 0x06;
/// Negative acknowledgment
pub const NAK: u8 = 0x15;
/// End of frame
pub const ETB: u8 = 0x17;
/// Escape introducer
pub const ESC: u8 = 0x22;

/// Length of the ASCII opcode at the start of every frame
pub const OPCODE_LEN: usize = 3;

/// Upper bound on buffered frame content
pub const MAX_FRAME_LEN: usize = 512;

/// Reserved byte and the code that follows [`ESC`] in its place
const ESCAPES: [(u8, u8); 6] = [
    (0x12, 0x12),
    (ESC, 0x22),
    (SOH, 0x11),
    (ETB, 0x27),
    (ACK, 0x20),
    (NAK, 0x25),
];

/// Byte-stuff every reserved control byte in `data`
#[must_use]
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &byte in data {
        match ESCAPES.iter().find(|(raw, _)| *raw == byte) {
            Some(&(_, code)) => {
                out.push(ESC);
                out.push(code);
            }
            None => out.push(byte),
        }
    }
    out
}

/// Reverse [`escape`]
///
/// # Errors
///
/// Returns a description of the offending sequence if an escape is
/// truncated or unknown.
pub fn unescape(data: &[u8]) -> std::result::Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(data.len());
    let mut bytes = data.iter();
    while let Some(&byte) = bytes.next() {
        if byte != ESC {
            out.push(byte);
            continue;
        }
        let code = *bytes.next().ok_or("truncated escape sequence")?;
        let raw = ESCAPES
            .iter()
            .find(|(_, c)| *c == code)
            .map(|&(raw, _)| raw)
            .ok_or_else(|| format!("unknown escape code {code:#04X}"))?;
        out.push(raw);
    }
    Ok(out)
}

/// Frame checksum: sum of opcode and payload bytes modulo 100
#[must_use]
pub fn checksum(opcode: &[u8], payload: &[u8]) -> u8 {
    let sum: u64 = opcode.iter().chain(payload).map(|&b| u64::from(b)).sum();
    // always < 100
    (sum % 100) as u8
}

/// Build a complete frame for `opcode` and unescaped `payload`
#[must_use]
pub fn encode_frame(opcode: &[u8], payload: &[u8]) -> Bytes {
    let escaped = escape(payload);
    let mut buf = BytesMut::with_capacity(opcode.len() + escaped.len() + 4);
    buf.put_u8(SOH);
    buf.extend_from_slice(opcode);
    buf.extend_from_slice(&escaped);
    buf.extend_from_slice(format!("{:02}", checksum(opcode, payload)).as_bytes());
    buf.put_u8(ETB);
    buf.freeze()
}

fn parse_checksum_digits(digits: &[u8]) -> Option<u8> {
    match digits {
        [tens @ b'0'..=b'9', ones @ b'0'..=b'9'] => Some((tens - b'0') * 10 + (ones - b'0')),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    AwaitingAck,
    AwaitingFrame,
}

/// SOH/ETB framing with escaping, checksum and ACK/NAK, used by Daum 8i
/// Premium cockpits
///
/// A command payload is the three-character ASCII opcode followed by the
/// unescaped binary arguments. The device acknowledges the request with ACK
/// (or rejects it with NAK), then answers with a frame that echoes the opcode.
/// A valid frame is acknowledged with ACK; a corrupted one with NAK. The reply
/// body is the unescaped payload after the opcode.
#[derive(Debug)]
pub struct EscapedFrameCodec {
    phase: Phase,
    opcode: Option<[u8; OPCODE_LEN]>,
    in_frame: bool,
    buffer: BytesMut,
    reply: Option<Bytes>,
}

impl Default for EscapedFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EscapedFrameCodec {
    /// Create an unarmed codec
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            opcode: None,
            in_frame: false,
            buffer: BytesMut::new(),
            reply: None,
        }
    }

    fn reject(&mut self, kind: ProtocolErrorKind, detail: String) -> DecodeResult {
        self.reply = Some(Bytes::from_static(&[NAK]));
        DecodeResult::framing(kind, detail)
    }

    fn complete_frame(&mut self, expected: [u8; OPCODE_LEN]) -> DecodeResult {
        let content = self.buffer.split().freeze();
        self.in_frame = false;
        self.phase = Phase::Idle;

        if content.len() < OPCODE_LEN + 2 {
            return self.reject(
                ProtocolErrorKind::MalformedFrame,
                format!("frame too short ({} bytes)", content.len()),
            );
        }
        let (opcode, rest) = content.split_at(OPCODE_LEN);
        let (escaped, digits) = rest.split_at(rest.len() - 2);

        let payload = match unescape(escaped) {
            Ok(payload) => payload,
            Err(detail) => return self.reject(ProtocolErrorKind::MalformedFrame, detail),
        };
        let Some(received) = parse_checksum_digits(digits) else {
            return self.reject(
                ProtocolErrorKind::MalformedFrame,
                format!("checksum digits {digits:02X?} are not decimal"),
            );
        };
        let computed = checksum(opcode, &payload);
        if received != computed {
            return self.reject(
                ProtocolErrorKind::ChecksumMismatch,
                format!("expected {computed:02}, got {received:02}"),
            );
        }

        self.reply = Some(Bytes::from_static(&[ACK]));
        if opcode != expected.as_slice() {
            return DecodeResult::framing(
                ProtocolErrorKind::IllegalResponse,
                format!(
                    "expected reply to {}, got {}",
                    String::from_utf8_lossy(&expected),
                    String::from_utf8_lossy(opcode)
                ),
            );
        }
        DecodeResult::Response(Bytes::from(payload))
    }
}

impl FrameCodec for EscapedFrameCodec {
    fn name(&self) -> &'static str {
        "premium"
    }

    fn encode(&mut self, command: &Command) -> Result<Bytes> {
        let Payload::Binary(payload) = command.payload() else {
            return Err(LinkError::InvalidParameters(format!(
                "{}: premium commands must be binary",
                command.log_label()
            )));
        };
        let opcode: [u8; OPCODE_LEN] = payload
            .get(..OPCODE_LEN)
            .and_then(|op| op.try_into().ok())
            .filter(|op: &[u8; OPCODE_LEN]| op.iter().all(u8::is_ascii_alphanumeric))
            .ok_or_else(|| {
                LinkError::InvalidParameters(format!(
                    "{}: premium commands start with a 3 character opcode",
                    command.log_label()
                ))
            })?;

        self.reset();
        self.opcode = Some(opcode);
        self.phase = Phase::AwaitingAck;
        Ok(encode_frame(&opcode, &payload[OPCODE_LEN..]))
    }

    fn feed(&mut self, data: &[u8]) -> DecodeResult {
        let Some(expected) = self.opcode else {
            return DecodeResult::framing(ProtocolErrorKind::MalformedFrame, "no request pending");
        };

        for &byte in data {
            match self.phase {
                Phase::Idle => {
                    debug!("premium: ignoring {byte:#04X} after frame end");
                }
                Phase::AwaitingAck => match byte {
                    ACK => self.phase = Phase::AwaitingFrame,
                    NAK => {
                        self.phase = Phase::Idle;
                        return DecodeResult::framing(
                            ProtocolErrorKind::NotAcknowledged,
                            "device answered NAK",
                        );
                    }
                    SOH => {
                        debug!("premium: frame started without ACK");
                        self.phase = Phase::AwaitingFrame;
                        self.in_frame = true;
                        self.buffer.clear();
                    }
                    other => debug!("premium: ignoring {other:#04X} while awaiting ACK"),
                },
                Phase::AwaitingFrame => {
                    if byte == SOH {
                        if self.in_frame {
                            debug!("premium: frame restarted, dropping {} bytes", self.buffer.len());
                        }
                        self.in_frame = true;
                        self.buffer.clear();
                    } else if !self.in_frame {
                        debug!("premium: ignoring {byte:#04X} outside frame");
                    } else if byte == ETB {
                        return self.complete_frame(expected);
                    } else {
                        self.buffer.put_u8(byte);
                        if self.buffer.len() > MAX_FRAME_LEN {
                            self.buffer.clear();
                            self.in_frame = false;
                            self.phase = Phase::Idle;
                            return self.reject(
                                ProtocolErrorKind::MalformedFrame,
                                format!("frame exceeds {MAX_FRAME_LEN} bytes"),
                            );
                        }
                    }
                }
            }
        }
        DecodeResult::NeedMore
    }

    fn take_reply(&mut self) -> Option<Bytes> {
        self.reply.take()
    }

    fn phase(&self) -> TransactionState {
        match self.phase {
            Phase::AwaitingAck => TransactionState::AwaitingAck,
            Phase::Idle | Phase::AwaitingFrame => TransactionState::AwaitingFrame,
        }
    }

    fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.opcode = None;
        self.in_frame = false;
        self.buffer.clear();
        self.reply = None;
    }
}

use bytes::Bytes;
use std::fmt;
use uuid::Uuid;

use crate::error::{LinkError, Result};

/// Opaque correlation token attached to every command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandId(Uuid);

impl CommandId {
    /// Generate a fresh token
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Command body handed to a codec
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Raw bytes (Classic, Premium)
    Binary(Bytes),
    /// ASCII command string (Kettler)
    Text(String),
}

impl Payload {
    /// Payload as raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Binary(bytes) => bytes,
            Self::Text(text) => text.as_bytes(),
        }
    }

    /// Payload length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Whether the payload carries no bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

/// A logical command sent over a device link
///
/// Commands are built with the constructors and `with_*`/`expect_*` methods
/// and are immutable once handed to [`crate::DeviceLink::send`].
#[derive(Debug, Clone)]
pub struct Command {
    id: CommandId,
    log_label: String,
    payload: Payload,
    expected_reply_length: Option<usize>,
    expected_fields: Option<usize>,
    terminator: Option<Bytes>,
    timeout_ms: Option<u64>,
}

impl Command {
    fn new(log_label: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: CommandId::new(),
            log_label: log_label.into(),
            payload,
            expected_reply_length: None,
            expected_fields: None,
            terminator: None,
            timeout_ms: None,
        }
    }

    /// Create a command with a binary payload
    pub fn binary(log_label: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::new(log_label, Payload::Binary(payload.into()))
    }

    /// Create a command with an ASCII payload
    pub fn text(log_label: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::new(log_label, Payload::Text(payload.into()))
    }

    /// Expect a fixed-length reply of `length` bytes
    #[must_use]
    pub fn expect_reply_length(mut self, length: usize) -> Self {
        self.expected_reply_length = Some(length);
        self
    }

    /// Expect a reply line made of `count` separated fields
    #[must_use]
    pub fn expect_fields(mut self, count: usize) -> Self {
        self.expected_fields = Some(count);
        self
    }

    /// Override the line terminator used by line-oriented codecs
    #[must_use]
    pub fn with_terminator(mut self, terminator: impl Into<Bytes>) -> Self {
        self.terminator = Some(terminator.into());
        self
    }

    /// Set the response deadline in milliseconds
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Correlation token
    #[must_use]
    pub const fn id(&self) -> CommandId {
        self.id
    }

    /// Label used in logs and errors
    #[must_use]
    pub fn log_label(&self) -> &str {
        &self.log_label
    }

    /// Command body
    #[must_use]
    pub const fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Expected reply length for fixed-length framing
    #[must_use]
    pub const fn expected_reply_length(&self) -> Option<usize> {
        self.expected_reply_length
    }

    /// Expected field count for line framing
    #[must_use]
    pub const fn expected_fields(&self) -> Option<usize> {
        self.expected_fields
    }

    /// Line terminator override
    #[must_use]
    pub const fn terminator(&self) -> Option<&Bytes> {
        self.terminator.as_ref()
    }

    /// Response deadline override in milliseconds
    #[must_use]
    pub const fn timeout_ms(&self) -> Option<u64> {
        self.timeout_ms
    }
}

/// A validated reply to a [`Command`]
///
/// The body is codec specific: the complete reply for fixed-length framing,
/// the unescaped payload after the echoed opcode for escaped frames, and the
/// line without its terminator for line framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    command_id: CommandId,
    body: Bytes,
}

impl Response {
    /// Wrap a reply body for the given command
    #[must_use]
    pub const fn new(command_id: CommandId, body: Bytes) -> Self {
        Self { command_id, body }
    }

    /// Token of the command this reply answers
    #[must_use]
    pub const fn command_id(&self) -> CommandId {
        self.command_id
    }

    /// Reply body
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Reply body as ASCII text
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Parse`] if the body is not valid UTF-8.
    pub fn as_text(&self) -> Result<&str> {
        std::str::from_utf8(&self.body)
            .map_err(|e| LinkError::Parse(format!("reply is not text: {e}")))
    }

    /// Tab separated fields of a text reply
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Parse`] if the body is not valid UTF-8.
    pub fn fields(&self) -> Result<Vec<&str>> {
        Ok(self.as_text()?.split('\t').map(str::trim).collect())
    }

    /// Consume the reply and return its body
    #[must_use]
    pub fn into_body(self) -> Bytes {
        self.body
    }
}

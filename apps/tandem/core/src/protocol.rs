use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SyncError, SyncResult};

/// Closed set of envelope types understood by clients and the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Hello,
    KeepAlive,
    Ack,
    Error,
    Sync,
}

impl MessageKind {
    pub const ALL: [MessageKind; 5] = [
        MessageKind::Hello,
        MessageKind::KeepAlive,
        MessageKind::Ack,
        MessageKind::Error,
        MessageKind::Sync,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Hello => "hello",
            MessageKind::KeepAlive => "keep-alive",
            MessageKind::Ack => "ack",
            MessageKind::Error => "error",
            MessageKind::Sync => "sync",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw wire unit. `kind` is kept as a string so an unrecognised type still
/// decodes and can be rejected by the dispatcher with a precise error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    pub fn encode(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Classifies the envelope into the closed [`Message`] set.
    pub fn into_message(self) -> SyncResult<Message> {
        let kind = MessageKind::parse(&self.kind)
            .ok_or_else(|| SyncError::UnknownMessageType(self.kind.clone()))?;
        match kind {
            MessageKind::Hello => Ok(Message::Hello),
            MessageKind::KeepAlive => Ok(Message::KeepAlive),
            MessageKind::Ack => Ok(Message::Ack),
            MessageKind::Error => {
                let data = require_object(kind, self.data)?;
                let payload = serde_json::from_value::<ErrorPayload>(data)
                    .map_err(|err| SyncError::InvalidPayload(format!("error: {err}")))?;
                Ok(Message::Error(payload))
            }
            MessageKind::Sync => {
                let data = require_object(kind, self.data)?;
                let record = serde_json::from_value::<SyncRecord>(data)
                    .map_err(|err| SyncError::InvalidPayload(format!("sync: {err}")))?;
                Ok(Message::Sync(record))
            }
        }
    }
}

fn require_object(kind: MessageKind, data: Option<Value>) -> SyncResult<Value> {
    match data {
        Some(value @ Value::Object(_)) => Ok(value),
        Some(_) => Err(SyncError::InvalidPayload(format!(
            "{kind}: data must be an object"
        ))),
        None => Err(SyncError::InvalidPayload(format!("{kind}: data is required"))),
    }
}

/// Payload of an `error` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Payload of a `sync` envelope. Build-tool specific fields ride along in
/// `extensions` and are flattened into the same JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub remote: String,
    #[serde(default)]
    pub branch: String,
    /// Identifies the machine that stamped `seq`. Sequences are only
    /// compared between records from the same sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Monotonic per-sender sequence; records at or below the last applied
    /// value for that sender in a room are discarded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
}

impl SyncRecord {
    pub fn new(
        repo: impl Into<String>,
        remote: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            repo: repo.into(),
            remote: remote.into(),
            branch: branch.into(),
            sender: None,
            seq: None,
            extensions: BTreeMap::new(),
        }
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extensions.insert(key.into(), value.into());
        self
    }

    /// Ensures repo, remote and branch are present and safe to hand to
    /// version control. Records arrive from other room members, so names
    /// that could be read as options or paths are refused.
    pub fn validate(&self) -> SyncResult<()> {
        for (field, value) in [
            ("repo", &self.repo),
            ("remote", &self.remote),
            ("branch", &self.branch),
        ] {
            if value.trim().is_empty() {
                return Err(SyncError::InvalidPayload(format!(
                    "sync record is missing {field}"
                )));
            }
        }
        if !is_plain_name(&self.repo) {
            return Err(invalid_name("repo", &self.repo));
        }
        if !is_plain_name(&self.remote) || !is_ref_component(&self.remote) {
            return Err(invalid_name("remote", &self.remote));
        }
        if !is_branch_name(&self.branch) {
            return Err(invalid_name("branch", &self.branch));
        }
        Ok(())
    }

    /// Fully qualified remote-tracking ref for this record.
    pub fn remote_ref(&self) -> String {
        format!("refs/remotes/{}/{}", self.remote, self.branch)
    }
}

impl fmt::Display for SyncRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.repo, self.remote, self.branch)
    }
}

fn invalid_name(field: &str, value: &str) -> SyncError {
    SyncError::InvalidPayload(format!("sync record has an invalid {field}: {value:?}"))
}

/// A single directory-name-like token: no separators, no leading dash, not
/// `.` or `..`.
fn is_plain_name(value: &str) -> bool {
    !value.starts_with('-')
        && value != "."
        && value != ".."
        && !value
            .chars()
            .any(|c| c == '/' || c == '\\' || c == ':' || c.is_whitespace() || c.is_control())
}

/// One slash-free component of a git ref name.
fn is_ref_component(value: &str) -> bool {
    !value.is_empty()
        && !value.starts_with('.')
        && !value.ends_with(".lock")
        && !value.contains("..")
        && !value.contains("@{")
        && value != "@"
        && !value.chars().any(|c| {
            c.is_ascii_control()
                || c.is_whitespace()
                || matches!(c, '~' | '^' | ':' | '?' | '*' | '[' | '\\' | '/')
        })
}

/// Branch names as `git check-ref-format --branch` accepts them.
fn is_branch_name(value: &str) -> bool {
    !value.starts_with('-')
        && !value.ends_with('.')
        && value != "HEAD"
        && value.split('/').all(is_ref_component)
}

/// Typed view of an envelope; matching on it is exhaustive.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello,
    KeepAlive,
    Ack,
    Error(ErrorPayload),
    Sync(SyncRecord),
}

impl Message {
    pub fn error(message: impl Into<String>) -> Self {
        Message::Error(ErrorPayload {
            message: message.into(),
        })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Hello => MessageKind::Hello,
            Message::KeepAlive => MessageKind::KeepAlive,
            Message::Ack => MessageKind::Ack,
            Message::Error(_) => MessageKind::Error,
            Message::Sync(_) => MessageKind::Sync,
        }
    }

    pub fn to_envelope(&self) -> SyncResult<Envelope> {
        let data = match self {
            Message::Hello | Message::KeepAlive | Message::Ack => None,
            Message::Error(payload) => Some(serde_json::to_value(payload)?),
            Message::Sync(record) => Some(serde_json::to_value(record)?),
        };
        Ok(Envelope::new(self.kind().as_str(), data))
    }
}

/// Serialises a message into its canonical `{type, data}` text form.
pub fn encode(message: &Message) -> SyncResult<String> {
    message.to_envelope()?.encode()
}

/// Parses wire bytes into an [`Envelope`]. Only structure is checked here:
/// the bytes must be a UTF-8 JSON object with a string `type`.
pub fn decode(bytes: &[u8]) -> SyncResult<Envelope> {
    let text = std::str::from_utf8(bytes)
        .map_err(|err| SyncError::MalformedMessage(format!("invalid utf8: {err}")))?;
    serde_json::from_str::<Envelope>(text).map_err(SyncError::from)
}

//! Structured messages produced from responses and failures

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageType {
    None,
    Success,
    Information,
    Warning,
    Error,
}

impl MessageType {
    /// Maps the `numericSeverity` of an OData message annotation
    pub fn from_numeric_severity(severity: u64) -> Self {
        match severity {
            1 => MessageType::Success,
            2 => MessageType::Information,
            3 => MessageType::Warning,
            4 => MessageType::Error,
            _ => MessageType::None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::None => "None",
            MessageType::Success => "Success",
            MessageType::Information => "Information",
            MessageType::Warning => "Warning",
            MessageType::Error => "Error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Message {
    pub code: Option<String>,
    pub text: String,
    /// Absolute resource path plus property, or empty for unbound messages
    pub target: String,
    /// Survives the lifetime of the data that triggered it
    pub persistent: bool,
    /// Raw protocol error rather than a business message
    pub technical: bool,
    pub message_type: MessageType,
}

impl Message {
    pub fn new(text: impl Into<String>, target: impl Into<String>, message_type: MessageType) -> Self {
        Self {
            code: None,
            text: text.into(),
            target: target.into(),
            persistent: false,
            technical: false,
            message_type,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn technical(mut self) -> Self {
        self.technical = true;
        self.persistent = true;
        self
    }

    /// True if the target is `path` itself or lies below it
    pub fn targets_within(&self, path: &str) -> bool {
        self.target == path
            || (self.target.starts_with(path)
                && matches!(self.target.as_bytes().get(path.len()), Some(b'/') | Some(b'(')))
    }
}

/// Change of the visible message set, passed to the change notifier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageDelta {
    pub added: Vec<Message>,
    pub removed: Vec<Message>,
}

impl MessageDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    pub fn extend(&mut self, other: MessageDelta) {
        self.added.extend(other.added);
        self.removed.extend(other.removed);
    }
}

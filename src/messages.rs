//! Side-channel messages for the operator
//!
//! Debug dumps and (optionally) query errors are reported here, separately
//! from the extraction result, so a host can show them next to the run.

use std::sync::RwLock;

use serde::Serialize;

/// Message severity as shown to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Status,
    Warning,
    Error,
}

/// One side-channel message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub level: MessageLevel,
    /// Field key (or `context` / `count`) the message is about
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub text: String,
}

impl Message {
    pub fn status(source: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            level: MessageLevel::Status,
            source: Some(source.into()),
            text: text.into(),
        }
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self {
            level: MessageLevel::Warning,
            source: None,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            level: MessageLevel::Error,
            source: None,
            text: text.into(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Receiver for side-channel messages.
pub trait MessageSink {
    fn emit(&self, message: Message);
}

/// Collects messages in memory.
#[derive(Debug, Default)]
pub struct MessageLog {
    messages: RwLock<Vec<Message>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the collected messages.
    pub fn messages(&self) -> Vec<Message> {
        match self.messages.read() {
            Ok(messages) => messages.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Remove and return the collected messages.
    pub fn take(&self) -> Vec<Message> {
        match self.messages.write() {
            Ok(mut messages) => std::mem::take(&mut *messages),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MessageSink for MessageLog {
    fn emit(&self, message: Message) {
        match self.messages.write() {
            Ok(mut messages) => messages.push(message),
            Err(poisoned) => poisoned.into_inner().push(message),
        }
    }
}

/// Forwards messages to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MessageSink for TracingSink {
    fn emit(&self, message: Message) {
        let source = message.source.as_deref().unwrap_or("-");
        match message.level {
            MessageLevel::Status => tracing::info!(source, "{}", message.text),
            MessageLevel::Warning => tracing::warn!(source, "{}", message.text),
            MessageLevel::Error => tracing::error!(source, "{}", message.text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_log_collects_and_drains() {
        let log = MessageLog::new();
        assert!(log.is_empty());

        log.emit(Message::status("title", "title : <h1>x</h1>"));
        log.emit(Message::error("bad query").with_source("body"));
        assert_eq!(log.len(), 2);

        let messages = log.take();
        assert_eq!(messages[0].level, MessageLevel::Status);
        assert_eq!(messages[1].source.as_deref(), Some("body"));
        assert!(log.is_empty());
    }

    #[test]
    fn test_message_serializes_without_empty_source() {
        let json = serde_json::to_string(&Message::warning("careful")).unwrap();
        assert_eq!(json, r#"{"level":"warning","text":"careful"}"#);
    }
}

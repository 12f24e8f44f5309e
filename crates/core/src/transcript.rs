//! The append-only message transcript.
//!
//! The model wire protocol imposes strict sequencing: roles alternate,
//! every tool use is answered by exactly one tool result with the same id
//! in the immediately following user message, and those results appear in
//! the same positional order as the uses. `Transcript::append` is the
//! single gate where all of that is enforced — a violating append fails
//! instead of corrupting the log.

use serde::{Deserialize, Serialize};

use crate::error::TranscriptError;
use crate::message::{Block, Message, Role};
use crate::tool::ToolCall;

/// An ordered, invariant-checked sequence of messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    /// Create an empty transcript.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a transcript from stored messages, re-validating every append.
    ///
    /// Used by session restore; a record that no longer satisfies the
    /// sequencing rules is rejected rather than silently accepted.
    pub fn from_messages(messages: Vec<Message>) -> Result<Self, TranscriptError> {
        let mut transcript = Self::new();
        for message in messages {
            transcript.append(message)?;
        }
        Ok(transcript)
    }

    /// Append a message, enforcing the sequencing invariants.
    pub fn append(&mut self, message: Message) -> Result<(), TranscriptError> {
        self.check(&message)?;
        self.messages.push(message);
        Ok(())
    }

    fn check(&self, message: &Message) -> Result<(), TranscriptError> {
        if message.content.is_empty() {
            return Err(TranscriptError::EmptyMessage);
        }

        if let Some(last) = self.messages.last()
            && last.role == message.role
        {
            return Err(TranscriptError::RoleNotAlternating {
                role: format!("{:?}", message.role).to_lowercase(),
            });
        }

        match message.role {
            Role::Assistant => self.check_assistant(message),
            Role::User => self.check_user(message),
        }
    }

    fn check_assistant(&self, message: &Message) -> Result<(), TranscriptError> {
        let mut seen_ids: Vec<&str> = Vec::new();
        for block in &message.content {
            match block {
                Block::ToolResult { .. } => return Err(TranscriptError::ToolResultInAssistant),
                Block::ToolUse { id, .. } => {
                    if seen_ids.contains(&id.as_str()) {
                        return Err(TranscriptError::DuplicateToolUseId(id.clone()));
                    }
                    seen_ids.push(id);
                }
                Block::Text { .. } => {}
            }
        }
        Ok(())
    }

    fn check_user(&self, message: &Message) -> Result<(), TranscriptError> {
        let has_results = message.content.iter().any(Block::is_tool_result);
        let has_other = message.content.iter().any(|b| !b.is_tool_result());

        if has_results && has_other {
            return Err(TranscriptError::MixedToolResultContent);
        }

        let pending: Vec<String> = self
            .last_assistant_tool_uses()
            .into_iter()
            .map(|call| call.id)
            .collect();

        if has_results {
            if pending.is_empty() {
                return Err(TranscriptError::OrphanToolResults);
            }
            let got: Vec<String> = message
                .content
                .iter()
                .filter_map(|block| match block {
                    Block::ToolResult { id, .. } => Some(id.clone()),
                    _ => None,
                })
                .collect();
            // Positional equality: same ids, same order, nothing extra.
            if got != pending {
                return Err(TranscriptError::ToolResultMismatch {
                    expected: pending,
                    got,
                });
            }
        } else if !pending.is_empty() {
            // The previous assistant message is still waiting for answers.
            return Err(TranscriptError::ToolResultMismatch {
                expected: pending,
                got: vec![],
            });
        }

        Ok(())
    }

    /// The tool calls of the most recent assistant message, in block order.
    ///
    /// Empty when the last message is not an assistant message or carries
    /// no tool uses. The executor and the driver both key off this list
    /// for dispatch and result reordering.
    pub fn last_assistant_tool_uses(&self) -> Vec<ToolCall> {
        match self.messages.last() {
            Some(message) if message.role == Role::Assistant => message.tool_calls(),
            _ => Vec::new(),
        }
    }

    /// Read-only view of the log.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Snapshot for the model adapter.
    pub fn view(&self) -> Vec<Message> {
        self.messages.clone()
    }

    /// Consume the transcript, yielding its messages.
    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    /// Concatenated text of the final assistant message, if any.
    pub fn final_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(Message::text)
    }

    pub fn last_role(&self) -> Option<Role> {
        self.messages.last().map(|m| m.role)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_use(id: &str) -> Block {
        Block::ToolUse {
            id: id.into(),
            name: "probe".into(),
            input: serde_json::json!({}),
        }
    }

    #[test]
    fn simple_exchange() {
        let mut t = Transcript::new();
        t.append(Message::user_text("hi")).unwrap();
        t.append(Message::assistant_text("hello")).unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(t.final_text().unwrap(), "hello");
    }

    #[test]
    fn rejects_consecutive_same_role() {
        let mut t = Transcript::new();
        t.append(Message::user_text("one")).unwrap();
        let err = t.append(Message::user_text("two")).unwrap_err();
        assert!(matches!(err, TranscriptError::RoleNotAlternating { .. }));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn rejects_empty_message() {
        let mut t = Transcript::new();
        let err = t.append(Message::assistant(vec![])).unwrap_err();
        assert_eq!(err, TranscriptError::EmptyMessage);
    }

    #[test]
    fn rejects_mixed_tool_results_and_text() {
        let mut t = Transcript::new();
        t.append(Message::user_text("go")).unwrap();
        t.append(Message::assistant(vec![tool_use("a")])).unwrap();

        let mixed = Message::tool_results(vec![
            Block::tool_ok("a", serde_json::json!(1)),
            Block::text("commentary"),
        ]);
        let err = t.append(mixed).unwrap_err();
        assert_eq!(err, TranscriptError::MixedToolResultContent);
    }

    #[test]
    fn rejects_result_order_mismatch() {
        let mut t = Transcript::new();
        t.append(Message::user_text("go")).unwrap();
        t.append(Message::assistant(vec![tool_use("a"), tool_use("b")]))
            .unwrap();

        // Right ids, wrong order.
        let swapped = Message::tool_results(vec![
            Block::tool_ok("b", serde_json::json!(2)),
            Block::tool_ok("a", serde_json::json!(1)),
        ]);
        let err = t.append(swapped).unwrap_err();
        assert!(matches!(err, TranscriptError::ToolResultMismatch { .. }));
    }

    #[test]
    fn rejects_missing_and_extra_results() {
        let mut t = Transcript::new();
        t.append(Message::user_text("go")).unwrap();
        t.append(Message::assistant(vec![tool_use("a"), tool_use("b")]))
            .unwrap();

        let missing = Message::tool_results(vec![Block::tool_ok("a", serde_json::json!(1))]);
        assert!(t.append(missing).is_err());

        let extra = Message::tool_results(vec![
            Block::tool_ok("a", serde_json::json!(1)),
            Block::tool_ok("b", serde_json::json!(2)),
            Block::tool_ok("c", serde_json::json!(3)),
        ]);
        assert!(t.append(extra).is_err());
    }

    #[test]
    fn rejects_orphan_results() {
        let mut t = Transcript::new();
        t.append(Message::user_text("go")).unwrap();
        t.append(Message::assistant_text("done")).unwrap();

        let orphan = Message::tool_results(vec![Block::tool_ok("x", serde_json::json!(1))]);
        let err = t.append(orphan).unwrap_err();
        assert_eq!(err, TranscriptError::OrphanToolResults);
    }

    #[test]
    fn rejects_text_while_results_pending() {
        let mut t = Transcript::new();
        t.append(Message::user_text("go")).unwrap();
        t.append(Message::assistant(vec![tool_use("a")])).unwrap();

        let err = t.append(Message::user_text("ignoring your tool call")).unwrap_err();
        assert!(matches!(err, TranscriptError::ToolResultMismatch { .. }));
    }

    #[test]
    fn rejects_duplicate_tool_use_ids() {
        let mut t = Transcript::new();
        t.append(Message::user_text("go")).unwrap();
        let err = t
            .append(Message::assistant(vec![tool_use("a"), tool_use("a")]))
            .unwrap_err();
        assert_eq!(err, TranscriptError::DuplicateToolUseId("a".into()));
    }

    #[test]
    fn accepts_matching_batch() {
        let mut t = Transcript::new();
        t.append(Message::user_text("go")).unwrap();
        t.append(Message::assistant(vec![
            Block::text("working on it"),
            tool_use("a"),
            tool_use("b"),
        ]))
        .unwrap();
        t.append(Message::tool_results(vec![
            Block::tool_ok("a", serde_json::json!(1)),
            Block::tool_error("b", "boom"),
        ]))
        .unwrap();

        assert_eq!(t.len(), 3);
        // Last message is a user message, so no pending uses.
        assert!(t.last_assistant_tool_uses().is_empty());
    }

    #[test]
    fn from_messages_revalidates() {
        let mut t = Transcript::new();
        t.append(Message::user_text("hi")).unwrap();
        t.append(Message::assistant_text("hello")).unwrap();

        let rebuilt = Transcript::from_messages(t.view()).unwrap();
        assert_eq!(rebuilt, t);

        let bad = vec![Message::user_text("one"), Message::user_text("two")];
        assert!(Transcript::from_messages(bad).is_err());
    }

    #[test]
    fn last_assistant_tool_uses_ordering() {
        let mut t = Transcript::new();
        t.append(Message::user_text("go")).unwrap();
        t.append(Message::assistant(vec![
            tool_use("first"),
            Block::text("middle"),
            tool_use("second"),
        ]))
        .unwrap();

        let ids: Vec<String> = t
            .last_assistant_tool_uses()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["first", "second"]);
    }
}

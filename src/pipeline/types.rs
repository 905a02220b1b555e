//! Shared types for the mail processing pipeline.

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TransportError;

// ── Message identity ────────────────────────────────────────────────

/// Opaque, stable identifier of an inbox entry (the IMAP UID for the
/// bundled adapter).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ── Inbound snapshot ────────────────────────────────────────────────

/// Immutable snapshot of one unseen inbox entry, valid for one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSummary {
    pub id: MessageId,
    /// Sender email address.
    pub sender: String,
    /// Sender display name, if the `From` header carried one.
    pub sender_name: Option<String>,
    pub subject: String,
    /// Plain-text body, capped at the configured size.
    pub body_excerpt: String,
    /// HTML alternative, forwarded alongside the text body when present.
    pub html_body: Option<String>,
    /// RFC 5322 `Message-ID`, used for reply threading.
    pub message_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl MessageSummary {
    /// Minimal summary with an empty body, mostly for tests and fixtures.
    pub fn new(id: impl Into<MessageId>, sender: &str, subject: &str) -> Self {
        Self {
            id: id.into(),
            sender: sender.to_string(),
            sender_name: None,
            subject: subject.to_string(),
            body_excerpt: String::new(),
            html_body: None,
            message_id: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body_excerpt = body.to_string();
        self
    }

    pub fn with_sender_name(mut self, name: &str) -> Self {
        self.sender_name = Some(name.to_string());
        self
    }

    pub fn with_message_id(mut self, message_id: &str) -> Self {
        self.message_id = Some(message_id.to_string());
        self
    }

    pub fn with_html_body(mut self, html: &str) -> Self {
        self.html_body = Some(html.to_string());
        self
    }
}

// ── Outbound message ────────────────────────────────────────────────

/// A fully composed message handed to the outbound transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Display name for the `From` header; the address is the transport's own.
    pub from_name: Option<String>,
    pub from_address: String,
    pub to: String,
    pub reply_to: Option<String>,
    pub subject: String,
    pub text_body: String,
    pub html_body: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

// ── Outcomes ────────────────────────────────────────────────────────

/// The concrete action a filter asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Forward,
    Reply,
    MarkRead,
}

impl ActionKind {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Reply => "reply",
            Self::MarkRead => "mark_read",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeResult {
    Applied,
    SkippedNoMatch,
    Failed,
}

/// What happened to one message in one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub message_id: MessageId,
    /// Name of the filter that fired.
    pub rule_matched: Option<String>,
    pub action_taken: Option<ActionKind>,
    pub result: OutcomeResult,
    pub error: Option<String>,
    /// Transport attempts made for the action (0 when nothing ran).
    pub attempts: u32,
    /// Whether the message was marked seen on the server this cycle.
    pub acknowledged: bool,
}

impl ActionOutcome {
    pub fn no_match(message_id: MessageId) -> Self {
        Self {
            message_id,
            rule_matched: None,
            action_taken: None,
            result: OutcomeResult::SkippedNoMatch,
            error: None,
            attempts: 0,
            acknowledged: false,
        }
    }

    pub fn is_applied(&self) -> bool {
        self.result == OutcomeResult::Applied
    }
}

/// Aggregate of all outcomes for one scheduler tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleResult {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Messages reported unseen by the inbound transport.
    pub fetched: usize,
    /// Messages dropped because their id was already in the seen window.
    pub already_seen: usize,
    pub outcomes: Vec<ActionOutcome>,
    /// Set when the listing failed and nothing was processed this tick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_error: Option<String>,
}

impl CycleResult {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            started_at,
            fetched: 0,
            already_seen: 0,
            outcomes: Vec::new(),
            fetch_error: None,
        }
    }

    /// A tick whose listing failed.
    pub fn fetch_failed(started_at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            fetch_error: Some(error.into()),
            ..Self::new(started_at)
        }
    }

    pub fn is_fetch_failure(&self) -> bool {
        self.fetch_error.is_some()
    }

    pub fn applied(&self) -> usize {
        self.count(OutcomeResult::Applied)
    }

    pub fn failed(&self) -> usize {
        self.count(OutcomeResult::Failed)
    }

    pub fn unmatched(&self) -> usize {
        self.count(OutcomeResult::SkippedNoMatch)
    }

    pub fn outcome_for(&self, id: &MessageId) -> Option<&ActionOutcome> {
        self.outcomes.iter().find(|o| &o.message_id == id)
    }

    fn count(&self, result: OutcomeResult) -> usize {
        self.outcomes.iter().filter(|o| o.result == result).count()
    }
}

// ── Transport traits ────────────────────────────────────────────────

/// Inbound mail store: lists unseen messages and flags them seen.
///
/// Implementations own connection lifecycle, authentication and any
/// provider-specific behavior.
#[async_trait]
pub trait InboundTransport: Send + Sync {
    /// Transport name for logs (e.g. "imap").
    fn name(&self) -> &str;

    /// List the unseen messages of `folder`, oldest first.
    async fn list_unseen(&self, folder: &str) -> Result<Vec<MessageSummary>, TransportError>;

    /// Like [`list_unseen`](Self::list_unseen), but ids in `known` may be left
    /// out without downloading them. Callers still filter the result.
    async fn list_unseen_excluding(
        &self,
        folder: &str,
        _known: &HashSet<MessageId>,
    ) -> Result<Vec<MessageSummary>, TransportError> {
        self.list_unseen(folder).await
    }

    /// Flag one message as seen.
    async fn mark_seen(&self, id: &MessageId) -> Result<(), TransportError>;
}

/// Outbound mail submission.
#[async_trait]
pub trait OutboundTransport: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_labels() {
        assert_eq!(ActionKind::Forward.label(), "forward");
        assert_eq!(ActionKind::Reply.label(), "reply");
        assert_eq!(ActionKind::MarkRead.to_string(), "mark_read");
    }

    #[test]
    fn cycle_result_counts_by_result() {
        let mut cycle = CycleResult::new(Utc::now());
        cycle.outcomes.push(ActionOutcome::no_match("1".into()));
        cycle.outcomes.push(ActionOutcome {
            message_id: "2".into(),
            rule_matched: Some("boss".into()),
            action_taken: Some(ActionKind::Forward),
            result: OutcomeResult::Applied,
            error: None,
            attempts: 1,
            acknowledged: true,
        });
        assert_eq!(cycle.applied(), 1);
        assert_eq!(cycle.unmatched(), 1);
        assert_eq!(cycle.failed(), 0);
        assert!(cycle.outcome_for(&"2".into()).is_some_and(|o| o.is_applied()));
    }

    #[test]
    fn outcome_serializes_snake_case() {
        let outcome = ActionOutcome::no_match("42".into());
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["result"], "skipped_no_match");
        assert_eq!(json["message_id"], "42");
    }

    #[test]
    fn fetch_failure_carries_the_error() {
        let cycle = CycleResult::fetch_failed(Utc::now(), "imap call timed out");
        assert!(cycle.is_fetch_failure());
        assert_eq!(cycle.fetched, 0);
        assert!(cycle.outcomes.is_empty());

        let json = serde_json::to_value(&cycle).unwrap();
        assert_eq!(json["fetch_error"], "imap call timed out");
        let ok = serde_json::to_value(CycleResult::new(Utc::now())).unwrap();
        assert!(ok.get("fetch_error").is_none());
    }
}

//! In-memory transports with scripted failures.
//!
//! `MemoryInbox` behaves like a single folder: messages stay listed as unseen
//! until `mark_seen` flags them. `MemoryOutbox` records every message it
//! accepts. Both can be told to fail, which is how the retry and escalation
//! paths are exercised without a mail server.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::pipeline::types::{
    InboundTransport, MessageId, MessageSummary, OutboundMessage, OutboundTransport,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted failures: one-shot errors first, then the standing error if any.
#[derive(Debug, Default)]
struct FailureScript {
    next: VecDeque<TransportError>,
    always: Option<TransportError>,
}

impl FailureScript {
    fn take(&mut self) -> Option<TransportError> {
        self.next.pop_front().or_else(|| self.always.clone())
    }
}

// ── Inbound ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryInbox {
    messages: Mutex<Vec<MessageSummary>>,
    seen: Mutex<HashSet<MessageId>>,
    marked: Mutex<Vec<MessageId>>,
    list_failures: Mutex<FailureScript>,
    mark_failures: Mutex<FailureScript>,
    list_calls: AtomicU32,
    fetch_limit: Mutex<Option<usize>>,
    delay_per_message: Mutex<Option<Duration>>,
}

impl MemoryInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(messages: Vec<MessageSummary>) -> Self {
        let inbox = Self::new();
        *lock(&inbox.messages) = messages;
        inbox
    }

    /// Deliver a new unseen message.
    pub fn deliver(&self, message: MessageSummary) {
        lock(&self.messages).push(message);
    }

    /// Fail the next `list_unseen` call once.
    pub fn fail_next_list(&self, error: TransportError) {
        lock(&self.list_failures).next.push_back(error);
    }

    /// Fail every `list_unseen` call.
    pub fn fail_list_always(&self, error: TransportError) {
        lock(&self.list_failures).always = Some(error);
    }

    /// List at most `limit` messages per call, oldest first.
    pub fn set_fetch_limit(&self, limit: usize) {
        *lock(&self.fetch_limit) = Some(limit);
    }

    /// Make listing take `delay` per returned message, like a server
    /// downloading each body.
    pub fn set_delay_per_message(&self, delay: Duration) {
        *lock(&self.delay_per_message) = Some(delay);
    }

    /// Messages not yet marked seen.
    pub fn unseen_count(&self) -> usize {
        let seen = lock(&self.seen);
        lock(&self.messages).iter().filter(|m| !seen.contains(&m.id)).count()
    }

    /// Fail every `mark_seen` call.
    pub fn fail_mark_seen(&self, error: TransportError) {
        lock(&self.mark_failures).always = Some(error);
    }

    /// Ids successfully marked seen, in call order.
    pub fn marked_seen(&self) -> Vec<MessageId> {
        lock(&self.marked).clone()
    }

    pub fn list_calls(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InboundTransport for MemoryInbox {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list_unseen(&self, _folder: &str) -> Result<Vec<MessageSummary>, TransportError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = lock(&self.list_failures).take() {
            return Err(e);
        }
        let limit = lock(&self.fetch_limit).unwrap_or(usize::MAX);
        let unseen: Vec<MessageSummary> = {
            let seen = lock(&self.seen);
            lock(&self.messages)
                .iter()
                .filter(|m| !seen.contains(&m.id))
                .take(limit)
                .cloned()
                .collect()
        };
        let delay = *lock(&self.delay_per_message);
        if let Some(delay) = delay {
            let count = u32::try_from(unseen.len()).unwrap_or(u32::MAX);
            tokio::time::sleep(delay.saturating_mul(count)).await;
        }
        Ok(unseen)
    }

    async fn mark_seen(&self, id: &MessageId) -> Result<(), TransportError> {
        if let Some(e) = lock(&self.mark_failures).take() {
            return Err(e);
        }
        lock(&self.seen).insert(id.clone());
        lock(&self.marked).push(id.clone());
        Ok(())
    }
}

// ── Outbound ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryOutbox {
    sent: Mutex<Vec<OutboundMessage>>,
    failures: Mutex<FailureScript>,
    delay: Mutex<Option<Duration>>,
    attempts: AtomicU32,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: TransportError) {
        lock(&self.failures).next.push_back(error);
    }

    pub fn fail_always(&self, error: TransportError) {
        lock(&self.failures).always = Some(error);
    }

    /// Make every send take `delay` before completing.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    /// Messages accepted so far.
    pub fn sent(&self) -> Vec<OutboundMessage> {
        lock(&self.sent).clone()
    }

    /// Send calls made, failed ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OutboundTransport for MemoryOutbox {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(e) = lock(&self.failures).take() {
            return Err(e);
        }
        lock(&self.sent).push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn marked_messages_leave_the_unseen_list() {
        let inbox = MemoryInbox::with_messages(vec![
            MessageSummary::new("1", "a@x.com", "one"),
            MessageSummary::new("2", "b@x.com", "two"),
        ]);
        inbox.mark_seen(&"1".into()).await.unwrap();
        let unseen = inbox.list_unseen("INBOX").await.unwrap();
        assert_eq!(unseen.len(), 1);
        assert_eq!(unseen[0].id, "2".into());
    }

    #[tokio::test]
    async fn fetch_limit_lists_oldest_unseen_first() {
        let inbox = MemoryInbox::with_messages(
            (1..=4).map(|i| MessageSummary::new(i.to_string(), "a@x.com", "s")).collect(),
        );
        inbox.set_fetch_limit(2);
        let ids: Vec<String> = inbox
            .list_unseen("INBOX")
            .await
            .unwrap()
            .iter()
            .map(|m| m.id.to_string())
            .collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(inbox.unseen_count(), 4);
    }

    #[tokio::test]
    async fn one_shot_failure_then_recovery() {
        let inbox = MemoryInbox::new();
        inbox.fail_next_list(TransportError::transient("memory", "down"));
        assert!(inbox.list_unseen("INBOX").await.is_err());
        assert!(inbox.list_unseen("INBOX").await.is_ok());
        assert_eq!(inbox.list_calls(), 2);
    }

    #[tokio::test]
    async fn outbox_counts_failed_attempts() {
        let outbox = MemoryOutbox::new();
        outbox.fail_next(TransportError::permanent("memory", "bad rcpt"));
        let message = OutboundMessage {
            from_name: None,
            from_address: "bot@me.com".into(),
            to: "a@x.com".into(),
            reply_to: None,
            subject: "s".into(),
            text_body: "b".into(),
            html_body: None,
            in_reply_to: None,
            references: vec![],
        };
        assert!(outbox.send(&message).await.is_err());
        assert!(outbox.send(&message).await.is_ok());
        assert_eq!(outbox.attempts(), 2);
        assert_eq!(outbox.sent().len(), 1);
    }
}

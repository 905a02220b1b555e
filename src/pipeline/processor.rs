//! One fetch → dedup → match → dispatch cycle.
//!
//! The processor owns the [`SeenWindow`] so only one writer ever touches it,
//! and it handles messages one at a time so at most one send is in flight.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, TransportError};
use crate::pipeline::dispatch::ActionDispatcher;
use crate::pipeline::rules::{Filter, first_match};
use crate::pipeline::seen::SeenWindow;
use crate::pipeline::types::{ActionOutcome, CycleResult, InboundTransport, MessageId};

/// Per-cycle settings that don't belong to a single component.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub folder: String,
    /// Timeout for the inbound listing call.
    pub fetch_timeout: Duration,
    /// When more unmatched messages than this pile up in one cycle, the oldest
    /// excess ones are marked seen on the server. `None` leaves them alone.
    pub unmatched_backlog_limit: Option<usize>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            folder: "INBOX".to_string(),
            fetch_timeout: Duration::from_secs(30),
            unmatched_backlog_limit: None,
        }
    }
}

pub struct MessageProcessor {
    inbound: Arc<dyn InboundTransport>,
    filters: Arc<[Filter]>,
    dispatcher: ActionDispatcher,
    seen: SeenWindow,
    config: ProcessorConfig,
}

impl MessageProcessor {
    pub fn new(
        inbound: Arc<dyn InboundTransport>,
        filters: Arc<[Filter]>,
        dispatcher: ActionDispatcher,
        seen: SeenWindow,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            inbound,
            filters,
            dispatcher,
            seen,
            config,
        }
    }

    pub fn seen(&self) -> &SeenWindow {
        &self.seen
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Run one full cycle. Only a failed fetch is an error; per-message
    /// failures are reported in the returned outcomes.
    pub async fn run_cycle(&mut self) -> Result<CycleResult, PipelineError> {
        let mut cycle = CycleResult::new(Utc::now());
        let folder = self.config.folder.clone();

        let fetched = match tokio::time::timeout(
            self.config.fetch_timeout,
            self.inbound.list_unseen_excluding(&folder, self.seen.ids()),
        )
        .await
        {
            Ok(Ok(messages)) => messages,
            Ok(Err(source)) => return Err(PipelineError::Fetch { folder, source }),
            Err(_) => {
                return Err(PipelineError::Fetch {
                    folder,
                    source: TransportError::Timeout {
                        transport: self.inbound.name().to_string(),
                        timeout: self.config.fetch_timeout,
                    },
                });
            }
        };

        cycle.fetched = fetched.len();
        let fresh = self.seen.filter(fetched);
        cycle.already_seen = cycle.fetched - fresh.len();

        if fresh.is_empty() {
            debug!(cycle = %cycle.cycle_id, fetched = cycle.fetched, "No new messages to process");
            return Ok(cycle);
        }

        info!(cycle = %cycle.cycle_id, count = fresh.len(), "Processing new message(s)");

        let mut unmatched = Vec::new();
        for message in &fresh {
            match first_match(message, &self.filters) {
                Some(filter) => {
                    let outcome = self.dispatcher.execute(message, filter, &mut self.seen).await;
                    cycle.outcomes.push(outcome);
                }
                None => {
                    debug!(id = %message.id, sender = %message.sender, "No filter matched");
                    unmatched.push(cycle.outcomes.len());
                    cycle.outcomes.push(ActionOutcome::no_match(message.id.clone()));
                }
            }
        }

        if let Some(limit) = self.config.unmatched_backlog_limit {
            let excess = unmatched.len().saturating_sub(limit);
            for &index in unmatched.iter().take(excess) {
                let id = cycle.outcomes[index].message_id.clone();
                cycle.outcomes[index].acknowledged = self.acknowledge_backlog(&id).await;
            }
        }

        Ok(cycle)
    }

    async fn acknowledge_backlog(&self, id: &MessageId) -> bool {
        match tokio::time::timeout(self.config.fetch_timeout, self.inbound.mark_seen(id)).await {
            Ok(Ok(())) => {
                info!(id = %id, "Acknowledged unmatched message to bound the backlog");
                true
            }
            Ok(Err(e)) => {
                warn!(id = %id, error = %e, "Failed to acknowledge unmatched message");
                false
            }
            Err(_) => {
                warn!(id = %id, "Timed out acknowledging unmatched message");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;
    use crate::channels::memory::{MemoryInbox, MemoryOutbox};
    use crate::pipeline::dispatch::RetryPolicy;
    use crate::pipeline::rules::Action;
    use crate::pipeline::types::{MessageSummary, OutcomeResult};

    fn processor(
        inbox: &Arc<MemoryInbox>,
        outbox: &Arc<MemoryOutbox>,
        filters: Vec<Filter>,
        config: ProcessorConfig,
    ) -> MessageProcessor {
        let dispatcher =
            ActionDispatcher::new(inbox.clone(), outbox.clone(), "bot@me.com", RetryPolicy::default());
        MessageProcessor::new(
            inbox.clone(),
            filters.into(),
            dispatcher,
            SeenWindow::new(NonZeroUsize::new(8).unwrap()),
            config,
        )
    }

    fn mark_news() -> Filter {
        Filter::new("news", Action::MarkRead).sender_contains(["news@"])
    }

    #[tokio::test]
    async fn empty_inbox_yields_empty_cycle() {
        let inbox = Arc::new(MemoryInbox::new());
        let outbox = Arc::new(MemoryOutbox::new());
        let mut p = processor(&inbox, &outbox, vec![mark_news()], ProcessorConfig::default());

        let cycle = p.run_cycle().await.unwrap();
        assert_eq!(cycle.fetched, 0);
        assert!(cycle.outcomes.is_empty());
    }

    #[tokio::test]
    async fn fetch_error_is_reported_with_folder() {
        let inbox = Arc::new(MemoryInbox::new());
        inbox.fail_next_list(TransportError::transient("memory", "refused"));
        let outbox = Arc::new(MemoryOutbox::new());
        let config = ProcessorConfig {
            folder: "Receipts".into(),
            ..Default::default()
        };
        let mut p = processor(&inbox, &outbox, vec![mark_news()], config);

        match p.run_cycle().await {
            Err(PipelineError::Fetch { folder, source }) => {
                assert_eq!(folder, "Receipts");
                assert!(source.is_transient());
            }
            other => panic!("expected fetch error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn recorded_ids_are_not_dispatched_again() {
        let inbox = Arc::new(MemoryInbox::with_messages(vec![MessageSummary::new(
            "1",
            "boss@co.com",
            "Hi",
        )]));
        // Marking fails, so the message stays unseen on the server.
        inbox.fail_mark_seen(TransportError::transient("memory", "flaky"));
        let outbox = Arc::new(MemoryOutbox::new());
        let filter = Filter::new(
            "boss",
            Action::Forward {
                forward_to: "me@other.com".into(),
            },
        )
        .sender_contains(["boss@co.com"]);
        let mut p = processor(&inbox, &outbox, vec![filter], ProcessorConfig::default());

        let first = p.run_cycle().await.unwrap();
        assert_eq!(first.applied(), 1);
        let second = p.run_cycle().await.unwrap();
        assert_eq!(second.fetched, 1);
        assert_eq!(second.already_seen, 1);
        assert!(second.outcomes.is_empty());
        assert_eq!(outbox.sent().len(), 1);
    }

    #[tokio::test]
    async fn backlog_limit_acknowledges_oldest_unmatched() {
        let inbox = Arc::new(MemoryInbox::with_messages(
            (1..=5)
                .map(|i| MessageSummary::new(i.to_string(), "stranger@x.com", "hello"))
                .collect(),
        ));
        let outbox = Arc::new(MemoryOutbox::new());
        let config = ProcessorConfig {
            unmatched_backlog_limit: Some(2),
            ..Default::default()
        };
        let mut p = processor(&inbox, &outbox, vec![mark_news()], config);

        let cycle = p.run_cycle().await.unwrap();
        assert_eq!(cycle.unmatched(), 5);
        let acked: Vec<String> = cycle
            .outcomes
            .iter()
            .filter(|o| o.acknowledged)
            .map(|o| o.message_id.to_string())
            .collect();
        assert_eq!(acked, vec!["1", "2", "3"]);
        assert!(cycle.outcomes.iter().all(|o| o.result == OutcomeResult::SkippedNoMatch));
        // Acknowledged backlog is not a handled message.
        assert!(p.seen().is_empty());
    }

    #[tokio::test]
    async fn backlog_limit_ignores_matched_messages() {
        let inbox = Arc::new(MemoryInbox::with_messages(vec![
            MessageSummary::new("1", "news@x.com", "weekly"),
            MessageSummary::new("2", "stranger@x.com", "hello"),
        ]));
        let outbox = Arc::new(MemoryOutbox::new());
        let config = ProcessorConfig {
            unmatched_backlog_limit: Some(1),
            ..Default::default()
        };
        let mut p = processor(&inbox, &outbox, vec![mark_news()], config);

        let cycle = p.run_cycle().await.unwrap();
        assert!(!cycle.outcome_for(&"2".into()).unwrap().acknowledged);
        assert_eq!(inbox.marked_seen(), vec!["1".into()]);
    }

    #[tokio::test(start_paused = true)]
    async fn capped_listing_drains_a_slow_unmatched_backlog() {
        let inbox = Arc::new(MemoryInbox::with_messages(
            (1..=60)
                .map(|i| MessageSummary::new(i.to_string(), "stranger@x.com", "hello"))
                .collect(),
        ));
        // Each message costs a second to download; sixty overrun the timeout.
        inbox.set_delay_per_message(Duration::from_secs(1));
        let outbox = Arc::new(MemoryOutbox::new());
        let config = ProcessorConfig {
            fetch_timeout: Duration::from_secs(30),
            unmatched_backlog_limit: Some(10),
            ..Default::default()
        };
        let mut p = processor(&inbox, &outbox, vec![mark_news()], config);

        match p.run_cycle().await {
            Err(PipelineError::Fetch {
                source: TransportError::Timeout { .. },
                ..
            }) => {}
            other => panic!("expected fetch timeout, got {other:?}"),
        }

        inbox.set_fetch_limit(20);
        let mut remaining = Vec::new();
        for _ in 0..5 {
            let cycle = p.run_cycle().await.unwrap();
            assert_eq!(cycle.fetched, 20);
            remaining.push(inbox.unseen_count());
        }
        assert_eq!(remaining, vec![50, 40, 30, 20, 10]);
        assert!(outbox.sent().is_empty());
    }
}

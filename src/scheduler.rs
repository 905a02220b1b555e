//! Polling scheduler: drives one pipeline cycle per tick.
//!
//! Ticks are spaced from cycle *start*, so a slow cycle doesn't push every
//! later tick back; a cycle that overruns the interval is followed
//! immediately by the next one. Only one cycle is ever in flight.
//!
//! Cancellation interrupts the wait between ticks, never a running cycle:
//! an in-flight fetch or send finishes (or times out) on its own.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channels::{ImapInbox, SmtpMailer};
use crate::config::AppConfig;
use crate::error::PipelineError;
use crate::pipeline::dispatch::ActionDispatcher;
use crate::pipeline::processor::MessageProcessor;
use crate::pipeline::seen::SeenWindow;
use crate::pipeline::types::CycleResult;

/// Polling more often than this only hammers the mail server.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of the cycle-result broadcast channel.
const RESULT_CHANNEL_CAPACITY: usize = 64;

pub struct Scheduler {
    processor: MessageProcessor,
    interval: Duration,
    /// Consecutive fetch failures tolerated before giving up; `None` never
    /// gives up.
    max_consecutive_failures: Option<u32>,
    results: broadcast::Sender<CycleResult>,
}

impl Scheduler {
    pub fn new(processor: MessageProcessor, interval: Duration) -> Self {
        let interval = if interval < MIN_POLL_INTERVAL {
            warn!(
                requested = ?interval,
                minimum = ?MIN_POLL_INTERVAL,
                "Poll interval below minimum, clamping"
            );
            MIN_POLL_INTERVAL
        } else {
            interval
        };
        let (results, _) = broadcast::channel(RESULT_CHANNEL_CAPACITY);
        Self {
            processor,
            interval,
            max_consecutive_failures: None,
            results,
        }
    }

    /// Wire IMAP, SMTP, the dispatcher and the processor from validated
    /// settings. Nothing connects until the first tick.
    pub fn from_config(config: AppConfig) -> crate::error::Result<Self> {
        let inbound = Arc::new(ImapInbox::new(config.imap.clone()));
        let outbound = Arc::new(SmtpMailer::new(&config.smtp)?);

        let dispatcher = ActionDispatcher::new(
            inbound.clone(),
            outbound,
            config.from_address.clone(),
            config.retry.clone(),
        )
        .with_send_timeout(config.smtp.timeout)
        .with_mark_timeout(config.processor.fetch_timeout);

        let processor = MessageProcessor::new(
            inbound,
            config.filters.into(),
            dispatcher,
            SeenWindow::new(config.keep_unseen_count),
            config.processor,
        );
        Ok(Self::new(processor, config.interval)
            .with_failure_threshold(config.max_consecutive_fetch_failures))
    }

    /// Escalate after `failures` consecutive fetch failures. Zero disables.
    pub fn with_failure_threshold(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = (failures > 0).then_some(failures);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn processor(&self) -> &MessageProcessor {
        &self.processor
    }

    /// Receive one `CycleResult` per tick. A tick whose fetch failed yields
    /// a result with `fetch_error` set and no outcomes.
    pub fn subscribe(&self) -> broadcast::Receiver<CycleResult> {
        self.results.subscribe()
    }

    /// Loop until `cancel` fires (returns `Ok`) or fetch failures escalate.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), PipelineError> {
        info!(
            interval = ?self.interval,
            folder = %self.processor.config().folder,
            filters = self.processor.filters().len(),
            "Scheduler started"
        );

        let mut consecutive_failures = 0u32;

        loop {
            if cancel.is_cancelled() {
                info!("Scheduler shutting down");
                return Ok(());
            }

            let started = Instant::now();
            match self.processor.run_cycle().await {
                Ok(cycle) => {
                    consecutive_failures = 0;
                    log_cycle(&cycle);
                    // No subscribers is fine.
                    let _ = self.results.send(cycle);
                }
                Err(e) => {
                    consecutive_failures += 1;
                    error!(consecutive_failures, error = %e, "Cycle skipped");
                    let _ = self.results.send(CycleResult::fetch_failed(Utc::now(), e.to_string()));
                    if let Some(max) = self.max_consecutive_failures
                        && consecutive_failures >= max
                    {
                        return Err(PipelineError::FetchEscalated {
                            failures: consecutive_failures,
                            last_error: e.to_string(),
                        });
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Scheduler shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep_until(started + self.interval) => {}
            }
        }
    }
}

fn log_cycle(cycle: &CycleResult) {
    if cycle.outcomes.is_empty() {
        debug!(cycle = %cycle.cycle_id, fetched = cycle.fetched, "Cycle finished, nothing to do");
        return;
    }
    info!(
        cycle = %cycle.cycle_id,
        fetched = cycle.fetched,
        already_seen = cycle.already_seen,
        applied = cycle.applied(),
        failed = cycle.failed(),
        unmatched = cycle.unmatched(),
        "Cycle finished"
    );
}

/// Spawn the scheduler on the runtime. Cancel the token to stop it.
pub fn spawn_scheduler(
    mut scheduler: Scheduler,
    cancel: CancellationToken,
) -> JoinHandle<Result<(), PipelineError>> {
    tokio::spawn(async move { scheduler.run(cancel).await })
}

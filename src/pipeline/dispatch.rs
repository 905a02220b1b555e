//! Action dispatch with bounded retry.
//!
//! A matched filter's action is executed against the transports:
//! - forward/reply compose an [`OutboundMessage`] and send it
//! - mark_read only flags the message seen on the inbound transport
//!
//! Transient transport failures are retried with exponential backoff, bounded
//! both by `max_attempts` and by a per-message time ceiling. Permanent failures
//! are reported immediately. Every terminal outcome (success, permanent
//! failure, exhausted retries) records the id in the [`SeenWindow`].
//!
//! Send happens before mark-seen: a crash in between can duplicate a send, but
//! never marks a message seen whose reply was lost.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::TransportError;
use crate::pipeline::rules::{Action, Filter};
use crate::pipeline::seen::SeenWindow;
use crate::pipeline::types::{
    ActionKind, ActionOutcome, InboundTransport, MessageSummary, OutboundMessage,
    OutboundTransport, OutcomeResult,
};

const FORWARD_SEPARATOR: &str = "---------- Forwarded message ----------";
const EMPTY_BODY: &str = "Empty content";

// ── Retry policy ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per action, including the first (>= 1).
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound on time spent dispatching one message, retries included.
    pub dispatch_ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            dispatch_ceiling: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry` (1-based): `initial * 2^(retry-1)`,
    /// capped at `max_backoff`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let cap = self.max_backoff.max(self.initial_backoff);
        let shift = retry.saturating_sub(1).min(20);
        self.initial_backoff
            .checked_mul(1u32 << shift)
            .unwrap_or(cap)
            .min(cap)
    }
}

/// Result of a (possibly retried) transport call.
#[derive(Debug)]
struct Attempted {
    result: Result<(), TransportError>,
    attempts: u32,
}

// ── Dispatcher ──────────────────────────────────────────────────────

pub struct ActionDispatcher {
    inbound: Arc<dyn InboundTransport>,
    outbound: Arc<dyn OutboundTransport>,
    from_address: String,
    retry: RetryPolicy,
    send_timeout: Duration,
    mark_timeout: Duration,
}

impl ActionDispatcher {
    pub fn new(
        inbound: Arc<dyn InboundTransport>,
        outbound: Arc<dyn OutboundTransport>,
        from_address: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inbound,
            outbound,
            from_address: from_address.into(),
            retry,
            send_timeout: Duration::from_secs(30),
            mark_timeout: Duration::from_secs(30),
        }
    }

    /// Per-call timeout for outbound sends.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Per-call timeout for inbound mark-seen.
    pub fn with_mark_timeout(mut self, timeout: Duration) -> Self {
        self.mark_timeout = timeout;
        self
    }

    /// Execute `filter`'s action for `message` and record the terminal outcome.
    pub async fn execute(
        &self,
        message: &MessageSummary,
        filter: &Filter,
        seen: &mut SeenWindow,
    ) -> ActionOutcome {
        let kind = filter.action().kind();

        let attempted = match filter.action() {
            Action::Forward { forward_to } => {
                let outbound = compose_forward(message, forward_to, &self.from_address);
                self.send_with_retry(&outbound).await
            }
            Action::Reply { reply_template } => {
                let outbound = compose_reply(message, reply_template, &self.from_address);
                self.send_with_retry(&outbound).await
            }
            Action::MarkRead => {
                self.with_retry(self.inbound.name(), self.mark_timeout, || {
                    self.inbound.mark_seen(&message.id)
                })
                .await
            }
        };

        let mut outcome = ActionOutcome {
            message_id: message.id.clone(),
            rule_matched: Some(filter.name().to_string()),
            action_taken: Some(kind),
            result: OutcomeResult::Applied,
            error: None,
            attempts: attempted.attempts,
            acknowledged: false,
        };

        match attempted.result {
            Ok(()) => {
                outcome.acknowledged = match kind {
                    ActionKind::MarkRead => true,
                    ActionKind::Forward | ActionKind::Reply => self.acknowledge(message).await,
                };
                info!(
                    id = %message.id,
                    rule = %filter.name(),
                    action = kind.label(),
                    attempts = attempted.attempts,
                    subject = %message.subject,
                    "Action applied"
                );
            }
            Err(e) => {
                error!(
                    id = %message.id,
                    rule = %filter.name(),
                    action = kind.label(),
                    attempts = attempted.attempts,
                    error = %e,
                    "Action failed"
                );
                outcome.result = OutcomeResult::Failed;
                outcome.error = Some(e.to_string());
            }
        }

        seen.record(message.id.clone());
        outcome
    }

    async fn send_with_retry(&self, outbound: &OutboundMessage) -> Attempted {
        self.with_retry(self.outbound.name(), self.send_timeout, || {
            self.outbound.send(outbound)
        })
        .await
    }

    /// Best-effort follow-up after a completed send. A failure here is logged
    /// and never unwinds the send.
    async fn acknowledge(&self, message: &MessageSummary) -> bool {
        match tokio::time::timeout(self.mark_timeout, self.inbound.mark_seen(&message.id)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(id = %message.id, error = %e, "Failed to mark message seen after send");
                false
            }
            Err(_) => {
                warn!(
                    id = %message.id,
                    timeout = ?self.mark_timeout,
                    "Timed out marking message seen after send"
                );
                false
            }
        }
    }

    async fn with_retry<F, Fut>(&self, transport: &str, call_timeout: Duration, mut call: F) -> Attempted
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), TransportError>>,
    {
        let started = Instant::now();
        let ceiling = self.retry.dispatch_ceiling;
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempts = 0;

        loop {
            let remaining = ceiling.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Attempted {
                    result: Err(TransportError::Timeout {
                        transport: transport.to_string(),
                        timeout: ceiling,
                    }),
                    attempts,
                };
            }

            let budget = call_timeout.min(remaining);
            attempts += 1;
            let result = match tokio::time::timeout(budget, call()).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout {
                    transport: transport.to_string(),
                    timeout: budget,
                }),
            };

            match result {
                Ok(()) => return Attempted { result, attempts },
                Err(e) if e.is_transient() && attempts < max_attempts => {
                    let wait = self.retry.backoff(attempts);
                    if started.elapsed() + wait >= ceiling {
                        warn!(
                            transport,
                            attempts,
                            error = %e,
                            "Retry would exceed dispatch ceiling, giving up"
                        );
                        return Attempted {
                            result: Err(e),
                            attempts,
                        };
                    }
                    warn!(transport, attempt = attempts, wait = ?wait, error = %e, "Transient failure, retrying");
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    return Attempted {
                        result: Err(e),
                        attempts,
                    };
                }
            }
        }
    }
}

// ── Message composition (public for testing) ────────────────────────

/// Strip line breaks and surrounding whitespace from a header value.
pub fn sanitize_header(value: &str) -> String {
    value.trim().replace(['\r', '\n'], "")
}

/// Prefix `Re: ` unless the subject already carries it.
pub fn reply_subject(subject: &str) -> String {
    let subject = sanitize_header(subject);
    if subject.to_lowercase().starts_with("re:") {
        subject
    } else {
        format!("Re: {subject}")
    }
}

/// Wrap a message id in angle brackets for `In-Reply-To`/`References`.
pub fn header_message_id(id: &str) -> String {
    format!("<{}>", id.trim().trim_start_matches('<').trim_end_matches('>'))
}

/// Fill `{sender}`, `{sender_name}` and `{subject}` in a reply template.
///
/// Single pass over the template: substituted values are never rescanned,
/// so braces in a sender name or subject come out literally.
pub fn render_template(template: &str, message: &MessageSummary) -> String {
    let sender_name = message
        .sender_name
        .as_deref()
        .map(sanitize_header)
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| message.sender.clone());
    let subject = sanitize_header(&message.subject);
    let placeholders = [
        ("{sender_name}", sender_name.as_str()),
        ("{sender}", message.sender.as_str()),
        ("{subject}", subject.as_str()),
    ];

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        rest = &rest[open..];
        match placeholders.iter().find(|(key, _)| rest.starts_with(key)) {
            Some((key, value)) => {
                out.push_str(value);
                rest = &rest[key.len()..];
            }
            None => {
                out.push('{');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn compose_forward(message: &MessageSummary, forward_to: &str, from_address: &str) -> OutboundMessage {
    let subject = sanitize_header(&message.subject);
    let sender_name = message
        .sender_name
        .as_deref()
        .map(sanitize_header)
        .filter(|n| !n.is_empty());

    let from_line = match sender_name {
        Some(ref name) => format!("{name} <{}>", message.sender),
        None => format!("<{}>", message.sender),
    };
    let footer = format!("\n\n{FORWARD_SEPARATOR}\nFrom: {from_line}\nSubject: {subject}\n");

    let text = if message.body_excerpt.is_empty() && message.html_body.is_none() {
        EMPTY_BODY
    } else {
        message.body_excerpt.as_str()
    };

    let html_body = message
        .html_body
        .as_ref()
        .map(|html| format!("{html}<br><br>{}", escape_html(&footer).replace('\n', "<br>")));

    OutboundMessage {
        from_name: sender_name,
        from_address: from_address.to_string(),
        to: forward_to.to_string(),
        reply_to: Some(message.sender.clone()),
        subject: format!("Fwd: {subject}"),
        text_body: format!("{text}{footer}"),
        html_body,
        in_reply_to: None,
        references: Vec::new(),
    }
}

pub fn compose_reply(message: &MessageSummary, template: &str, from_address: &str) -> OutboundMessage {
    let threading = message.message_id.as_deref().map(header_message_id);
    OutboundMessage {
        from_name: None,
        from_address: from_address.to_string(),
        to: message.sender.clone(),
        reply_to: None,
        subject: reply_subject(&message.subject),
        text_body: render_template(template, message),
        html_body: None,
        in_reply_to: threading.clone(),
        references: threading.into_iter().collect(),
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

//! Mail processing pipeline.
//!
//! Every scheduler tick flows through:
//! 1. `InboundTransport::list_unseen()`: transport I/O
//! 2. `SeenWindow::filter()`: drop ids already handled
//! 3. `rules::first_match()`: ordered, first-match-wins classification
//! 4. `ActionDispatcher::execute()`: forward / reply / mark-read with retry
//!
//! Unmatched messages get no terminal action and are reconsidered next cycle.

pub mod dispatch;
pub mod processor;
pub mod rules;
pub mod seen;
pub mod types;

pub use dispatch::{ActionDispatcher, RetryPolicy};
pub use processor::{MessageProcessor, ProcessorConfig};
pub use rules::{Action, Filter, RuleField, all_matches, first_match};
pub use seen::SeenWindow;
pub use types::{
    ActionKind, ActionOutcome, CycleResult, InboundTransport, MessageId, MessageSummary,
    OutboundMessage, OutboundTransport, OutcomeResult,
};

//! mail-reply-smith: rule-driven mail forwarder and auto-responder.
//!
//! Polls a mailbox, matches each new message against an ordered filter list
//! and forwards, replies to, or marks it read.

pub mod channels;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod scheduler;

//! Mail transports: IMAP in, SMTP out, plus in-memory doubles.

pub mod imap;
pub mod memory;
pub mod parse;
pub mod smtp;

pub use imap::{ImapConfig, ImapInbox, ProviderQuirk};
pub use memory::{MemoryInbox, MemoryOutbox};
pub use smtp::{SmtpConfig, SmtpMailer, SmtpSecurity};

//! Raw RFC 5322 bytes → [`MessageSummary`].

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, PartType};

use crate::pipeline::types::{MessageId, MessageSummary};

const NO_SUBJECT: &str = "No Subject";

/// Parse one fetched message. Returns `None` if the bytes aren't a message.
pub fn parse_message(id: MessageId, raw: &[u8], max_body_bytes: usize) -> Option<MessageSummary> {
    let parsed = MessageParser::default().parse(raw)?;

    let from = parsed.from().and_then(|addr| addr.first());
    let sender = from
        .and_then(|a| a.address())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".into());
    let sender_name = from
        .and_then(|a| a.name())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let subject = parsed
        .subject()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| NO_SUBJECT.into());

    let text = match parsed.body_text(0) {
        Some(text) => text.into_owned(),
        None => parsed
            .body_html(0)
            .map(|html| strip_html(&html))
            .unwrap_or_default(),
    };

    // `body_html` synthesizes HTML from plain text; only keep a real HTML part.
    let html_body = parsed.html_part(0).and_then(|part| match &part.body {
        PartType::Html(html) => Some(truncate(html, max_body_bytes).to_string()),
        _ => None,
    });

    let received_at = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    Some(MessageSummary {
        id,
        sender,
        sender_name,
        subject,
        body_excerpt: truncate(&text, max_body_bytes).to_string(),
        html_body,
        message_id: parsed.message_id().map(str::to_string),
        received_at,
    })
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cut `s` to at most `max` bytes on a char boundary.
pub fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

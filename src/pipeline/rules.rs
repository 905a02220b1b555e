//! Ordered filter matching.
//!
//! Filters are evaluated in configured order and the **first** one that fires
//! wins. A filter fires when every populated field matches (AND across
//! sender/subject/body), where a field matches if any of its substrings is
//! contained in the message value (OR within a field). Containment is
//! case-insensitive. A filter with no populated field never fires.
//!
//! First-match-wins means a message never gets two conflicting actions (say,
//! both forward and reply); users control priority by ordering filters.

use tracing::debug;

use crate::pipeline::types::{ActionKind, MessageSummary};

/// Which message field a predicate matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleField {
    Sender,
    Subject,
    Body,
}

/// The action a filter performs, with only the parameters that variant needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Forward { forward_to: String },
    Reply { reply_template: String },
    MarkRead,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Forward { .. } => ActionKind::Forward,
            Self::Reply { .. } => ActionKind::Reply,
            Self::MarkRead => ActionKind::MarkRead,
        }
    }
}

/// A named predicate-plus-action entry.
#[derive(Debug, Clone)]
pub struct Filter {
    name: String,
    sender_contains: Vec<String>,
    subject_contains: Vec<String>,
    body_contains: Vec<String>,
    action: Action,
}

impl Filter {
    pub fn new(name: impl Into<String>, action: Action) -> Self {
        Self {
            name: name.into(),
            sender_contains: Vec::new(),
            subject_contains: Vec::new(),
            body_contains: Vec::new(),
            action,
        }
    }

    pub fn sender_contains<I, S>(self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.with_patterns(RuleField::Sender, patterns)
    }

    pub fn subject_contains<I, S>(self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.with_patterns(RuleField::Subject, patterns)
    }

    pub fn body_contains<I, S>(self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.with_patterns(RuleField::Body, patterns)
    }

    /// Add substrings for `field`. Patterns are stored lowercased.
    pub fn with_patterns<I, S>(mut self, field: RuleField, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let target = match field {
            RuleField::Sender => &mut self.sender_contains,
            RuleField::Subject => &mut self.subject_contains,
            RuleField::Body => &mut self.body_contains,
        };
        target.extend(patterns.into_iter().map(|p| p.as_ref().to_lowercase()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn patterns(&self, field: RuleField) -> &[String] {
        match field {
            RuleField::Sender => &self.sender_contains,
            RuleField::Subject => &self.subject_contains,
            RuleField::Body => &self.body_contains,
        }
    }

    pub fn has_predicates(&self) -> bool {
        !(self.sender_contains.is_empty()
            && self.subject_contains.is_empty()
            && self.body_contains.is_empty())
    }

    /// Whether every populated field of this filter matches `message`.
    pub fn matches(&self, message: &MessageSummary) -> bool {
        if !self.has_predicates() {
            return false;
        }

        [
            (RuleField::Sender, message.sender.as_str()),
            (RuleField::Subject, message.subject.as_str()),
            (RuleField::Body, message.body_excerpt.as_str()),
        ]
        .into_iter()
        .all(|(field, value)| field_matches(self.patterns(field), value))
    }
}

/// Empty pattern lists are unconstrained.
fn field_matches(patterns: &[String], value: &str) -> bool {
    if patterns.is_empty() {
        return true;
    }
    let value = value.to_lowercase();
    patterns.iter().any(|p| value.contains(p.as_str()))
}

/// Return the first filter, in order, that fires on `message`.
pub fn first_match<'a>(message: &MessageSummary, filters: &'a [Filter]) -> Option<&'a Filter> {
    let matched = filters.iter().find(|f| f.matches(message));
    if let Some(filter) = matched {
        debug!(
            id = %message.id,
            sender = %message.sender,
            rule = %filter.name(),
            action = filter.action().kind().label(),
            "Message matched filter"
        );
    }
    matched
}

/// Every filter that fires on `message`, in configured order.
pub fn all_matches<'a>(message: &MessageSummary, filters: &'a [Filter]) -> Vec<&'a Filter> {
    filters.iter().filter(|f| f.matches(message)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forward(name: &str) -> Filter {
        Filter::new(
            name,
            Action::Forward {
                forward_to: "me@other.com".into(),
            },
        )
    }

    fn reply(name: &str) -> Filter {
        Filter::new(
            name,
            Action::Reply {
                reply_template: "Thanks!".into(),
            },
        )
    }

    fn msg(sender: &str, subject: &str, body: &str) -> MessageSummary {
        MessageSummary::new("1", sender, subject).with_body(body)
    }

    #[test]
    fn first_match_wins_over_later_filters() {
        let filters = vec![forward("f1").sender_contains(["a"]), reply("f2").sender_contains(["a"])];
        let message = msg("a@x.com", "Hi", "");
        for _ in 0..10 {
            let hit = first_match(&message, &filters).unwrap();
            assert_eq!(hit.name(), "f1");
            assert_eq!(hit.action().kind(), ActionKind::Forward);
        }
    }

    #[test]
    fn reordering_filters_changes_winner() {
        let filters = vec![reply("f2").sender_contains(["a"]), forward("f1").sender_contains(["a"])];
        let hit = first_match(&msg("a@x.com", "Hi", ""), &filters).unwrap();
        assert_eq!(hit.action().kind(), ActionKind::Reply);
    }

    #[test]
    fn fields_are_and_matched() {
        let filter = forward("boss-urgent")
            .sender_contains(["boss@co.com"])
            .subject_contains(["urgent"]);
        assert!(filter.matches(&msg("boss@co.com", "URGENT: call me", "")));
        assert!(!filter.matches(&msg("boss@co.com", "lunch?", "")));
        assert!(!filter.matches(&msg("intern@co.com", "urgent", "")));
    }

    #[test]
    fn substrings_are_or_matched_within_field() {
        let filter = forward("team").sender_contains(["alice@", "bob@"]);
        assert!(filter.matches(&msg("alice@co.com", "", "")));
        assert!(filter.matches(&msg("bob@co.com", "", "")));
        assert!(!filter.matches(&msg("carol@co.com", "", "")));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let filter = forward("invoices").body_contains(["Invoice #"]);
        assert!(filter.matches(&msg("billing@x.com", "", "your INVOICE #123 is ready")));
        let filter = forward("boss").sender_contains(["BOSS@CO.COM"]);
        assert!(filter.matches(&msg("Boss@Co.com", "", "")));
    }

    #[test]
    fn filter_without_predicates_never_fires() {
        let filter = Filter::new("catch-all", Action::MarkRead);
        assert!(!filter.has_predicates());
        assert!(!filter.matches(&msg("anyone@x.com", "anything", "at all")));
    }

    #[test]
    fn no_match_returns_none() {
        let filters = vec![forward("f1").sender_contains(["boss@co.com"])];
        assert!(first_match(&msg("spam@x.com", "Sale", ""), &filters).is_none());
        assert!(first_match(&msg("spam@x.com", "Sale", ""), &[]).is_none());
    }

    #[test]
    fn all_matches_keeps_order() {
        let filters = vec![
            forward("f1").sender_contains(["a"]),
            reply("f2").subject_contains(["nope"]),
            Filter::new("f3", Action::MarkRead).sender_contains(["x.com"]),
        ];
        let names: Vec<&str> = all_matches(&msg("a@x.com", "Hi", ""), &filters)
            .into_iter()
            .map(Filter::name)
            .collect();
        assert_eq!(names, vec!["f1", "f3"]);
    }

    #[test]
    fn patterns_are_stored_lowercased() {
        let filter = forward("f").subject_contains(["HeLLo"]);
        assert_eq!(filter.patterns(RuleField::Subject), ["hello".to_string()]);
        assert!(filter.patterns(RuleField::Body).is_empty());
    }
}

//! Bounded dedup ledger of recently handled message ids.
//!
//! The inbound transport's `\Seen` flag is not a reliable dedup signal on its
//! own: marking can fail or lag behind a completed send. The window remembers
//! the last `capacity` ids that reached a terminal outcome, evicting the oldest
//! first. Ids older than the window may be processed again; that horizon is
//! the only memory bound.

use std::collections::{HashSet, VecDeque};
use std::num::NonZeroUsize;

use crate::pipeline::types::{MessageId, MessageSummary};

#[derive(Debug, Clone)]
pub struct SeenWindow {
    capacity: NonZeroUsize,
    order: VecDeque<MessageId>,
    members: HashSet<MessageId>,
}

impl SeenWindow {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity.get()),
            members: HashSet::with_capacity(capacity.get()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.members.contains(id)
    }

    /// Every id currently in the window.
    pub fn ids(&self) -> &HashSet<MessageId> {
        &self.members
    }

    /// Record `id` as handled. Returns the evicted id, if the window was full.
    ///
    /// Recording an id that is already present keeps its original position.
    pub fn record(&mut self, id: MessageId) -> Option<MessageId> {
        if self.members.contains(&id) {
            return None;
        }

        let evicted = if self.order.len() == self.capacity.get() {
            let oldest = self.order.pop_front();
            if let Some(ref old) = oldest {
                self.members.remove(old);
            }
            oldest
        } else {
            None
        };

        self.members.insert(id.clone());
        self.order.push_back(id);
        evicted
    }

    /// Drop every message whose id is already in the window.
    pub fn filter(&self, messages: Vec<MessageSummary>) -> Vec<MessageSummary> {
        messages
            .into_iter()
            .filter(|m| !self.contains(&m.id))
            .collect()
    }
}

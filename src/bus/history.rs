//! Bounded ring buffer of dispatched messages.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use super::message::{Message, Priority};

/// Filter for history queries. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub event_type: Option<String>,
    pub source: Option<String>,
    pub priority: Option<Priority>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl HistoryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, message: &Message) -> bool {
        if let Some(ref event_type) = self.event_type {
            if &message.event_type != event_type {
                return false;
            }
        }
        if let Some(ref source) = self.source {
            if message.source.as_deref() != Some(source.as_str()) {
                return false;
            }
        }
        if let Some(priority) = self.priority {
            if message.priority != priority {
                return false;
            }
        }
        if let Some(since) = self.since {
            if message.created_at < since {
                return false;
            }
        }
        true
    }
}

pub struct MessageHistory {
    entries: VecDeque<Message>,
    max_entries: usize,
}

impl MessageHistory {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_entries.min(1024)),
            max_entries,
        }
    }

    /// Record a dispatched message, evicting the oldest entry when full.
    pub fn record(&mut self, message: Message) {
        while self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back(message);
    }

    pub fn query(&self, filter: &HistoryFilter) -> Vec<Message> {
        let iter = self.entries.iter().filter(|m| filter.matches(m)).cloned();
        match filter.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

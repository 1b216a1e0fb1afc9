//! User-visible strategy log, mirrored to tracing.

use super::kind::StrategyKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{error, info, warn};

pub const JOURNAL_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalKind {
    Info,
    Success,
    Error,
    Trade,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: JournalKind,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Journal {
    strategy: StrategyKind,
    entries: VecDeque<JournalEntry>,
}

impl Journal {
    pub fn new(strategy: StrategyKind) -> Self {
        Self {
            strategy,
            entries: VecDeque::with_capacity(JOURNAL_CAPACITY),
        }
    }

    pub fn push(&mut self, kind: JournalKind, message: impl Into<String>) {
        let message = message.into();
        let strategy = self.strategy.as_str();
        match kind {
            JournalKind::Error => error!(strategy, "{}", message),
            JournalKind::Trade => warn!(strategy, "{}", message),
            JournalKind::Info | JournalKind::Success => info!(strategy, "{}", message),
        }
        self.entries.push_front(JournalEntry {
            timestamp: Utc::now(),
            kind,
            message,
        });
        self.entries.truncate(JOURNAL_CAPACITY);
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.push(JournalKind::Info, message);
    }

    pub fn success(&mut self, message: impl Into<String>) {
        self.push(JournalKind::Success, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.push(JournalKind::Error, message);
    }

    pub fn trade(&mut self, message: impl Into<String>) {
        self.push(JournalKind::Trade, message);
    }

    /// Newest first.
    pub fn entries(&self) -> impl Iterator<Item = &JournalEntry> {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<&JournalEntry> {
        self.entries.front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_vec(&self) -> Vec<JournalEntry> {
        self.entries.iter().cloned().collect()
    }
}

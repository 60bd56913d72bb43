use crate::error::{BallotError, Result};

/// Payload of a log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Appended by a new leader so entries from earlier terms can commit
    Noop,
    /// Opaque application command
    Apply(Vec<u8>),
}

/// A single entry in the Raft log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: Command,
}

impl LogEntry {
    pub fn new(term: u64, index: u64, command: Command) -> Self {
        Self {
            term,
            index,
            command,
        }
    }
}

/// Storage for the replicated log. Indices are 1-based; index 0 is the empty
/// prefix with term 0.
///
/// Only the consensus engine writes to a log, from a single task. Durable
/// implementations persist inside `append`/`truncate` before returning.
/// Snapshotting would add a compaction point below which `entry` returns
/// `None` while `term_at` still answers for the compaction index.
pub trait Log: Send + 'static {
    fn last_index(&self) -> u64;

    fn last_term(&self) -> u64;

    /// Term of the entry at `index`; `Some(0)` for index 0 and `None` past
    /// the end of the log.
    fn term_at(&self, index: u64) -> Option<u64>;

    fn entry(&self, index: u64) -> Option<LogEntry>;

    /// Up to `max` entries starting at `from` (inclusive).
    fn entries(&self, from: u64, max: usize) -> Vec<LogEntry>;

    /// Append entries that continue the log at `last_index() + 1`.
    fn append(&mut self, entries: Vec<LogEntry>) -> Result<()>;

    /// Remove every entry with index >= `from`.
    fn truncate(&mut self, from: u64) -> Result<()>;
}

/// In-memory log (would be persisted to disk in production).
#[derive(Debug, Default, Clone)]
pub struct MemoryLog {
    entries: Vec<LogEntry>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn as_slice(&self) -> &[LogEntry] {
        &self.entries
    }
}

impl Log for MemoryLog {
    fn last_index(&self) -> u64 {
        self.entries.last().map(|e| e.index).unwrap_or(0)
    }

    fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.entries.get((index - 1) as usize).map(|e| e.term)
    }

    fn entry(&self, index: u64) -> Option<LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize).cloned()
    }

    fn entries(&self, from: u64, max: usize) -> Vec<LogEntry> {
        let start = from.max(1) as usize - 1;
        if start >= self.entries.len() {
            return Vec::new();
        }
        self.entries[start..].iter().take(max).cloned().collect()
    }

    fn append(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        let mut expected = self.last_index() + 1;
        for entry in &entries {
            if entry.index != expected {
                return Err(BallotError::Log(format!(
                    "entry index {} does not continue the log at {}",
                    entry.index, expected
                )));
            }
            expected += 1;
        }
        self.entries.extend(entries);
        Ok(())
    }

    fn truncate(&mut self, from: u64) -> Result<()> {
        self.entries.truncate(from.saturating_sub(1) as usize);
        Ok(())
    }
}

/// Application state machine fed with committed entries, in index order and
/// exactly once each.
pub trait StateMachine: Send + 'static {
    fn apply(&mut self, entry: &LogEntry);
}

impl<F> StateMachine for F
where
    F: FnMut(&LogEntry) + Send + 'static,
{
    fn apply(&mut self, entry: &LogEntry) {
        self(entry)
    }
}

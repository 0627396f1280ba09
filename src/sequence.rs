//! Monotonic identifier issuance on both ends of the protocol.
//!
//! The sender's `clientEventId` counter is durable: it survives process
//! restarts so ids never collide even after a reload. The receiver's
//! `eventId` counter is per-process and resets each run. Both are used
//! purely for correlation, never for ordering guarantees beyond
//! per-transport order.

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};

/// Errors from counter persistence.
#[derive(thiserror::Error, Debug)]
pub enum CounterError {
    /// Reading or writing the counter file failed.
    #[error("counter io error: {0}")]
    Io(#[from] std::io::Error),
    /// The counter file held something other than counter state.
    #[error("counter state corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// On-disk counter state.
#[derive(Debug, Serialize, Deserialize)]
struct CounterState {
    next: u64,
}

/// Sender-side `clientEventId` counter, persisted across restarts.
///
/// `load`, `save`, and `next` are separate operations: `next` issues
/// and persists in one step, but tests can drive load/save directly.
/// Ids are never reused and never decremented - a failed send still
/// consumes its id, keeping the sequence strictly increasing for
/// correlation.
#[derive(Debug)]
pub struct PersistedCounter {
    next: u64,
    path: PathBuf,
}

impl PersistedCounter {
    /// Load counter state from `path`, defaulting to 1 when no state
    /// exists yet.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, CounterError> {
        let path = path.into();
        let next = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let state: CounterState = serde_json::from_str(&content)?;
            state.next.max(1)
        } else {
            1
        };
        Ok(Self { next, path })
    }

    /// Persist the current state. Written to a sibling temp file and
    /// renamed so a crash never leaves a torn counter.
    pub fn save(&self) -> Result<(), CounterError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string(&CounterState { next: self.next })?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Issue the next id, persisting the advanced state before
    /// returning it.
    pub fn next(&mut self) -> Result<u64, CounterError> {
        let id = self.next;
        self.next += 1;
        self.save()?;
        Ok(id)
    }

    /// The id `next()` would issue, without issuing it.
    pub fn peek(&self) -> u64 {
        self.next
    }

    /// Path the counter persists to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Receiver-side `eventId` allocator. Starts at 1 each process run and
/// increments atomically, so a receiver serving several concurrent
/// channels still issues unique ids.
#[derive(Debug)]
pub struct EventIdAllocator {
    next: AtomicU64,
}

impl Default for EventIdAllocator {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }
}

impl EventIdAllocator {
    /// Allocator starting at 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next event id.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_counter_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join("keywire-counter-tests")
            .join(format!("{name}-{}.json", std::process::id()))
    }

    #[test]
    fn counter_defaults_to_one() {
        let path = temp_counter_path("default");
        let _ = std::fs::remove_file(&path);
        let mut counter = PersistedCounter::load(&path).unwrap();
        assert_eq!(counter.next().unwrap(), 1);
        assert_eq!(counter.next().unwrap(), 2);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn counter_survives_reload() {
        let path = temp_counter_path("reload");
        let _ = std::fs::remove_file(&path);

        let mut counter = PersistedCounter::load(&path).unwrap();
        assert_eq!(counter.next().unwrap(), 1);
        assert_eq!(counter.next().unwrap(), 2);
        drop(counter);

        // Restarted sender never reuses an issued id.
        let mut counter = PersistedCounter::load(&path).unwrap();
        assert_eq!(counter.next().unwrap(), 3);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn load_and_save_are_separate_operations() {
        let path = temp_counter_path("explicit");
        let _ = std::fs::remove_file(&path);

        let counter = PersistedCounter::load(&path).unwrap();
        assert_eq!(counter.peek(), 1);
        counter.save().unwrap();
        assert!(path.exists());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn event_ids_start_at_one_each_run() {
        let ids = EventIdAllocator::new();
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
        assert_eq!(ids.next(), 3);
    }
}

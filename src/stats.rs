//! Cross-subsystem stat collection.
//!
//! Subsystems register a dump callback; a periodic caller (or operator
//! request) invokes every callback under a single lock. Counters follow the
//! single-writer discipline: the owning thread stores, the collector reads
//! relaxed snapshots. Dumps reset the counters, so each dump reports the
//! delta since the previous one.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Single-writer, multi-reader event counter.
///
/// The owner increments from its own thread; any thread may snapshot.
/// Plain relaxed ordering everywhere — counters carry no synchronization
/// obligations.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    pub fn inc(&self) {
        self.add(1);
    }

    #[inline]
    pub fn add(&self, n: u64) {
        // Single writer: load + store avoids an atomic RMW on the hot path.
        let v = self.0.load(Ordering::Relaxed);
        self.0.store(v + n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Snapshot and reset, used by periodic stat dumps.
    pub fn take(&self) -> u64 {
        self.0.swap(0, Ordering::Relaxed)
    }
}

/// Callback invoked by [`StatCollector::dump`].
pub type StatCallback = Box<dyn Fn() + Send>;

/// Opaque registration handle returned by [`StatCollector::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatHandle(u64);

struct StatItem {
    id: u64,
    name: String,
    cb: StatCallback,
}

/// Registry of periodic stat dump callbacks.
#[derive(Default)]
pub struct StatCollector {
    items: Mutex<Vec<StatItem>>,
    next_id: AtomicU64,
}

impl StatCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named dump callback; the handle unregisters it later.
    pub fn register(&self, name: &str, cb: StatCallback) -> StatHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.items.lock().push(StatItem {
            id,
            name: name.to_string(),
            cb,
        });
        tracing::debug!(name, id, "stat callback registered");
        StatHandle(id)
    }

    /// Remove a previously registered callback.
    pub fn unregister(&self, handle: StatHandle) -> Result<()> {
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|item| item.id != handle.0);
        if items.len() == before {
            tracing::warn!(id = handle.0, "stat callback not found");
            return Err(Error::NotFound("stat callback"));
        }
        Ok(())
    }

    /// Run every registered callback under the collector lock.
    ///
    /// Uses try-lock so a stuck dumper cannot wedge the caller; contention
    /// reports [`Error::Busy`].
    pub fn dump(&self) -> Result<()> {
        let Some(items) = self.items.try_lock() else {
            tracing::warn!("stat dump skipped, collector busy");
            return Err(Error::Busy("stat collector"));
        };
        for item in items.iter() {
            (item.cb)();
        }
        Ok(())
    }

    /// Log any callbacks still registered at shutdown.
    pub fn drain(&self) {
        let mut items = self.items.lock();
        for item in items.iter() {
            tracing::warn!(name = %item.name, "stat callback not unregistered at shutdown");
        }
        items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn counter_take_resets() {
        let c = Counter::new();
        c.add(5);
        c.inc();
        assert_eq!(c.get(), 6);
        assert_eq!(c.take(), 6);
        assert_eq!(c.get(), 0);
    }

    #[test]
    fn dump_runs_registered_callbacks() {
        let collector = StatCollector::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        collector.register(
            "test",
            Box::new(move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        collector.dump().unwrap();
        collector.dump().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unregister_removes() {
        let collector = StatCollector::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let handle = collector.register(
            "test",
            Box::new(move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        collector.unregister(handle).unwrap();
        collector.dump().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unregister_unknown_fails() {
        let collector = StatCollector::new();
        assert!(collector.unregister(StatHandle(42)).is_err());
    }
}

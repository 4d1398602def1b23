//! Processor counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use super::State;

/// Point-in-time view of a processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    /// Lifecycle state
    pub state: State,
    /// Packages waiting in the processing queue
    pub current_queue_size: usize,
    /// Items waiting in the intake queue
    pub pending_items: usize,
    /// Items accepted by any add operation
    pub total_added_items: u64,
    /// Items pushed to the processing queue
    pub total_pushed_items: u64,
    /// Packages pushed to the processing queue
    pub total_pushed_packages: u64,
    /// Items whose package was handled successfully
    pub total_processed_items: u64,
    /// Packages handled successfully
    pub total_processed_packages: u64,
    /// Items whose package handler failed
    pub total_failed_items: u64,
    /// Packages whose handler failed
    pub total_failed_packages: u64,
}

/// Atomic processor counters
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicProcessorStats {
    pub added_items: AtomicU64,
    pub pushed_items: AtomicU64,
    pub pushed_packages: AtomicU64,
    pub processed_items: AtomicU64,
    pub processed_packages: AtomicU64,
    pub failed_items: AtomicU64,
    pub failed_packages: AtomicU64,
}

impl AtomicProcessorStats {
    /// Record items accepted by an add operation
    pub fn record_added(&self, items: u64) {
        self.added_items.fetch_add(items, Ordering::Relaxed);
    }

    /// Record a package pushed to the processing queue
    pub fn record_pushed(&self, items: u64) {
        self.pushed_items.fetch_add(items, Ordering::Relaxed);
        self.pushed_packages.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a package handled successfully
    pub fn record_processed(&self, items: u64) {
        self.processed_items.fetch_add(items, Ordering::Relaxed);
        self.processed_packages.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a package whose handler failed
    pub fn record_failed(&self, items: u64) {
        self.failed_items.fetch_add(items, Ordering::Relaxed);
        self.failed_packages.fetch_add(1, Ordering::Relaxed);
    }

    /// Zero the pushed and processed counters (done on start)
    pub fn reset_processing(&self) {
        self.pushed_items.store(0, Ordering::Relaxed);
        self.pushed_packages.store(0, Ordering::Relaxed);
        self.processed_items.store(0, Ordering::Relaxed);
        self.processed_packages.store(0, Ordering::Relaxed);
    }

    /// Snapshot counters together with the queue gauges
    pub fn snapshot(
        &self,
        state: State,
        current_queue_size: usize,
        pending_items: usize,
    ) -> ProcessorStats {
        ProcessorStats {
            state,
            current_queue_size,
            pending_items,
            total_added_items: self.added_items.load(Ordering::Relaxed),
            total_pushed_items: self.pushed_items.load(Ordering::Relaxed),
            total_pushed_packages: self.pushed_packages.load(Ordering::Relaxed),
            total_processed_items: self.processed_items.load(Ordering::Relaxed),
            total_processed_packages: self.processed_packages.load(Ordering::Relaxed),
            total_failed_items: self.failed_items.load(Ordering::Relaxed),
            total_failed_packages: self.failed_packages.load(Ordering::Relaxed),
        }
    }
}

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::relay::DropCause;

/// Per-layer checkpoint and bruise tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LayerTally {
    pub checkpoints: u64,
    pub bruises: u64,
}

/// Counters shared by every in-flight `receive`.
#[derive(Debug, Default)]
pub struct RelayStats {
    pub received: AtomicU64,
    pub forwarded: AtomicU64,
    pub delivered: AtomicU64,
    pub checkpoints: AtomicU64,
    pub bruises: AtomicU64,
    pub dropped_undecodable: AtomicU64,
    pub dropped_sepal_mismatch: AtomicU64,
    pub dropped_bruise_threshold: AtomicU64,
    pub forward_failures: AtomicU64,
    per_layer: Mutex<BTreeMap<usize, LayerTally>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub forwarded: u64,
    pub delivered: u64,
    pub checkpoints: u64,
    pub bruises: u64,
    pub dropped_undecodable: u64,
    pub dropped_sepal_mismatch: u64,
    pub dropped_bruise_threshold: u64,
    pub forward_failures: u64,
    pub per_layer: BTreeMap<usize, LayerTally>,
}

impl RelayStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn onion_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn checkpoint_matched(&self, layer: usize) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
        self.with_layer(layer, |tally| tally.checkpoints += 1);
    }

    pub fn bruise_recorded(&self, layer: usize) {
        self.bruises.fetch_add(1, Ordering::Relaxed);
        self.with_layer(layer, |tally| tally.bruises += 1);
    }

    pub fn onion_dropped(&self, cause: DropCause) {
        let counter = match cause {
            DropCause::Undecodable => &self.dropped_undecodable,
            DropCause::SepalMismatch => &self.dropped_sepal_mismatch,
            DropCause::BruiseThreshold => &self.dropped_bruise_threshold,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn onion_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn onion_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn forward_failed(&self) {
        self.forward_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn layer(&self, layer: usize) -> LayerTally {
        self.per_layer
            .lock()
            .map(|map| map.get(&layer).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            bruises: self.bruises.load(Ordering::Relaxed),
            dropped_undecodable: self.dropped_undecodable.load(Ordering::Relaxed),
            dropped_sepal_mismatch: self.dropped_sepal_mismatch.load(Ordering::Relaxed),
            dropped_bruise_threshold: self.dropped_bruise_threshold.load(Ordering::Relaxed),
            forward_failures: self.forward_failures.load(Ordering::Relaxed),
            per_layer: self.per_layer.lock().map(|map| map.clone()).unwrap_or_default(),
        }
    }

    /// Zero every counter; called when a new run is installed.
    pub fn reset(&self) {
        for counter in [
            &self.received,
            &self.forwarded,
            &self.delivered,
            &self.checkpoints,
            &self.bruises,
            &self.dropped_undecodable,
            &self.dropped_sepal_mismatch,
            &self.dropped_bruise_threshold,
            &self.forward_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        if let Ok(mut map) = self.per_layer.lock() {
            map.clear();
        }
    }

    pub fn log_stats(&self) {
        let s = self.snapshot();
        tracing::info!(
            received = s.received,
            forwarded = s.forwarded,
            delivered = s.delivered,
            checkpoints = s.checkpoints,
            bruises = s.bruises,
            dropped = s.dropped_undecodable + s.dropped_sepal_mismatch + s.dropped_bruise_threshold,
            forward_failures = s.forward_failures,
            "[stats]"
        );
    }

    fn with_layer(&self, layer: usize, update: impl FnOnce(&mut LayerTally)) {
        // A poisoned map only loses the per-layer breakdown; totals stay exact.
        if let Ok(mut map) = self.per_layer.lock() {
            update(map.entry(layer).or_default());
        }
    }
}

//! Periodic engine statistics
//!
//! Each store owns one [`StatsReporter`]: a background thread that snapshots
//! [`StoreStats`] on a fixed interval and publishes every value as a
//! `strata_store_stat{store, metric}` gauge. The exporter is the caller's
//! concern.

use crate::store::StoreStats;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use strata_common::Result;
use tracing::{debug, info, warn};

/// Background statistics loop owned by one store instance
pub struct StatsReporter {
    store: String,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl StatsReporter {
    /// Start reporting `snapshot()` every `interval`
    pub fn start<F>(store: impl Into<String>, interval: Duration, snapshot: F) -> Result<Self>
    where
        F: Fn() -> StoreStats + Send + 'static,
    {
        let store = store.into();
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_shutdown = Arc::clone(&shutdown);
        let label = store.clone();
        let handle = thread::Builder::new()
            .name(format!("{store}-stats"))
            .spawn(move || {
                debug!("Stats reporter for {} started", label);
                let mut next = Instant::now() + interval;
                while !thread_shutdown.load(Ordering::Acquire) {
                    let now = Instant::now();
                    if now < next {
                        thread::park_timeout(next - now);
                        continue;
                    }
                    publish(&label, &snapshot());
                    next = Instant::now() + interval;
                }
                debug!("Stats reporter for {} stopped", label);
            })?;

        info!("Reporting stats for {} every {:?}", store, interval);
        Ok(Self {
            store,
            shutdown,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stop the loop and wait for it to exit
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                warn!("Stats reporter for {} panicked", self.store);
            }
        }
    }

    /// Check if the loop is still running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }
}

impl Drop for StatsReporter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Publish one snapshot through the `metrics` facade
pub fn publish(store: &str, stats: &StoreStats) {
    for (metric, value) in &stats.metrics {
        metrics::gauge!(
            "strata_store_stat",
            "store" => store.to_string(),
            "engine" => stats.engine,
            "metric" => metric.clone()
        )
        .set(*value);
    }
}

//! Parallel batch executor
//!
//! A fixed set of named worker threads consumes jobs from a bounded
//! crossbeam channel. [`WorkerPool::process`] splits one request into
//! batches, runs them on the workers and reassembles the results in input
//! order. The first failing batch stops further dispatch and its error is
//! returned; partial results are discarded. A panicking batch counts as a
//! failed one.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use strata_common::{Error, Result};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Outcome of one batch: `None` when skipped after cancellation
type BatchOutcome<O> = (usize, Option<Result<Vec<O>>>);

/// Fixed-size worker pool
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Spawn `size` workers named `{name}-worker-{i}`
    pub fn new(name: impl Into<String>, size: usize) -> Result<Self> {
        let name = name.into();
        let size = size.max(1);
        let (sender, receiver) = crossbeam_channel::bounded::<Job>(size * 4);

        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let receiver: Receiver<Job> = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-worker-{i}"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                })?;
            workers.push(handle);
        }

        debug!("Started worker pool {} with {} workers", name, size);
        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            size,
        })
    }

    /// Number of worker threads
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `batch_fn` over `items` in batches of `batch_size`
    ///
    /// `batch_fn` must return exactly one output per input item. Output order
    /// matches input order regardless of completion order.
    pub fn process<I, O, F>(&self, items: &[I], batch_size: usize, batch_fn: F) -> Result<Vec<O>>
    where
        I: Clone + Send + Sync + 'static,
        O: Send + 'static,
        F: Fn(&[I]) -> Result<Vec<O>> + Send + Sync + 'static,
    {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let batch_size = batch_size.max(1);
        let sender = self.sender.lock().clone().ok_or(Error::Closed)?;

        let items: Arc<[I]> = Arc::from(items);
        let batch_fn = Arc::new(batch_fn);
        let cancelled = Arc::new(AtomicBool::new(false));
        let (tx, rx) = crossbeam_channel::unbounded::<BatchOutcome<O>>();

        let batches = items.len().div_ceil(batch_size);
        let mut dispatched = 0;
        for batch in 0..batches {
            if cancelled.load(Ordering::Acquire) {
                break;
            }
            let items = Arc::clone(&items);
            let batch_fn = Arc::clone(&batch_fn);
            let job_cancelled = Arc::clone(&cancelled);
            let tx = tx.clone();
            let job: Job = Box::new(move || {
                if job_cancelled.load(Ordering::Acquire) {
                    let _ = tx.send((batch, None));
                    return;
                }
                let start = batch * batch_size;
                let end = (start + batch_size).min(items.len());
                let run = AssertUnwindSafe(|| batch_fn(&items[start..end]));
                let outcome = panic::catch_unwind(run)
                    .unwrap_or_else(|_| Err(Error::storage(format!("batch {batch} panicked"))))
                    .and_then(|out| {
                        if out.len() == end - start {
                            Ok(out)
                        } else {
                            Err(Error::storage(format!(
                                "batch returned {} results for {} items",
                                out.len(),
                                end - start
                            )))
                        }
                    });
                if outcome.is_err() {
                    job_cancelled.store(true, Ordering::Release);
                }
                let _ = tx.send((batch, Some(outcome)));
            });
            if sender.send(job).is_err() {
                cancelled.store(true, Ordering::Release);
                return Err(Error::Closed);
            }
            dispatched += 1;
        }
        drop(tx);

        let mut slots: Vec<Option<Vec<O>>> = (0..batches).map(|_| None).collect();
        let mut received = 0;
        while received < dispatched {
            let Ok((batch, outcome)) = rx.recv() else {
                return Err(Error::storage(format!(
                    "worker pool {} dropped a batch",
                    self.name
                )));
            };
            received += 1;
            match outcome {
                Some(Ok(out)) => slots[batch] = Some(out),
                Some(Err(e)) => return Err(e),
                None => {}
            }
        }

        let mut results = Vec::with_capacity(items.len());
        for slot in slots {
            match slot {
                Some(out) => results.extend(out),
                None => return Err(Error::storage("batch skipped without an error")),
            }
        }
        Ok(results)
    }

    /// Stop accepting work and join the workers
    pub fn close(&self) {
        self.sender.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                warn!("Worker in pool {} panicked", self.name);
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

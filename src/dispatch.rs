//! Worker pool that runs the user callback on copies of freshly ingested rows.
//!
//! Rows travel over a bounded channel so a slow callback can never grow memory without
//! limit; a submit that cannot be queued within the timeout is rejected and counted.
//! Workers report every outcome back on a second channel which the ingestion loop reaps.

use crate::{DaqError, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, SendTimeoutError, Sender};
use log::{debug, warn};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Copy of one ingested row handed to the callback.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRow {
    /// Row index in the acquisition buffer.
    pub index: usize,
    pub readings: Vec<f64>,
    pub device_time: f64,
    pub host_time: f64,
}

pub type RowCallback = Arc<dyn Fn(&SampleRow) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchSettings {
    pub workers: usize,
    pub queue_depth: usize,
    pub submit_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 1024,
            submit_timeout: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
}

impl DispatchReport {
    /// Submitted rows whose callback has not reported back yet.
    pub fn outstanding(&self) -> u64 {
        self.submitted - self.completed - self.failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed,
}

pub struct CallbackDispatcher {
    tx: Option<Sender<SampleRow>>,
    done_rx: Receiver<Outcome>,
    workers: Vec<JoinHandle<()>>,
    submit_timeout: Duration,
    report: DispatchReport,
}

impl CallbackDispatcher {
    pub fn start(callback: RowCallback, settings: DispatchSettings) -> Result<Self> {
        if settings.workers == 0 {
            return Err(DaqError::validation("callback pool needs at least one worker"));
        }
        if settings.queue_depth == 0 {
            return Err(DaqError::validation("callback queue depth must be positive"));
        }

        let (tx, rx) = bounded::<SampleRow>(settings.queue_depth);
        let (done_tx, done_rx) = unbounded();
        let mut workers = Vec::with_capacity(settings.workers);
        for id in 0..settings.workers {
            let rx = rx.clone();
            let done_tx = done_tx.clone();
            let callback = Arc::clone(&callback);
            let handle = thread::Builder::new()
                .name(format!("callback-{id}"))
                .spawn(move || worker(rx, done_tx, callback))
                .map_err(|e| DaqError::Dispatch(format!("spawning worker {id}: {e}")))?;
            workers.push(handle);
        }
        debug!(
            "callback pool started: {} workers, queue depth {}",
            settings.workers, settings.queue_depth
        );

        Ok(Self {
            tx: Some(tx),
            done_rx,
            workers,
            submit_timeout: settings.submit_timeout,
            report: DispatchReport::default(),
        })
    }

    /// Queues a row for the callback. Returns `false` if it was rejected.
    pub fn submit(&mut self, row: SampleRow) -> bool {
        let Some(tx) = &self.tx else {
            self.report.rejected += 1;
            return false;
        };
        match tx.send_timeout(row, self.submit_timeout) {
            Ok(()) => {
                self.report.submitted += 1;
                true
            }
            Err(SendTimeoutError::Timeout(row)) => {
                self.report.rejected += 1;
                warn!(
                    "callback queue full for {:?}; row {} dropped",
                    self.submit_timeout, row.index
                );
                false
            }
            Err(SendTimeoutError::Disconnected(row)) => {
                self.report.rejected += 1;
                warn!("callback workers gone; row {} dropped", row.index);
                false
            }
        }
    }

    /// Collects outcomes reported so far without blocking. Returns how many were reaped.
    pub fn reap(&mut self) -> usize {
        let mut reaped = 0;
        while let Ok(outcome) = self.done_rx.try_recv() {
            self.record(outcome);
            reaped += 1;
        }
        reaped
    }

    pub fn report(&self) -> DispatchReport {
        self.report
    }

    /// Closes the queue, waits for every queued callback to finish and returns the final
    /// tally. After this `outstanding()` is zero.
    pub fn drain(mut self) -> DispatchReport {
        self.shutdown();
        self.report
    }

    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Completed => self.report.completed += 1,
            Outcome::Failed => self.report.failed += 1,
        }
    }

    fn shutdown(&mut self) {
        // Dropping the sender lets workers finish the queue and exit.
        self.tx = None;
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("callback worker exited abnormally");
            }
        }
        self.reap();
        if self.report.outstanding() > 0 {
            warn!(
                "{} callbacks never reported back",
                self.report.outstanding()
            );
        }
    }
}

impl Drop for CallbackDispatcher {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.shutdown();
        }
    }
}

fn worker(rx: Receiver<SampleRow>, done_tx: Sender<Outcome>, callback: RowCallback) {
    for row in rx.iter() {
        let outcome = match catch_unwind(AssertUnwindSafe(|| callback(&row))) {
            Ok(()) => Outcome::Completed,
            Err(_) => {
                warn!("callback panicked on row {}", row.index);
                Outcome::Failed
            }
        };
        if done_tx.send(outcome).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn row(index: usize) -> SampleRow {
        SampleRow {
            index,
            readings: vec![index as f64],
            device_time: index as f64 * 0.1,
            host_time: 0.0,
        }
    }

    #[test]
    fn rejects_empty_pool() {
        let cb: RowCallback = Arc::new(|_| {});
        let settings = DispatchSettings {
            workers: 0,
            ..Default::default()
        };
        assert!(CallbackDispatcher::start(cb.clone(), settings).is_err());
        let settings = DispatchSettings {
            queue_depth: 0,
            ..Default::default()
        };
        assert!(CallbackDispatcher::start(cb, settings).is_err());
    }

    #[test]
    fn drain_waits_for_every_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb: RowCallback = Arc::new(move |r: &SampleRow| {
            thread::sleep(Duration::from_millis(1));
            sink.lock().unwrap().push(r.index);
        });
        let mut dispatcher = CallbackDispatcher::start(cb, DispatchSettings::default()).unwrap();
        for i in 0..50 {
            assert!(dispatcher.submit(row(i)));
        }
        let report = dispatcher.drain();
        assert_eq!(
            report,
            DispatchReport {
                submitted: 50,
                completed: 50,
                failed: 0,
                rejected: 0
            }
        );
        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn panicking_callback_counts_as_failed() {
        let cb: RowCallback = Arc::new(|r: &SampleRow| {
            if r.index % 2 == 1 {
                panic!("odd row");
            }
        });
        let mut dispatcher = CallbackDispatcher::start(cb, DispatchSettings::default()).unwrap();
        for i in 0..10 {
            dispatcher.submit(row(i));
        }
        let report = dispatcher.drain();
        assert_eq!(report.completed, 5);
        assert_eq!(report.failed, 5);
        assert_eq!(report.outstanding(), 0);
    }

    #[test]
    fn full_queue_rejects_after_timeout() {
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        let started = Arc::new(AtomicUsize::new(0));
        let cb: RowCallback = {
            let gate = Arc::clone(&gate);
            let started = Arc::clone(&started);
            Arc::new(move |_: &SampleRow| {
                started.fetch_add(1, Ordering::SeqCst);
                let _g = gate.lock().unwrap();
            })
        };
        let settings = DispatchSettings {
            workers: 1,
            queue_depth: 1,
            submit_timeout: Duration::from_millis(10),
        };
        let mut dispatcher = CallbackDispatcher::start(cb, settings).unwrap();
        assert!(dispatcher.submit(row(0)));
        while started.load(Ordering::SeqCst) == 0 {
            thread::yield_now();
        }
        // worker is blocked on row 0, the queue holds row 1
        assert!(dispatcher.submit(row(1)));
        assert!(!dispatcher.submit(row(2)));
        drop(held);
        let report = dispatcher.drain();
        assert_eq!(report.submitted, 2);
        assert_eq!(report.completed, 2);
        assert_eq!(report.rejected, 1);
    }

    #[test]
    fn reap_picks_up_finished_work() {
        let cb: RowCallback = Arc::new(|_| {});
        let mut dispatcher = CallbackDispatcher::start(cb, DispatchSettings::default()).unwrap();
        dispatcher.submit(row(0));
        let mut reaped = 0;
        while reaped == 0 {
            reaped = dispatcher.reap();
            thread::yield_now();
        }
        assert_eq!(dispatcher.report().completed, 1);
        assert_eq!(dispatcher.drain().outstanding(), 0);
    }
}

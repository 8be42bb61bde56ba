//! Bounded worker pool for independent batch items.
//!
//! Workers claim items through an atomic cursor and report through a
//! channel; the channel is the only state they share with the caller. When the batch
//! deadline passes the cancel flag is raised, no further items are started
//! and whatever has not reported yet comes back as `None`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::timestamp::deadline_after;

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-item view of the batch handed to the work function.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub cancel: CancelToken,
    pub deadline: Instant,
}

impl WorkerContext {
    /// Time left before the batch deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// True once cancelled or past the deadline.
    pub fn should_stop(&self) -> bool {
        self.cancel.is_cancelled() || Instant::now() >= self.deadline
    }
}

pub type WorkFn<I, T> = Arc<dyn Fn(usize, I, &WorkerContext) -> T + Send + Sync>;

/// Run `work` over `items` with at most `throttle` items in flight.
///
/// The result vector is in input order; `None` marks an item that did not
/// finish before `batch_timeout`.
pub fn run_bounded<I, T>(
    items: Vec<I>,
    throttle: usize,
    batch_timeout: Duration,
    work: WorkFn<I, T>,
) -> Vec<Option<T>>
where
    I: Send + 'static,
    T: Send + 'static,
{
    let total = items.len();
    let mut results: Vec<Option<T>> = (0..total).map(|_| None).collect();
    if total == 0 {
        return results;
    }

    let ctx = WorkerContext {
        cancel: CancelToken::new(),
        deadline: deadline_after(Instant::now(), batch_timeout),
    };
    let slots: Arc<Vec<Mutex<Option<I>>>> =
        Arc::new(items.into_iter().map(|item| Mutex::new(Some(item))).collect());
    let cursor = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel::<(usize, T)>();

    let workers: Vec<JoinHandle<()>> = (0..throttle.clamp(1, total))
        .map(|_| {
            let slots = Arc::clone(&slots);
            let cursor = Arc::clone(&cursor);
            let tx = tx.clone();
            let work = Arc::clone(&work);
            let ctx = ctx.clone();
            std::thread::spawn(move || loop {
                if ctx.should_stop() {
                    break;
                }
                let index = cursor.fetch_add(1, Ordering::SeqCst);
                let Some(slot) = slots.get(index) else {
                    break;
                };
                let Some(item) = slot
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take()
                else {
                    continue;
                };
                let out = work(index, item, &ctx);
                if tx.send((index, out)).is_err() {
                    break;
                }
            })
        })
        .collect();
    drop(tx);

    let mut received = 0;
    while received < total {
        let remaining = ctx.deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok((index, out)) => {
                results[index] = Some(out);
                received += 1;
            }
            Err(RecvTimeoutError::Timeout) => {
                ctx.cancel.cancel();
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if received == total {
        for worker in workers {
            let _ = worker.join();
        }
    }
    // Otherwise stragglers are left detached; their sends fail once `rx`
    // is dropped and they exit.
    results
}

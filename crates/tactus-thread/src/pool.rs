//! Returnable worker threads for short, independent fan-out jobs.
//!
//! Workers are spawned once and go back to the pool after each job. Jobs
//! must not block on the thread tree; they are meant for bounded
//! per-channel or per-run work inside one tick.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

use crate::error::{Result, ThreadError, panic_message};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Result slot of one pooled job.
pub struct Returnable<R> {
    rx: Receiver<std::result::Result<R, String>>,
}

impl<R> Returnable<R> {
    /// Blocks until the job returned.
    pub fn wait(self) -> Result<R> {
        match self.rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(ThreadError::JobPanicked(message)),
            Err(_) => Err(ThreadError::PoolClosed),
        }
    }

    /// Returns the result if the job already finished.
    pub fn try_take(&self) -> Option<Result<R>> {
        match self.rx.try_recv() {
            Ok(Ok(value)) => Some(Ok(value)),
            Ok(Err(message)) => Some(Err(ThreadError::JobPanicked(message))),
            Err(crossbeam_channel::TryRecvError::Empty) => None,
            Err(crossbeam_channel::TryRecvError::Disconnected) => Some(Err(ThreadError::PoolClosed)),
        }
    }
}

/// Fixed set of worker threads fed over a channel.
pub struct ReturnablePool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ReturnablePool {
    /// Spawns `size` workers.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(ThreadError::InvalidConfig("worker pool needs at least one thread".into()));
        }
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let rx = rx.clone();
            let name = format!("tactus-worker-{i}");
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    for job in rx.iter() {
                        job();
                    }
                })
                .map_err(|source| ThreadError::Spawn { name, source })?;
            workers.push(handle);
        }
        tracing::debug!("pool_start: {size} workers");
        Ok(Self { tx: Some(tx), workers })
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues `job` and returns its result slot.
    pub fn execute<R, F>(&self, job: F) -> Returnable<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (result_tx, rx) = crossbeam_channel::bounded(1);
        let wrapped: Job = Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(job)).map_err(|p| panic_message(p.as_ref()));
            let _ = result_tx.send(outcome);
        });
        if let Some(tx) = &self.tx {
            // A failed send drops the job and with it the result sender,
            // which the slot reports as a closed pool.
            let _ = tx.send(wrapped);
        }
        Returnable { rx }
    }

    /// Runs `f` over every item on the pool and returns the results in
    /// input order. The first panicking job is reported after all others
    /// finished.
    pub fn fan_out<T, R, F>(&self, items: Vec<T>, f: F) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let slots: Vec<_> = items
            .into_iter()
            .map(|item| {
                let f = Arc::clone(&f);
                self.execute(move || f(item))
            })
            .collect();

        let mut results = Vec::with_capacity(slots.len());
        let mut first_error = None;
        for slot in slots {
            match slot.wait() {
                Ok(value) => results.push(value),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }
}

impl Drop for ReturnablePool {
    fn drop(&mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fan_out_keeps_order() {
        let pool = ReturnablePool::new(3).unwrap();
        let out = pool.fan_out((0..32).collect(), |i: u32| i * i).unwrap();
        assert_eq!(out, (0..32).map(|i| i * i).collect::<Vec<_>>());
    }

    #[test]
    fn test_workers_are_reused() {
        let pool = ReturnablePool::new(2).unwrap();
        let names = pool
            .fan_out((0..16).collect(), |_: u32| {
                thread::current().name().map(str::to_string).unwrap_or_default()
            })
            .unwrap();
        assert!(names.iter().all(|n| n.starts_with("tactus-worker-")));
        assert_eq!(pool.size(), 2);
    }

    #[test]
    fn test_panicking_job_is_reported() {
        let pool = ReturnablePool::new(2).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let result = pool.fan_out(vec![1, 2, 3], move |i: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            assert!(i != 2, "job two failed");
            i
        });
        assert!(matches!(result, Err(ThreadError::JobPanicked(ref m)) if m.contains("job two failed")));
        assert_eq!(ran.load(Ordering::SeqCst), 3);

        // The pool survives a panicking job.
        assert_eq!(pool.execute(|| 7).wait().unwrap(), 7);
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(matches!(ReturnablePool::new(0), Err(ThreadError::InvalidConfig(_))));
    }
}

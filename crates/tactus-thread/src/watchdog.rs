//! Background hang detection.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, ThreadError};
use crate::tree::ThreadTree;

/// Runs [`ThreadTree::check_hangs`] on its own thread every `interval`.
///
/// Dropping the watchdog stops and joins its thread.
pub struct Watchdog {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Spawns a watchdog over `tree`.
    pub fn spawn(tree: ThreadTree, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(ThreadError::InvalidConfig("watchdog interval must be non-zero".into()));
        }
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("tactus-watchdog".into())
            .spawn(move || {
                let (lock, cond) = &*flag;
                let mut stopped = lock.lock();
                while !*stopped {
                    if cond.wait_for(&mut stopped, interval).timed_out() {
                        drop(stopped);
                        for hang in tree.check_hangs() {
                            tracing::error!("watchdog: {hang}");
                        }
                        stopped = lock.lock();
                    }
                }
            })
            .map_err(|source| ThreadError::Spawn {
                name: "tactus-watchdog".into(),
                source,
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stops the watchdog and waits for its thread.
    pub fn stop(&mut self) {
        let (lock, cond) = &*self.stop;
        *lock.lock() = true;
        cond.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

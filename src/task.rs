//! Background tasks and cooperative cancellation.
//!
//! Every loop runs on its own named OS thread. A [CancelToken] is checked at
//! each blocking boundary; setting it never interrupts a blocked call by
//! itself, the transport has to be shut down as well.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::error;

use crate::{Error, Result};

/// Locks `mutex`, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Starts `f` on a new OS thread named `name`.
///
/// A panic inside `f` is caught and logged rather than propagated to the
/// joiner.
///
/// # Errors
///
/// Returns [Error::TaskCreateFailed] if the OS refused to create the thread.
pub fn spawn<F>(name: &str, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    let task = name.to_string();

    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            if let Err(e) = panic::catch_unwind(AssertUnwindSafe(f)) {
                let msg = if let Some(s) = e.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = e.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };

                error!("task {task} panicked: {msg}");
            }
        })
        .map_err(Error::TaskCreateFailed)
}

/// Cancellation token shared between a connection and its loop.
#[derive(Debug, Default)]
pub struct CancelToken {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl CancelToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cancellation flag and wakes every [CancelToken::sleep].
    pub fn cancel(&self) {
        *lock(&self.flag) = true;
        self.cond.notify_all();
    }

    /// Checks if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        *lock(&self.flag)
    }

    /// Sleeps for `dur`, returning early if the token is cancelled.
    ///
    /// Returns `true` if the token was cancelled.
    pub fn sleep(&self, dur: Duration) -> bool {
        let deadline = Instant::now() + dur;
        let mut cancelled = lock(&self.flag);

        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            cancelled = self
                .cond
                .wait_timeout(cancelled, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        *cancelled
    }
}

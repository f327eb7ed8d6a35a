//! Cooperative cancellation and time source for every blocking wait.
//!
//! The sequencer never sleeps directly. It waits on a [`CancelToken`] through
//! a [`Clock`], so a termination signal ends any pending wait at the next
//! wakeup instead of killing the process mid-call.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{KillchainError, Result};

// ---------------------------------------------------------------------------
// CancelToken
// ---------------------------------------------------------------------------

/// Shared, clonable cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token and wake every waiter.
    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        if let Ok(mut cancelled) = flag.lock() {
            *cancelled = true;
        }
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.0.lock().map(|c| *c).unwrap_or(true)
    }

    /// `Err(Cancelled)` if the token has been tripped.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(KillchainError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Block for up to `timeout`. Returns `Err(Cancelled)` as soon as the
    /// token is tripped, `Ok(())` when the full duration elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        let (flag, cvar) = &*self.inner;
        let guard = flag.lock().map_err(|_| KillchainError::Cancelled)?;
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .map_err(|_| KillchainError::Cancelled)?;
        if *guard {
            Err(KillchainError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Block until the token is tripped.
    pub fn wait(&self) {
        let (flag, cvar) = &*self.inner;
        let Ok(guard) = flag.lock() else {
            return;
        };
        drop(cvar.wait_while(guard, |cancelled| !*cancelled));
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Time source used by every loop in the crate.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;

    /// Sleep for `duration` unless `cancel` is tripped first.
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> Result<()>;
}

/// Wall-clock time with condvar-backed, interruptible sleeps.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> Result<()> {
        cancel.wait_timeout(duration)
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }

    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> Result<()> {
        (**self).sleep(duration, cancel)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

// src/core/locks.rs

//! Named locks serialising actions that touch the same external resource.
//!
//! The executor only sees the [`LockProvider`] trait; the daemon hands it one
//! process-wide [`LockTable`] shared by every session.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The lock stayed held by another action for longer than allowed.
    #[error("Timed out after {waited_ms} ms waiting for lock '{name}'.")]
    Timeout { name: String, waited_ms: u128 },
    /// A thread panicked while it held the lock table.
    #[error("Lock table is poisoned, cannot acquire '{0}'.")]
    Poisoned(String),
    #[error("Lock '{0}' is not available.")]
    Unavailable(String),
}

/// Grants named, non-reentrant locks.
pub trait LockProvider: Send + Sync + fmt::Debug {
    /// Blocks until `name` is free, then holds it until the guard drops.
    fn acquire(&self, name: &str) -> Result<LockGuard, LockError>;

    /// Takes `name` only if nobody holds it, failing with
    /// [`LockError::Unavailable`] otherwise. Never waits.
    fn try_acquire(&self, name: &str) -> Result<LockGuard, LockError>;
}

/// Releases its lock when dropped.
pub struct LockGuard {
    name: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    pub fn new(name: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            name: name.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("name", &self.name).finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            log::trace!("Releasing lock '{}'", self.name);
            release();
        }
    }
}

#[derive(Debug, Default)]
struct LockState {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl LockState {
    fn release(&self, name: &str) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.remove(name);
        self.released.notify_all();
    }
}

/// The in-memory lock table. Cloning yields another handle to the same table.
#[derive(Debug, Clone)]
pub struct LockTable {
    state: Arc<LockState>,
    timeout: Duration,
}

impl LockTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Arc::new(LockState::default()),
            timeout,
        }
    }

    /// Returns `true` if some action currently holds `name`.
    pub fn is_held(&self, name: &str) -> bool {
        self.state
            .held
            .lock()
            .map(|held| held.contains(name))
            .unwrap_or(false)
    }

    fn guard(&self, name: &str) -> LockGuard {
        let state = Arc::clone(&self.state);
        let owned = name.to_string();
        LockGuard::new(name, move || state.release(&owned))
    }
}

impl LockProvider for LockTable {
    fn acquire(&self, name: &str) -> Result<LockGuard, LockError> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut held = self
            .state
            .held
            .lock()
            .map_err(|_| LockError::Poisoned(name.to_string()))?;

        while held.contains(name) {
            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    name: name.to_string(),
                    waited_ms: started.elapsed().as_millis(),
                });
            }
            let (guard, _) = self
                .state
                .released
                .wait_timeout(held, deadline - now)
                .map_err(|_| LockError::Poisoned(name.to_string()))?;
            held = guard;
        }

        held.insert(name.to_string());
        log::trace!("Acquired lock '{}' after {:?}", name, started.elapsed());
        Ok(self.guard(name))
    }

    fn try_acquire(&self, name: &str) -> Result<LockGuard, LockError> {
        let mut held = self
            .state
            .held
            .lock()
            .map_err(|_| LockError::Poisoned(name.to_string()))?;
        if !held.insert(name.to_string()) {
            return Err(LockError::Unavailable(name.to_string()));
        }
        Ok(self.guard(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_guard_releases_on_drop() {
        // Setup
        let table = LockTable::new(Duration::from_millis(100));

        // Execute
        let guard = table.acquire("config").unwrap();
        assert!(table.is_held("config"));
        drop(guard);

        // Assert
        assert!(!table.is_held("config"));
        assert!(table.acquire("config").is_ok());
    }

    #[test]
    fn test_second_acquire_times_out_while_held() {
        // Setup
        let table = LockTable::new(Duration::from_millis(50));
        let _guard = table.acquire("config").unwrap();

        // Execute
        let result = table.acquire("config");

        // Assert
        assert!(matches!(result, Err(LockError::Timeout { ref name, .. }) if name == "config"));
    }

    #[test]
    fn test_try_acquire_fails_fast_while_held() {
        // Setup: a long timeout that a blocking acquire would sit out.
        let table = LockTable::new(Duration::from_secs(5));
        let guard = table.acquire("config").unwrap();

        // Execute
        let started = Instant::now();
        let busy = table.try_acquire("config");

        // Assert
        assert!(matches!(busy, Err(LockError::Unavailable(ref name)) if name == "config"));
        assert!(started.elapsed() < Duration::from_secs(1));
        drop(guard);
        assert!(table.try_acquire("config").is_ok());
    }

    #[test]
    fn test_distinct_names_do_not_block() {
        let table = LockTable::new(Duration::from_millis(50));
        let _a = table.acquire("a").unwrap();
        assert!(table.acquire("b").is_ok());
    }

    #[test]
    fn test_holders_of_the_same_lock_never_overlap() {
        // Setup: two threads each hold "L" for a while and record their interval.
        let table = LockTable::new(Duration::from_secs(5));
        let hold = Duration::from_millis(150);

        // Execute
        let workers: Vec<_> = (0..2)
            .map(|_| {
                let table = table.clone();
                thread::spawn(move || {
                    let _guard = table.acquire("L").unwrap();
                    let start = Instant::now();
                    thread::sleep(hold);
                    (start, Instant::now())
                })
            })
            .collect();
        let mut intervals: Vec<(Instant, Instant)> =
            workers.into_iter().map(|w| w.join().unwrap()).collect();
        intervals.sort();

        // Assert: the second interval starts after the first one ended.
        let first = intervals.first().unwrap();
        let second = intervals.last().unwrap();
        assert!(second.0 >= first.1);
    }
}

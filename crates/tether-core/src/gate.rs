//! Exclusive access gate for shared mutable state.
//!
//! An [`ExclusiveGate`] owns a value and only lends it out to a *key*: a
//! callback executed while the gate's lock is held. There is no accessor that
//! returns a reference, so the value can never be mutated outside the lock.
//!
//! ```
//! use tether_core::gate::ExclusiveGate;
//!
//! let gate = ExclusiveGate::new(Vec::<String>::new());
//!
//! assert!(gate.enter(|names| names.push("first".into())));
//!
//! // Non-blocking attempt; false if another caller holds the lock.
//! let _ = gate.try_enter(|names| names.push("second".into()));
//!
//! // A failing key reports false instead of propagating.
//! assert!(!gate.enter_with(|_| Err::<(), _>("rejected")));
//! ```
//!
//! The held value may start out in a "not yet valid" form (an empty
//! `Option`, a default struct); keys are free to bring it to a valid state
//! through in-place mutation.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use parking_lot::Mutex;

use crate::error::panic_message;
use crate::logging::targets;

/// Serializes all access to one value behind a lock.
pub struct ExclusiveGate<T> {
    value: Mutex<T>,
}

impl<T> ExclusiveGate<T> {
    /// Create a gate holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
        }
    }

    /// Acquire the lock (blocking) and run `key` against the held value.
    ///
    /// Returns `false` if the key panicked. The lock is released either way
    /// and the gate stays usable, but a key that panics halfway through a
    /// mutation leaves whatever it had written so far.
    pub fn enter<F>(&self, key: F) -> bool
    where
        F: FnOnce(&mut T),
    {
        self.enter_with(|value| {
            key(value);
            Ok::<(), String>(())
        })
    }

    /// Like [`enter`](Self::enter), but never blocks.
    ///
    /// Returns `false` immediately, without running the key, if the lock is
    /// held by another caller.
    pub fn try_enter<F>(&self, key: F) -> bool
    where
        F: FnOnce(&mut T),
    {
        self.try_enter_with(|value| {
            key(value);
            Ok::<(), String>(())
        })
    }

    /// Acquire the lock and run a fallible key.
    ///
    /// Returns `true` only if the key returned `Ok`.
    pub fn enter_with<F, E>(&self, key: F) -> bool
    where
        F: FnOnce(&mut T) -> Result<(), E>,
        E: fmt::Display,
    {
        let mut guard = self.value.lock();
        run_key(&mut *guard, key)
    }

    /// Non-blocking form of [`enter_with`](Self::enter_with).
    pub fn try_enter_with<F, E>(&self, key: F) -> bool
    where
        F: FnOnce(&mut T) -> Result<(), E>,
        E: fmt::Display,
    {
        match self.value.try_lock() {
            Some(mut guard) => run_key(&mut *guard, key),
            None => {
                tracing::trace!(target: targets::GATE, "gate busy, key not run");
                false
            }
        }
    }

    /// Whether some caller currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.value.is_locked()
    }

    /// Consume the gate and return the held value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: Default> Default for ExclusiveGate<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for ExclusiveGate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The held value is only visible through a key.
        f.debug_struct("ExclusiveGate")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

fn run_key<T, F, E>(value: &mut T, key: F) -> bool
where
    F: FnOnce(&mut T) -> Result<(), E>,
    E: fmt::Display,
{
    match panic::catch_unwind(AssertUnwindSafe(|| key(value))) {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            tracing::debug!(target: targets::GATE, error = %err, "key reported failure");
            false
        }
        Err(payload) => {
            tracing::debug!(
                target: targets::GATE,
                panic = %panic_message(&*payload),
                "key panicked"
            );
            false
        }
    }
}

static_assertions::assert_impl_all!(ExclusiveGate<String>: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    #[test]
    fn test_enter_mutates_in_place() {
        let gate = ExclusiveGate::new(Option::<String>::None);
        assert!(gate.enter(|value| *value = Some("ready".to_string())));
        assert_eq!(gate.into_inner().as_deref(), Some("ready"));
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let gate = Arc::new(ExclusiveGate::new(0u64));
        let threads: Vec<_> = (0..16)
            .map(|_| {
                let gate = gate.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        assert!(gate.enter(|count| *count += 1));
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        let mut total = 0;
        gate.enter(|count| total = *count);
        assert_eq!(total, 16 * 250);
    }

    #[test]
    fn test_panicking_key_reports_false_and_releases() {
        let gate = ExclusiveGate::new(1);
        assert!(!gate.enter(|_| panic!("key failure")));
        assert!(!gate.is_locked());
        assert!(gate.enter(|value| *value += 1));
        assert_eq!(gate.into_inner(), 2);
    }

    #[test]
    fn test_fallible_key() {
        let gate = ExclusiveGate::new(Vec::<u8>::new());
        assert!(gate.enter_with(|bytes| {
            bytes.push(1);
            Ok::<(), String>(())
        }));
        assert!(!gate.enter_with(|_| Err("invalid state")));
        assert_eq!(gate.into_inner(), vec![1]);
    }

    #[test]
    fn test_try_enter_does_not_block_when_held() {
        let gate = Arc::new(ExclusiveGate::new(0));
        let (locked_tx, locked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let holder = {
            let gate = gate.clone();
            std::thread::spawn(move || {
                gate.enter(|_| {
                    locked_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                });
            })
        };

        locked_rx.recv().unwrap();
        let mut ran = false;
        let started = Instant::now();
        assert!(!gate.try_enter(|_| ran = true));
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(!ran);

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert!(gate.try_enter(|value| *value = 5));
    }
}

//! Filepath: src/olock.rs
//!
//! Optimistic lock for tree nodes.
//!
//! [`OLock`] packs a version counter and two state bits into a single
//! `AtomicU64`, following the scheme in Leis et al., "The ART of Practical
//! Synchronization" (DaMoN 2016), appendix A:
//!
//! - bit 0: obsolete (the node has been unlinked; it may never be re-locked)
//! - bit 1: locked (a writer holds exclusive access)
//! - bits 2..: update counter
//!
//! Readers take no lock. They snapshot the version with [`OLock::read_lock`],
//! perform their reads, and revalidate with [`OLock::read_unlock`] or
//! [`OLock::check`]; any version change means the read raced a writer and
//! must be restarted. A writer acquires exclusivity with [`OLock::upgrade`],
//! a compare-and-swap from the exact version it observed, which doubles as
//! the validation of everything read under that version.
//!
//! The zero value is unlocked, live, version 0.
//!
//! # Example
//!
//! ```rust
//! use artree::olock::OLock;
//!
//! let lock = OLock::new();
//! let (version, obsolete) = lock.read_lock();
//! assert!(!obsolete);
//! // ... read the protected node ...
//! assert!(!lock.read_unlock(version, None), "no writer interfered");
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot_core::SpinWait;

const OBSOLETE_BIT: u64 = 0b01;
const LOCKED_BIT: u64 = 0b10;

/// A 64-bit optimistic version lock.
#[derive(Debug, Default)]
pub struct OLock {
    state: AtomicU64,
}

impl OLock {
    /// Create an unlocked, live lock at version 0.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
        }
    }

    /// Wait for any writer to release the lock, then snapshot it.
    ///
    /// Returns the raw counter value and whether the obsolete bit is set.
    /// An obsolete node must be discarded and the operation restarted.
    #[must_use]
    pub fn read_lock(&self) -> (u64, bool) {
        let version = self.wait_unlocked();
        (version, version & OBSOLETE_BIT != 0)
    }

    /// Validate a read snapshot taken with [`read_lock`](Self::read_lock).
    ///
    /// Returns `true` if the counter moved since `version` was taken, in
    /// which case the caller must restart. `also` is a companion write lock
    /// acquired speculatively on top of this read; it is released before
    /// reporting the conflict so the restart begins from a clean slate.
    pub fn read_unlock(&self, version: u64, also: Option<&OLock>) -> bool {
        if self.state.load(Ordering::Acquire) != version {
            if let Some(held) = also {
                held.unlock();
            }
            return true;
        }
        false
    }

    /// Upgrade a read snapshot to an exclusive write lock.
    ///
    /// Succeeds only if the counter still equals `version`, so a successful
    /// upgrade also proves every read made under `version`. Returns `true`
    /// on conflict (caller restarts), releasing `also` if given.
    pub fn upgrade(&self, version: u64, also: Option<&OLock>) -> bool {
        if self
            .state
            .compare_exchange(
                version,
                version + LOCKED_BIT,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_err()
        {
            if let Some(held) = also {
                held.unlock();
            }
            return true;
        }
        false
    }

    /// `true` iff the counter has moved since `version`.
    #[must_use]
    pub fn check(&self, version: u64) -> bool {
        self.state.load(Ordering::Acquire) != version
    }

    /// Block (spin) until the write lock is acquired.
    pub fn lock(&self) {
        loop {
            let (version, obsolete) = self.read_lock();
            if obsolete {
                continue;
            }
            if !self.upgrade(version, None) {
                return;
            }
        }
    }

    /// Release the write lock, advancing the version.
    pub fn unlock(&self) {
        self.state.fetch_add(LOCKED_BIT, Ordering::Release);
    }

    /// Release the write lock, advancing the version and marking the node
    /// obsolete. Terminal: the lock can never be acquired again.
    pub fn unlock_obsolete(&self) {
        self.state
            .fetch_add(LOCKED_BIT | OBSOLETE_BIT, Ordering::Release);
    }

    fn wait_unlocked(&self) -> u64 {
        let mut spin = SpinWait::new();
        loop {
            let version = self.state.load(Ordering::Acquire);
            if version & LOCKED_BIT == 0 {
                return version;
            }
            spin.spin();
        }
    }
}


/// Loom model of the lock's CAS core.
///
/// The production lock spins via `parking_lot_core`, which loom cannot
/// instrument, so the model re-implements the two operations whose
/// interleavings matter: upgrade-from-snapshot and read validation.
///
/// Run with: `RUSTFLAGS="--cfg loom" cargo test --lib olock::loom_tests`
#[cfg(loom)]
mod loom_tests {
    use loom::sync::atomic::{AtomicU64, Ordering};
    use loom::sync::Arc;
    use loom::thread;

    const LOCKED_BIT: u64 = 0b10;

    fn upgrade(state: &AtomicU64, version: u64) -> bool {
        state
            .compare_exchange(
                version,
                version + LOCKED_BIT,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_err()
    }

    #[test]
    fn single_upgrade_wins() {
        loom::model(|| {
            let state = Arc::new(AtomicU64::new(0));
            let version = state.load(Ordering::Acquire);

            let contender = {
                let state = Arc::clone(&state);
                thread::spawn(move || !upgrade(&state, version))
            };
            let won_here = !upgrade(&state, version);
            let won_there = contender.join().unwrap();

            assert!(
                won_here ^ won_there,
                "exactly one writer may upgrade from the same version"
            );
        });
    }

    #[test]
    fn validation_sees_writer() {
        loom::model(|| {
            let state = Arc::new(AtomicU64::new(0));
            let version = state.load(Ordering::Acquire);

            let writer = {
                let state = Arc::clone(&state);
                thread::spawn(move || {
                    if !upgrade(&state, version) {
                        state.fetch_add(LOCKED_BIT, Ordering::Release);
                    }
                })
            };

            // A reader validating after the writer ran must notice.
            writer.join().unwrap();
            assert!(state.load(Ordering::Acquire) != version);
        });
    }
}

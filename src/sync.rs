//! Speculative reader/writer coordination for the volatile index.
//!
//! The tree couples a process-wide reader/writer lock with per-leaf versioned
//! locks. Point operations run as short optimistic transactions: they hold the
//! speculative lock in reader mode, record the target leaf's version, do their
//! reads, and validate the version afterwards. A version change or an
//! observed-held leaf lock aborts the attempt. After a bounded number of
//! aborts the operation escalates to writer mode, which excludes every
//! optimistic attempt and is also where all structural modifications run.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Transactional attempts abort at most this many times before the operation
/// escalates to the writer-mode lock.
pub(crate) const MAX_OPTIMISTIC_RETRIES: usize = 5;

/// Outcome of one optimistic attempt.
pub(crate) enum Transaction<T> {
    /// The attempt validated and produced a result.
    Commit(T),
    /// The attempt observed a conflict and must be retried or escalated.
    Abort,
}

/// Reader/writer lock compatible with the optimistic fast path.
///
/// Readers in optimistic transactions hold the lock in reader mode and commit
/// without further coordination when their leaf-version validation succeeds.
/// Writer mode is exclusive: it drains all optimistic attempts and serializes
/// structural modifications against each other.
pub(crate) struct SpeculativeLock<T> {
    inner: RwLock<T>,
}

impl<T> SpeculativeLock<T> {
    pub(crate) fn new(value: T) -> Self {
        SpeculativeLock {
            inner: RwLock::new(value),
        }
    }

    /// Acquires the lock in reader mode.
    pub(crate) fn shared(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read()
    }

    /// Acquires the lock in writer mode.
    pub(crate) fn exclusive(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.write()
    }
}

/// Runs `attempt` under the lock in reader mode until it commits or the retry
/// budget is exhausted. Returns `None` once the caller should escalate.
pub(crate) fn optimistic<T, R>(
    lock: &SpeculativeLock<T>,
    mut attempt: impl FnMut(&T) -> Transaction<R>,
) -> Option<R> {
    for _ in 0..MAX_OPTIMISTIC_RETRIES {
        {
            let guard = lock.shared();
            if let Transaction::Commit(value) = attempt(&guard) {
                return Some(value);
            }
        }
        std::hint::spin_loop();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::{optimistic, SpeculativeLock, Transaction, MAX_OPTIMISTIC_RETRIES};

    #[test]
    fn optimistic_commits_on_first_clean_attempt() {
        let lock = SpeculativeLock::new(7u64);
        let result = optimistic(&lock, |value| Transaction::Commit(*value * 2));
        assert_eq!(result, Some(14));
    }

    #[test]
    fn optimistic_gives_up_after_budget() {
        let lock = SpeculativeLock::new(());
        let mut attempts = 0;
        let result: Option<()> = optimistic(&lock, |_| {
            attempts += 1;
            Transaction::Abort
        });
        assert_eq!(result, None);
        assert_eq!(attempts, MAX_OPTIMISTIC_RETRIES);
    }

    #[test]
    fn abort_then_commit_retries_in_place() {
        let lock = SpeculativeLock::new(3u64);
        let mut aborted_once = false;
        let result = optimistic(&lock, |value| {
            if !aborted_once {
                aborted_once = true;
                return Transaction::Abort;
            }
            Transaction::Commit(*value)
        });
        assert_eq!(result, Some(3));
    }
}

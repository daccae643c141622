//! Version-stamped atomic snapshot cell
//!
//! Every piece of shared distributer state is an immutable snapshot behind
//! a [`Stamped`] cell. Writers never mutate in place: they read the current
//! snapshot and stamp, compute the next snapshot, and swap it in with
//! [`Stamped::compare_and_set`], retrying on contention. Races surface as
//! failed swaps rather than corruption, and stale updates are rejected by
//! comparing stamps.

use parking_lot::RwLock;
use std::sync::Arc;

pub struct Stamped<T> {
    cell: RwLock<(Arc<T>, i64)>,
}

impl<T> Stamped<T> {
    pub fn new(initial: T) -> Self {
        Self {
            cell: RwLock::new((Arc::new(initial), 0)),
        }
    }

    /// Current snapshot and its stamp
    pub fn get(&self) -> (Arc<T>, i64) {
        let guard = self.cell.read();
        (Arc::clone(&guard.0), guard.1)
    }

    /// Current snapshot, when the stamp is not needed
    pub fn reference(&self) -> Arc<T> {
        Arc::clone(&self.cell.read().0)
    }

    pub fn stamp(&self) -> i64 {
        self.cell.read().1
    }

    /// Swap in `next` with `next_stamp` iff the current stamp is still
    /// `expect_stamp`. Returns whether the swap happened.
    pub fn compare_and_set(&self, expect_stamp: i64, next: T, next_stamp: i64) -> bool {
        let mut guard = self.cell.write();
        if guard.1 != expect_stamp {
            return false;
        }
        *guard = (Arc::new(next), next_stamp);
        true
    }
}

impl<T: Default> Default for Stamped<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

//! Ranked reader-writer locks for entry info blocks.
//!
//! Operations that lock several entries at once (rename, link, copy-up) give
//! every acquisition a [`LockRank`]. Children are locked before parents, and
//! siblings of the same role take increasing sub-ranks in call-site order
//! (source before destination). Each thread tracks the locks it holds and
//! refuses an acquisition whose rank is lower than one already held, or one on
//! a lock it already holds, instead of deadlocking later.

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{DentryError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockRank {
    /// Child first.
    Child,
    /// rename(2), link(2) and copy-up from a notification.
    Child2,
    /// Copying up directories.
    Child3,
    Parent,
    Parent2,
    Parent3,
    /// Scratch block used while replacing an entry's info.
    Temporary,
}

impl LockRank {
    /// Rank to use for the parent of an entry locked at `self`.
    pub fn parent_rank(self) -> LockRank {
        match self {
            LockRank::Child | LockRank::Child2 | LockRank::Child3 => LockRank::Parent,
            LockRank::Parent => LockRank::Parent2,
            LockRank::Parent2 => LockRank::Parent3,
            LockRank::Parent3 | LockRank::Temporary => LockRank::Temporary,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Held {
    addr: usize,
    rank: LockRank,
    write: bool,
}

thread_local! {
    static HELD: RefCell<Vec<Held>> = const { RefCell::new(Vec::new()) };
}

fn check_order(addr: usize, requested: LockRank) -> Result<()> {
    HELD.with(|held| {
        let held = held.borrow();
        if let Some(same) = held.iter().find(|h| h.addr == addr) {
            return Err(DentryError::LockOrderViolation {
                held: same.rank,
                requested,
            });
        }
        match held.iter().map(|h| h.rank).max() {
            Some(top) if requested < top => Err(DentryError::LockOrderViolation {
                held: top,
                requested,
            }),
            _ => Ok(()),
        }
    })
}

fn held_by_current_thread(addr: usize) -> Option<Held> {
    HELD.with(|held| held.borrow().iter().find(|h| h.addr == addr).copied())
}

/// Record of one acquisition on the current thread's stack; popped on drop.
struct RankToken {
    addr: usize,
    rank: LockRank,
}

impl RankToken {
    fn push(addr: usize, rank: LockRank, write: bool) -> Self {
        HELD.with(|held| held.borrow_mut().push(Held { addr, rank, write }));
        Self { addr, rank }
    }

    fn mark_read(&self) {
        HELD.with(|held| {
            if let Some(h) = held.borrow_mut().iter_mut().rev().find(|h| h.addr == self.addr) {
                h.write = false;
            }
        });
    }
}

impl Drop for RankToken {
    fn drop(&mut self) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|h| h.addr == self.addr) {
                held.remove(pos);
            }
        });
    }
}

pub struct RankedRwLock<T> {
    inner: RwLock<T>,
    waiters: AtomicUsize,
}

impl<T> RankedRwLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(value),
            waiters: AtomicUsize::new(0),
        }
    }

    fn addr(&self) -> usize {
        &self.inner as *const RwLock<T> as usize
    }

    pub fn try_read(&self, rank: LockRank) -> Result<RankedReadGuard<'_, T>> {
        check_order(self.addr(), rank)?;
        let guard = match self.inner.try_read() {
            Some(guard) => guard,
            None => {
                self.waiters.fetch_add(1, Ordering::SeqCst);
                let guard = self.inner.read();
                self.waiters.fetch_sub(1, Ordering::SeqCst);
                guard
            }
        };
        Ok(RankedReadGuard {
            guard,
            token: RankToken::push(self.addr(), rank, false),
        })
    }

    pub fn try_write(&self, rank: LockRank) -> Result<RankedWriteGuard<'_, T>> {
        check_order(self.addr(), rank)?;
        let guard = match self.inner.try_write() {
            Some(guard) => guard,
            None => {
                self.waiters.fetch_add(1, Ordering::SeqCst);
                let guard = self.inner.write();
                self.waiters.fetch_sub(1, Ordering::SeqCst);
                guard
            }
        };
        Ok(RankedWriteGuard {
            guard,
            token: RankToken::push(self.addr(), rank, true),
        })
    }

    /// Panics on a rank violation.
    pub fn read(&self, rank: LockRank) -> RankedReadGuard<'_, T> {
        self.try_read(rank).unwrap_or_else(|e| panic!("{}", e))
    }

    /// Panics on a rank violation.
    pub fn write(&self, rank: LockRank) -> RankedWriteGuard<'_, T> {
        self.try_write(rank).unwrap_or_else(|e| panic!("{}", e))
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    pub fn is_locked_exclusive(&self) -> bool {
        self.inner.is_locked_exclusive()
    }

    /// Threads currently blocked acquiring this lock.
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    pub fn assert_any_lock(&self) {
        if held_by_current_thread(self.addr()).is_none() {
            panic!(
                "{}",
                DentryError::LockContract("caller must hold the lock".into())
            );
        }
    }

    pub fn assert_write_lock(&self) {
        if !held_by_current_thread(self.addr()).is_some_and(|h| h.write) {
            panic!(
                "{}",
                DentryError::LockContract("caller must hold the write lock".into())
            );
        }
    }

    pub fn assert_no_waiters(&self) {
        let waiters = self.waiters();
        if waiters != 0 {
            panic!(
                "{}",
                DentryError::LockContract(format!("{} waiter(s) still queued", waiters))
            );
        }
    }

    /// Exclusive access without locking, for a block nobody else can see.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T: Default> Default for RankedRwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

pub struct RankedReadGuard<'a, T> {
    guard: RwLockReadGuard<'a, T>,
    token: RankToken,
}

impl<T> RankedReadGuard<'_, T> {
    pub fn rank(&self) -> LockRank {
        self.token.rank
    }
}

impl<T> Deref for RankedReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

pub struct RankedWriteGuard<'a, T> {
    guard: RwLockWriteGuard<'a, T>,
    token: RankToken,
}

impl<'a, T> RankedWriteGuard<'a, T> {
    pub fn rank(&self) -> LockRank {
        self.token.rank
    }

    /// Turn the write lock into a read lock without letting a writer in between.
    pub fn downgrade(self) -> RankedReadGuard<'a, T> {
        let RankedWriteGuard { guard, token } = self;
        token.mark_read();
        RankedReadGuard {
            guard: RwLockWriteGuard::downgrade(guard),
            token,
        }
    }
}

impl<T> Deref for RankedWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for RankedWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

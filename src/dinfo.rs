use std::sync::atomic::{AtomicU64, Ordering};

use crate::branch::{BranchDriver, BranchTable, Lookup};
use crate::error::Result;
use crate::lock::{LockRank, RankedReadGuard, RankedRwLock, RankedWriteGuard};
use crate::physical::PhysicalEntry;
use crate::slots::SlotArray;

pub type InfoReadGuard<'a> = RankedReadGuard<'a, SlotArray>;
pub type InfoWriteGuard<'a> = RankedWriteGuard<'a, SlotArray>;

/// Per-entry branch mapping and the generation it was built for.
///
/// The stamp is written with `Release` while the write lock is held and read
/// with `Acquire` without any lock, so a reader seeing a fresh stamp also sees
/// the slots written before it.
#[derive(Default)]
pub struct EntryInfo {
    generation: AtomicU64,
    slots: RankedRwLock<SlotArray>,
}

/// What one refresh pass found, before it is published into the slots.
#[derive(Default)]
struct Reconciled {
    found: Vec<(usize, PhysicalEntry)>,
    whiteout: Option<usize>,
    opaque: Option<usize>,
}

impl EntryInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, rank: LockRank) -> InfoReadGuard<'_> {
        self.slots.read(rank)
    }

    pub fn write(&self, rank: LockRank) -> InfoWriteGuard<'_> {
        self.slots.write(rank)
    }

    pub fn try_read(&self, rank: LockRank) -> Result<InfoReadGuard<'_>> {
        self.slots.try_read(rank)
    }

    pub fn try_write(&self, rank: LockRank) -> Result<InfoWriteGuard<'_>> {
        self.slots.try_write(rank)
    }

    pub fn lock(&self) -> &RankedRwLock<SlotArray> {
        &self.slots
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn is_stale(&self, observed: u64) -> bool {
        self.generation() != observed
    }

    /// Taking the guard ties the stamp to the slot contents it describes.
    pub fn stamp(&self, _guard: &InfoWriteGuard<'_>, generation: u64) {
        self.generation.store(generation, Ordering::Release);
    }

    /// Rebuild the slots from the current branch table and stamp them.
    ///
    /// `parent` is the parent entry's slots (read-locked by the caller) and the
    /// generation they were stamped with, or `None` for the root, whose
    /// physical entries are the branch roots. A child built from a stale
    /// parent takes the parent's stamp and so stays stale. On a driver error
    /// the slots and the stamp are left as they were.
    pub fn refresh(
        &self,
        guard: &mut InfoWriteGuard<'_>,
        table: &BranchTable,
        driver: &dyn BranchDriver,
        name: &str,
        parent: Option<(&SlotArray, u64)>,
    ) -> Result<()> {
        let snapshot = table.snapshot();
        let mut out = Reconciled::default();

        let stamp = match parent {
            Some((_, parent_generation)) if parent_generation != snapshot.generation => {
                log::debug!(
                    "parent of {:?} is at generation {}, table at {}",
                    name,
                    parent_generation,
                    snapshot.generation
                );
                parent_generation
            }
            _ => snapshot.generation,
        };
        let parent = parent.map(|(slots, _)| slots);

        // Ranks below an opaque parent are masked.
        let bottom = parent.and_then(SlotArray::opaque);

        for (rank, branch) in snapshot.branches.iter().enumerate() {
            if bottom.is_some_and(|b| rank > b) {
                break;
            }

            let lookup = match parent {
                None => Lookup::Positive(driver.branch_root(branch)?),
                Some(parent) => match parent.get(rank) {
                    Some(h_parent) if h_parent.branch() == branch.id => {
                        driver.branch_lookup(branch, name, h_parent)?
                    }
                    _ => continue,
                },
            };

            match lookup {
                Lookup::Negative => {}
                Lookup::Whiteout => {
                    out.whiteout = Some(rank);
                    break;
                }
                Lookup::Positive(entry) => {
                    // A lower non-directory cannot merge under a directory.
                    if !out.found.is_empty() && !entry.is_dir() {
                        break;
                    }
                    let is_dir = entry.is_dir();
                    let opaque = entry.is_opaque();
                    out.found.push((rank, entry));
                    if !is_dir {
                        break;
                    }
                    if opaque && parent.is_some() {
                        out.opaque = Some(rank);
                        break;
                    }
                }
            }
        }

        guard.grow(snapshot.branches.len())?;
        guard.clear();
        for (rank, entry) in out.found {
            guard.record(rank, Some(entry));
        }
        guard.set_whiteout(out.whiteout);
        guard.set_opaque(out.opaque);
        self.stamp(guard, stamp);

        log::debug!(
            "refreshed {:?} at generation {}: range {:?}, whiteout {:?}, opaque {:?}",
            name,
            stamp,
            guard.populated_range(),
            guard.whiteout(),
            guard.opaque()
        );
        Ok(())
    }

    /// Release every physical reference held by this block.
    ///
    /// Panics if another thread is still queued on the lock.
    pub fn finalize(&self) {
        let mut guard = self.slots.write(LockRank::Temporary);
        self.slots.assert_no_waiters();
        guard.clear();
        self.stamp(&guard, 0);
    }

    /// Reset a block nobody else can reach, keeping its slot capacity.
    pub(crate) fn reset(&mut self) {
        self.slots.get_mut().clear();
        *self.generation.get_mut() = 0;
    }
}

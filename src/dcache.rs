use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};

use crate::branch::{BranchDriver, BranchIndex, BranchTable, NO_BRANCH};
use crate::dinfo::{EntryInfo, InfoReadGuard, InfoWriteGuard};
use crate::error::{DentryError, Result};
use crate::lock::LockRank;
use crate::physical::PhysicalEntry;

pub const ROOT_ID: u64 = 1;

/// Recycled info blocks are capped so a burst of evictions does not pin memory.
const MAX_FREE_INFOS: usize = 64;

pub type DentryHandle = Arc<Dentry>;

#[derive(Default)]
struct InfoPool {
    free: Mutex<Vec<EntryInfo>>,
}

impl InfoPool {
    fn take(&self) -> EntryInfo {
        self.free.lock().pop().unwrap_or_default()
    }

    fn put(&self, mut info: EntryInfo) {
        info.reset();
        let mut free = self.free.lock();
        if free.len() < MAX_FREE_INFOS {
            free.push(info);
        }
    }
}

/// One logical directory entry of the union.
pub struct Dentry {
    id: u64,
    name: String,
    parent: Option<DentryHandle>,
    info: EntryInfo,
    pool: Weak<InfoPool>,
}

impl Dentry {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&DentryHandle> {
        self.parent.as_ref()
    }

    pub fn info(&self) -> &EntryInfo {
        &self.info
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Logical path from the union root.
    pub fn path(&self) -> PathBuf {
        let mut names = Vec::new();
        let mut cur = Some(self);
        while let Some(d) = cur {
            if !d.is_root() {
                names.push(d.name.as_str());
            }
            cur = d.parent.as_deref();
        }
        let mut path = PathBuf::from("/");
        path.extend(names.iter().rev());
        path
    }

    fn ancestors_root_first(self: &Arc<Self>) -> Vec<DentryHandle> {
        let mut chain = vec![self.clone()];
        let mut cur = self.parent.clone();
        while let Some(d) = cur {
            cur = d.parent.clone();
            chain.push(d);
        }
        chain.reverse();
        chain
    }
}

impl Drop for Dentry {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.put(std::mem::take(&mut self.info));
        }
    }
}

/// Locks held across a rename: both entries, then both parents.
///
/// Only one rename per cache holds its locks at a time; the entry guards are
/// released before the cache's rename lock.
pub struct RenameLocks<'a> {
    pub src: InfoWriteGuard<'a>,
    pub dst: InfoWriteGuard<'a>,
    pub src_parent: InfoWriteGuard<'a>,
    /// `None` when both entries share a parent.
    pub dst_parent: Option<InfoWriteGuard<'a>>,
    _serial: MutexGuard<'a, ()>,
}

/// Branch-indexed dentry cache of one union instance.
pub struct DentryCache {
    table: Arc<BranchTable>,
    driver: Arc<dyn BranchDriver>,
    root: DentryHandle,
    children: DashMap<(u64, String), DentryHandle>,
    next_id: AtomicU64,
    pool: Arc<InfoPool>,
    rename_lock: Mutex<()>,
}

fn to_rank(index: BranchIndex) -> Option<usize> {
    usize::try_from(index).ok()
}

/// Write-lock two distinct entries, the smaller id at `low`, and return the
/// guards in argument order.
fn lock_pair<'a>(
    a: &'a DentryHandle,
    b: &'a DentryHandle,
    low: LockRank,
    high: LockRank,
) -> Result<(InfoWriteGuard<'a>, InfoWriteGuard<'a>)> {
    if a.id <= b.id {
        let ga = a.info.try_write(low)?;
        let gb = b.info.try_write(high)?;
        Ok((ga, gb))
    } else {
        let gb = b.info.try_write(low)?;
        let ga = a.info.try_write(high)?;
        Ok((ga, gb))
    }
}

impl DentryCache {
    pub fn new(table: Arc<BranchTable>, driver: Arc<dyn BranchDriver>) -> Self {
        let pool = Arc::new(InfoPool::default());
        let root = Arc::new(Dentry {
            id: ROOT_ID,
            name: String::new(),
            parent: None,
            info: EntryInfo::new(),
            pool: Arc::downgrade(&pool),
        });

        Self {
            table,
            driver,
            root,
            children: DashMap::new(),
            next_id: AtomicU64::new(ROOT_ID + 1),
            pool,
            rename_lock: Mutex::new(()),
        }
    }

    pub fn table(&self) -> &Arc<BranchTable> {
        &self.table
    }

    pub fn root(&self) -> DentryHandle {
        self.root.clone()
    }

    /// Cached entries, the root included.
    pub fn len(&self) -> usize {
        self.children.len() + 1
    }

    /// Instantiate (or find) the logical entry `name` under `parent`.
    ///
    /// The new entry has no slots yet; they are filled by the first refresh.
    pub fn attach(&self, parent: &DentryHandle, name: &str) -> DentryHandle {
        let key = (parent.id, name.to_string());
        if let Some(existing) = self.children.get(&key) {
            return existing.clone();
        }

        self.children
            .entry(key)
            .or_insert_with(|| {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                log::trace!("attach {:?} under {} as {}", name, parent.id, id);
                Arc::new(Dentry {
                    id,
                    name: name.to_string(),
                    parent: Some(parent.clone()),
                    info: self.pool.take(),
                    pool: Arc::downgrade(&self.pool),
                })
            })
            .clone()
    }

    /// Evict an entry and everything cached below it, releasing every
    /// physical reference they hold.
    ///
    /// Negative entries left behind by `resolve` stay cached until the
    /// caller detaches them.
    pub fn detach(&self, dentry: &DentryHandle) {
        let children: Vec<DentryHandle> = self
            .children
            .iter()
            .filter(|e| e.key().0 == dentry.id)
            .map(|e| e.value().clone())
            .collect();
        for child in &children {
            self.detach(child);
        }

        if let Some(parent) = &dentry.parent {
            let key = (parent.id, dentry.name.clone());
            self.children
                .remove_if(&key, |_, d| Arc::ptr_eq(d, dentry));
        }
        dentry.info.finalize();
        log::trace!("detached {:?} ({})", dentry.path(), dentry.id);
    }

    pub fn lookup_physical(
        &self,
        dentry: &DentryHandle,
        index: BranchIndex,
    ) -> Option<PhysicalEntry> {
        let rank = to_rank(index)?;
        dentry.info.read(LockRank::Child).get(rank).cloned()
    }

    /// Store (or clear, with `None`) the physical entry for one branch.
    pub fn record_physical(
        &self,
        dentry: &DentryHandle,
        index: BranchIndex,
        entry: Option<PhysicalEntry>,
    ) -> Result<()> {
        let count = self.table.branch_count();
        let rank = to_rank(index)
            .filter(|&rank| rank < count)
            .ok_or(DentryError::BranchIndex(index))?;
        let mut guard = dentry.info.write(LockRank::Child);
        guard.grow(count)?;
        guard.record(rank, entry);
        Ok(())
    }

    pub fn current_populated_range(
        &self,
        dentry: &DentryHandle,
    ) -> (BranchIndex, BranchIndex) {
        dentry.info.read(LockRank::Child).populated_range()
    }

    pub fn is_stale(&self, dentry: &DentryHandle, generation: u64) -> bool {
        dentry.info.is_stale(generation)
    }

    pub fn find_branch_of(&self, dentry: &DentryHandle, entry: &PhysicalEntry) -> BranchIndex {
        dentry
            .info
            .read(LockRank::Child)
            .find_branch(entry)
            .map_or(NO_BRANCH, |rank| rank as BranchIndex)
    }

    /// Rebuild one entry's slots against the current branch table, bringing
    /// its ancestors up to date first.
    pub fn refresh(&self, dentry: &DentryHandle) -> Result<()> {
        if let Some(parent) = &dentry.parent {
            self.revalidate(parent)?;
        }
        let mut guard = dentry.info.write(LockRank::Child);
        self.refresh_locked(dentry, &mut guard, LockRank::Parent)
    }

    fn refresh_locked(
        &self,
        dentry: &DentryHandle,
        guard: &mut InfoWriteGuard<'_>,
        parent_rank: LockRank,
    ) -> Result<()> {
        let parent_guard = dentry.parent.as_ref().map(|p| p.info.read(parent_rank));
        let parent = dentry
            .parent
            .as_ref()
            .zip(parent_guard.as_deref())
            .map(|(p, slots)| (slots, p.info.generation()));
        dentry.info.refresh(
            guard,
            &self.table,
            self.driver.as_ref(),
            &dentry.name,
            parent,
        )?;

        if !guard.check_range_consistency() {
            panic!("{}", guard.inconsistency());
        }
        Ok(())
    }

    fn refresh_if_stale(&self, dentry: &DentryHandle, rank: LockRank) -> Result<()> {
        if !dentry.info.is_stale(self.table.generation()) {
            return Ok(());
        }
        let mut guard = dentry.info.write(rank);
        // Someone may have refreshed it while we waited.
        if dentry.info.is_stale(self.table.generation()) {
            self.refresh_locked(dentry, &mut guard, rank.parent_rank())?;
        }
        Ok(())
    }

    /// Bring an entry and all its ancestors up to the current generation,
    /// root first. Each step holds only the child and its parent.
    pub fn revalidate(&self, dentry: &DentryHandle) -> Result<()> {
        self.revalidate_at(dentry, LockRank::Child)
    }

    /// `revalidate` with each step's child locked at `rank` and its parent at
    /// `rank.parent_rank()`, for callers already holding lower-ranked locks.
    pub fn revalidate_at(&self, dentry: &DentryHandle, rank: LockRank) -> Result<()> {
        for d in dentry.ancestors_root_first() {
            self.refresh_if_stale(&d, rank)?;
        }
        Ok(())
    }

    /// Read-lock an entry whose slots matched the current generation when the
    /// lock was taken. Retries while branch changes keep overtaking it.
    ///
    /// Stale ancestors are refreshed at `rank` too, so a caller may already
    /// hold locks ranked below it.
    pub fn read_fresh<'a>(
        &self,
        dentry: &'a DentryHandle,
        rank: LockRank,
    ) -> Result<InfoReadGuard<'a>> {
        loop {
            if let Some(parent) = &dentry.parent {
                self.revalidate_at(parent, rank)?;
            }

            let generation = self.table.generation();
            if !dentry.info.is_stale(generation) {
                let guard = dentry.info.read(rank);
                if !dentry.info.is_stale(generation) {
                    return Ok(guard);
                }
                continue;
            }

            let mut guard = dentry.info.write(rank);
            if dentry.info.is_stale(self.table.generation()) {
                self.refresh_locked(dentry, &mut guard, rank.parent_rank())?;
            }
            if !dentry.info.is_stale(self.table.generation()) {
                return Ok(guard.downgrade());
            }
            log::trace!("{:?} overtaken by a branch change, retrying", dentry.name);
        }
    }

    /// Attach `name` under `parent` and make sure its slots are current.
    pub fn lookup(&self, parent: &DentryHandle, name: &str) -> Result<DentryHandle> {
        self.revalidate(parent)?;
        let dentry = self.attach(parent, name);
        self.refresh_if_stale(&dentry, LockRank::Child)?;
        Ok(dentry)
    }

    /// Walk an absolute logical path from the root.
    ///
    /// Returns the entry even when no branch holds it; check its populated
    /// range to tell positive from negative.
    pub fn resolve(&self, path: &str) -> Result<DentryHandle> {
        let mut cur = self.root();
        self.revalidate(&cur)?;
        for name in path.split('/') {
            match name {
                "" | "." => {}
                ".." => {
                    if let Some(parent) = cur.parent.clone() {
                        cur = parent;
                    }
                }
                _ => {
                    if cur.info.read(LockRank::Child).populated_range().0 == NO_BRANCH {
                        return Err(DentryError::Io(std::io::Error::from(
                            std::io::ErrorKind::NotFound,
                        )));
                    }
                    cur = self.lookup(&cur, name)?;
                }
            }
        }
        Ok(cur)
    }

    /// Lock the four entries of a rename in rank order.
    ///
    /// Within each pair the entry with the smaller id takes the lower rank,
    /// so `rename(a, b)` and `rename(b, a)` lock in the same order.
    pub fn lock_for_rename<'a>(
        &'a self,
        src: &'a DentryHandle,
        dst: &'a DentryHandle,
    ) -> Result<RenameLocks<'a>> {
        let (Some(src_dir), Some(dst_dir)) = (&src.parent, &dst.parent) else {
            return Err(DentryError::Invalid("cannot rename the root".into()));
        };
        if Arc::ptr_eq(src, dst)
            || Arc::ptr_eq(src_dir, dst)
            || Arc::ptr_eq(dst_dir, src)
        {
            return Err(DentryError::Invalid(
                "rename source and target overlap".into(),
            ));
        }

        let serial = self.rename_lock.lock();

        let (src_guard, dst_guard) =
            lock_pair(src, dst, LockRank::Child, LockRank::Child2)?;
        let (src_parent, dst_parent) = if Arc::ptr_eq(src_dir, dst_dir) {
            (src_dir.info.try_write(LockRank::Parent)?, None)
        } else {
            let (s, d) = lock_pair(src_dir, dst_dir, LockRank::Parent, LockRank::Parent2)?;
            (s, Some(d))
        };

        Ok(RenameLocks {
            src: src_guard,
            dst: dst_guard,
            src_parent,
            dst_parent,
            _serial: serial,
        })
    }
}

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{DentryError, Result};
use crate::physical::PhysicalEntry;

/// Position of a branch in the current table. `NO_BRANCH` means "none".
pub type BranchIndex = i32;

pub const NO_BRANCH: BranchIndex = -1;

/// Stable identity of a branch. Never reused within one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchId(pub u64);

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchPerm {
    Rw,
    #[default]
    Ro,
}

#[derive(Debug, Clone)]
pub struct Branch {
    pub id: BranchId,
    pub root: PathBuf,
    pub perm: BranchPerm,
}

/// Result of asking one branch for a name.
#[derive(Debug, Clone)]
pub enum Lookup {
    /// Nothing by that name in this branch.
    Negative,
    /// The name is whited out in this branch.
    Whiteout,
    Positive(PhysicalEntry),
}

/// Per-branch storage driver, consulted only while refreshing an entry.
pub trait BranchDriver: Send + Sync {
    fn branch_root(&self, branch: &Branch) -> Result<PhysicalEntry>;

    fn branch_lookup(&self, branch: &Branch, name: &str, parent: &PhysicalEntry)
        -> Result<Lookup>;
}

/// Consistent view of the table at one generation.
#[derive(Debug, Clone)]
pub struct BranchSnapshot {
    pub branches: Vec<Branch>,
    pub generation: u64,
}

fn validate_branch_root(root: &Path, existing: &[Branch]) -> Result<()> {
    if root.as_os_str().is_empty() {
        return Err(DentryError::Invalid("branch root cannot be empty".into()));
    }
    if existing.iter().any(|b| b.root == root) {
        return Err(DentryError::Invalid(format!(
            "branch root {:?} is already in the union",
            root
        )));
    }
    Ok(())
}

/// Ordered branch table of one union instance.
///
/// Every mutation bumps the global generation while the table's write lock is
/// held, so a snapshot always pairs a branch list with the generation it was
/// published under.
pub struct BranchTable {
    branches: RwLock<Vec<Branch>>,
    next_id: AtomicU64,
    generation: AtomicU64,
}

impl BranchTable {
    pub fn new() -> Self {
        Self {
            branches: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    pub fn add_branch(&self, root: impl Into<PathBuf>, perm: BranchPerm) -> Result<BranchId> {
        let mut branches = self.branches.write();
        let index = branches.len();
        self.insert_locked(&mut branches, index, root.into(), perm)
    }

    /// Insert a branch at `index`, shifting lower branches down by one rank.
    pub fn insert_branch(
        &self,
        index: usize,
        root: impl Into<PathBuf>,
        perm: BranchPerm,
    ) -> Result<BranchId> {
        let mut branches = self.branches.write();
        self.insert_locked(&mut branches, index, root.into(), perm)
    }

    fn insert_locked(
        &self,
        branches: &mut Vec<Branch>,
        index: usize,
        root: PathBuf,
        perm: BranchPerm,
    ) -> Result<BranchId> {
        validate_branch_root(&root, branches)?;
        if index > branches.len() {
            return Err(DentryError::BranchIndex(index as BranchIndex));
        }

        let id = BranchId(self.next_id.fetch_add(1, Ordering::SeqCst));
        log::info!("Adding branch {} at rank {} ({:?}, {:?})", id, index, root, perm);
        branches.insert(index, Branch { id, root, perm });
        self.bump_generation();

        Ok(id)
    }

    pub fn remove_branch(&self, id: BranchId) -> Result<Branch> {
        let mut branches = self.branches.write();
        let index = branches
            .iter()
            .position(|b| b.id == id)
            .ok_or(DentryError::BranchNotFound(id))?;

        let branch = branches.remove(index);
        log::info!("Removed branch {} from rank {}", id, index);
        self.bump_generation();

        Ok(branch)
    }

    /// Move a branch to a new rank.
    pub fn move_branch(&self, id: BranchId, new_index: usize) -> Result<()> {
        let mut branches = self.branches.write();
        let index = branches
            .iter()
            .position(|b| b.id == id)
            .ok_or(DentryError::BranchNotFound(id))?;
        if new_index >= branches.len() {
            return Err(DentryError::BranchIndex(new_index as BranchIndex));
        }

        let branch = branches.remove(index);
        branches.insert(new_index, branch);
        log::info!("Moved branch {} from rank {} to {}", id, index, new_index);
        self.bump_generation();

        Ok(())
    }

    // Callers hold the write lock on `branches`.
    fn bump_generation(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        log::debug!("Branch table generation is now {}", generation);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn branch_count(&self) -> usize {
        self.branches.read().len()
    }

    pub fn index_of(&self, id: BranchId) -> Option<usize> {
        self.branches.read().iter().position(|b| b.id == id)
    }

    pub fn get(&self, index: usize) -> Option<Branch> {
        self.branches.read().get(index).cloned()
    }

    pub fn snapshot(&self) -> BranchSnapshot {
        let branches = self.branches.read();
        BranchSnapshot {
            branches: branches.clone(),
            generation: self.generation(),
        }
    }

    pub fn list_branches(&self) -> Vec<(BranchId, PathBuf, BranchPerm)> {
        self.branches
            .read()
            .iter()
            .map(|b| (b.id, b.root.clone(), b.perm))
            .collect()
    }
}

impl Default for BranchTable {
    fn default() -> Self {
        Self::new()
    }
}

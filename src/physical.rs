use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::branch::BranchId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
}

#[derive(Debug)]
struct PhysicalInner {
    branch: BranchId,
    path: PathBuf,
    kind: EntryKind,
    opaque: bool,
}

impl Drop for PhysicalInner {
    fn drop(&mut self) {
        log::trace!("released physical entry {:?} on {}", self.path, self.branch);
    }
}

/// Owned handle to an entry living in one branch.
///
/// Cloning hands out another reference to the same physical entry; two handles
/// are the same entry only when [`PhysicalEntry::same`] says so, regardless of
/// path equality.
#[derive(Clone)]
pub struct PhysicalEntry(Arc<PhysicalInner>);

impl PhysicalEntry {
    pub fn new(branch: BranchId, path: impl Into<PathBuf>, kind: EntryKind) -> Self {
        Self(Arc::new(PhysicalInner {
            branch,
            path: path.into(),
            kind,
            opaque: false,
        }))
    }

    /// A directory carrying an opaque marker.
    pub fn opaque_dir(branch: BranchId, path: impl Into<PathBuf>) -> Self {
        Self(Arc::new(PhysicalInner {
            branch,
            path: path.into(),
            kind: EntryKind::Directory,
            opaque: true,
        }))
    }

    pub fn branch(&self) -> BranchId {
        self.0.branch
    }

    pub fn path(&self) -> &Path {
        &self.0.path
    }

    pub fn kind(&self) -> EntryKind {
        self.0.kind
    }

    pub fn is_dir(&self) -> bool {
        self.0.kind == EntryKind::Directory
    }

    pub fn is_opaque(&self) -> bool {
        self.0.opaque
    }

    pub fn same(&self, other: &PhysicalEntry) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Number of live handles to this physical entry.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl fmt::Debug for PhysicalEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}", self.0.branch, self.0.path)
    }
}

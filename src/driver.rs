use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::branch::{Branch, BranchDriver, BranchId, Lookup};
use crate::error::{DentryError, Result};
use crate::physical::{EntryKind, PhysicalEntry};

pub const WHITEOUT_PREFIX: &str = ".wh.";
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// Whether a marker file exists at `path`. Only a missing file counts as
/// absent; any other failure is returned.
fn marker_present(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(DentryError::Invalid(format!("'{}' is not an entry name", name)));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(DentryError::Invalid(
            "entry name cannot contain '/' or null bytes".into(),
        ));
    }
    if name.starts_with(WHITEOUT_PREFIX) {
        return Err(DentryError::Invalid(format!(
            "'{}' uses the reserved whiteout prefix",
            name
        )));
    }
    Ok(())
}

/// Branches backed by plain directories.
///
/// A file named `.wh.<name>` next to `<name>` whites it out for lower
/// branches; a directory containing `.wh..wh..opq` hides the same directory
/// in lower branches.
#[derive(Debug, Default)]
pub struct DirDriver;

impl DirDriver {
    pub fn new() -> Self {
        Self
    }

    fn entry_for(branch: &Branch, path: PathBuf) -> Result<Lookup> {
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Lookup::Negative),
            Err(e) => return Err(e.into()),
        };

        let entry = if meta.is_dir() {
            if marker_present(&path.join(OPAQUE_MARKER))? {
                PhysicalEntry::opaque_dir(branch.id, path)
            } else {
                PhysicalEntry::new(branch.id, path, EntryKind::Directory)
            }
        } else if meta.file_type().is_symlink() {
            PhysicalEntry::new(branch.id, path, EntryKind::Symlink)
        } else {
            PhysicalEntry::new(branch.id, path, EntryKind::File)
        };
        Ok(Lookup::Positive(entry))
    }
}

impl BranchDriver for DirDriver {
    fn branch_root(&self, branch: &Branch) -> Result<PhysicalEntry> {
        if !branch.root.is_dir() {
            return Err(DentryError::Invalid(format!(
                "branch root {:?} is not a directory",
                branch.root
            )));
        }
        Ok(PhysicalEntry::new(
            branch.id,
            branch.root.clone(),
            EntryKind::Directory,
        ))
    }

    fn branch_lookup(
        &self,
        branch: &Branch,
        name: &str,
        parent: &PhysicalEntry,
    ) -> Result<Lookup> {
        validate_name(name)?;
        if !parent.is_dir() {
            return Ok(Lookup::Negative);
        }

        let whiteout = parent.path().join(format!("{}{}", WHITEOUT_PREFIX, name));
        if marker_present(&whiteout)? {
            log::trace!("whiteout for {:?} in {}", name, branch.id);
            return Ok(Lookup::Whiteout);
        }

        Self::entry_for(branch, parent.path().join(name))
    }
}

#[derive(Debug, Clone, Copy)]
enum MemNode {
    Entry(EntryKind),
    OpaqueDir,
    Whiteout,
}

/// In-memory branches, for tests and for callers that synthesize entries.
///
/// Paths are absolute within each branch; every branch root is `/`.
#[derive(Debug, Default)]
pub struct MemDriver {
    nodes: Mutex<HashMap<(BranchId, PathBuf), MemNode>>,
}

impl MemDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, branch: BranchId, path: impl AsRef<Path>, kind: EntryKind) {
        self.insert(branch, path, MemNode::Entry(kind));
    }

    pub fn add_opaque_dir(&self, branch: BranchId, path: impl AsRef<Path>) {
        self.insert(branch, path, MemNode::OpaqueDir);
    }

    pub fn add_whiteout(&self, branch: BranchId, path: impl AsRef<Path>) {
        self.insert(branch, path, MemNode::Whiteout);
    }

    pub fn remove(&self, branch: BranchId, path: impl AsRef<Path>) {
        self.nodes
            .lock()
            .remove(&(branch, path.as_ref().to_path_buf()));
    }

    fn insert(&self, branch: BranchId, path: impl AsRef<Path>, node: MemNode) {
        self.nodes
            .lock()
            .insert((branch, path.as_ref().to_path_buf()), node);
    }
}

impl BranchDriver for MemDriver {
    fn branch_root(&self, branch: &Branch) -> Result<PhysicalEntry> {
        Ok(PhysicalEntry::new(branch.id, "/", EntryKind::Directory))
    }

    fn branch_lookup(
        &self,
        branch: &Branch,
        name: &str,
        parent: &PhysicalEntry,
    ) -> Result<Lookup> {
        validate_name(name)?;
        let path = parent.path().join(name);
        let node = self.nodes.lock().get(&(branch.id, path.clone())).copied();

        Ok(match node {
            None => Lookup::Negative,
            Some(MemNode::Whiteout) => Lookup::Whiteout,
            Some(MemNode::OpaqueDir) => Lookup::Positive(PhysicalEntry::opaque_dir(branch.id, path)),
            Some(MemNode::Entry(kind)) => Lookup::Positive(PhysicalEntry::new(branch.id, path, kind)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::BranchPerm;

    fn branch(id: u64, root: &Path) -> Branch {
        Branch {
            id: BranchId(id),
            root: root.to_path_buf(),
            perm: BranchPerm::Rw,
        }
    }

    #[test]
    fn dir_driver_reports_entries_whiteouts_and_opaque_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let b = branch(0, tmp.path());
        fs::write(tmp.path().join("file"), b"x").unwrap();
        fs::create_dir(tmp.path().join("plain")).unwrap();
        fs::create_dir(tmp.path().join("masked")).unwrap();
        fs::write(tmp.path().join("masked").join(OPAQUE_MARKER), b"").unwrap();
        fs::write(tmp.path().join(".wh.gone"), b"").unwrap();

        let driver = DirDriver::new();
        let root = driver.branch_root(&b).unwrap();

        match driver.branch_lookup(&b, "file", &root).unwrap() {
            Lookup::Positive(e) => assert_eq!(e.kind(), EntryKind::File),
            other => panic!("unexpected {:?}", other),
        }
        match driver.branch_lookup(&b, "plain", &root).unwrap() {
            Lookup::Positive(e) => assert!(e.is_dir() && !e.is_opaque()),
            other => panic!("unexpected {:?}", other),
        }
        match driver.branch_lookup(&b, "masked", &root).unwrap() {
            Lookup::Positive(e) => assert!(e.is_opaque()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            driver.branch_lookup(&b, "gone", &root).unwrap(),
            Lookup::Whiteout
        ));
        assert!(matches!(
            driver.branch_lookup(&b, "missing", &root).unwrap(),
            Lookup::Negative
        ));
    }

    #[test]
    fn marker_checks_only_treat_missing_files_as_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("file");
        fs::write(&file, b"x").unwrap();

        assert!(!marker_present(&tmp.path().join(OPAQUE_MARKER)).unwrap());
        assert!(marker_present(&file).unwrap());
        // ENOTDIR is a real failure, not a missing marker.
        assert!(matches!(
            marker_present(&file.join(OPAQUE_MARKER)),
            Err(DentryError::Io(_))
        ));

        let b = branch(0, tmp.path());
        let bogus_dir = PhysicalEntry::new(b.id, file, EntryKind::Directory);
        assert!(matches!(
            DirDriver::new().branch_lookup(&b, "x", &bogus_dir),
            Err(DentryError::Io(_))
        ));
    }

    #[test]
    fn reserved_and_malformed_names_are_rejected() {
        let driver = MemDriver::new();
        let b = branch(0, Path::new("/"));
        let root = driver.branch_root(&b).unwrap();
        for name in ["", "..", "a/b", ".wh.x"] {
            assert!(matches!(
                driver.branch_lookup(&b, name, &root),
                Err(DentryError::Invalid(_))
            ));
        }
    }

    #[test]
    fn dir_driver_rejects_missing_root() {
        let tmp = tempfile::tempdir().unwrap();
        let b = branch(0, &tmp.path().join("nope"));
        assert!(DirDriver::new().branch_root(&b).is_err());
    }

    #[test]
    fn mem_driver_lookup_follows_parent_path() {
        let driver = MemDriver::new();
        let b = branch(3, Path::new("/"));
        driver.add(BranchId(3), "/d", EntryKind::Directory);
        driver.add(BranchId(3), "/d/f", EntryKind::File);

        let root = driver.branch_root(&b).unwrap();
        let Lookup::Positive(d) = driver.branch_lookup(&b, "d", &root).unwrap() else {
            panic!("d missing");
        };
        let Lookup::Positive(f) = driver.branch_lookup(&b, "f", &d).unwrap() else {
            panic!("f missing");
        };
        assert_eq!(f.path(), Path::new("/d/f"));
        assert_eq!(f.branch(), BranchId(3));

        driver.remove(BranchId(3), "/d/f");
        assert!(matches!(
            driver.branch_lookup(&b, "f", &d).unwrap(),
            Lookup::Negative
        ));
    }
}

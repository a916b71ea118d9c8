pub mod branch;
pub mod config;
pub mod dcache;
pub mod dinfo;
pub mod driver;
pub mod error;
pub mod lock;
pub mod physical;
pub mod slots;

pub use branch::{
    Branch, BranchDriver, BranchId, BranchIndex, BranchPerm, BranchTable, Lookup, NO_BRANCH,
};
pub use config::UnionConfig;
pub use dcache::{Dentry, DentryCache, DentryHandle};
pub use dinfo::EntryInfo;
pub use driver::{DirDriver, MemDriver};
pub use error::{DentryError, Result};
pub use lock::LockRank;
pub use physical::{EntryKind, PhysicalEntry};

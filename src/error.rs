use thiserror::Error;

use crate::branch::BranchId;
use crate::lock::LockRank;

#[derive(Error, Debug)]
pub enum DentryError {
    #[error("out of memory growing slot array to {requested} slots")]
    OutOfMemory { requested: usize },

    #[error("lock order violation: acquiring {requested:?} while holding {held:?}")]
    LockOrderViolation { held: LockRank, requested: LockRank },

    #[error("inconsistent populated range ({lowest}, {highest}) for {count} slots")]
    InconsistentRange {
        lowest: i32,
        highest: i32,
        count: usize,
    },

    #[error("lock contract violated: {0}")]
    LockContract(String),

    #[error("branch not found: {0}")]
    BranchNotFound(BranchId),

    #[error("branch index out of range: {0}")]
    BranchIndex(i32),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DentryError>;

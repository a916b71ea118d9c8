use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::branch::{BranchPerm, BranchTable};
use crate::error::{DentryError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub perm: BranchPerm,
}

/// Branch list of a union, topmost branch first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnionConfig {
    pub branches: Vec<BranchConfig>,
}

impl UnionConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn push(&mut self, path: PathBuf, perm: BranchPerm) {
        self.branches.push(BranchConfig { path, perm });
    }

    pub fn build_table(&self) -> Result<BranchTable> {
        if self.branches.is_empty() {
            return Err(DentryError::Invalid("a union needs at least one branch".into()));
        }
        let table = BranchTable::new();
        for branch in &self.branches {
            table.add_branch(branch.path.clone(), branch.perm)?;
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_branch_list_with_default_perm() {
        let config = UnionConfig::from_json(
            r#"{"branches": [{"path": "/upper", "perm": "rw"}, {"path": "/lower"}]}"#,
        )
        .unwrap();
        assert_eq!(config.branches[0].perm, BranchPerm::Rw);
        assert_eq!(config.branches[1].perm, BranchPerm::Ro);

        let table = config.build_table().unwrap();
        assert_eq!(table.branch_count(), 2);
        assert_eq!(table.get(1).unwrap().root, PathBuf::from("/lower"));
    }

    #[test]
    fn round_trips_through_a_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = UnionConfig::default();
        config.push("/a".into(), BranchPerm::Rw);
        config.push("/b".into(), BranchPerm::Ro);

        let path = tmp.path().join("union.json");
        fs::write(&path, config.to_json().unwrap()).unwrap();
        assert_eq!(UnionConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn rejects_empty_and_malformed_configs() {
        assert!(matches!(
            UnionConfig::default().build_table(),
            Err(DentryError::Invalid(_))
        ));
        assert!(matches!(
            UnionConfig::from_json("{\"branches\": 3}"),
            Err(DentryError::Json(_))
        ));
    }
}

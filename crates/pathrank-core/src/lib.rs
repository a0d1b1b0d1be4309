use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod graph_key;

pub use graph_key::{DerivedGraphKey, GENERATION_SEPARATOR, GraphKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(pub i64);

impl BuildId {
    pub fn get(self) -> i64 {
        self.0
    }

    pub fn validate(self) -> Result<(), ValidationError> {
        if self.0 <= 0 {
            return Err(ValidationError::InvalidBuildId(self.0));
        }
        Ok(())
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("graph key must not be empty")]
    EmptyGraphKey,
    #[error("graph key '{0}' must not contain '-' or whitespace")]
    InvalidGraphKey(String),
    #[error("derived graph key '{0}' must look like <base>-<generation>")]
    InvalidDerivedGraphKey(String),
    #[error("build id must be positive, got {0}")]
    InvalidBuildId(i64),
    #[error("definition #{index} has an empty {field}")]
    EmptyDefinitionField { index: usize, field: &'static str },
    #[error("symbol name #{index} of the reference set is empty")]
    EmptySymbolName { index: usize },
}

/// A fact that `symbol_name` is declared at `document_path` in `repository`,
/// as observed by one build. Duplicates are expected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    pub build_id: BuildId,
    pub symbol_name: String,
    pub repository: String,
    pub document_path: String,
}

impl Definition {
    pub fn validate(&self, index: usize) -> Result<(), ValidationError> {
        self.build_id.validate()?;

        for (field, value) in [
            ("symbol_name", &self.symbol_name),
            ("repository", &self.repository),
            ("document_path", &self.document_path),
        ] {
            if value.trim().is_empty() {
                return Err(ValidationError::EmptyDefinitionField { index, field });
            }
        }

        Ok(())
    }
}

/// The ordered symbol names one build mentions, awaiting resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSet {
    pub build_id: BuildId,
    pub symbol_names: Vec<String>,
}

impl ReferenceSet {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.build_id.validate()?;

        if let Some(index) = self
            .symbol_names
            .iter()
            .position(|name| name.trim().is_empty())
        {
            return Err(ValidationError::EmptySymbolName { index });
        }

        Ok(())
    }
}

/// Builds of the same project index the same code; only the freshest one counts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectKey {
    pub repository_id: i64,
    pub root: String,
    pub indexer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub id: BuildId,
    pub repository_id: i64,
    pub root: String,
    pub indexer: String,
    /// Unix seconds. Unfinished builds order before any finished one.
    pub finished_at: Option<i64>,
}

impl BuildInfo {
    pub fn project(&self) -> ProjectKey {
        ProjectKey {
            repository_id: self.repository_id,
            root: self.root.clone(),
            indexer: self.indexer.clone(),
        }
    }

    /// Total order used for freshest-build selection. Ties on finish time go
    /// to the higher build id.
    pub fn freshness(&self) -> (Option<i64>, BuildId) {
        (self.finished_at, self.id)
    }
}

pub fn freshest_build<'a>(
    builds: impl IntoIterator<Item = &'a BuildInfo>,
) -> Option<&'a BuildInfo> {
    builds.into_iter().max_by_key(|build| build.freshness())
}

/// Summed occurrence count of one document path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PathCount {
    pub repository: String,
    pub document_path: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankRecord {
    pub repository_id: i64,
    pub document_path: String,
    pub graph_key: DerivedGraphKey,
    pub reference_count: i64,
    pub rank: f64,
}

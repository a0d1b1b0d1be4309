use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use pathrank_core::{BuildId, BuildInfo};
use rusqlite::{Connection, OptionalExtension, Transaction, params};

use crate::StoreError;

/// Build metadata used to group builds into projects.
pub trait BuildRegistry: Send + Sync {
    /// Metadata for every id the registry knows; unknown ids are absent.
    fn builds(&self, ids: &[BuildId]) -> Result<HashMap<BuildId, BuildInfo>, StoreError>;
}

/// Which builds are currently visible at a tracked branch tip.
///
/// Build ids are unique across repositories, so a build id alone names the
/// repository it belongs to; visibility rows are still recorded per
/// `(repository, build)` and the catalog refuses rows that contradict the
/// build's registered repository.
pub trait VisibilityIndex: Send + Sync {
    fn visible_builds(&self, ids: &[BuildId]) -> Result<HashSet<BuildId>, StoreError>;
}

/// Maps the repository names carried by definitions to repository ids.
pub trait RepositoryResolver: Send + Sync {
    fn repository_id(&self, name: &str) -> Result<Option<i64>, StoreError>;
}

/// Catalog tables living next to the ranking tables. Each call opens its own
/// connection, so lookups never interfere with an open ranking transaction.
#[derive(Debug, Clone)]
pub struct SqliteCatalog {
    sqlite_path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteCatalog {
    pub(crate) fn new(sqlite_path: PathBuf, busy_timeout: Duration) -> Self {
        Self {
            sqlite_path,
            busy_timeout,
        }
    }

    pub fn upsert_repository(&self, id: i64, name: &str) -> Result<(), StoreError> {
        let conn = self.connection()?;
        conn.execute(
            r#"
            INSERT INTO ranking_repositories (id, name)
            VALUES (?1, ?2)
            ON CONFLICT(id) DO UPDATE SET name = excluded.name
            "#,
            params![id, name],
        )?;
        Ok(())
    }

    pub fn upsert_build(&self, build: &BuildInfo) -> Result<(), StoreError> {
        build.id.validate()?;

        let conn = self.connection()?;
        conn.execute(
            r#"
            INSERT INTO ranking_builds (id, repository_id, root, indexer, finished_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                repository_id = excluded.repository_id,
                root = excluded.root,
                indexer = excluded.indexer,
                finished_at = excluded.finished_at
            "#,
            params![
                build.id.get(),
                build.repository_id,
                build.root,
                build.indexer,
                build.finished_at,
            ],
        )?;
        Ok(())
    }

    /// Adds `build_ids` to the builds visible at a tip of `repository_id`.
    pub fn mark_visible_at_tip(
        &self,
        repository_id: i64,
        build_ids: &[BuildId],
        is_default_branch: bool,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        insert_visible(&tx, repository_id, build_ids, is_default_branch)?;
        tx.commit()?;
        Ok(())
    }

    /// Swaps the visible set of `repository_id` for `build_ids` in one
    /// transaction; returns the number of rows that were replaced.
    pub fn replace_visible_at_tip(
        &self,
        repository_id: i64,
        build_ids: &[BuildId],
        is_default_branch: bool,
    ) -> Result<usize, StoreError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let replaced = tx.execute(
            "DELETE FROM ranking_visible_at_tip WHERE repository_id = ?1",
            params![repository_id],
        )?;
        insert_visible(&tx, repository_id, build_ids, is_default_branch)?;
        tx.commit()?;
        Ok(replaced)
    }

    fn connection(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.sqlite_path)?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }
}

fn insert_visible(
    tx: &Transaction<'_>,
    repository_id: i64,
    build_ids: &[BuildId],
    is_default_branch: bool,
) -> Result<(), StoreError> {
    let mut registered =
        tx.prepare_cached("SELECT repository_id FROM ranking_builds WHERE id = ?1")?;
    let mut insert = tx.prepare_cached(
        r#"
        INSERT INTO ranking_visible_at_tip (repository_id, build_id, is_default_branch)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(repository_id, build_id) DO UPDATE SET
            is_default_branch = excluded.is_default_branch
        "#,
    )?;

    for build_id in build_ids {
        let owner: Option<i64> = registered
            .query_row(params![build_id.get()], |row| row.get(0))
            .optional()?;
        if let Some(owner) = owner.filter(|owner| *owner != repository_id) {
            return Err(StoreError::Collaborator(format!(
                "build {build_id} belongs to repository {owner}, not {repository_id}"
            )));
        }
        insert.execute(params![repository_id, build_id.get(), is_default_branch])?;
    }

    Ok(())
}

impl BuildRegistry for SqliteCatalog {
    fn builds(&self, ids: &[BuildId]) -> Result<HashMap<BuildId, BuildInfo>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT id, repository_id, root, indexer, finished_at
            FROM ranking_builds
            WHERE id = ?1
            "#,
        )?;

        let mut builds = HashMap::with_capacity(ids.len());
        for id in ids {
            let build = stmt
                .query_row(params![id.get()], |row| {
                    Ok(BuildInfo {
                        id: BuildId(row.get(0)?),
                        repository_id: row.get(1)?,
                        root: row.get(2)?,
                        indexer: row.get(3)?,
                        finished_at: row.get(4)?,
                    })
                })
                .optional()?;
            if let Some(build) = build {
                builds.insert(*id, build);
            }
        }

        Ok(builds)
    }
}

impl VisibilityIndex for SqliteCatalog {
    fn visible_builds(&self, ids: &[BuildId]) -> Result<HashSet<BuildId>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare_cached(
            "SELECT EXISTS (SELECT 1 FROM ranking_visible_at_tip WHERE build_id = ?1)",
        )?;

        let mut visible = HashSet::new();
        for id in ids {
            let exists: bool = stmt.query_row(params![id.get()], |row| row.get(0))?;
            if exists {
                visible.insert(*id);
            }
        }

        Ok(visible)
    }
}

impl RepositoryResolver for SqliteCatalog {
    fn repository_id(&self, name: &str) -> Result<Option<i64>, StoreError> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT id FROM ranking_repositories WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }
}

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use pathrank_config::{PATHRANK_DIR_NAME, PathrankConfig};
use pathrank_core::{
    BuildId, Definition, DerivedGraphKey, GraphKey, PathCount, RankRecord, ReferenceSet,
    ValidationError,
};
use rusqlite::{Connection, ErrorCode, params};
use thiserror::Error;

mod aggregate;
mod catalog;
mod consistency;
mod ingest;
mod ranks;
mod scoring;
mod vacuum;

pub use catalog::{BuildRegistry, RepositoryResolver, SqliteCatalog, VisibilityIndex};
pub use scoring::{LogScaledScorer, PathScorer};

pub const DATABASE_FILE_NAME: &str = "ranking.sqlite";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("consistency violation for graph key {graph_key}: {detail}")]
    Consistency { graph_key: String, detail: String },
    #[error("collaborator error: {0}")]
    Collaborator(String),
}

impl StoreError {
    /// Lock contention or a busy database; the whole call can be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => {
                matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            }
            _ => false,
        }
    }
}

/// Ingestion, aggregation, rank writing and vacuum over one ranking corpus.
///
/// Every operation is atomic per call and bounded by its arguments; retries
/// are the caller's business.
pub trait RankingStore {
    /// Appends definition facts under `graph_key`. Returns the number of rows written.
    fn insert_definitions(
        &self,
        graph_key: &GraphKey,
        batch: i64,
        definitions: &[Definition],
    ) -> Result<usize, StoreError>;

    /// Appends one reference-set row under `graph_key`.
    fn insert_references(
        &self,
        graph_key: &GraphKey,
        batch: i64,
        references: &ReferenceSet,
    ) -> Result<(), StoreError>;

    /// Claims up to `limit` unprocessed reference sets and folds them into path
    /// count inputs. Returns `(reference sets claimed, input rows written)`.
    fn fold_references_into_path_counts(
        &self,
        graph_key: &DerivedGraphKey,
        limit: usize,
    ) -> Result<(usize, usize), StoreError>;

    /// Consumes up to `batch_size` path count inputs into rank records.
    /// Returns `(rank rows written, inputs consumed)`.
    fn write_ranks(
        &self,
        graph_key: &DerivedGraphKey,
        batch_size: usize,
    ) -> Result<(usize, usize), StoreError>;

    /// Returns `(definitions deleted, reference sets deleted)`.
    fn vacuum_stale_definitions_and_references(
        &self,
        graph_key: &GraphKey,
    ) -> Result<(usize, usize), StoreError>;

    /// Returns `(processed markers deleted, path count inputs deleted)`.
    fn vacuum_stale_graphs(&self, current: &DerivedGraphKey) -> Result<(usize, usize), StoreError>;

    /// Returns the number of rank records deleted.
    fn vacuum_stale_ranks(&self, current: &DerivedGraphKey) -> Result<usize, StoreError>;
}

#[derive(Clone)]
pub struct SqliteRankingStore {
    sqlite_path: PathBuf,
    busy_timeout: Duration,
    retained_rank_generations: usize,
    catalog: SqliteCatalog,
    builds: Arc<dyn BuildRegistry>,
    visibility: Arc<dyn VisibilityIndex>,
    repositories: Arc<dyn RepositoryResolver>,
    scorer: Arc<dyn PathScorer>,
}

impl SqliteRankingStore {
    /// Opens (creating when missing) `.pathrank/ranking.sqlite` under the
    /// workspace root. The bundled catalog tables back every collaborator
    /// until one is replaced with the `with_*` builders.
    pub fn open(
        workspace_root: impl AsRef<Path>,
        config: &PathrankConfig,
    ) -> Result<Self, StoreError> {
        let pathrank_dir = workspace_root.as_ref().join(PATHRANK_DIR_NAME);
        fs::create_dir_all(&pathrank_dir)?;
        let sqlite_path = pathrank_dir.join(DATABASE_FILE_NAME);
        let busy_timeout = Duration::from_millis(config.storage.busy_timeout_ms);

        let conn = Connection::open(&sqlite_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(busy_timeout)?;
        run_migrations(&conn)?;
        drop(conn);

        let catalog = SqliteCatalog::new(sqlite_path.clone(), busy_timeout);

        Ok(Self {
            sqlite_path,
            busy_timeout,
            retained_rank_generations: config.ranking.retained_rank_generations.max(1),
            builds: Arc::new(catalog.clone()),
            visibility: Arc::new(catalog.clone()),
            repositories: Arc::new(catalog.clone()),
            catalog,
            scorer: Arc::new(LogScaledScorer),
        })
    }

    pub fn with_build_registry(mut self, builds: Arc<dyn BuildRegistry>) -> Self {
        self.builds = builds;
        self
    }

    pub fn with_visibility_index(mut self, visibility: Arc<dyn VisibilityIndex>) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_repository_resolver(mut self, repositories: Arc<dyn RepositoryResolver>) -> Self {
        self.repositories = repositories;
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn PathScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_retained_rank_generations(mut self, generations: usize) -> Self {
        self.retained_rank_generations = generations.max(1);
        self
    }

    pub fn sqlite_path(&self) -> &Path {
        &self.sqlite_path
    }

    /// The catalog sharing this store's database file.
    pub fn catalog(&self) -> &SqliteCatalog {
        &self.catalog
    }

    /// Fails with [`StoreError::Consistency`] when a processed marker under
    /// `graph_key` points at a missing reference set or an input row carries a
    /// non-positive count.
    pub fn verify_consistency(&self, graph_key: &DerivedGraphKey) -> Result<(), StoreError> {
        let conn = self.connection()?;
        consistency::verify(&conn, graph_key)
    }

    pub fn definitions(&self, graph_key: &GraphKey) -> Result<Vec<Definition>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT build_id, symbol_name, repository, document_path
            FROM ranking_definitions
            WHERE graph_key = ?1
            ORDER BY id
            "#,
        )?;

        let rows = stmt.query_map(params![graph_key.as_str()], |row| {
            Ok(Definition {
                build_id: BuildId(row.get(0)?),
                symbol_name: row.get(1)?,
                repository: row.get(2)?,
                document_path: row.get(3)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn reference_sets(&self, graph_key: &GraphKey) -> Result<Vec<ReferenceSet>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT build_id, symbol_names
            FROM ranking_references
            WHERE graph_key = ?1
            ORDER BY id
            "#,
        )?;

        let rows = stmt.query_map(params![graph_key.as_str()], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut references = Vec::new();
        for row in rows {
            let (build_id, symbol_names) = row?;
            references.push(ReferenceSet {
                build_id: BuildId(build_id),
                symbol_names: serde_json::from_str(&symbol_names)?,
            });
        }

        Ok(references)
    }

    /// Path count inputs under `graph_key`, summed per document, consumed or not.
    pub fn path_counts(&self, graph_key: &DerivedGraphKey) -> Result<Vec<PathCount>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT repository, document_path, SUM(count)
            FROM ranking_path_counts_inputs
            WHERE graph_key = ?1
            GROUP BY repository, document_path
            ORDER BY repository, document_path
            "#,
        )?;

        let rows = stmt.query_map(params![graph_key.to_string()], |row| {
            Ok(PathCount {
                repository: row.get(0)?,
                document_path: row.get(1)?,
                count: row.get(2)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn path_ranks(&self, graph_key: &DerivedGraphKey) -> Result<Vec<RankRecord>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT repository_id, document_path, reference_count, rank
            FROM ranking_path_ranks
            WHERE graph_key = ?1
            ORDER BY repository_id, document_path
            "#,
        )?;

        let rows = stmt.query_map(params![graph_key.to_string()], |row| {
            Ok(RankRecord {
                repository_id: row.get(0)?,
                document_path: row.get(1)?,
                graph_key: graph_key.clone(),
                reference_count: row.get(2)?,
                rank: row.get(3)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Generations of `base` that currently hold rank records, ascending.
    pub fn rank_generations(&self, base: &GraphKey) -> Result<Vec<u64>, StoreError> {
        let conn = self.connection()?;
        let mut generations = vacuum::sibling_generations(
            &conn,
            "SELECT DISTINCT graph_key FROM ranking_path_ranks",
            base,
        )?
        .into_iter()
        .map(|key| key.generation())
        .collect::<Vec<_>>();
        generations.sort_unstable();

        Ok(generations)
    }

    fn connection(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.sqlite_path)?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }
}

impl RankingStore for SqliteRankingStore {
    fn insert_definitions(
        &self,
        graph_key: &GraphKey,
        batch: i64,
        definitions: &[Definition],
    ) -> Result<usize, StoreError> {
        let mut conn = self.connection()?;
        ingest::insert_definitions(&mut conn, graph_key, batch, definitions)
    }

    fn insert_references(
        &self,
        graph_key: &GraphKey,
        batch: i64,
        references: &ReferenceSet,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        ingest::insert_references(&mut conn, graph_key, batch, references)
    }

    fn fold_references_into_path_counts(
        &self,
        graph_key: &DerivedGraphKey,
        limit: usize,
    ) -> Result<(usize, usize), StoreError> {
        let mut conn = self.connection()?;
        aggregate::fold_references_into_path_counts(
            &mut conn,
            self.builds.as_ref(),
            graph_key,
            limit,
        )
    }

    fn write_ranks(
        &self,
        graph_key: &DerivedGraphKey,
        batch_size: usize,
    ) -> Result<(usize, usize), StoreError> {
        let mut conn = self.connection()?;
        ranks::write_ranks(
            &mut conn,
            self.repositories.as_ref(),
            self.scorer.as_ref(),
            graph_key,
            batch_size,
        )
    }

    fn vacuum_stale_definitions_and_references(
        &self,
        graph_key: &GraphKey,
    ) -> Result<(usize, usize), StoreError> {
        let mut conn = self.connection()?;
        vacuum::vacuum_stale_definitions_and_references(
            &mut conn,
            self.visibility.as_ref(),
            graph_key,
        )
    }

    fn vacuum_stale_graphs(&self, current: &DerivedGraphKey) -> Result<(usize, usize), StoreError> {
        let mut conn = self.connection()?;
        vacuum::vacuum_stale_graphs(&mut conn, current)
    }

    fn vacuum_stale_ranks(&self, current: &DerivedGraphKey) -> Result<usize, StoreError> {
        let mut conn = self.connection()?;
        vacuum::vacuum_stale_ranks(&mut conn, current, self.retained_rank_generations)
    }
}

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS ranking_definitions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            build_id INTEGER NOT NULL,
            symbol_name TEXT NOT NULL,
            repository TEXT NOT NULL,
            document_path TEXT NOT NULL,
            graph_key TEXT NOT NULL,
            batch INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS ranking_definitions_graph_key_symbol_name
            ON ranking_definitions (graph_key, symbol_name);
        CREATE INDEX IF NOT EXISTS ranking_definitions_graph_key_build_id
            ON ranking_definitions (graph_key, build_id);

        CREATE TABLE IF NOT EXISTS ranking_references (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            build_id INTEGER NOT NULL,
            symbol_names TEXT NOT NULL,
            graph_key TEXT NOT NULL,
            batch INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS ranking_references_graph_key_build_id
            ON ranking_references (graph_key, build_id);

        CREATE TABLE IF NOT EXISTS ranking_references_processed (
            graph_key TEXT NOT NULL,
            reference_id INTEGER NOT NULL,
            counted INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (graph_key, reference_id)
        );
        CREATE INDEX IF NOT EXISTS ranking_references_processed_reference_id
            ON ranking_references_processed (reference_id);

        CREATE TABLE IF NOT EXISTS ranking_path_counts_inputs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            repository TEXT NOT NULL,
            document_path TEXT NOT NULL,
            count INTEGER NOT NULL,
            graph_key TEXT NOT NULL,
            processed INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS ranking_path_counts_inputs_graph_key_processed
            ON ranking_path_counts_inputs (graph_key, processed, id);

        CREATE TABLE IF NOT EXISTS ranking_path_ranks (
            repository_id INTEGER NOT NULL,
            document_path TEXT NOT NULL,
            graph_key TEXT NOT NULL,
            reference_count INTEGER NOT NULL,
            rank REAL NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (repository_id, document_path, graph_key)
        );
        CREATE INDEX IF NOT EXISTS ranking_path_ranks_graph_key
            ON ranking_path_ranks (graph_key);

        CREATE TABLE IF NOT EXISTS ranking_repositories (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS ranking_builds (
            id INTEGER PRIMARY KEY,
            repository_id INTEGER NOT NULL,
            root TEXT NOT NULL,
            indexer TEXT NOT NULL,
            finished_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS ranking_builds_project
            ON ranking_builds (repository_id, root, indexer);

        CREATE TABLE IF NOT EXISTS ranking_visible_at_tip (
            repository_id INTEGER NOT NULL,
            build_id INTEGER NOT NULL,
            is_default_branch INTEGER NOT NULL,
            PRIMARY KEY (repository_id, build_id)
        );
        CREATE INDEX IF NOT EXISTS ranking_visible_at_tip_build_id
            ON ranking_visible_at_tip (build_id);
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use pathrank_config::PathrankConfig;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn store_creates_layout_and_reopens_existing_database() {
        let temp = tempdir().expect("tempdir");
        let workspace = temp.path();
        let base = GraphKey::new("mockDev").expect("graph key");

        let store = SqliteRankingStore::open(workspace, &PathrankConfig::default())
            .expect("open store");
        assert!(workspace.join(".pathrank/ranking.sqlite").exists());
        assert_eq!(store.sqlite_path(), workspace.join(".pathrank/ranking.sqlite"));

        let definitions = vec![Definition {
            build_id: BuildId(1),
            symbol_name: "foo".to_owned(),
            repository: "deadbeef".to_owned(),
            document_path: "foo.go".to_owned(),
        }];
        store
            .insert_definitions(&base, 10, &definitions)
            .expect("insert definitions");
        drop(store);

        let reopened = SqliteRankingStore::open(workspace, &PathrankConfig::default())
            .expect("reopen store");
        assert_eq!(
            reopened.definitions(&base).expect("definitions after reopen"),
            definitions
        );
    }

    #[test]
    fn busy_and_locked_failures_are_transient() {
        let busy = StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(busy.is_transient());

        let constraint = StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        ));
        assert!(!constraint.is_transient());
        assert!(!StoreError::Validation(ValidationError::EmptyGraphKey).is_transient());
    }
}

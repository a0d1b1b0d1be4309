use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use pathrank_config::RankingConfig;
use pathrank_core::{BuildInfo, Definition, DerivedGraphKey, ReferenceSet};
use pathrank_store::{RankingStore, StoreError};
use serde::Serialize;

/// Row counts of one scheduling round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoundSummary {
    pub references_claimed: usize,
    pub path_counts_written: usize,
    pub ranks_written: usize,
    pub inputs_consumed: usize,
    pub definitions_deleted: usize,
    pub references_deleted: usize,
    pub markers_deleted: usize,
    pub inputs_deleted: usize,
    pub ranks_deleted: usize,
}

pub fn read_definitions(path: &Path) -> Result<Vec<Definition>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read definitions from {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse definitions in {}", path.display()))
}

pub fn read_reference_sets(path: &Path) -> Result<Vec<ReferenceSet>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read reference sets from {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse reference sets in {}", path.display()))
}

pub fn read_builds(path: &Path) -> Result<Vec<BuildInfo>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read builds from {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse builds in {}", path.display()))
}

/// Folds batches until a call claims nothing.
pub fn fold_until_drained<S: RankingStore>(
    store: &S,
    graph_key: &DerivedGraphKey,
    limit: usize,
) -> Result<(usize, usize), StoreError> {
    let mut claimed = 0;
    let mut written = 0;
    loop {
        let (batch_claimed, batch_written) =
            store.fold_references_into_path_counts(graph_key, limit)?;
        if batch_claimed == 0 {
            return Ok((claimed, written));
        }
        claimed += batch_claimed;
        written += batch_written;
    }
}

/// Writes rank batches until a call consumes nothing.
pub fn write_ranks_until_drained<S: RankingStore>(
    store: &S,
    graph_key: &DerivedGraphKey,
    batch_size: usize,
) -> Result<(usize, usize), StoreError> {
    let mut written = 0;
    let mut consumed = 0;
    loop {
        let (batch_written, batch_consumed) = store.write_ranks(graph_key, batch_size)?;
        if batch_consumed == 0 {
            return Ok((written, consumed));
        }
        written += batch_written;
        consumed += batch_consumed;
    }
}

/// Aggregation, rank writing, then the three vacuums for `graph_key`.
pub fn run_round<S: RankingStore>(
    store: &S,
    graph_key: &DerivedGraphKey,
    config: &RankingConfig,
) -> Result<RoundSummary, StoreError> {
    let (references_claimed, path_counts_written) =
        fold_until_drained(store, graph_key, config.fold_batch_limit.max(1))?;
    let (ranks_written, inputs_consumed) =
        write_ranks_until_drained(store, graph_key, config.rank_batch_size.max(1))?;
    let (definitions_deleted, references_deleted) =
        store.vacuum_stale_definitions_and_references(graph_key.base())?;
    let (markers_deleted, inputs_deleted) = store.vacuum_stale_graphs(graph_key)?;
    let ranks_deleted = store.vacuum_stale_ranks(graph_key)?;

    Ok(RoundSummary {
        references_claimed,
        path_counts_written,
        ranks_written,
        inputs_consumed,
        definitions_deleted,
        references_deleted,
        markers_deleted,
        inputs_deleted,
        ranks_deleted,
    })
}

/// Runs rounds every `interval` until a non-transient error, or once.
/// Transient lock failures are logged and retried on the next round.
pub fn run_loop<S: RankingStore>(
    store: &S,
    graph_key: &DerivedGraphKey,
    config: &RankingConfig,
    interval: Duration,
    once: bool,
) -> Result<()> {
    loop {
        match run_round(store, graph_key, config) {
            Ok(summary) => {
                tracing::info!(
                    graph_key = %graph_key,
                    references_claimed = summary.references_claimed,
                    ranks_written = summary.ranks_written,
                    ranks_deleted = summary.ranks_deleted,
                    "ranking round complete"
                );
                println!(
                    "{}",
                    serde_json::to_string(&summary).context("failed to encode round summary")?
                );
            }
            Err(err) if err.is_transient() && !once => {
                tracing::warn!(graph_key = %graph_key, error = %err, "ranking round hit a busy database");
            }
            Err(err) => {
                return Err(err).with_context(|| format!("ranking round for {graph_key} failed"));
            }
        }

        if once {
            return Ok(());
        }
        thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use pathrank_config::PathrankConfig;
    use pathrank_core::{BuildId, GraphKey};
    use pathrank_store::SqliteRankingStore;
    use tempfile::tempdir;

    use super::*;

    fn seeded_store(workspace: &Path) -> SqliteRankingStore {
        let store =
            SqliteRankingStore::open(workspace, &PathrankConfig::default()).expect("open store");
        let base = GraphKey::new("dev").expect("graph key");

        store
            .catalog()
            .upsert_repository(1, "deadbeef")
            .expect("register repository");
        for (id, finished_at) in [(1, 100), (2, 200)] {
            store
                .catalog()
                .upsert_build(&BuildInfo {
                    id: BuildId(id),
                    repository_id: 1,
                    root: String::new(),
                    indexer: "scip-go".to_owned(),
                    finished_at: Some(finished_at),
                })
                .expect("register build");
        }
        store
            .catalog()
            .mark_visible_at_tip(1, &[BuildId(2)], true)
            .expect("mark visible");

        store
            .insert_definitions(
                &base,
                0,
                &[
                    Definition {
                        build_id: BuildId(2),
                        symbol_name: "foo".to_owned(),
                        repository: "deadbeef".to_owned(),
                        document_path: "foo.go".to_owned(),
                    },
                    Definition {
                        build_id: BuildId(1),
                        symbol_name: "bar".to_owned(),
                        repository: "deadbeef".to_owned(),
                        document_path: "bar.go".to_owned(),
                    },
                ],
            )
            .expect("insert definitions");
        for (id, names) in [(1, vec!["foo", "bar"]), (2, vec!["foo", "foo"])] {
            store
                .insert_references(
                    &base,
                    0,
                    &ReferenceSet {
                        build_id: BuildId(id),
                        symbol_names: names.into_iter().map(str::to_owned).collect(),
                    },
                )
                .expect("insert references");
        }

        store
    }

    #[test]
    fn round_drains_aggregation_ranks_and_vacuums() {
        let temp = tempdir().expect("tempdir");
        let store = seeded_store(temp.path());
        let key = GraphKey::new("dev").expect("graph key").derive(1);
        let config = RankingConfig {
            fold_batch_limit: 1,
            rank_batch_size: 1,
            ..RankingConfig::default()
        };

        let summary = run_round(&store, &key, &config).expect("run round");
        assert_eq!(
            summary,
            RoundSummary {
                references_claimed: 2,
                path_counts_written: 2,
                ranks_written: 2,
                inputs_consumed: 2,
                definitions_deleted: 1,
                references_deleted: 1,
                markers_deleted: 0,
                inputs_deleted: 0,
                ranks_deleted: 0,
            }
        );

        // Build 1 folds first and owns the project for this generation, so build 2 adds nothing.
        let ranks = store.path_ranks(&key).expect("path ranks");
        let counts = ranks
            .iter()
            .map(|record| (record.document_path.as_str(), record.reference_count))
            .collect::<Vec<_>>();
        assert_eq!(counts, vec![("bar.go", 1), ("foo.go", 1)]);
        store.verify_consistency(&key).expect("consistent");

        assert_eq!(
            run_round(&store, &key, &config).expect("idle round"),
            RoundSummary::default()
        );
    }

    #[test]
    fn next_generation_round_clears_the_previous_lineage() {
        let temp = tempdir().expect("tempdir");
        let store = seeded_store(temp.path());
        let base = GraphKey::new("dev").expect("graph key");
        let config = RankingConfig::default();

        run_round(&store, &base.derive(1), &config).expect("first generation");
        let summary = run_round(&store, &base.derive(2), &config).expect("second generation");

        assert_eq!(summary.references_claimed, 1);
        assert_eq!(summary.markers_deleted, 1);
        assert_eq!(summary.inputs_deleted, 1);
        assert_eq!(summary.ranks_deleted, 0);
        assert_eq!(store.rank_generations(&base).expect("generations"), vec![1, 2]);
    }

    #[test]
    fn run_loop_once_returns_after_a_single_round() {
        let temp = tempdir().expect("tempdir");
        let store = seeded_store(temp.path());
        let key = GraphKey::new("dev").expect("graph key").derive(1);

        run_loop(
            &store,
            &key,
            &RankingConfig::default(),
            Duration::from_secs(3600),
            true,
        )
        .expect("single round");
        assert_eq!(store.path_ranks(&key).expect("path ranks").len(), 1);
    }

    #[test]
    fn input_files_parse_as_json_arrays() {
        let temp = tempdir().expect("tempdir");
        let definitions = temp.path().join("defs.json");
        fs::write(
            &definitions,
            r#"[{"build_id": 3, "symbol_name": "foo", "repository": "r", "document_path": "a.go"}]"#,
        )
        .expect("write definitions");
        let references = temp.path().join("refs.json");
        fs::write(&references, r#"[{"build_id": 3, "symbol_names": ["foo", "foo"]}]"#)
            .expect("write references");

        let parsed = read_definitions(&definitions).expect("read definitions");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].build_id, BuildId(3));

        let parsed = read_reference_sets(&references).expect("read references");
        assert_eq!(parsed[0].symbol_names, vec!["foo", "foo"]);

        let builds = temp.path().join("builds.json");
        fs::write(
            &builds,
            r#"[{"id": 3, "repository_id": 50, "root": "", "indexer": "scip-go", "finished_at": null}]"#,
        )
        .expect("write builds");
        let parsed = read_builds(&builds).expect("read builds");
        assert_eq!(parsed[0].finished_at, None);

        let err = read_definitions(&temp.path().join("missing.json")).expect_err("missing file");
        assert!(err.to_string().contains("missing.json"));
    }
}

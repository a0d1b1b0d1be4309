use std::fs;

use pathrank_config::{ensure_workspace_config, normalize_config};
use pathrank_core::GraphKey;
use pathrank_store::{RankingStore, SqliteRankingStore};
use pathrankd::passes::{
    RoundSummary, read_builds, read_definitions, read_reference_sets, run_round,
};
use tempfile::tempdir;

#[test]
fn json_inputs_flow_through_a_full_round() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let workspace = temp.path();

    fs::write(
        workspace.join("builds.json"),
        r#"[
            {"id": 42, "repository_id": 50, "root": "", "indexer": "scip-go", "finished_at": 100},
            {"id": 90, "repository_id": 52, "root": "", "indexer": "scip-go", "finished_at": 200}
        ]"#,
    )?;
    fs::write(
        workspace.join("definitions.json"),
        r#"[
            {"build_id": 42, "symbol_name": "foo", "repository": "deadbeef", "document_path": "foo.go"},
            {"build_id": 42, "symbol_name": "bar", "repository": "deadbeef", "document_path": "bar.go"}
        ]"#,
    )?;
    fs::write(
        workspace.join("references.json"),
        r#"[{"build_id": 90, "symbol_names": ["foo", "bar", "foo"]}]"#,
    )?;

    let config = normalize_config(ensure_workspace_config(workspace)?);
    assert!(workspace.join(".pathrank/config.toml").exists());

    let store = SqliteRankingStore::open(workspace, &config)?;
    let base = GraphKey::new("dev")?;
    let current = base.derive(1);

    for build in read_builds(&workspace.join("builds.json"))? {
        store.catalog().upsert_build(&build)?;
    }
    store.catalog().upsert_repository(7, "deadbeef")?;
    store.catalog().mark_visible_at_tip(52, &[pathrank_core::BuildId(90)], true)?;
    store.catalog().mark_visible_at_tip(50, &[pathrank_core::BuildId(42)], true)?;

    let definitions = read_definitions(&workspace.join("definitions.json"))?;
    assert_eq!(store.insert_definitions(&base, 1, &definitions)?, 2);
    for references in read_reference_sets(&workspace.join("references.json"))? {
        store.insert_references(&base, 1, &references)?;
    }

    let summary = run_round(&store, &current, &config.ranking)?;
    assert_eq!(
        summary,
        RoundSummary {
            references_claimed: 1,
            path_counts_written: 2,
            ranks_written: 2,
            inputs_consumed: 2,
            ..RoundSummary::default()
        }
    );

    let ranks = store.path_ranks(&current)?;
    let counts = ranks
        .iter()
        .map(|record| (record.repository_id, record.document_path.as_str(), record.reference_count))
        .collect::<Vec<_>>();
    assert_eq!(counts, vec![(7, "bar.go", 1), (7, "foo.go", 2)]);
    store.verify_consistency(&current)?;

    Ok(())
}

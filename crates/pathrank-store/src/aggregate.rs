use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use pathrank_core::{BuildId, BuildInfo, DerivedGraphKey, ProjectKey, freshest_build};
use rusqlite::{Connection, Transaction, TransactionBehavior, params};

use crate::{BuildRegistry, StoreError};

struct ClaimedReferences {
    id: i64,
    build_id: BuildId,
    symbol_names: Vec<String>,
}

/// Claims up to `limit` reference sets that have no processed marker under
/// `graph_key`, marks them, and appends the path counts of the builds selected
/// by [`contributing_builds`]. Claim, marks and counts share one immediate
/// transaction, so concurrent callers get disjoint claims and a failed call
/// leaves nothing behind.
pub(crate) fn fold_references_into_path_counts(
    conn: &mut Connection,
    registry: &dyn BuildRegistry,
    graph_key: &DerivedGraphKey,
    limit: usize,
) -> Result<(usize, usize), StoreError> {
    if limit == 0 {
        return Ok((0, 0));
    }

    let derived_key = graph_key.to_string();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let claimed = claim_references(&tx, graph_key, &derived_key, limit)?;
    if claimed.is_empty() {
        return Ok((0, 0));
    }
    let folded = folded_builds(&tx, graph_key, &derived_key)?;
    let contributing = contributing_builds(registry, &claimed, &folded)?;
    mark_processed(&tx, &derived_key, &claimed, &contributing)?;

    let mut occurrences = HashMap::<&str, i64>::new();
    for reference in claimed
        .iter()
        .filter(|reference| contributing.contains(&reference.build_id))
    {
        for symbol_name in &reference.symbol_names {
            *occurrences.entry(symbol_name.as_str()).or_default() += 1;
        }
    }

    let counts = resolve_occurrences(&tx, graph_key, &occurrences)?;
    let written = append_path_counts(&tx, &derived_key, &counts)?;
    tx.commit()?;

    tracing::info!(
        graph_key = %graph_key,
        references_claimed = claimed.len(),
        contributing_builds = contributing.len(),
        path_counts_written = written,
        "folded references into path counts"
    );
    Ok((claimed.len(), written))
}

/// Builds whose claimed reference sets are counted. A project that already has
/// counted reference sets under the derived key keeps counting only the builds
/// it was counted with; any other project counts the freshest of its claimed
/// builds. Builds unknown to the registry never count.
fn contributing_builds(
    registry: &dyn BuildRegistry,
    claimed: &[ClaimedReferences],
    folded: &BTreeSet<BuildId>,
) -> Result<HashSet<BuildId>, StoreError> {
    let lookup = claimed
        .iter()
        .map(|reference| reference.build_id)
        .chain(folded.iter().copied())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>();
    let builds = registry.builds(&lookup)?;

    let mut folded_by_project = HashMap::<ProjectKey, BTreeSet<BuildId>>::new();
    for build in folded.iter().filter_map(|id| builds.get(id)) {
        folded_by_project
            .entry(build.project())
            .or_default()
            .insert(build.id);
    }

    let mut candidates = HashMap::<ProjectKey, BTreeMap<BuildId, &BuildInfo>>::new();
    for reference in claimed {
        match builds.get(&reference.build_id) {
            Some(build) => {
                candidates
                    .entry(build.project())
                    .or_default()
                    .insert(build.id, build);
            }
            None => {
                tracing::debug!(
                    build_id = %reference.build_id,
                    "build unknown to registry, skipping references"
                );
            }
        }
    }

    let mut contributing = HashSet::new();
    for (project, candidates) in &candidates {
        let selected = match folded_by_project.get(project) {
            Some(already_folded) => candidates
                .keys()
                .filter(|id| already_folded.contains(*id))
                .copied()
                .collect::<Vec<_>>(),
            None => freshest_build(candidates.values().copied())
                .map(|build| vec![build.id])
                .unwrap_or_default(),
        };

        for id in candidates.keys().filter(|id| !selected.contains(*id)) {
            tracing::debug!(
                build_id = %id,
                selected = ?selected,
                "build superseded within its project, references claimed without counts"
            );
        }
        contributing.extend(selected);
    }

    Ok(contributing)
}

fn claim_references(
    tx: &Transaction<'_>,
    graph_key: &DerivedGraphKey,
    derived_key: &str,
    limit: usize,
) -> Result<Vec<ClaimedReferences>, StoreError> {
    let mut stmt = tx.prepare_cached(
        r#"
        SELECT r.id, r.build_id, r.symbol_names
        FROM ranking_references r
        WHERE r.graph_key = ?1
          AND NOT EXISTS (
              SELECT 1
              FROM ranking_references_processed p
              WHERE p.graph_key = ?2 AND p.reference_id = r.id
          )
        ORDER BY r.id
        LIMIT ?3
        "#,
    )?;
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = stmt.query_map(
        params![graph_key.base().as_str(), derived_key, limit],
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        },
    )?;

    let mut claimed = Vec::new();
    for row in rows {
        let (id, build_id, symbol_names) = row?;
        claimed.push(ClaimedReferences {
            id,
            build_id: BuildId(build_id),
            symbol_names: serde_json::from_str(&symbol_names)?,
        });
    }

    Ok(claimed)
}

/// Builds owning reference sets already counted under `derived_key`.
fn folded_builds(
    tx: &Transaction<'_>,
    graph_key: &DerivedGraphKey,
    derived_key: &str,
) -> Result<BTreeSet<BuildId>, StoreError> {
    let mut stmt = tx.prepare_cached(
        r#"
        SELECT DISTINCT r.build_id
        FROM ranking_references_processed p
        JOIN ranking_references r ON r.id = p.reference_id
        WHERE p.graph_key = ?1 AND r.graph_key = ?2 AND p.counted = 1
        "#,
    )?;
    let rows = stmt.query_map(params![derived_key, graph_key.base().as_str()], |row| {
        row.get::<_, i64>(0).map(BuildId)
    })?;

    rows.collect::<Result<BTreeSet<_>, _>>().map_err(Into::into)
}

fn mark_processed(
    tx: &Transaction<'_>,
    derived_key: &str,
    claimed: &[ClaimedReferences],
    contributing: &HashSet<BuildId>,
) -> Result<(), StoreError> {
    // A primary-key conflict here means another worker claimed the same row,
    // which the write lock rules out; let it fail the call.
    let mut mark = tx.prepare_cached(
        r#"
        INSERT INTO ranking_references_processed (graph_key, reference_id, counted)
        VALUES (?1, ?2, ?3)
        "#,
    )?;
    for reference in claimed {
        let counted = contributing.contains(&reference.build_id);
        mark.execute(params![derived_key, reference.id, counted])?;
    }

    Ok(())
}

/// Every occurrence of a symbol name counts once per distinct document that
/// defines it under the base key; unresolved names contribute nothing.
fn resolve_occurrences(
    tx: &Transaction<'_>,
    graph_key: &DerivedGraphKey,
    occurrences: &HashMap<&str, i64>,
) -> Result<BTreeMap<(String, String), i64>, StoreError> {
    let mut stmt = tx.prepare_cached(
        r#"
        SELECT DISTINCT repository, document_path
        FROM ranking_definitions
        WHERE graph_key = ?1 AND symbol_name = ?2
        "#,
    )?;

    let mut counts = BTreeMap::<(String, String), i64>::new();
    for (symbol_name, occurrences) in occurrences {
        let rows = stmt.query_map(params![graph_key.base().as_str(), symbol_name], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            *counts.entry(row?).or_default() += occurrences;
        }
    }

    Ok(counts)
}

fn append_path_counts(
    tx: &Transaction<'_>,
    derived_key: &str,
    counts: &BTreeMap<(String, String), i64>,
) -> Result<usize, StoreError> {
    let mut stmt = tx.prepare_cached(
        r#"
        INSERT INTO ranking_path_counts_inputs (repository, document_path, count, graph_key)
        VALUES (?1, ?2, ?3, ?4)
        "#,
    )?;
    for ((repository, document_path), count) in counts {
        stmt.execute(params![repository, document_path, count, derived_key])?;
    }

    Ok(counts.len())
}

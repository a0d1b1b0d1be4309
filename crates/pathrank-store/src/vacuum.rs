use std::collections::BTreeSet;

use pathrank_core::{BuildId, DerivedGraphKey, GraphKey};
use rusqlite::{Connection, TransactionBehavior, params};

use crate::{StoreError, VisibilityIndex};

/// Deletes definitions, reference sets and the processed markers of those
/// reference sets for every build under `graph_key` that is not visible at a
/// branch tip. Visible builds are never touched.
pub(crate) fn vacuum_stale_definitions_and_references(
    conn: &mut Connection,
    visibility: &dyn VisibilityIndex,
    graph_key: &GraphKey,
) -> Result<(usize, usize), StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let build_ids = {
        let mut stmt = tx.prepare(
            r#"
            SELECT build_id FROM ranking_definitions WHERE graph_key = ?1
            UNION
            SELECT build_id FROM ranking_references WHERE graph_key = ?1
            ORDER BY build_id
            "#,
        )?;
        let rows = stmt.query_map(params![graph_key.as_str()], |row| {
            row.get::<_, i64>(0).map(BuildId)
        })?;
        rows.collect::<Result<Vec<_>, _>>()?
    };
    if build_ids.is_empty() {
        return Ok((0, 0));
    }

    let visible = visibility.visible_builds(&build_ids)?;
    let mut definitions_deleted = 0;
    let mut references_deleted = 0;
    let mut markers_deleted = 0;
    {
        let mut delete_markers = tx.prepare_cached(
            r#"
            DELETE FROM ranking_references_processed
            WHERE reference_id IN (
                SELECT id FROM ranking_references WHERE graph_key = ?1 AND build_id = ?2
            )
            "#,
        )?;
        let mut delete_references = tx.prepare_cached(
            "DELETE FROM ranking_references WHERE graph_key = ?1 AND build_id = ?2",
        )?;
        let mut delete_definitions = tx.prepare_cached(
            "DELETE FROM ranking_definitions WHERE graph_key = ?1 AND build_id = ?2",
        )?;

        for build_id in build_ids.iter().filter(|id| !visible.contains(*id)) {
            let build_id = build_id.get();
            markers_deleted += delete_markers.execute(params![graph_key.as_str(), build_id])?;
            references_deleted +=
                delete_references.execute(params![graph_key.as_str(), build_id])?;
            definitions_deleted +=
                delete_definitions.execute(params![graph_key.as_str(), build_id])?;
        }
    }
    tx.commit()?;

    tracing::info!(
        graph_key = %graph_key,
        definitions_deleted,
        references_deleted,
        markers_deleted,
        "vacuumed definitions and references of invisible builds"
    );
    Ok((definitions_deleted, references_deleted))
}

/// Deletes processed markers and path count inputs of every generation of
/// `current`'s base key other than `current` itself.
pub(crate) fn vacuum_stale_graphs(
    conn: &mut Connection,
    current: &DerivedGraphKey,
) -> Result<(usize, usize), StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let stale = sibling_generations(
        &tx,
        r#"
        SELECT DISTINCT graph_key FROM ranking_references_processed
        UNION
        SELECT DISTINCT graph_key FROM ranking_path_counts_inputs
        "#,
        current.base(),
    )?
    .into_iter()
    .filter(|key| key != current)
    .collect::<Vec<_>>();

    let mut markers_deleted = 0;
    let mut inputs_deleted = 0;
    for key in &stale {
        let key = key.to_string();
        markers_deleted += tx.execute(
            "DELETE FROM ranking_references_processed WHERE graph_key = ?1",
            params![key],
        )?;
        inputs_deleted += tx.execute(
            "DELETE FROM ranking_path_counts_inputs WHERE graph_key = ?1",
            params![key],
        )?;
    }
    tx.commit()?;

    tracing::info!(
        graph_key = %current,
        stale_generations = stale.len(),
        markers_deleted,
        inputs_deleted,
        "vacuumed stale graph generations"
    );
    Ok((markers_deleted, inputs_deleted))
}

/// Keeps rank records of the `retained_generations` newest generations among
/// those stored and `current`; older generations of the same base are deleted.
/// `current` itself always survives.
pub(crate) fn vacuum_stale_ranks(
    conn: &mut Connection,
    current: &DerivedGraphKey,
    retained_generations: usize,
) -> Result<usize, StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let stored = sibling_generations(
        &tx,
        "SELECT DISTINCT graph_key FROM ranking_path_ranks",
        current.base(),
    )?;

    let floor = retained_floor(
        stored.iter().map(DerivedGraphKey::generation),
        current.generation(),
        retained_generations,
    );

    let mut ranks_deleted = 0;
    for key in stored.iter().filter(|key| key.generation() < floor) {
        ranks_deleted += tx.execute(
            "DELETE FROM ranking_path_ranks WHERE graph_key = ?1",
            params![key.to_string()],
        )?;
    }
    tx.commit()?;

    tracing::info!(
        graph_key = %current,
        retained_floor = floor,
        ranks_deleted,
        "vacuumed stale path ranks"
    );
    Ok(ranks_deleted)
}

/// Lowest generation that survives: the `retained`-th newest of `stored` and
/// `current`, never above `current`.
fn retained_floor(stored: impl Iterator<Item = u64>, current: u64, retained: usize) -> u64 {
    let generations = stored
        .chain(std::iter::once(current))
        .collect::<BTreeSet<_>>();

    generations
        .iter()
        .rev()
        .take(retained.max(1))
        .last()
        .copied()
        .unwrap_or(current)
        .min(current)
}

/// Parses the graph keys returned by `query` and keeps the generations of `base`.
pub(crate) fn sibling_generations(
    conn: &Connection,
    query: &str,
    base: &GraphKey,
) -> Result<Vec<DerivedGraphKey>, StoreError> {
    let mut stmt = conn.prepare(query)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut keys = Vec::new();
    for row in rows {
        let raw = row?;
        match DerivedGraphKey::parse(&raw) {
            Ok(key) if key.base() == base => keys.push(key),
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(graph_key = %raw, error = %err, "skipping unparseable graph key")
            }
        }
    }

    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::retained_floor;

    #[test]
    fn floor_keeps_the_newest_generations() {
        assert_eq!(retained_floor([123, 234, 345, 456].into_iter(), 456, 2), 345);
        assert_eq!(retained_floor([123, 234].into_iter(), 456, 2), 234);
        assert_eq!(retained_floor(std::iter::empty(), 7, 2), 7);
    }

    #[test]
    fn floor_never_rises_above_current() {
        assert_eq!(retained_floor([10, 20, 30].into_iter(), 5, 2), 5);
        assert_eq!(retained_floor([10, 20, 30].into_iter(), 30, 1), 30);
        assert_eq!(retained_floor([10, 20, 30].into_iter(), 30, 0), 30);
    }
}

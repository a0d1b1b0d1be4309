use pathrank_core::DerivedGraphKey;
use rusqlite::{Connection, params};

use crate::StoreError;

pub(crate) fn verify(conn: &Connection, graph_key: &DerivedGraphKey) -> Result<(), StoreError> {
    let derived_key = graph_key.to_string();

    let dangling_markers: i64 = conn.query_row(
        r#"
        SELECT COUNT(*)
        FROM ranking_references_processed p
        WHERE p.graph_key = ?1
          AND NOT EXISTS (SELECT 1 FROM ranking_references r WHERE r.id = p.reference_id)
        "#,
        params![derived_key],
        |row| row.get(0),
    )?;
    if dangling_markers > 0 {
        return Err(StoreError::Consistency {
            graph_key: derived_key,
            detail: format!("{dangling_markers} processed markers point at missing reference sets"),
        });
    }

    let non_positive_inputs: i64 = conn.query_row(
        "SELECT COUNT(*) FROM ranking_path_counts_inputs WHERE graph_key = ?1 AND count <= 0",
        params![derived_key],
        |row| row.get(0),
    )?;
    if non_positive_inputs > 0 {
        return Err(StoreError::Consistency {
            graph_key: derived_key,
            detail: format!("{non_positive_inputs} path count inputs carry a non-positive count"),
        });
    }

    Ok(())
}

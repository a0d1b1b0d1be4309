use pathrank_core::{Definition, GraphKey, ReferenceSet};
use rusqlite::{Connection, TransactionBehavior, params};

use crate::StoreError;

pub(crate) fn insert_definitions(
    conn: &mut Connection,
    graph_key: &GraphKey,
    batch: i64,
    definitions: &[Definition],
) -> Result<usize, StoreError> {
    for (index, definition) in definitions.iter().enumerate() {
        definition.validate(index)?;
    }
    if definitions.is_empty() {
        return Ok(0);
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    {
        let mut stmt = tx.prepare_cached(
            r#"
            INSERT INTO ranking_definitions (
                build_id, symbol_name, repository, document_path, graph_key, batch
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )?;
        for definition in definitions {
            stmt.execute(params![
                definition.build_id.get(),
                definition.symbol_name,
                definition.repository,
                definition.document_path,
                graph_key.as_str(),
                batch,
            ])?;
        }
    }
    tx.commit()?;

    tracing::debug!(
        graph_key = %graph_key,
        batch,
        rows = definitions.len(),
        "inserted ranking definitions"
    );
    Ok(definitions.len())
}

pub(crate) fn insert_references(
    conn: &mut Connection,
    graph_key: &GraphKey,
    batch: i64,
    references: &ReferenceSet,
) -> Result<(), StoreError> {
    references.validate()?;
    let symbol_names = serde_json::to_string(&references.symbol_names)?;

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute(
        r#"
        INSERT INTO ranking_references (build_id, symbol_names, graph_key, batch)
        VALUES (?1, ?2, ?3, ?4)
        "#,
        params![
            references.build_id.get(),
            symbol_names,
            graph_key.as_str(),
            batch
        ],
    )?;
    tx.commit()?;

    tracing::debug!(
        graph_key = %graph_key,
        batch,
        build_id = %references.build_id,
        symbols = references.symbol_names.len(),
        "inserted ranking references"
    );
    Ok(())
}

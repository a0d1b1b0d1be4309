use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use pathrank_core::DerivedGraphKey;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use crate::{PathScorer, RepositoryResolver, StoreError};

/// Consumes up to `batch_size` unconsumed path count inputs of `graph_key`,
/// adds their sums to the stored reference counts and re-scores the touched
/// documents. Consumption and rank upserts commit together.
pub(crate) fn write_ranks(
    conn: &mut Connection,
    repositories: &dyn RepositoryResolver,
    scorer: &dyn PathScorer,
    graph_key: &DerivedGraphKey,
    batch_size: usize,
) -> Result<(usize, usize), StoreError> {
    if batch_size == 0 {
        return Ok((0, 0));
    }

    let derived_key = graph_key.to_string();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let inputs = {
        let mut stmt = tx.prepare_cached(
            r#"
            SELECT id, repository, document_path, count
            FROM ranking_path_counts_inputs
            WHERE graph_key = ?1 AND processed = 0
            ORDER BY id
            LIMIT ?2
            "#,
        )?;
        let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![derived_key, limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        rows.collect::<Result<Vec<_>, _>>()?
    };
    if inputs.is_empty() {
        return Ok((0, 0));
    }

    let mut sums = BTreeMap::<(String, String), i64>::new();
    {
        let mut consume = tx.prepare_cached(
            "UPDATE ranking_path_counts_inputs SET processed = 1 WHERE id = ?1",
        )?;
        for (id, repository, document_path, count) in &inputs {
            consume.execute(params![id])?;
            *sums
                .entry((repository.clone(), document_path.clone()))
                .or_default() += count;
        }
    }

    let mut repository_ids = HashMap::<String, Option<i64>>::new();
    let updated_at = unix_now();
    let mut written = 0;
    {
        let mut existing = tx.prepare_cached(
            r#"
            SELECT reference_count
            FROM ranking_path_ranks
            WHERE repository_id = ?1 AND document_path = ?2 AND graph_key = ?3
            "#,
        )?;
        let mut upsert = tx.prepare_cached(
            r#"
            INSERT INTO ranking_path_ranks (
                repository_id, document_path, graph_key, reference_count, rank, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(repository_id, document_path, graph_key) DO UPDATE SET
                reference_count = excluded.reference_count,
                rank = excluded.rank,
                updated_at = excluded.updated_at
            "#,
        )?;

        for ((repository, document_path), sum) in &sums {
            let repository_id = match repository_ids.get(repository) {
                Some(id) => *id,
                None => {
                    let id = repositories.repository_id(repository)?;
                    if id.is_none() {
                        tracing::warn!(
                            graph_key = %graph_key,
                            repository = %repository,
                            "unknown repository, consuming path counts without a rank"
                        );
                    }
                    repository_ids.insert(repository.clone(), id);
                    id
                }
            };
            let Some(repository_id) = repository_id else {
                continue;
            };

            let previous: Option<i64> = existing
                .query_row(params![repository_id, document_path, derived_key], |row| {
                    row.get(0)
                })
                .optional()?;
            let reference_count = previous.unwrap_or(0) + sum;
            let rank = scorer.score(repository, document_path, reference_count);

            upsert.execute(params![
                repository_id,
                document_path,
                derived_key,
                reference_count,
                rank,
                updated_at,
            ])?;
            written += 1;
        }
    }
    tx.commit()?;

    tracing::info!(
        graph_key = %graph_key,
        ranks_written = written,
        inputs_consumed = inputs.len(),
        "wrote path ranks"
    );
    Ok((written, inputs.len()))
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

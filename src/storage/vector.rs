//! Embedding persistence and brute-force similarity search.
//!
//! Vectors are stored as f32 little-endian blobs. Search is exact cosine
//! over the task-scoped candidate set — corpus sizes here are thousands of
//! fragments per task, well inside brute-force territory.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

/// Serialize an embedding as a little-endian f32 blob.
#[must_use]
pub fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Deserialize a little-endian f32 blob. Trailing partial floats are
/// dropped.
#[must_use]
pub fn deserialize_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity; 0.0 for empty or mismatched-dimension inputs.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= 0.0 { 0.0 } else { dot / denom }
}

/// One similarity-search hit.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub similarity: f64,
    pub text_preview: String,
}

/// Persist an embedding, replacing any prior vector for the same
/// `(target_type, target_id, model_id)`.
pub async fn persist_embedding(
    pool: &SqlitePool,
    target_type: &str,
    target_id: &str,
    embedding: &[f32],
    model_id: &str,
) -> Result<()> {
    anyhow::ensure!(
        target_type == "fragment" || target_type == "claim",
        "target_type must be 'fragment' or 'claim'"
    );
    anyhow::ensure!(!embedding.is_empty(), "embedding must be non-empty");

    let embedding_id = format!("{target_type}:{target_id}:{model_id}");
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO embeddings
        (id, target_type, target_id, model_id, embedding_blob, dimension)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&embedding_id)
    .bind(target_type)
    .bind(target_id)
    .bind(model_id)
    .bind(serialize_embedding(embedding))
    .bind(embedding.len() as i64)
    .execute(pool)
    .await?;
    Ok(())
}

/// Brute-force cosine search over stored embeddings of one target type,
/// optionally scoped to a task's claims (fragments scope through their
/// claim edges).
pub async fn vector_search(
    pool: &SqlitePool,
    query_vec: &[f32],
    target_type: &str,
    task_id: Option<&str>,
    top_k: usize,
    min_similarity: f64,
    model_id: &str,
) -> Result<Vec<VectorHit>> {
    let rows = match (task_id, target_type) {
        (Some(task), "claim") => {
            sqlx::query(
                r#"
                SELECT e.target_id, e.embedding_blob, e.dimension, c.claim_text AS text_content
                FROM embeddings e
                JOIN claims c ON e.target_id = c.id
                WHERE e.target_type = 'claim' AND e.model_id = ? AND c.task_id = ?
                "#,
            )
            .bind(model_id)
            .bind(task)
            .fetch_all(pool)
            .await?
        }
        (Some(task), "fragment") => {
            sqlx::query(
                r#"
                WITH task_fragments AS (
                    SELECT DISTINCT ed.source_id AS fragment_id
                    FROM edges ed
                    JOIN claims c ON ed.target_type = 'claim' AND ed.target_id = c.id
                    WHERE ed.source_type = 'fragment' AND c.task_id = ?
                )
                SELECT e.target_id, e.embedding_blob, e.dimension, f.text_content
                FROM embeddings e
                JOIN fragments f ON e.target_id = f.id
                WHERE e.target_type = 'fragment' AND e.model_id = ?
                  AND e.target_id IN (SELECT fragment_id FROM task_fragments)
                "#,
            )
            .bind(task)
            .bind(model_id)
            .fetch_all(pool)
            .await?
        }
        _ => {
            sqlx::query(
                r#"
                SELECT e.target_id, e.embedding_blob, e.dimension,
                       CASE e.target_type
                         WHEN 'fragment' THEN f.text_content
                         WHEN 'claim' THEN c.claim_text
                       END AS text_content
                FROM embeddings e
                LEFT JOIN fragments f ON e.target_type = 'fragment' AND e.target_id = f.id
                LEFT JOIN claims c ON e.target_type = 'claim' AND e.target_id = c.id
                WHERE e.target_type = ? AND e.model_id = ?
                "#,
            )
            .bind(target_type)
            .bind(model_id)
            .fetch_all(pool)
            .await?
        }
    };

    let mut hits = Vec::new();
    for row in rows {
        let blob: Vec<u8> = row.get("embedding_blob");
        let dimension: i64 = row.get("dimension");
        let emb = deserialize_embedding(&blob);
        if emb.len() != dimension as usize || emb.len() != query_vec.len() {
            continue;
        }
        let sim = cosine_similarity(query_vec, &emb);
        if sim >= min_similarity {
            let text: Option<String> = row.get("text_content");
            let text = text.unwrap_or_default();
            hits.push(VectorHit {
                id: row.get("target_id"),
                similarity: sim,
                text_preview: text.chars().take(200).collect(),
            });
        }
    }

    hits.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(top_k);
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_round_trip() {
        let vec = vec![0.25f32, -1.5, 3.0, 0.0];
        let blob = serialize_embedding(&vec);
        assert_eq!(blob.len(), 16);
        assert_eq!(deserialize_embedding(&blob), vec);
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }
}

//! Cross-source NLI verification.
//!
//! For each claim: exclude the domains the claim came from (origin edges),
//! recall candidate fragments by cosine similarity over the task's
//! embeddings, cap by similarity rank and domain diversity, skip pairs
//! already judged, batch through NLI, and persist stance edges with
//! `INSERT OR IGNORE` against the partial unique index. Everything no-ops
//! gracefully: no claims, no embeddings, no candidates are all fine.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::ml::{MlClient, NliPair};
use crate::storage::vector::{cosine_similarity, deserialize_embedding};

/// Summary returned by a verification run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VerificationSummary {
    pub ok: bool,
    pub task_id: String,
    pub claims_processed: u32,
    pub edges_created: u32,
    pub edges_skipped_duplicate: u32,
    pub status: &'static str,
}

struct Candidate {
    fragment_id: String,
    similarity: f64,
    text_content: String,
    domain: Option<String>,
}

/// Verify a task's claims against cross-source fragments.
pub async fn verify_claims_nli(
    pool: &SqlitePool,
    ml: &MlClient,
    settings: &Arc<Settings>,
    task_id: &str,
    claim_ids: Option<&[String]>,
) -> anyhow::Result<VerificationSummary> {
    let claims: Vec<(String, String)> = match claim_ids {
        Some(ids) if !ids.is_empty() => {
            let mut rows = Vec::new();
            for id in ids {
                if let Some(row) = sqlx::query(
                    "SELECT id, claim_text FROM claims WHERE task_id = ? AND id = ?",
                )
                .bind(task_id)
                .bind(id)
                .fetch_optional(pool)
                .await?
                {
                    rows.push((row.get("id"), row.get("claim_text")));
                }
            }
            rows
        }
        _ => sqlx::query("SELECT id, claim_text FROM claims WHERE task_id = ?")
            .bind(task_id)
            .fetch_all(pool)
            .await?
            .into_iter()
            .map(|row| (row.get("id"), row.get("claim_text")))
            .collect(),
    };

    if claims.is_empty() {
        info!(task_id, "no claims to verify");
        return Ok(VerificationSummary {
            ok: true,
            task_id: task_id.to_string(),
            claims_processed: 0,
            edges_created: 0,
            edges_skipped_duplicate: 0,
            status: "no_claims",
        });
    }

    let mut edges_created = 0u32;
    let mut edges_skipped = 0u32;
    let mut claims_processed = 0u32;

    for (claim_id, claim_text) in &claims {
        let (created, skipped) =
            verify_single_claim(pool, ml, settings, task_id, claim_id, claim_text).await?;
        edges_created += created;
        edges_skipped += skipped;
        claims_processed += 1;
    }

    info!(
        task_id,
        claims_processed,
        edges_created,
        edges_skipped_duplicate = edges_skipped,
        "cross-source NLI verification completed"
    );

    Ok(VerificationSummary {
        ok: true,
        task_id: task_id.to_string(),
        claims_processed,
        edges_created,
        edges_skipped_duplicate: edges_skipped,
        status: "completed",
    })
}

async fn verify_single_claim(
    pool: &SqlitePool,
    ml: &MlClient,
    settings: &Arc<Settings>,
    task_id: &str,
    claim_id: &str,
    claim_text: &str,
) -> anyhow::Result<(u32, u32)> {
    let origin_domains = claim_origin_domains(pool, claim_id).await?;

    let mut candidates =
        candidate_fragments(pool, ml, settings, task_id, claim_id, claim_text, &origin_domains)
            .await?;
    if candidates.is_empty() {
        debug!(claim_id, ?origin_domains, "no candidate fragments found");
        return Ok((0, 0));
    }

    // Pairs already judged for this claim are skipped.
    let existing = existing_nli_fragment_ids(pool, claim_id).await?;
    candidates.retain(|c| !existing.contains(&c.fragment_id));
    if candidates.is_empty() {
        debug!(claim_id, "all candidates already evaluated");
        return Ok((0, 0));
    }

    candidates.truncate(settings.verification.max_pairs_per_claim);

    let pairs: Vec<NliPair> = candidates
        .iter()
        .map(|c| NliPair {
            pair_id: format!("{claim_id}:{}", c.fragment_id),
            premise: c.text_content.clone(),
            nli_hypothesis: claim_text.to_string(),
        })
        .collect();

    let verdicts = ml.nli(&pairs).await?;

    let mut created = 0u32;
    let mut skipped = 0u32;
    for (verdict, candidate) in verdicts.iter().zip(candidates.iter()) {
        let stance = verdict.stance.as_str();
        if matches!(stance, "supports" | "refutes")
            && verdict.confidence < settings.verification.min_nli_confidence
        {
            continue;
        }
        if stance == "neutral" && !settings.verification.save_neutral {
            continue;
        }
        if !matches!(stance, "supports" | "refutes" | "neutral") {
            warn!(claim_id, stance, "unknown NLI stance, skipping");
            continue;
        }

        if insert_nli_edge(
            pool,
            claim_id,
            &candidate.fragment_id,
            stance,
            verdict.confidence,
            candidate.domain.as_deref(),
        )
        .await?
        {
            created += 1;
        } else {
            skipped += 1;
        }
    }

    Ok((created, skipped))
}

/// Domains the claim was extracted from, via its origin edges.
async fn claim_origin_domains(
    pool: &SqlitePool,
    claim_id: &str,
) -> anyhow::Result<HashSet<String>> {
    let rows = sqlx::query(
        r#"
        SELECT DISTINCT p.domain
        FROM edges e
        JOIN fragments f ON e.source_type = 'fragment' AND e.source_id = f.id
        JOIN pages p ON f.page_id = p.id
        WHERE e.target_type = 'claim'
          AND e.target_id = ?
          AND e.relation = 'origin'
        "#,
    )
    .bind(claim_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .filter_map(|row| row.get::<Option<String>, _>("domain"))
        .collect())
}

async fn candidate_fragments(
    pool: &SqlitePool,
    ml: &MlClient,
    settings: &Arc<Settings>,
    task_id: &str,
    claim_id: &str,
    claim_text: &str,
    origin_domains: &HashSet<String>,
) -> anyhow::Result<Vec<Candidate>> {
    let claim_vec = match ml.embed(&[claim_text.to_string()]).await {
        Ok(mut embeddings) if !embeddings.is_empty() => embeddings.remove(0),
        Ok(_) => return Ok(Vec::new()),
        Err(e) => {
            warn!(claim_id, error = %e, "failed to generate claim embedding");
            return Ok(Vec::new());
        }
    };

    // Task-scoped fragment embeddings; origin domains are filtered below.
    let rows = sqlx::query(
        r#"
        WITH task_fragments AS (
            SELECT DISTINCT e.source_id AS fragment_id
            FROM edges e
            JOIN claims c ON e.target_type = 'claim' AND e.target_id = c.id
            WHERE e.source_type = 'fragment'
              AND c.task_id = ?
        )
        SELECT emb.target_id AS fragment_id, emb.embedding_blob,
               f.text_content, p.domain
        FROM embeddings emb
        JOIN fragments f ON emb.target_id = f.id
        JOIN pages p ON f.page_id = p.id
        WHERE emb.target_type = 'fragment'
          AND emb.model_id = ?
          AND emb.target_id IN (SELECT fragment_id FROM task_fragments)
        "#,
    )
    .bind(task_id)
    .bind(&settings.verification.embedding_model)
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        debug!(task_id, claim_id, "no fragment embeddings found for task");
        return Ok(Vec::new());
    }

    let mut candidates = Vec::new();
    for row in rows {
        let domain: Option<String> = row.get("domain");
        if let Some(ref d) = domain {
            if origin_domains.contains(d) {
                continue;
            }
        }
        let blob: Vec<u8> = row.get("embedding_blob");
        let emb = deserialize_embedding(&blob);
        if emb.is_empty() {
            continue;
        }
        let sim = cosine_similarity(&claim_vec, &emb);
        if sim >= settings.verification.min_similarity {
            let text: Option<String> = row.get("text_content");
            candidates.push(Candidate {
                fragment_id: row.get("fragment_id"),
                similarity: sim,
                text_content: text.unwrap_or_default(),
                domain,
            });
        }
    }

    candidates.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(settings.verification.top_k);

    // Cap distinct domains for source diversity; extra fragments from
    // already-admitted domains still pass.
    let max_domains = settings.verification.max_domains;
    if max_domains > 0 {
        let mut seen: HashSet<String> = HashSet::new();
        candidates.retain(|c| {
            let domain = c.domain.clone().unwrap_or_else(|| "unknown".to_string());
            if seen.len() < max_domains || seen.contains(&domain) {
                seen.insert(domain);
                true
            } else {
                false
            }
        });
    }

    Ok(candidates)
}

async fn existing_nli_fragment_ids(
    pool: &SqlitePool,
    claim_id: &str,
) -> anyhow::Result<HashSet<String>> {
    let rows = sqlx::query(
        r#"
        SELECT source_id
        FROM edges
        WHERE source_type = 'fragment'
          AND target_type = 'claim'
          AND target_id = ?
          AND relation IN ('supports', 'refutes', 'neutral')
        "#,
    )
    .bind(claim_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|row| row.get("source_id")).collect())
}

/// Insert one NLI edge. Returns true when created, false when the partial
/// unique index made it a duplicate no-op.
pub async fn insert_nli_edge(
    pool: &SqlitePool,
    claim_id: &str,
    fragment_id: &str,
    stance: &str,
    confidence: f64,
    source_domain: Option<&str>,
) -> anyhow::Result<bool> {
    let edge_id = format!("e_{}", &Uuid::new_v4().simple().to_string()[..8]);
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO edges
        (id, source_type, source_id, target_type, target_id,
         relation, nli_confidence, source_domain, created_at)
        VALUES (?, 'fragment', ?, 'claim', ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&edge_id)
    .bind(fragment_id)
    .bind(claim_id)
    .bind(stance)
    .bind(confidence)
    .bind(source_domain)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    if result.rows_affected() > 0 {
        debug!(edge_id, claim_id, fragment_id, stance, confidence, "NLI edge created");
        Ok(true)
    } else {
        debug!(claim_id, fragment_id, "NLI edge skipped (duplicate)");
        Ok(false)
    }
}

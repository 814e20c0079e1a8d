//! Deferred citation-graph persistence.
//!
//! Target executions that surface papers (DOI lookups, scholarly SERPs)
//! hand their findings to a lower-priority job which persists paper rows
//! and `cites` edges. Papers without a landing URL get a placeholder page
//! row so the graph stays navigable. The follow-up enqueue is deduplicated
//! per `search_id` by the worker manager; this module is idempotent anyway
//! (papers upsert on DOI).

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::utils::registrable_domain;

/// One paper as emitted by a target execution.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PaperRecord {
    #[serde(default)]
    pub doi: Option<String>,
    pub title: String,
    #[serde(rename = "abstract", default)]
    pub abstract_text: Option<String>,
    #[serde(default)]
    pub year: Option<i64>,
    #[serde(default)]
    pub url: Option<String>,
    /// DOIs this paper cites.
    #[serde(default)]
    pub references: Vec<String>,
}

/// Summary of one citation-graph run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CitationGraphSummary {
    pub ok: bool,
    pub papers_persisted: u32,
    pub edges_created: u32,
    pub placeholders_created: u32,
}

/// Persist papers and their citation edges from a completed target's
/// output payload (`{"papers": [...]}`).
pub async fn process_citation_graph(
    pool: &SqlitePool,
    input: &serde_json::Value,
) -> anyhow::Result<CitationGraphSummary> {
    let papers: Vec<PaperRecord> = input
        .get("papers")
        .map(|value| serde_json::from_value(value.clone()))
        .transpose()?
        .unwrap_or_default();

    if papers.is_empty() {
        debug!("citation graph job had no papers");
        return Ok(CitationGraphSummary {
            ok: true,
            papers_persisted: 0,
            edges_created: 0,
            placeholders_created: 0,
        });
    }

    let mut papers_persisted = 0u32;
    let mut edges_created = 0u32;
    let mut placeholders_created = 0u32;

    for paper in &papers {
        let (paper_id, placeholder) = persist_paper(pool, paper).await?;
        papers_persisted += 1;
        if placeholder {
            placeholders_created += 1;
        }

        for cited_doi in &paper.references {
            if cited_doi.trim().is_empty() {
                continue;
            }
            let cited_id = ensure_paper_for_doi(pool, cited_doi).await?;
            if insert_cites_edge(pool, &paper_id, &cited_id).await? {
                edges_created += 1;
            }
        }
    }

    info!(
        papers_persisted,
        edges_created, placeholders_created, "citation graph processed"
    );

    Ok(CitationGraphSummary {
        ok: true,
        papers_persisted,
        edges_created,
        placeholders_created,
    })
}

/// Upsert a paper row (keyed by DOI when present). Returns
/// `(paper_id, created_placeholder_page)`.
async fn persist_paper(pool: &SqlitePool, paper: &PaperRecord) -> anyhow::Result<(String, bool)> {
    let existing = match &paper.doi {
        Some(doi) => sqlx::query("SELECT id FROM papers WHERE doi = ?")
            .bind(doi)
            .fetch_optional(pool)
            .await?,
        None => None,
    };

    let paper_id = match existing {
        Some(row) => {
            let id: String = row.get("id");
            sqlx::query("UPDATE papers SET title = ?, abstract = ?, year = ?, url = ? WHERE id = ?")
                .bind(&paper.title)
                .bind(&paper.abstract_text)
                .bind(paper.year)
                .bind(&paper.url)
                .bind(&id)
                .execute(pool)
                .await?;
            id
        }
        None => {
            let id = format!("paper_{}", Uuid::new_v4().simple());
            let mut page_id: Option<String> = None;
            if paper.url.is_none() {
                page_id = Some(create_placeholder_page(pool, &paper.title).await?);
            }
            sqlx::query(
                r#"
                INSERT INTO papers (id, doi, title, abstract, year, url, page_id, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&id)
            .bind(&paper.doi)
            .bind(&paper.title)
            .bind(&paper.abstract_text)
            .bind(paper.year)
            .bind(&paper.url)
            .bind(&page_id)
            .bind(Utc::now().to_rfc3339())
            .execute(pool)
            .await?;
            return Ok((id, page_id.is_some()));
        }
    };

    Ok((paper_id, false))
}

/// Paper row for a cited DOI, creating a stub if unseen.
async fn ensure_paper_for_doi(pool: &SqlitePool, doi: &str) -> anyhow::Result<String> {
    if let Some(row) = sqlx::query("SELECT id FROM papers WHERE doi = ?")
        .bind(doi)
        .fetch_optional(pool)
        .await?
    {
        return Ok(row.get("id"));
    }

    let id = format!("paper_{}", Uuid::new_v4().simple());
    sqlx::query(
        "INSERT INTO papers (id, doi, title, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(doi)
    .bind(doi)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(id)
}

async fn create_placeholder_page(pool: &SqlitePool, title: &str) -> anyhow::Result<String> {
    let page_id = format!("page_{}", Uuid::new_v4().simple());
    let pseudo_url = format!("paper://placeholder/{page_id}");
    let domain = registrable_domain(&pseudo_url).unwrap_or_else(|| "placeholder".to_string());
    sqlx::query(
        "INSERT INTO pages (id, url, domain, fetched_at) VALUES (?, ?, ?, ?)",
    )
    .bind(&page_id)
    .bind(&pseudo_url)
    .bind(domain)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    debug!(page_id, title, "created placeholder page for paper");
    Ok(page_id)
}

/// Insert a `cites` edge. Cites edges carry no uniqueness constraint from
/// the partial index, so duplicates are avoided with an explicit check.
async fn insert_cites_edge(
    pool: &SqlitePool,
    from_paper: &str,
    to_paper: &str,
) -> anyhow::Result<bool> {
    let existing = sqlx::query(
        r#"
        SELECT COUNT(*) AS n FROM edges
        WHERE source_type = 'paper' AND source_id = ?
          AND target_type = 'paper' AND target_id = ?
          AND relation = 'cites'
        "#,
    )
    .bind(from_paper)
    .bind(to_paper)
    .fetch_one(pool)
    .await?;
    if existing.get::<i64, _>("n") > 0 {
        return Ok(false);
    }

    sqlx::query(
        r#"
        INSERT INTO edges (id, source_type, source_id, target_type, target_id, relation, created_at)
        VALUES (?, 'paper', ?, 'paper', ?, 'cites', ?)
        "#,
    )
    .bind(format!("e_{}", &Uuid::new_v4().simple().to_string()[..8]))
    .bind(from_paper)
    .bind(to_paper)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(true)
}

//! SQLite pool construction and schema.
//!
//! One pool serves the whole process. WAL mode allows concurrent readers
//! during worker writes; the schema block is idempotent
//! (`CREATE … IF NOT EXISTS`) and doubles as the storage contract the core
//! reads and writes. The partial unique index on `edges` is what makes NLI
//! edge insertion idempotent.

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};

/// Storage contract. Collaborators own migrations beyond this; the core
/// only relies on what is declared here.
const SCHEMA_SQL: &str = r#"
-- Durable job queue; the scheduler's single source of truth
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    task_id TEXT,
    kind TEXT NOT NULL,
    priority INTEGER NOT NULL,
    slot TEXT NOT NULL,
    state TEXT NOT NULL,
    input_json TEXT,
    output_json TEXT,
    error_message TEXT,
    queued_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    cause_id TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(slot, state, priority, queued_at);
CREATE INDEX IF NOT EXISTS idx_jobs_task ON jobs(task_id);

-- Per-domain learned network stats (IPv6 Happy-Eyeballs)
CREATE TABLE IF NOT EXISTS domains (
    domain TEXT PRIMARY KEY,
    ipv6_enabled INTEGER NOT NULL DEFAULT 1,
    ipv6_success_rate REAL NOT NULL DEFAULT 0.5,
    ipv4_success_rate REAL NOT NULL DEFAULT 0.5,
    ipv6_preference TEXT NOT NULL DEFAULT 'auto',
    ipv6_attempts INTEGER NOT NULL DEFAULT 0,
    ipv6_successes INTEGER NOT NULL DEFAULT 0,
    ipv4_attempts INTEGER NOT NULL DEFAULT 0,
    ipv4_successes INTEGER NOT NULL DEFAULT 0,
    switch_count INTEGER NOT NULL DEFAULT 0,
    switch_success_count INTEGER NOT NULL DEFAULT 0,
    last_ipv6_success_at REAL,
    last_ipv6_failure_at REAL,
    last_ipv4_success_at REAL,
    last_ipv4_failure_at REAL
);

-- Fetched pages (content-addressed body lives on disk)
CREATE TABLE IF NOT EXISTS pages (
    id TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    final_url TEXT,
    domain TEXT NOT NULL,
    content_hash TEXT,
    html_path TEXT,
    archive_path TEXT,
    fetched_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pages_domain ON pages(domain);
CREATE INDEX IF NOT EXISTS idx_pages_url ON pages(url);

-- Extracted fragments and claims
CREATE TABLE IF NOT EXISTS fragments (
    id TEXT PRIMARY KEY,
    page_id TEXT NOT NULL,
    text_content TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS claims (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    claim_text TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_claims_task ON claims(task_id);

-- Evidence graph
CREATE TABLE IF NOT EXISTS edges (
    id TEXT PRIMARY KEY,
    source_type TEXT NOT NULL,
    source_id TEXT NOT NULL,
    target_type TEXT NOT NULL,
    target_id TEXT NOT NULL,
    relation TEXT NOT NULL,
    nli_confidence REAL,
    source_domain TEXT,
    created_at TEXT
);

-- At most one NLI edge per (fragment -> claim); origin/cites unconstrained
CREATE UNIQUE INDEX IF NOT EXISTS idx_edges_nli_unique
    ON edges(source_type, source_id, target_type, target_id)
    WHERE relation IN ('supports', 'refutes', 'neutral');

CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_type, target_id);

-- Embedding vectors (f32 little-endian blobs)
CREATE TABLE IF NOT EXISTS embeddings (
    id TEXT PRIMARY KEY,
    target_type TEXT NOT NULL,
    target_id TEXT NOT NULL,
    model_id TEXT NOT NULL,
    embedding_blob BLOB NOT NULL,
    dimension INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_embeddings_target ON embeddings(target_type, model_id);

-- Citation papers discovered by target execution
CREATE TABLE IF NOT EXISTS papers (
    id TEXT PRIMARY KEY,
    doi TEXT,
    title TEXT,
    abstract TEXT,
    year INTEGER,
    url TEXT,
    page_id TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_papers_doi ON papers(doi);

-- Human-intervention queue for challenge pages held open in the browser
CREATE TABLE IF NOT EXISTS auth_queue (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    job_id TEXT,
    url TEXT NOT NULL,
    domain TEXT NOT NULL,
    auth_type TEXT NOT NULL,
    estimated_effort TEXT NOT NULL,
    priority TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    outcome TEXT,
    created_at TEXT NOT NULL,
    resolved_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_auth_queue_task ON auth_queue(task_id, status);
CREATE INDEX IF NOT EXISTS idx_auth_queue_domain ON auth_queue(domain, status);
"#;

/// Open (or create) the database at `path` and apply the schema.
pub async fn open_pool(path: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .context("failed to open SQLite database")?;

    apply_schema(&pool).await?;
    Ok(pool)
}

/// In-memory pool for tests. A single connection keeps the `:memory:`
/// database alive for the pool's lifetime.
pub async fn open_memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(":memory:")
        .shared_cache(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .context("failed to open in-memory SQLite database")?;

    apply_schema(&pool).await?;
    Ok(pool)
}

async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(SCHEMA_SQL)
        .execute(pool)
        .await
        .context("failed to initialize database schema")?;
    Ok(())
}

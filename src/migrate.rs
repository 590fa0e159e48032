use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Schema, one statement per entry. Every statement is idempotent.
const SCHEMA: &[&str] = &[
    // Pipeline bookkeeping
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        document_ref TEXT NOT NULL UNIQUE,
        declared_type TEXT,
        doc_type TEXT NOT NULL DEFAULT 'unknown',
        storage_ref TEXT NOT NULL,
        current_attempt_id TEXT,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        uploaded_at INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS attempts (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        attempt_no INTEGER NOT NULL,
        state TEXT NOT NULL,
        failure_reason TEXT,
        retryable INTEGER NOT NULL DEFAULT 0,
        started_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE(document_id, attempt_no),
        FOREIGN KEY (document_id) REFERENCES documents(id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_attempts_state ON attempts(state)",
    r#"
    CREATE TABLE IF NOT EXISTS leases (
        document_id TEXT PRIMARY KEY,
        attempt_id TEXT NOT NULL,
        holder TEXT NOT NULL,
        expires_at_ms INTEGER NOT NULL
    )
    "#,
    // Stage artifacts, keyed by (document, attempt, artifact key)
    r#"
    CREATE TABLE IF NOT EXISTS raw_extractions (
        document_id TEXT NOT NULL,
        attempt_id TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (document_id, attempt_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS drafts (
        document_id TEXT NOT NULL,
        attempt_id TEXT NOT NULL,
        doc_type TEXT NOT NULL,
        draft_json TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (document_id, attempt_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        document_id TEXT NOT NULL,
        attempt_id TEXT NOT NULL,
        chunk_index INTEGER NOT NULL,
        heading TEXT,
        start_offset INTEGER NOT NULL,
        end_offset INTEGER NOT NULL,
        text TEXT NOT NULL,
        hash TEXT NOT NULL,
        PRIMARY KEY (document_id, attempt_id, chunk_index)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS summaries (
        document_id TEXT NOT NULL,
        attempt_id TEXT NOT NULL,
        text TEXT NOT NULL,
        hash TEXT NOT NULL,
        PRIMARY KEY (document_id, attempt_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS embeddings (
        document_id TEXT NOT NULL,
        attempt_id TEXT NOT NULL,
        subject TEXT NOT NULL,
        model TEXT NOT NULL,
        text_hash TEXT NOT NULL,
        dims INTEGER NOT NULL,
        vector BLOB,
        failure TEXT,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (document_id, attempt_id, subject, model)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_embeddings_reuse ON embeddings(document_id, model, text_hash)",
    r#"
    CREATE TABLE IF NOT EXISTS validation_results (
        document_id TEXT NOT NULL,
        attempt_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        rule_id TEXT NOT NULL,
        severity TEXT NOT NULL,
        subject TEXT NOT NULL,
        message TEXT NOT NULL,
        evaluated_at TEXT NOT NULL,
        PRIMARY KEY (document_id, attempt_id, seq)
    )
    "#,
    // Reference entities
    r#"
    CREATE TABLE IF NOT EXISTS vendors (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        aliases_json TEXT NOT NULL DEFAULT '[]',
        active INTEGER NOT NULL DEFAULT 1
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sows (
        id TEXT PRIMARY KEY,
        vendor_id TEXT NOT NULL,
        sow_number TEXT,
        title TEXT NOT NULL,
        total_value INTEGER,
        start_date TEXT,
        end_date TEXT,
        active INTEGER NOT NULL DEFAULT 1,
        source_document_id TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS milestones (
        id TEXT PRIMARY KEY,
        sow_id TEXT NOT NULL,
        name TEXT NOT NULL,
        description TEXT,
        budget INTEGER,
        due_date TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS deliverables (
        id TEXT PRIMARY KEY,
        sow_id TEXT NOT NULL,
        milestone_id TEXT,
        name TEXT NOT NULL,
        description TEXT,
        amount INTEGER,
        due_date TEXT
    )
    "#,
    // Accepted invoices
    r#"
    CREATE TABLE IF NOT EXISTS invoices (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL UNIQUE,
        attempt_id TEXT NOT NULL,
        vendor_id TEXT,
        sow_id TEXT,
        invoice_number TEXT,
        issue_date TEXT,
        due_date TEXT,
        subtotal INTEGER,
        tax INTEGER,
        total INTEGER,
        currency TEXT,
        accepted_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS invoice_line_items (
        invoice_id TEXT NOT NULL,
        line_no INTEGER NOT NULL,
        description TEXT,
        quantity REAL,
        unit_price INTEGER,
        amount INTEGER,
        milestone_id TEXT,
        deliverable_id TEXT,
        PRIMARY KEY (invoice_id, line_no)
    )
    "#,
];

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table on an open pool.
pub async fn apply(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.db.path = tmp.path().join("data").join("paperline.sqlite");

        run_migrations(&config).await.unwrap();
        run_migrations(&config).await.unwrap();

        let pool = db::connect(&config).await.unwrap();
        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('documents', 'attempts', 'leases', 'invoice_line_items')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(tables, 4);
    }
}

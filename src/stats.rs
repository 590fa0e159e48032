//! Pipeline statistics.
//!
//! Counts documents by the state of their current attempt, validation
//! findings by severity, and embedding coverage. Used by `paperline stats`.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::state::ProcessingState;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub documents: i64,
    /// `(state, count)` for every state, in pipeline order.
    pub by_state: Vec<(ProcessingState, i64)>,
    pub errors: i64,
    pub warnings: i64,
    pub infos: i64,
    pub embeddings: i64,
    pub failed_embeddings: i64,
    pub last_activity: Option<i64>,
}

impl PipelineStats {
    pub fn count(&self, state: ProcessingState) -> i64 {
        self.by_state
            .iter()
            .find(|(s, _)| *s == state)
            .map_or(0, |(_, n)| *n)
    }
}

/// Gather statistics over the current attempt of every document.
pub async fn collect(pool: &SqlitePool) -> Result<PipelineStats> {
    let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(pool)
        .await?;

    let state_rows = sqlx::query(
        r#"
        SELECT a.state, COUNT(*) AS n
        FROM documents d
        JOIN attempts a ON a.id = d.current_attempt_id
        GROUP BY a.state
        "#,
    )
    .fetch_all(pool)
    .await?;

    let by_state = ProcessingState::ALL
        .iter()
        .map(|state| {
            let n = state_rows
                .iter()
                .find(|row| row.get::<String, _>("state") == state.as_str())
                .map_or(0, |row| row.get::<i64, _>("n"));
            (*state, n)
        })
        .collect();

    let severity_rows = sqlx::query(
        r#"
        SELECT v.severity, COUNT(*) AS n
        FROM validation_results v
        JOIN documents d ON d.current_attempt_id = v.attempt_id
        GROUP BY v.severity
        "#,
    )
    .fetch_all(pool)
    .await?;
    let severity = |label: &str| {
        severity_rows
            .iter()
            .find(|row| row.get::<String, _>("severity") == label)
            .map_or(0, |row| row.get::<i64, _>("n"))
    };

    let embedding_row = sqlx::query(
        r#"
        SELECT COUNT(*) AS total, COALESCE(SUM(e.vector IS NULL), 0) AS failed
        FROM embeddings e
        JOIN documents d ON d.current_attempt_id = e.attempt_id
        "#,
    )
    .fetch_one(pool)
    .await?;

    let last_activity: Option<i64> = sqlx::query_scalar("SELECT MAX(updated_at) FROM documents")
        .fetch_one(pool)
        .await?;

    Ok(PipelineStats {
        documents,
        by_state,
        errors: severity("error"),
        warnings: severity("warning"),
        infos: severity("info"),
        embeddings: embedding_row.get("total"),
        failed_embeddings: embedding_row.get("failed"),
        last_activity,
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = collect(&pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Paperline — Pipeline Stats");
    println!("==========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Documents:   {}", stats.documents);
    println!(
        "  Last update: {}",
        stats
            .last_activity
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string())
    );
    println!();
    println!("  By state:");
    for (state, n) in stats.by_state.iter().filter(|(_, n)| *n > 0) {
        println!("  {:<16} {:>6}", state.as_str(), n);
    }
    println!();
    println!(
        "  Findings:    {} errors, {} warnings, {} info",
        stats.errors, stats.warnings, stats.infos
    );
    println!(
        "  Embeddings:  {} stored, {} flagged without vector",
        stats.embeddings, stats.failed_embeddings
    );
    println!();

    pool.close().await;
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

//! Reference entities: vendors, SOWs, milestones, deliverables.
//!
//! The rule engine never queries the store. The orchestrator loads a
//! [`ReferenceSnapshot`] before validation and the engine reads only that,
//! which keeps evaluation pure and testable with in-memory fixtures.
//!
//! Reference rows come from two places: `paperline reference import <file>`
//! (see [`import_file`]) and accepted SOW documents, which the gateway
//! promotes into the same tables.

use anyhow::Context;
use chrono::NaiveDate;
use serde::Deserialize;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::path::Path;

use crate::error::{PipelineError, Result};
use crate::models::{Amount, Deliverable, Milestone, Sow, Vendor};

/// Legal-form suffixes ignored when comparing vendor names.
const NAME_NOISE: &[&str] = &[
    "the", "inc", "incorporated", "llc", "ltd", "limited", "corp", "corporation", "co",
    "company", "gmbh", "plc", "sa", "ag", "bv", "pty",
];

/// `"The Acme Consulting, LLC"` → `"acmeconsulting"`.
pub fn vendor_key(name: &str) -> String {
    let lowered = name.to_lowercase();
    let tokens: Vec<String> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    let significant: String = tokens
        .iter()
        .filter(|t| !NAME_NOISE.contains(&t.as_str()))
        .map(String::as_str)
        .collect();
    if significant.is_empty() {
        tokens.concat()
    } else {
        significant
    }
}

fn reference_key(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Read-only view of the reference tables at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceSnapshot {
    pub vendors: Vec<Vendor>,
    pub sows: Vec<Sow>,
    pub milestones: Vec<Milestone>,
    pub deliverables: Vec<Deliverable>,
}

impl ReferenceSnapshot {
    /// Match an extracted vendor name against vendor names and aliases.
    pub fn resolve_vendor(&self, name: &str) -> Option<&Vendor> {
        let key = vendor_key(name);
        if key.is_empty() {
            return None;
        }
        self.vendors.iter().find(|v| {
            vendor_key(&v.name) == key || v.aliases.iter().any(|a| vendor_key(a) == key)
        })
    }

    pub fn vendor(&self, id: &str) -> Option<&Vendor> {
        self.vendors.iter().find(|v| v.id == id)
    }

    pub fn active_sows<'a>(&'a self, vendor_id: &'a str) -> impl Iterator<Item = &'a Sow> + 'a {
        self.sows
            .iter()
            .filter(move |s| s.active && s.vendor_id == vendor_id)
    }

    /// Look a SOW up by its number or id, ignoring punctuation and case.
    pub fn find_sow(&self, reference: &str) -> Option<&Sow> {
        let key = reference_key(reference);
        if key.is_empty() {
            return None;
        }
        self.sows.iter().find(|s| {
            reference_key(&s.id) == key
                || s.sow_number.as_deref().map(reference_key).as_deref() == Some(key.as_str())
        })
    }

    pub fn milestones_of<'a>(&'a self, sow_id: &'a str) -> impl Iterator<Item = &'a Milestone> + 'a {
        self.milestones.iter().filter(move |m| m.sow_id == sow_id)
    }

    pub fn deliverables_of<'a>(
        &'a self,
        sow_id: &'a str,
    ) -> impl Iterator<Item = &'a Deliverable> + 'a {
        self.deliverables.iter().filter(move |d| d.sow_id == sow_id)
    }
}

// ============ Loading ============

fn parse_date_column(value: Option<String>) -> Result<Option<NaiveDate>> {
    value
        .map(|s| {
            s.parse::<NaiveDate>()
                .map_err(|_| PipelineError::Corrupt(format!("bad date column: {}", s)))
        })
        .transpose()
}

fn format_date(date: Option<NaiveDate>) -> Option<String> {
    date.map(|d| d.format("%Y-%m-%d").to_string())
}

/// Load every reference row, ordered by id.
pub async fn load_snapshot(pool: &SqlitePool) -> Result<ReferenceSnapshot> {
    let mut snapshot = ReferenceSnapshot::default();

    let rows = sqlx::query("SELECT id, name, aliases_json, active FROM vendors ORDER BY id")
        .fetch_all(pool)
        .await?;
    for row in rows {
        let aliases_json: String = row.get("aliases_json");
        snapshot.vendors.push(Vendor {
            id: row.get("id"),
            name: row.get("name"),
            aliases: serde_json::from_str(&aliases_json)?,
            active: row.get::<i64, _>("active") != 0,
        });
    }

    let rows = sqlx::query(
        "SELECT id, vendor_id, sow_number, title, total_value, start_date, end_date, active
         FROM sows ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    for row in rows {
        snapshot.sows.push(Sow {
            id: row.get("id"),
            vendor_id: row.get("vendor_id"),
            sow_number: row.get("sow_number"),
            title: row.get("title"),
            total_value: row.get::<Option<i64>, _>("total_value").map(Amount),
            start_date: parse_date_column(row.get("start_date"))?,
            end_date: parse_date_column(row.get("end_date"))?,
            active: row.get::<i64, _>("active") != 0,
        });
    }

    let rows = sqlx::query(
        "SELECT id, sow_id, name, description, budget, due_date FROM milestones ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    for row in rows {
        snapshot.milestones.push(Milestone {
            id: row.get("id"),
            sow_id: row.get("sow_id"),
            name: row.get("name"),
            description: row.get("description"),
            budget: row.get::<Option<i64>, _>("budget").map(Amount),
            due_date: parse_date_column(row.get("due_date"))?,
        });
    }

    let rows = sqlx::query(
        "SELECT id, sow_id, milestone_id, name, description, amount, due_date
         FROM deliverables ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    for row in rows {
        snapshot.deliverables.push(Deliverable {
            id: row.get("id"),
            sow_id: row.get("sow_id"),
            milestone_id: row.get("milestone_id"),
            name: row.get("name"),
            description: row.get("description"),
            amount: row.get::<Option<i64>, _>("amount").map(Amount),
            due_date: parse_date_column(row.get("due_date"))?,
        });
    }

    Ok(snapshot)
}

// ============ Upserts ============

pub async fn upsert_vendor(conn: &mut SqliteConnection, vendor: &Vendor) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO vendors (id, name, aliases_json, active)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            aliases_json = excluded.aliases_json,
            active = excluded.active
        "#,
    )
    .bind(&vendor.id)
    .bind(&vendor.name)
    .bind(serde_json::to_string(&vendor.aliases)?)
    .bind(vendor.active as i64)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn upsert_sow(
    conn: &mut SqliteConnection,
    sow: &Sow,
    source_document_id: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sows (id, vendor_id, sow_number, title, total_value, start_date, end_date, active, source_document_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            vendor_id = excluded.vendor_id,
            sow_number = excluded.sow_number,
            title = excluded.title,
            total_value = excluded.total_value,
            start_date = excluded.start_date,
            end_date = excluded.end_date,
            active = excluded.active,
            source_document_id = excluded.source_document_id
        "#,
    )
    .bind(&sow.id)
    .bind(&sow.vendor_id)
    .bind(&sow.sow_number)
    .bind(&sow.title)
    .bind(sow.total_value.map(|a| a.cents()))
    .bind(format_date(sow.start_date))
    .bind(format_date(sow.end_date))
    .bind(sow.active as i64)
    .bind(source_document_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn upsert_milestone(conn: &mut SqliteConnection, milestone: &Milestone) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO milestones (id, sow_id, name, description, budget, due_date)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            sow_id = excluded.sow_id,
            name = excluded.name,
            description = excluded.description,
            budget = excluded.budget,
            due_date = excluded.due_date
        "#,
    )
    .bind(&milestone.id)
    .bind(&milestone.sow_id)
    .bind(&milestone.name)
    .bind(&milestone.description)
    .bind(milestone.budget.map(|b| b.cents()))
    .bind(format_date(milestone.due_date))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn upsert_deliverable(
    conn: &mut SqliteConnection,
    deliverable: &Deliverable,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO deliverables (id, sow_id, milestone_id, name, description, amount, due_date)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            sow_id = excluded.sow_id,
            milestone_id = excluded.milestone_id,
            name = excluded.name,
            description = excluded.description,
            amount = excluded.amount,
            due_date = excluded.due_date
        "#,
    )
    .bind(&deliverable.id)
    .bind(&deliverable.sow_id)
    .bind(&deliverable.milestone_id)
    .bind(&deliverable.name)
    .bind(&deliverable.description)
    .bind(deliverable.amount.map(|a| a.cents()))
    .bind(format_date(deliverable.due_date))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// ============ Import file ============

/// Seed file for `paperline reference import`. Amounts are in major units;
/// dates are quoted `"YYYY-MM-DD"` strings.
#[derive(Debug, Deserialize, Default)]
pub struct ReferenceFile {
    #[serde(default)]
    pub vendors: Vec<Vendor>,
    #[serde(default)]
    pub sows: Vec<SowEntry>,
    #[serde(default)]
    pub milestones: Vec<MilestoneEntry>,
    #[serde(default)]
    pub deliverables: Vec<DeliverableEntry>,
}

#[derive(Debug, Deserialize)]
pub struct SowEntry {
    pub id: String,
    pub vendor_id: String,
    #[serde(default)]
    pub sow_number: Option<String>,
    pub title: String,
    #[serde(default)]
    pub total_value: Option<f64>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default = "default_active")]
    pub active: bool,
}

#[derive(Debug, Deserialize)]
pub struct MilestoneEntry {
    pub id: String,
    pub sow_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub budget: Option<f64>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct DeliverableEntry {
    pub id: String,
    pub sow_id: String,
    #[serde(default)]
    pub milestone_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
}

fn default_active() -> bool {
    true
}

impl From<SowEntry> for Sow {
    fn from(e: SowEntry) -> Self {
        Sow {
            id: e.id,
            vendor_id: e.vendor_id,
            sow_number: e.sow_number,
            title: e.title,
            total_value: e.total_value.map(Amount::from_major),
            start_date: e.start_date,
            end_date: e.end_date,
            active: e.active,
        }
    }
}

impl From<MilestoneEntry> for Milestone {
    fn from(e: MilestoneEntry) -> Self {
        Milestone {
            id: e.id,
            sow_id: e.sow_id,
            name: e.name,
            description: e.description,
            budget: e.budget.map(Amount::from_major),
            due_date: e.due_date,
        }
    }
}

impl From<DeliverableEntry> for Deliverable {
    fn from(e: DeliverableEntry) -> Self {
        Deliverable {
            id: e.id,
            sow_id: e.sow_id,
            milestone_id: e.milestone_id,
            name: e.name,
            description: e.description,
            amount: e.amount.map(Amount::from_major),
            due_date: e.due_date,
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub vendors: usize,
    pub sows: usize,
    pub milestones: usize,
    pub deliverables: usize,
}

pub fn parse_reference_file(content: &str) -> anyhow::Result<ReferenceFile> {
    let file: ReferenceFile = toml::from_str(content).context("Failed to parse reference file")?;

    for sow in &file.sows {
        if !file.vendors.iter().any(|v| v.id == sow.vendor_id) {
            tracing::debug!(sow = %sow.id, vendor = %sow.vendor_id, "SOW vendor not in this file");
        }
    }
    if let Some(m) = file.milestones.iter().find(|m| m.budget.is_some_and(|b| b < 0.0)) {
        anyhow::bail!("milestone {} has a negative budget", m.id);
    }
    Ok(file)
}

/// Upsert every entity in a reference file in one transaction.
pub async fn import_file(pool: &SqlitePool, path: &Path) -> anyhow::Result<ImportSummary> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read reference file: {}", path.display()))?;
    let file = parse_reference_file(&content)?;
    import(pool, file).await
}

pub async fn import(pool: &SqlitePool, file: ReferenceFile) -> anyhow::Result<ImportSummary> {
    let mut summary = ImportSummary::default();
    let mut tx = pool.begin().await?;

    for vendor in &file.vendors {
        upsert_vendor(&mut tx, vendor).await?;
        summary.vendors += 1;
    }
    for entry in file.sows {
        upsert_sow(&mut tx, &entry.into(), None).await?;
        summary.sows += 1;
    }
    for entry in file.milestones {
        upsert_milestone(&mut tx, &entry.into()).await?;
        summary.milestones += 1;
    }
    for entry in file.deliverables {
        upsert_deliverable(&mut tx, &entry.into()).await?;
        summary.deliverables += 1;
    }

    tx.commit().await?;
    tracing::info!(
        vendors = summary.vendors,
        sows = summary.sows,
        milestones = summary.milestones,
        deliverables = summary.deliverables,
        "reference data imported"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use tempfile::TempDir;

    const SEED: &str = r#"
[[vendors]]
id = "v-acme"
name = "Acme Consulting LLC"
aliases = ["ACME"]

[[sows]]
id = "sow-1"
vendor_id = "v-acme"
sow_number = "SOW-2024-001"
title = "Platform build"
total_value = 1200.00
start_date = "2024-01-01"

[[milestones]]
id = "m-1"
sow_id = "sow-1"
name = "Discovery"
budget = 400.00

[[deliverables]]
id = "d-1"
sow_id = "sow-1"
milestone_id = "m-1"
name = "Requirements document"
"#;

    #[test]
    fn test_vendor_key_ignores_legal_suffixes() {
        assert_eq!(vendor_key("Acme Consulting, LLC"), "acmeconsulting");
        assert_eq!(vendor_key("The ACME Consulting Inc."), "acmeconsulting");
        assert_eq!(vendor_key("LLC"), "llc");
    }

    #[test]
    fn test_resolve_vendor_by_alias() {
        let file = parse_reference_file(SEED).unwrap();
        let snapshot = ReferenceSnapshot {
            vendors: file.vendors,
            ..Default::default()
        };
        assert_eq!(snapshot.resolve_vendor("Acme Inc").unwrap().id, "v-acme");
        assert_eq!(
            snapshot.resolve_vendor("acme consulting").unwrap().id,
            "v-acme"
        );
        assert!(snapshot.resolve_vendor("Globex").is_none());
        assert!(snapshot.resolve_vendor("  ").is_none());
    }

    #[test]
    fn test_rejects_negative_budget() {
        let bad = "[[milestones]]\nid = \"m\"\nsow_id = \"s\"\nname = \"x\"\nbudget = -1.0\n";
        assert!(parse_reference_file(bad).is_err());
    }

    #[tokio::test]
    async fn test_import_then_load_snapshot() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("ref.sqlite")).await.unwrap();
        migrate::apply(&pool).await.unwrap();

        let path = tmp.path().join("reference.toml");
        std::fs::write(&path, SEED).unwrap();
        let summary = import_file(&pool, &path).await.unwrap();
        assert_eq!(
            summary,
            ImportSummary {
                vendors: 1,
                sows: 1,
                milestones: 1,
                deliverables: 1
            }
        );
        // Re-import upserts rather than duplicating.
        import_file(&pool, &path).await.unwrap();

        let snapshot = load_snapshot(&pool).await.unwrap();
        assert_eq!(snapshot.vendors.len(), 1);
        assert_eq!(snapshot.vendors[0].aliases, vec!["ACME"]);
        assert_eq!(snapshot.milestones[0].budget, Some(Amount(40_000)));
        assert_eq!(
            snapshot.sows[0].start_date,
            NaiveDate::from_ymd_opt(2024, 1, 1)
        );
        assert_eq!(snapshot.find_sow("sow 2024 001").unwrap().id, "sow-1");
        assert_eq!(snapshot.active_sows("v-acme").count(), 1);
        assert_eq!(snapshot.deliverables_of("sow-1").count(), 1);
    }
}

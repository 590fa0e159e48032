//! Validation rule engine.
//!
//! Runs every applicable rule over a [`NormalizedDraft`] and a
//! [`ReferenceSnapshot`] and returns all findings; nothing short-circuits.
//! The engine is a pure function of its [`EvaluationInput`]: the evaluation
//! timestamp is an input, reference data comes from the snapshot, and results
//! are sorted before they are returned.
//!
//! | Rule id | Severity |
//! |---------|----------|
//! | `structural.document_type` | error when the type could not be determined |
//! | `structural.required` | error per missing required field |
//! | `structural.line_items` | warning for an invoice without line items or a SOW without milestones |
//! | `confidence.threshold` | warning below threshold, error for critical fields |
//! | `referential.vendor` | error when the vendor does not resolve, warning when inactive |
//! | `referential.sow` | warning for an unknown SOW reference, error for another vendor's SOW |
//! | `consistency.milestone_budget` | error when a line item exceeds its milestone's budget (none means uncapped) |
//! | `consistency.unmatched_line_item` | warning for an unmatched line item above the threshold |
//! | `consistency.arithmetic` | warning when totals do not add up |
//! | `consistency.sow_budget` | error when SOW milestones exceed the SOW total |
//! | `embedding.coverage` | warning per embedding stored without a vector |

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use crate::config::ValidationConfig;
use crate::draft::{InvoiceDraft, LineItemDraft, NormalizedDraft, SowDraft};
use crate::models::{
    Amount, Deliverable, DocumentType, Milestone, Severity, ValidationResult, ValidationSummary,
};
use crate::reference::ReferenceSnapshot;

const INVOICE_REQUIRED: &[&str] = &["invoiceNumber", "vendorName", "total", "dueDate"];
const SOW_REQUIRED: &[&str] = &["vendorName", "title"];

const STOPWORDS: &[&str] = &["the", "and", "of", "for", "to", "in", "on", "with", "an"];

pub struct EvaluationInput<'a> {
    pub draft: &'a NormalizedDraft,
    pub reference: &'a ReferenceSnapshot,
    /// Subject keys (`chunk:N`, `summary`) whose embedding was stored without a vector.
    pub failed_embeddings: &'a [String],
    pub evaluated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchBasis {
    Hint,
    Description,
    Amount,
}

/// An invoice line item linked to a reference milestone and/or deliverable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineItemMatch {
    pub line_no: usize,
    pub sow_id: String,
    pub milestone_id: Option<String>,
    pub deliverable_id: Option<String>,
    pub basis: MatchBasis,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub results: Vec<ValidationResult>,
    pub matches: Vec<LineItemMatch>,
    pub vendor_id: Option<String>,
    pub sow_id: Option<String>,
}

impl Evaluation {
    pub fn has_errors(&self) -> bool {
        self.results.iter().any(|r| r.severity == Severity::Error)
    }

    pub fn summary(&self) -> ValidationSummary {
        summarize(&self.results)
    }
}

pub fn summarize(results: &[ValidationResult]) -> ValidationSummary {
    let mut summary = ValidationSummary::default();
    for r in results {
        match r.severity {
            Severity::Error => summary.errors += 1,
            Severity::Warning => summary.warnings += 1,
            Severity::Info => summary.infos += 1,
        }
    }
    summary
}

/// Severity descending, then subject, rule id, message.
pub fn sort_results(results: &mut [ValidationResult]) {
    results.sort_by(|a, b| {
        (Reverse(a.severity), &a.subject, &a.rule_id, &a.message).cmp(&(
            Reverse(b.severity),
            &b.subject,
            &b.rule_id,
            &b.message,
        ))
    });
}

/// Collects findings for one evaluation.
struct Findings {
    at: DateTime<Utc>,
    results: Vec<ValidationResult>,
}

impl Findings {
    fn push(&mut self, rule_id: &str, severity: Severity, subject: impl Into<String>, message: String) {
        self.results.push(ValidationResult {
            rule_id: rule_id.to_string(),
            severity,
            subject: subject.into(),
            message,
            evaluated_at: self.at,
        });
    }
}

pub struct RuleEngine {
    config: ValidationConfig,
}

impl RuleEngine {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn evaluate(&self, input: &EvaluationInput<'_>) -> Evaluation {
        let mut findings = Findings {
            at: input.evaluated_at,
            results: Vec::new(),
        };
        let mut evaluation = Evaluation::default();

        self.check_confidence(input.draft, &mut findings);
        self.check_embeddings(input.failed_embeddings, &mut findings);

        match (input.draft.doc_type, input.draft.invoice(), input.draft.sow()) {
            (DocumentType::Invoice, Some(invoice), _) => {
                self.check_required(INVOICE_REQUIRED, input.draft, &mut findings);
                self.check_invoice(invoice, input.reference, &mut findings, &mut evaluation);
            }
            (DocumentType::Sow, _, Some(sow)) => {
                self.check_required(SOW_REQUIRED, input.draft, &mut findings);
                self.check_sow(sow, input.reference, &mut findings, &mut evaluation);
            }
            _ => findings.push(
                "structural.document_type",
                Severity::Error,
                "documentType",
                "document type could not be determined".to_string(),
            ),
        }

        sort_results(&mut findings.results);
        evaluation.results = findings.results;
        evaluation
    }

    // ============ Structural ============

    fn check_required(&self, required: &[&str], draft: &NormalizedDraft, findings: &mut Findings) {
        let views = draft.field_views();
        for name in required {
            let Some(view) = views.iter().find(|v| v.name == *name) else {
                continue;
            };
            if view.present {
                continue;
            }
            let message = if view.extracted {
                format!("required field {} could not be read", name)
            } else {
                format!("required field {} is missing", name)
            };
            findings.push("structural.required", Severity::Error, *name, message);
        }
    }

    // ============ Confidence ============

    fn check_confidence(&self, draft: &NormalizedDraft, findings: &mut Findings) {
        let threshold = self.config.confidence_threshold;
        for view in draft.field_views() {
            if !view.extracted || view.confidence >= threshold {
                continue;
            }
            let severity = if self.config.is_critical(&view.name) {
                Severity::Error
            } else {
                Severity::Warning
            };
            findings.push(
                "confidence.threshold",
                severity,
                view.name.clone(),
                format!(
                    "{} extracted with confidence {:.2}, below {:.2}",
                    view.name, view.confidence, threshold
                ),
            );
        }
    }

    fn check_embeddings(&self, failed: &[String], findings: &mut Findings) {
        let unique: BTreeSet<&String> = failed.iter().collect();
        for subject in unique {
            findings.push(
                "embedding.coverage",
                Severity::Warning,
                format!("embedding:{}", subject),
                format!("no embedding vector stored for {}", subject),
            );
        }
    }

    // ============ Invoices ============

    fn check_invoice(
        &self,
        invoice: &InvoiceDraft,
        reference: &ReferenceSnapshot,
        findings: &mut Findings,
        evaluation: &mut Evaluation,
    ) {
        if invoice.line_items.is_empty() {
            findings.push(
                "structural.line_items",
                Severity::Warning,
                "lineItems",
                "invoice has no line items".to_string(),
            );
        }
        self.check_invoice_arithmetic(invoice, findings);

        let Some(vendor_name) = invoice.vendor_name.value.as_deref() else {
            return;
        };
        let Some(vendor) = reference.resolve_vendor(vendor_name) else {
            findings.push(
                "referential.vendor",
                Severity::Error,
                "vendorName",
                format!("vendor '{}' does not match any known vendor", vendor_name),
            );
            return;
        };
        evaluation.vendor_id = Some(vendor.id.clone());
        if !vendor.active {
            findings.push(
                "referential.vendor",
                Severity::Warning,
                "vendorName",
                format!("vendor '{}' is inactive", vendor.name),
            );
        }

        let mut sow_ids: Vec<&str> = reference.active_sows(&vendor.id).map(|s| s.id.as_str()).collect();
        if let Some(sow_ref) = invoice.sow_reference.value.as_deref() {
            match reference.find_sow(sow_ref) {
                None => findings.push(
                    "referential.sow",
                    Severity::Warning,
                    "sowReference",
                    format!("SOW reference '{}' does not match any known SOW", sow_ref),
                ),
                Some(sow) if sow.vendor_id != vendor.id => findings.push(
                    "referential.sow",
                    Severity::Error,
                    "sowReference",
                    format!(
                        "SOW '{}' belongs to a different vendor than '{}'",
                        sow_ref, vendor.name
                    ),
                ),
                Some(sow) => {
                    evaluation.sow_id = Some(sow.id.clone());
                    sow_ids = vec![sow.id.as_str()];
                }
            }
        }

        let milestones: Vec<&Milestone> = sow_ids
            .iter()
            .flat_map(|id| reference.milestones_of(id))
            .collect();
        let deliverables: Vec<&Deliverable> = sow_ids
            .iter()
            .flat_map(|id| reference.deliverables_of(id))
            .collect();
        self.check_line_items(invoice, &milestones, &deliverables, findings, evaluation);
    }

    fn check_invoice_arithmetic(&self, invoice: &InvoiceDraft, findings: &mut Findings) {
        let tolerance = self.config.amount_tolerance().cents();
        let differs = |a: Amount, b: Amount| (a.cents() - b.cents()).abs() > tolerance;

        if let (Some(subtotal), Some(tax), Some(total)) =
            (invoice.subtotal.value, invoice.tax.value, invoice.total.value)
        {
            if differs(subtotal + tax, total) {
                findings.push(
                    "consistency.arithmetic",
                    Severity::Warning,
                    "total",
                    format!(
                        "subtotal {} plus tax {} does not equal total {}",
                        subtotal, tax, total
                    ),
                );
            }
        }

        if invoice.line_items.is_empty()
            || invoice.line_items.iter().any(|l| l.amount.value.is_none())
        {
            return;
        }
        let lines: Amount = invoice.line_items.iter().filter_map(|l| l.amount.value).sum();
        let (subject, expected) = match (invoice.subtotal.value, invoice.total.value) {
            (Some(subtotal), _) => ("subtotal", subtotal),
            (None, Some(total)) if invoice.tax.value.is_none() => ("total", total),
            _ => return,
        };
        if differs(lines, expected) {
            findings.push(
                "consistency.arithmetic",
                Severity::Warning,
                subject,
                format!("line items sum to {}, but {} is {}", lines, subject, expected),
            );
        }
    }

    fn check_line_items(
        &self,
        invoice: &InvoiceDraft,
        milestones: &[&Milestone],
        deliverables: &[&Deliverable],
        findings: &mut Findings,
        evaluation: &mut Evaluation,
    ) {
        let tolerance = self.config.amount_tolerance();
        let max_budget = milestones.iter().filter_map(|m| m.budget).max();
        let mut billed: BTreeMap<&str, (Amount, bool)> = BTreeMap::new();

        for (i, item) in invoice.line_items.iter().enumerate() {
            let subject = format!("lineItems[{}]", i);
            let Some(amount) = item.amount.value.filter(|a| a.cents() > 0) else {
                continue;
            };

            match self.match_line_item(item, amount, milestones, deliverables) {
                Some(found) => {
                    let milestone = found
                        .milestone_id
                        .as_deref()
                        .and_then(|id| milestones.iter().find(|m| m.id == id));
                    let deliverable = found
                        .deliverable_id
                        .as_deref()
                        .and_then(|id| deliverables.iter().find(|d| d.id == id));

                    let mut over = false;
                    if let Some(m) = milestone {
                        if let Some(budget) = m.budget {
                            if amount.cents() > budget.cents() + tolerance.cents() {
                                over = true;
                                findings.push(
                                    "consistency.milestone_budget",
                                    Severity::Error,
                                    subject.clone(),
                                    format!(
                                        "line {} amount {} exceeds milestone '{}' budget {}",
                                        item.line_no, amount, m.name, budget
                                    ),
                                );
                            }
                        }
                        let entry = billed.entry(m.id.as_str()).or_insert((Amount(0), false));
                        entry.0 = entry.0 + amount;
                        entry.1 |= over;
                    } else if let Some(d) = deliverable {
                        if let Some(cap) = d.amount {
                            if amount.cents() > cap.cents() + tolerance.cents() {
                                findings.push(
                                    "consistency.milestone_budget",
                                    Severity::Error,
                                    subject.clone(),
                                    format!(
                                        "line {} amount {} exceeds deliverable '{}' amount {}",
                                        item.line_no, amount, d.name, cap
                                    ),
                                );
                            }
                        }
                    }
                    evaluation.matches.push(found);
                }
                None => match max_budget {
                    Some(max) if amount.cents() > max.cents() + tolerance.cents() => findings.push(
                        "consistency.milestone_budget",
                        Severity::Error,
                        subject,
                        format!(
                            "line {} amount {} matches no milestone and exceeds every milestone budget (largest {})",
                            item.line_no, amount, max
                        ),
                    ),
                    _ if amount > self.config.unmatched_threshold() => findings.push(
                        "consistency.unmatched_line_item",
                        Severity::Warning,
                        subject,
                        format!(
                            "line {} amount {} matches no milestone or deliverable",
                            item.line_no, amount
                        ),
                    ),
                    _ => {}
                },
            }
        }

        // Several lines can each fit a milestone yet overrun it together.
        for (milestone_id, (sum, already_flagged)) in billed {
            let Some(m) = milestones.iter().find(|m| m.id == milestone_id) else {
                continue;
            };
            let Some(budget) = m.budget else {
                continue;
            };
            if !already_flagged && sum.cents() > budget.cents() + tolerance.cents() {
                findings.push(
                    "consistency.milestone_budget",
                    Severity::Error,
                    format!("milestone:{}", m.id),
                    format!(
                        "line items billed against milestone '{}' total {}, over its budget {}",
                        m.name, sum, budget
                    ),
                );
            }
        }

        if evaluation.sow_id.is_none() {
            let sows: BTreeSet<&str> = evaluation.matches.iter().map(|m| m.sow_id.as_str()).collect();
            if sows.len() == 1 {
                evaluation.sow_id = sows.into_iter().next().map(str::to_string);
            }
        }
    }

    /// Hint first, then description overlap, then exact amount.
    fn match_line_item(
        &self,
        item: &LineItemDraft,
        amount: Amount,
        milestones: &[&Milestone],
        deliverables: &[&Deliverable],
    ) -> Option<LineItemMatch> {
        let line_no = item.line_no;
        let for_milestone = |m: &Milestone, basis| LineItemMatch {
            line_no,
            sow_id: m.sow_id.clone(),
            milestone_id: Some(m.id.clone()),
            deliverable_id: None,
            basis,
        };
        let for_deliverable = |d: &Deliverable, basis| LineItemMatch {
            line_no,
            sow_id: d.sow_id.clone(),
            milestone_id: d.milestone_id.clone(),
            deliverable_id: Some(d.id.clone()),
            basis,
        };

        if let Some(hint) = item.milestone_hint.value.as_deref() {
            let hint = name_key(hint);
            if !hint.is_empty() {
                if let Some(m) = milestones.iter().copied().find(|m| name_key(&m.name) == hint) {
                    return Some(for_milestone(m, MatchBasis::Hint));
                }
                if let Some(d) = deliverables.iter().copied().find(|d| name_key(&d.name) == hint) {
                    return Some(for_deliverable(d, MatchBasis::Hint));
                }
            }
        }

        if let Some(description) = item.description.value.as_deref() {
            let threshold = self.config.description_match_threshold;
            let line_tokens = tokens(description);
            let mut best: Option<(f32, LineItemMatch)> = None;
            let mut consider = |score: f32, candidate: LineItemMatch| {
                if score >= threshold && best.as_ref().map_or(true, |(s, _)| score > *s) {
                    best = Some((score, candidate));
                }
            };
            for &m in milestones {
                let score = similarity(&line_tokens, &m.name, m.description.as_deref());
                consider(score, for_milestone(m, MatchBasis::Description));
            }
            for &d in deliverables {
                let score = similarity(&line_tokens, &d.name, d.description.as_deref());
                consider(score, for_deliverable(d, MatchBasis::Description));
            }
            if let Some((_, found)) = best {
                return Some(found);
            }
        }

        let tolerance = self.config.amount_tolerance().cents();
        let close = |a: Amount| (a.cents() - amount.cents()).abs() <= tolerance;
        if let Some(m) = milestones.iter().copied().find(|m| m.budget.is_some_and(|b| close(b))) {
            return Some(for_milestone(m, MatchBasis::Amount));
        }
        deliverables
            .iter()
            .copied()
            .find(|d| d.amount.is_some_and(|a| close(a)))
            .map(|d| for_deliverable(d, MatchBasis::Amount))
    }

    // ============ SOWs ============

    fn check_sow(
        &self,
        sow: &SowDraft,
        reference: &ReferenceSnapshot,
        findings: &mut Findings,
        evaluation: &mut Evaluation,
    ) {
        if sow.milestones.is_empty() {
            findings.push(
                "structural.line_items",
                Severity::Warning,
                "milestones",
                "statement of work has no milestones".to_string(),
            );
        }

        if let Some(vendor_name) = sow.vendor_name.value.as_deref() {
            match reference.resolve_vendor(vendor_name) {
                Some(vendor) => evaluation.vendor_id = Some(vendor.id.clone()),
                None => findings.push(
                    "referential.vendor",
                    Severity::Error,
                    "vendorName",
                    format!("vendor '{}' does not match any known vendor", vendor_name),
                ),
            }
        }

        let tolerance = self.config.amount_tolerance().cents();
        if let Some(total) = sow.total_value.value {
            let planned: Amount = sow.milestones.iter().filter_map(|m| m.amount.value).sum();
            if planned.cents() > total.cents() + tolerance {
                findings.push(
                    "consistency.sow_budget",
                    Severity::Error,
                    "totalValue",
                    format!(
                        "milestones total {}, over the SOW value {}",
                        planned, total
                    ),
                );
            }
        }
    }
}

fn name_key(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

fn tokens(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2 && !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

/// Best Jaccard overlap of the line tokens with a name, or name + description.
fn similarity(line: &BTreeSet<String>, name: &str, description: Option<&str>) -> f32 {
    let name_tokens = tokens(name);
    let mut score = jaccard(line, &name_tokens);
    if let Some(description) = description {
        let mut combined = name_tokens;
        combined.extend(tokens(description));
        score = score.max(jaccard(line, &combined));
    }
    score
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    let union = a.union(b).count();
    shared as f32 / union as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft::{DraftBody, Field, MilestoneDraft, RawExtractionRef};
    use crate::models::{Sow, Vendor};
    use chrono::{NaiveDate, TimeZone};

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn source() -> RawExtractionRef {
        RawExtractionRef {
            document_id: "doc".into(),
            attempt_id: "att".into(),
        }
    }

    fn line(line_no: usize, description: &str, cents: i64) -> LineItemDraft {
        LineItemDraft {
            line_no,
            description: Field::new(description.to_string(), 0.95, "table[0][1]"),
            amount: Field::new(Amount(cents), 0.95, "table[0][1]"),
            ..Default::default()
        }
    }

    fn invoice(lines: Vec<LineItemDraft>) -> InvoiceDraft {
        let total: Amount = lines.iter().filter_map(|l| l.amount.value).sum();
        InvoiceDraft {
            invoice_number: Field::new("INV-100".to_string(), 0.97, "Invoice No"),
            vendor_name: Field::new("Acme Consulting".to_string(), 0.96, "Vendor"),
            issue_date: Field::new(NaiveDate::from_ymd_opt(2024, 4, 1).unwrap(), 0.9, "Date"),
            due_date: Field::new(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(), 0.9, "Due Date"),
            total: Field::new(total, 0.98, "Total"),
            line_items: lines,
            ..Default::default()
        }
    }

    fn draft(body: DraftBody) -> NormalizedDraft {
        let doc_type = match &body {
            DraftBody::Invoice(_) => DocumentType::Invoice,
            DraftBody::Sow(_) => DocumentType::Sow,
            DraftBody::Unclassified => DocumentType::Unknown,
        };
        NormalizedDraft {
            source: source(),
            doc_type,
            body,
            unmapped: Vec::new(),
        }
    }

    fn milestone(id: &str, name: &str, budget: i64) -> Milestone {
        Milestone {
            id: id.into(),
            sow_id: "sow-1".into(),
            name: name.into(),
            description: None,
            budget: Some(Amount(budget)),
            due_date: None,
        }
    }

    fn reference() -> ReferenceSnapshot {
        ReferenceSnapshot {
            vendors: vec![Vendor {
                id: "v-acme".into(),
                name: "Acme Consulting LLC".into(),
                aliases: vec![],
                active: true,
            }],
            sows: vec![Sow {
                id: "sow-1".into(),
                vendor_id: "v-acme".into(),
                sow_number: Some("SOW-1".into()),
                title: "Platform".into(),
                total_value: Some(Amount(100_000)),
                start_date: None,
                end_date: None,
                active: true,
            }],
            milestones: vec![
                milestone("m-1", "Discovery workshop", 40_000),
                milestone("m-2", "Design review", 35_000),
            ],
            deliverables: vec![],
        }
    }

    fn evaluate(draft: &NormalizedDraft, reference: &ReferenceSnapshot, failed: &[String]) -> Evaluation {
        RuleEngine::new(ValidationConfig::default()).evaluate(&EvaluationInput {
            draft,
            reference,
            failed_embeddings: failed,
            evaluated_at: at(),
        })
    }

    fn errors(evaluation: &Evaluation) -> Vec<&ValidationResult> {
        evaluation
            .results
            .iter()
            .filter(|r| r.severity == Severity::Error)
            .collect()
    }

    #[test]
    fn test_clean_invoice_has_no_findings() {
        let d = draft(DraftBody::Invoice(invoice(vec![
            line(1, "Discovery workshop", 40_000),
            line(2, "Design review", 35_000),
        ])));
        let evaluation = evaluate(&d, &reference(), &[]);
        assert!(evaluation.results.is_empty(), "{:?}", evaluation.results);
        assert_eq!(evaluation.vendor_id.as_deref(), Some("v-acme"));
        assert_eq!(evaluation.sow_id.as_deref(), Some("sow-1"));
        assert_eq!(evaluation.matches.len(), 2);
        assert_eq!(evaluation.matches[0].basis, MatchBasis::Description);
    }

    #[test]
    fn test_line_over_every_milestone_budget_is_one_error() {
        // $1,250 total: $500 unmatched line against milestones capped at $400.
        let d = draft(DraftBody::Invoice(invoice(vec![
            line(1, "Travel and expenses", 50_000),
            line(2, "Discovery workshop", 40_000),
            line(3, "Design review", 35_000),
        ])));
        let evaluation = evaluate(&d, &reference(), &[]);
        let errs = errors(&evaluation);
        assert_eq!(errs.len(), 1, "{:?}", evaluation.results);
        assert_eq!(errs[0].rule_id, "consistency.milestone_budget");
        assert_eq!(errs[0].subject, "lineItems[0]");
        assert!(evaluation.has_errors());
        assert!(!evaluation
            .results
            .iter()
            .any(|r| r.rule_id == "consistency.unmatched_line_item"));
    }

    #[test]
    fn test_matched_line_over_budget() {
        let d = draft(DraftBody::Invoice(invoice(vec![line(1, "Discovery workshop", 45_000)])));
        let evaluation = evaluate(&d, &reference(), &[]);
        let errs = errors(&evaluation);
        assert_eq!(errs.len(), 1);
        assert!(errs[0].message.contains("Discovery workshop"));
    }

    #[test]
    fn test_milestone_without_budget_is_uncapped() {
        let mut reference = reference();
        reference.milestones[0].budget = None;
        let d = draft(DraftBody::Invoice(invoice(vec![
            line(1, "Discovery workshop", 90_000),
            line(2, "Discovery workshop", 20_000),
        ])));
        let evaluation = evaluate(&d, &reference, &[]);
        assert!(errors(&evaluation).is_empty(), "{:?}", evaluation.results);
        assert_eq!(evaluation.matches.len(), 2);
        assert!(evaluation
            .matches
            .iter()
            .all(|m| m.milestone_id.as_deref() == Some("m-1")));
    }

    #[test]
    fn test_unmatched_line_under_budgets_is_warning() {
        let d = draft(DraftBody::Invoice(invoice(vec![line(1, "Misc supplies", 15_000)])));
        let evaluation = evaluate(&d, &reference(), &[]);
        assert!(errors(&evaluation).is_empty());
        assert_eq!(evaluation.results[0].rule_id, "consistency.unmatched_line_item");
        assert_eq!(evaluation.results[0].severity, Severity::Warning);
    }

    #[test]
    fn test_cumulative_overrun_of_milestone() {
        let d = draft(DraftBody::Invoice(invoice(vec![
            line(1, "Discovery workshop day one", 30_000),
            line(2, "Discovery workshop day two", 30_000),
        ])));
        let mut config = ValidationConfig::default();
        config.description_match_threshold = 0.4;
        let evaluation = RuleEngine::new(config).evaluate(&EvaluationInput {
            draft: &d,
            reference: &reference(),
            failed_embeddings: &[],
            evaluated_at: at(),
        });
        let errs = errors(&evaluation);
        assert_eq!(errs.len(), 1, "{:?}", evaluation.results);
        assert_eq!(errs[0].subject, "milestone:m-1");
    }

    #[test]
    fn test_missing_due_date_is_structural_error() {
        let mut inv = invoice(vec![line(1, "Discovery workshop", 40_000)]);
        inv.due_date = Field::missing();
        let evaluation = evaluate(&draft(DraftBody::Invoice(inv)), &reference(), &[]);
        let errs = errors(&evaluation);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].rule_id, "structural.required");
        assert_eq!(errs[0].subject, "dueDate");
    }

    #[test]
    fn test_low_confidence_critical_field_is_error() {
        let mut inv = invoice(vec![line(1, "Discovery workshop", 40_000)]);
        inv.total.confidence = 0.4;
        inv.issue_date.confidence = 0.5;
        let evaluation = evaluate(&draft(DraftBody::Invoice(inv)), &reference(), &[]);
        let by_subject: Vec<(&str, Severity)> = evaluation
            .results
            .iter()
            .map(|r| (r.subject.as_str(), r.severity))
            .collect();
        assert_eq!(
            by_subject,
            vec![("total", Severity::Error), ("issueDate", Severity::Warning)]
        );
    }

    #[test]
    fn test_unknown_vendor_is_error() {
        let mut inv = invoice(vec![]);
        inv.vendor_name = Field::new("Globex".to_string(), 0.99, "Vendor");
        let evaluation = evaluate(&draft(DraftBody::Invoice(inv)), &reference(), &[]);
        assert!(evaluation
            .results
            .iter()
            .any(|r| r.rule_id == "referential.vendor" && r.severity == Severity::Error));
        assert!(evaluation.vendor_id.is_none());
    }

    #[test]
    fn test_failed_embeddings_are_warnings() {
        let d = draft(DraftBody::Invoice(invoice(vec![line(1, "Discovery workshop", 40_000)])));
        let evaluation = evaluate(&d, &reference(), &["chunk:3".to_string()]);
        assert_eq!(evaluation.results.len(), 1);
        assert_eq!(evaluation.results[0].rule_id, "embedding.coverage");
        assert_eq!(evaluation.results[0].severity, Severity::Warning);
        assert!(!evaluation.has_errors());
    }

    #[test]
    fn test_unclassified_document() {
        let evaluation = evaluate(&draft(DraftBody::Unclassified), &reference(), &[]);
        assert_eq!(errors(&evaluation)[0].rule_id, "structural.document_type");
    }

    #[test]
    fn test_sow_milestones_over_total() {
        let sow = SowDraft {
            title: Field::new("Platform".to_string(), 0.9, "Title"),
            vendor_name: Field::new("Acme".to_string(), 0.9, "Vendor"),
            total_value: Field::new(Amount(50_000), 0.9, "Total Value"),
            milestones: vec![
                MilestoneDraft {
                    name: Field::new("One".to_string(), 0.9, "t"),
                    amount: Field::new(Amount(30_000), 0.9, "t"),
                    ..Default::default()
                },
                MilestoneDraft {
                    name: Field::new("Two".to_string(), 0.9, "t"),
                    amount: Field::new(Amount(30_000), 0.9, "t"),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let mut snapshot = reference();
        snapshot.vendors[0].aliases = vec!["Acme".into()];
        let evaluation = evaluate(&draft(DraftBody::Sow(sow)), &snapshot, &[]);
        let errs = errors(&evaluation);
        assert_eq!(errs.len(), 1, "{:?}", evaluation.results);
        assert_eq!(errs[0].rule_id, "consistency.sow_budget");
    }

    #[test]
    fn test_evaluation_is_deterministic_and_ordered() {
        let mut inv = invoice(vec![
            line(1, "Travel", 50_000),
            line(2, "Snacks", 20_000),
        ]);
        inv.due_date = Field::missing();
        inv.issue_date.confidence = 0.1;
        let d = draft(DraftBody::Invoice(inv));
        let failed = vec!["chunk:1".to_string()];
        let first = evaluate(&d, &reference(), &failed);
        let second = evaluate(&d, &reference(), &failed);
        assert_eq!(first, second);

        let severities: Vec<Severity> = first.results.iter().map(|r| r.severity).collect();
        let mut sorted = severities.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(severities, sorted);
        assert!(first.results.iter().all(|r| r.evaluated_at == at()));
    }
}

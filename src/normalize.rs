//! Extraction normalizer.
//!
//! Maps a [`RawExtraction`] onto a typed [`NormalizedDraft`]:
//!
//! 1. Resolve the document type (declared, else inferred from the extraction).
//! 2. Map service-specific field names to canonical names through alias tables.
//! 3. Coerce strings to amounts and dates. A coercion failure leaves the field
//!    empty with confidence zero; it never aborts normalization.
//! 4. Derive missing fields from their parts (`total = subtotal + tax`,
//!    `amount = quantity × unitPrice`) at the minimum confidence of the parts.
//! 5. Assign table rows to line items, milestones or deliverables by header
//!    names, falling back to column position.
//!
//! Raw fields that no canonical name claims are kept on the draft.

use chrono::NaiveDate;
use tracing::debug;

use crate::draft::{
    DeliverableDraft, DraftBody, Field, InvoiceDraft, LineItemDraft, MilestoneDraft,
    NormalizedDraft, RawExtractionRef, SowDraft,
};
use crate::error::CoercionError;
use crate::models::{Amount, DocumentType, RawCell, RawExtraction, RawField, RawTable};

const INVOICE_NUMBER: &[&str] = &["invoicenumber", "invoiceno", "invoiceid", "invoicenum", "invoice"];
const VENDOR_NAME: &[&str] = &[
    "vendorname", "vendor", "suppliername", "supplier", "sellername", "seller", "remitto",
    "contractor", "serviceprovider",
];
const ISSUE_DATE: &[&str] = &["invoicedate", "issuedate", "dateofissue", "date"];
const DUE_DATE: &[&str] = &["duedate", "paymentduedate", "paymentdue", "dueby"];
const SUBTOTAL: &[&str] = &["subtotal", "netamount", "net"];
const TAX: &[&str] = &["tax", "totaltax", "taxamount", "vat", "salestax"];
const TOTAL: &[&str] = &[
    "total", "invoicetotal", "totalamount", "amountdue", "totaldue", "balancedue", "grandtotal",
];
const CURRENCY: &[&str] = &["currency", "currencycode"];
const SOW_REFERENCE: &[&str] = &[
    "sowreference", "sownumber", "sow", "ponumber", "purchaseorder", "contractnumber",
];

const SOW_NUMBER: &[&str] = &["sownumber", "sowid", "sow", "agreementnumber", "contractnumber"];
const SOW_TITLE: &[&str] = &["title", "projecttitle", "sowtitle", "projectname", "project"];
const START_DATE: &[&str] = &["startdate", "effectivedate", "commencementdate"];
const END_DATE: &[&str] = &["enddate", "terminationdate", "completiondate", "expirationdate"];
const TOTAL_VALUE: &[&str] = &[
    "totalvalue", "contractvalue", "totalamount", "total", "totalfees", "totalcost",
];

const INVOICE_MARKERS: &[&str] = &[
    "invoicenumber", "invoiceno", "invoiceid", "invoicedate", "duedate", "amountdue",
    "balancedue", "paymentdue",
];
const SOW_MARKERS: &[&str] = &[
    "sownumber", "sowid", "statementofwork", "projecttitle", "startdate", "enddate",
    "contractvalue", "totalvalue",
];

/// Footer rows in line-item tables that repeat header totals.
const SUMMARY_ROWS: &[&str] = &["total", "subtotal", "tax", "amountdue", "balancedue", "grandtotal"];

/// Lowercase alphanumerics only: `"Invoice No."` → `"invoiceno"`.
pub fn canonical_key(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Project a raw extraction into a typed draft.
pub fn normalize(
    raw: &RawExtraction,
    declared: Option<DocumentType>,
    source: RawExtractionRef,
) -> NormalizedDraft {
    let doc_type = match declared {
        Some(DocumentType::Invoice) => DocumentType::Invoice,
        Some(DocumentType::Sow) => DocumentType::Sow,
        Some(DocumentType::Unknown) | None => infer_type(raw),
    };

    let mut picker = FieldPicker::new(&raw.fields);
    let body = match doc_type {
        DocumentType::Invoice => DraftBody::Invoice(project_invoice(&mut picker, &raw.tables)),
        DocumentType::Sow => DraftBody::Sow(project_sow(&mut picker, &raw.tables)),
        DocumentType::Unknown => DraftBody::Unclassified,
    };

    NormalizedDraft {
        source,
        doc_type,
        body,
        unmapped: picker.unclaimed(),
    }
}

/// Infer the document type from the service hint, then from field vocabulary.
pub fn infer_type(raw: &RawExtraction) -> DocumentType {
    if let Some(hint) = raw.document_type.as_deref() {
        match hint.parse::<DocumentType>() {
            Ok(DocumentType::Unknown) | Err(_) => {}
            Ok(t) => return t,
        }
    }

    let keys: Vec<String> = raw.fields.iter().map(|f| canonical_key(&f.name)).collect();
    let mut invoice_score = keys
        .iter()
        .filter(|k| INVOICE_MARKERS.contains(&k.as_str()))
        .count();
    let mut sow_score = keys
        .iter()
        .filter(|k| SOW_MARKERS.contains(&k.as_str()))
        .count();

    let text = raw.text.to_lowercase();
    if text.contains("statement of work") {
        sow_score += 1;
    }
    if text.contains("invoice") {
        invoice_score += 1;
    }

    match invoice_score.cmp(&sow_score) {
        std::cmp::Ordering::Greater => DocumentType::Invoice,
        std::cmp::Ordering::Less => DocumentType::Sow,
        std::cmp::Ordering::Equal => DocumentType::Unknown,
    }
}

// ============ Field selection ============

/// Hands out raw fields to canonical names, remembering which were claimed.
struct FieldPicker<'a> {
    fields: &'a [RawField],
    keys: Vec<String>,
    claimed: Vec<bool>,
}

impl<'a> FieldPicker<'a> {
    fn new(fields: &'a [RawField]) -> Self {
        Self {
            fields,
            keys: fields.iter().map(|f| canonical_key(&f.name)).collect(),
            claimed: vec![false; fields.len()],
        }
    }

    /// Best unclaimed raw field for a canonical name: highest confidence,
    /// then earliest alias, then earliest position. All matches are claimed.
    fn pick(&mut self, aliases: &[&str]) -> Option<&'a RawField> {
        let mut best: Option<(usize, usize)> = None;
        for (i, key) in self.keys.iter().enumerate() {
            if self.claimed[i] {
                continue;
            }
            let Some(rank) = aliases.iter().position(|a| a == key) else {
                continue;
            };
            let better = match best {
                None => true,
                Some((bi, brank)) => {
                    let (c, bc) = (clamp(self.fields[i].confidence), clamp(self.fields[bi].confidence));
                    c > bc || (c == bc && rank < brank)
                }
            };
            if better {
                best = Some((i, rank));
            }
        }
        for (i, key) in self.keys.iter().enumerate() {
            if aliases.contains(&key.as_str()) {
                self.claimed[i] = true;
            }
        }
        best.map(|(i, _)| &self.fields[i])
    }

    fn text(&mut self, aliases: &[&str]) -> Field<String> {
        match self.pick(aliases) {
            Some(raw) => coerce(raw, parse_text),
            None => Field::missing(),
        }
    }

    fn amount(&mut self, aliases: &[&str]) -> Field<Amount> {
        match self.pick(aliases) {
            Some(raw) => coerce(raw, parse_amount),
            None => Field::missing(),
        }
    }

    fn date(&mut self, aliases: &[&str]) -> Field<NaiveDate> {
        match self.pick(aliases) {
            Some(raw) => coerce(raw, parse_date),
            None => Field::missing(),
        }
    }

    fn unclaimed(&self) -> Vec<RawField> {
        self.fields
            .iter()
            .zip(&self.claimed)
            .filter(|(_, claimed)| !**claimed)
            .map(|(f, _)| f.clone())
            .collect()
    }
}

fn clamp(confidence: f32) -> f32 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

fn coerce<T>(raw: &RawField, parse: fn(&str) -> Result<T, CoercionError>) -> Field<T> {
    match parse(&raw.value) {
        Ok(value) => Field::new(value, clamp(raw.confidence), raw.name.clone()),
        Err(e) => {
            debug!(field = %raw.name, error = %e, "coercion failed; confidence forced to zero");
            Field::coercion_failed(raw.name.clone())
        }
    }
}

fn coerce_cell<T>(
    cell: &RawCell,
    label: &str,
    parse: fn(&str) -> Result<T, CoercionError>,
) -> Field<T> {
    if cell.text.trim().is_empty() {
        return Field::missing();
    }
    match parse(&cell.text) {
        Ok(value) => Field::new(value, clamp(cell.confidence), label.to_string()),
        Err(e) => {
            debug!(cell = %label, error = %e, "cell coercion failed");
            Field::coercion_failed(label.to_string())
        }
    }
}

/// Combine parts into a derived field at the minimum of their confidences.
fn derive<A, B, T>(a: &Field<A>, b: &Field<B>, combine: impl Fn(&A, &B) -> T) -> Field<T> {
    match (&a.value, &b.value) {
        (Some(x), Some(y)) => Field {
            value: Some(combine(x, y)),
            confidence: a.confidence.min(b.confidence),
            sources: a.sources.iter().chain(&b.sources).cloned().collect(),
        },
        _ => Field::missing(),
    }
}

// ============ Invoices ============

fn project_invoice(picker: &mut FieldPicker<'_>, tables: &[RawTable]) -> InvoiceDraft {
    let invoice_number = picker.text(INVOICE_NUMBER);
    let vendor_name = picker.text(VENDOR_NAME);
    let due_date = picker.date(DUE_DATE);
    let issue_date = picker.date(ISSUE_DATE);
    let subtotal = picker.amount(SUBTOTAL);
    let tax = picker.amount(TAX);
    let mut total = picker.amount(TOTAL);
    let currency = picker.text(CURRENCY);
    let sow_reference = picker.text(SOW_REFERENCE);

    if !total.was_extracted() {
        total = derive(&subtotal, &tax, |s, t| *s + *t);
    }

    let mut line_items = Vec::new();
    for (t, table) in tables.iter().enumerate() {
        for item in line_items_from_table(t, table) {
            line_items.push(LineItemDraft {
                line_no: line_items.len() + 1,
                ..item
            });
        }
    }

    InvoiceDraft {
        invoice_number,
        vendor_name,
        issue_date,
        due_date,
        subtotal,
        tax,
        total,
        currency,
        sow_reference,
        line_items,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineColumn {
    Description,
    Quantity,
    UnitPrice,
    Amount,
    Milestone,
}

const LINE_COLUMNS: &[(LineColumn, &[&str])] = &[
    (
        LineColumn::Description,
        &["description", "item", "items", "service", "services", "details", "task", "particulars", "activity"],
    ),
    (LineColumn::Quantity, &["qty", "quantity", "hours", "units", "hrs"]),
    (LineColumn::UnitPrice, &["unitprice", "rate", "price", "unitcost", "hourlyrate"]),
    (
        LineColumn::Amount,
        &["amount", "total", "linetotal", "extended", "extendedprice", "lineamount", "cost", "fee"],
    ),
    (LineColumn::Milestone, &["milestone", "phase", "workpackage"]),
];

fn line_position_fallback(width: usize) -> Vec<Option<LineColumn>> {
    use LineColumn::*;
    match width {
        0 => Vec::new(),
        1 => vec![Some(Description)],
        2 => vec![Some(Description), Some(Amount)],
        3 => vec![Some(Description), Some(Quantity), Some(Amount)],
        n => {
            let mut cols = vec![None; n];
            cols[0] = Some(Description);
            cols[1] = Some(Quantity);
            cols[n - 2] = Some(UnitPrice);
            cols[n - 1] = Some(Amount);
            cols
        }
    }
}

fn line_items_from_table(table_index: usize, table: &RawTable) -> Vec<LineItemDraft> {
    let (columns, data_start) = map_columns(table, LINE_COLUMNS, line_position_fallback);

    let mut items = Vec::new();
    for (r, row) in table.rows.iter().enumerate().skip(data_start) {
        if row.iter().all(|c| c.text.trim().is_empty()) {
            continue;
        }
        let label = |col: usize| format!("tables[{}][{}][{}]", table_index, r, col);
        let mut item = LineItemDraft::default();
        for (c, cell) in row.iter().enumerate() {
            match columns.get(c).copied().flatten() {
                Some(LineColumn::Description) => {
                    item.description = coerce_cell(cell, &label(c), parse_text)
                }
                Some(LineColumn::Quantity) => {
                    item.quantity = coerce_cell(cell, &label(c), parse_quantity)
                }
                Some(LineColumn::UnitPrice) => {
                    item.unit_price = coerce_cell(cell, &label(c), parse_amount)
                }
                Some(LineColumn::Amount) => item.amount = coerce_cell(cell, &label(c), parse_amount),
                Some(LineColumn::Milestone) => {
                    item.milestone_hint = coerce_cell(cell, &label(c), parse_text)
                }
                None => {}
            }
        }

        let is_summary = item
            .description
            .value
            .as_deref()
            .map(|d| SUMMARY_ROWS.contains(&canonical_key(d).as_str()))
            .unwrap_or(false);
        if is_summary {
            continue;
        }

        if !item.amount.was_extracted() {
            item.amount = derive(&item.quantity, &item.unit_price, |q, p| {
                Amount((q * p.cents() as f64).round() as i64)
            });
        }
        items.push(item);
    }
    items
}

/// Resolve column roles from the first row's headers. If no header cell is
/// recognised, every row is data and roles come from `fallback(width)`.
fn map_columns<C: Copy + PartialEq>(
    table: &RawTable,
    vocabulary: &[(C, &[&str])],
    fallback: fn(usize) -> Vec<Option<C>>,
) -> (Vec<Option<C>>, usize) {
    let Some(first) = table.rows.first() else {
        return (Vec::new(), 0);
    };

    let mut columns: Vec<Option<C>> = Vec::with_capacity(first.len());
    for cell in first {
        let key = canonical_key(&cell.text);
        let role = vocabulary
            .iter()
            .find(|(_, aliases)| aliases.contains(&key.as_str()))
            .map(|(role, _)| *role)
            .filter(|role| !columns.contains(&Some(*role)));
        columns.push(role);
    }

    if columns.iter().any(Option::is_some) {
        (columns, 1)
    } else {
        let width = table.rows.iter().map(Vec::len).max().unwrap_or(0);
        (fallback(width), 0)
    }
}

// ============ Statements of work ============

fn project_sow(picker: &mut FieldPicker<'_>, tables: &[RawTable]) -> SowDraft {
    let sow_number = picker.text(SOW_NUMBER);
    let title = picker.text(SOW_TITLE);
    let vendor_name = picker.text(VENDOR_NAME);
    let start_date = picker.date(START_DATE);
    let end_date = picker.date(END_DATE);
    let total_value = picker.amount(TOTAL_VALUE);
    let currency = picker.text(CURRENCY);

    let mut milestones = Vec::new();
    let mut deliverables = Vec::new();
    for (t, table) in tables.iter().enumerate() {
        if is_deliverable_table(table) {
            deliverables.extend(deliverables_from_table(t, table));
        } else {
            milestones.extend(milestones_from_table(t, table));
        }
    }

    SowDraft {
        sow_number,
        title,
        vendor_name,
        start_date,
        end_date,
        total_value,
        currency,
        milestones,
        deliverables,
    }
}

fn is_deliverable_table(table: &RawTable) -> bool {
    table
        .rows
        .first()
        .map(|row| {
            row.iter().any(|c| {
                let key = canonical_key(&c.text);
                key == "deliverable" || key == "deliverables"
            })
        })
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MilestoneColumn {
    Name,
    Description,
    Amount,
    DueDate,
}

const MILESTONE_COLUMNS: &[(MilestoneColumn, &[&str])] = &[
    (MilestoneColumn::Name, &["milestone", "name", "phase", "title"]),
    (MilestoneColumn::Description, &["description", "details", "scope"]),
    (
        MilestoneColumn::Amount,
        &["amount", "budget", "fee", "fees", "cost", "price", "value", "payment"],
    ),
    (
        MilestoneColumn::DueDate,
        &["duedate", "date", "targetdate", "due", "completiondate"],
    ),
];

fn milestone_position_fallback(width: usize) -> Vec<Option<MilestoneColumn>> {
    use MilestoneColumn::*;
    match width {
        0 => Vec::new(),
        1 => vec![Some(Name)],
        2 => vec![Some(Name), Some(Amount)],
        3 => vec![Some(Name), Some(DueDate), Some(Amount)],
        n => {
            let mut cols = vec![None; n];
            cols[0] = Some(Name);
            cols[1] = Some(Description);
            cols[n - 2] = Some(DueDate);
            cols[n - 1] = Some(Amount);
            cols
        }
    }
}

fn milestones_from_table(table_index: usize, table: &RawTable) -> Vec<MilestoneDraft> {
    let (columns, data_start) = map_columns(table, MILESTONE_COLUMNS, milestone_position_fallback);
    let mut out = Vec::new();
    for (r, row) in table.rows.iter().enumerate().skip(data_start) {
        if row.iter().all(|c| c.text.trim().is_empty()) {
            continue;
        }
        let label = |col: usize| format!("tables[{}][{}][{}]", table_index, r, col);
        let mut m = MilestoneDraft::default();
        for (c, cell) in row.iter().enumerate() {
            match columns.get(c).copied().flatten() {
                Some(MilestoneColumn::Name) => m.name = coerce_cell(cell, &label(c), parse_text),
                Some(MilestoneColumn::Description) => {
                    m.description = coerce_cell(cell, &label(c), parse_text)
                }
                Some(MilestoneColumn::Amount) => m.amount = coerce_cell(cell, &label(c), parse_amount),
                Some(MilestoneColumn::DueDate) => m.due_date = coerce_cell(cell, &label(c), parse_date),
                None => {}
            }
        }
        let is_summary = m
            .name
            .value
            .as_deref()
            .map(|n| SUMMARY_ROWS.contains(&canonical_key(n).as_str()))
            .unwrap_or(false);
        if !is_summary {
            out.push(m);
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliverableColumn {
    Name,
    Description,
    Milestone,
    DueDate,
}

const DELIVERABLE_COLUMNS: &[(DeliverableColumn, &[&str])] = &[
    (DeliverableColumn::Name, &["deliverable", "deliverables", "name", "title"]),
    (DeliverableColumn::Description, &["description", "details", "acceptancecriteria"]),
    (DeliverableColumn::Milestone, &["milestone", "phase"]),
    (DeliverableColumn::DueDate, &["duedate", "date", "due", "targetdate"]),
];

fn deliverable_position_fallback(width: usize) -> Vec<Option<DeliverableColumn>> {
    use DeliverableColumn::*;
    [Some(Name), Some(Description), Some(Milestone), Some(DueDate)]
        .into_iter()
        .chain(std::iter::repeat(None))
        .take(width)
        .collect()
}

fn deliverables_from_table(table_index: usize, table: &RawTable) -> Vec<DeliverableDraft> {
    let (columns, data_start) =
        map_columns(table, DELIVERABLE_COLUMNS, deliverable_position_fallback);
    let mut out = Vec::new();
    for (r, row) in table.rows.iter().enumerate().skip(data_start) {
        if row.iter().all(|c| c.text.trim().is_empty()) {
            continue;
        }
        let label = |col: usize| format!("tables[{}][{}][{}]", table_index, r, col);
        let mut d = DeliverableDraft::default();
        for (c, cell) in row.iter().enumerate() {
            match columns.get(c).copied().flatten() {
                Some(DeliverableColumn::Name) => d.name = coerce_cell(cell, &label(c), parse_text),
                Some(DeliverableColumn::Description) => {
                    d.description = coerce_cell(cell, &label(c), parse_text)
                }
                Some(DeliverableColumn::Milestone) => {
                    d.milestone = coerce_cell(cell, &label(c), parse_text)
                }
                Some(DeliverableColumn::DueDate) => {
                    d.due_date = coerce_cell(cell, &label(c), parse_date)
                }
                None => {}
            }
        }
        out.push(d);
    }
    out
}

// ============ Coercion ============

pub fn parse_text(raw: &str) -> Result<String, CoercionError> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        Err(CoercionError::Empty)
    } else {
        Ok(collapsed)
    }
}

/// Parse a currency amount into cents.
///
/// Accepts symbols and ISO codes (`$`, `USD`), thousands separators in either
/// convention (`1,250.00`, `1.250,00`), and accounting negatives (`(40.00)`).
pub fn parse_amount(raw: &str) -> Result<Amount, CoercionError> {
    let fail = || CoercionError::Amount(raw.to_string());
    let trimmed = raw.trim();
    let negative = (trimmed.starts_with('(') && trimmed.ends_with(')'))
        || trimmed.starts_with('-')
        || trimmed.ends_with('-');

    let kept: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    if !kept.chars().any(|c| c.is_ascii_digit()) {
        return Err(fail());
    }

    let last_dot = kept.rfind('.');
    let last_comma = kept.rfind(',');
    let decimal_at = match (last_dot, last_comma) {
        (Some(d), Some(c)) => Some(d.max(c)),
        (Some(d), None) => {
            if kept.matches('.').count() > 1 {
                None
            } else {
                Some(d)
            }
        }
        (None, Some(c)) => {
            let frac_len = kept.len() - c - 1;
            if kept.matches(',').count() == 1 && frac_len == 2 {
                Some(c)
            } else {
                None
            }
        }
        (None, None) => None,
    };

    let (int_part, frac_part) = match decimal_at {
        Some(i) => (&kept[..i], &kept[i + 1..]),
        None => (kept.as_str(), ""),
    };
    let int_digits: String = int_part.chars().filter(char::is_ascii_digit).collect();
    if frac_part.contains(['.', ',']) {
        return Err(fail());
    }

    let whole: i64 = if int_digits.is_empty() {
        0
    } else {
        int_digits.parse().map_err(|_| fail())?
    };
    let mut frac_digits: Vec<i64> = frac_part
        .chars()
        .filter_map(|c| c.to_digit(10).map(i64::from))
        .collect();
    frac_digits.resize(3, 0);
    let mut cents = frac_digits[0] * 10 + frac_digits[1];
    if frac_digits[2] >= 5 {
        cents += 1;
    }

    let total = whole
        .checked_mul(100)
        .and_then(|w| w.checked_add(cents))
        .ok_or_else(fail)?;
    Ok(Amount(if negative { -total } else { total }))
}

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%m-%d-%Y", "%d.%m.%Y", "%B %d, %Y", "%b %d, %Y",
    "%B %d %Y", "%b %d %Y", "%d %B %Y", "%d %b %Y",
];

pub fn parse_date(raw: &str) -> Result<NaiveDate, CoercionError> {
    let trimmed = raw.trim();
    // ISO timestamps: keep the date part.
    let candidate = match trimmed.find('T') {
        Some(10) if trimmed.len() > 10 => &trimmed[..10],
        _ => trimmed,
    };
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(candidate, fmt).ok())
        .ok_or_else(|| CoercionError::Date(raw.to_string()))
}

/// Leading numeric part of a quantity cell: `"12.5 hrs"` → `12.5`.
pub fn parse_quantity(raw: &str) -> Result<f64, CoercionError> {
    let numeric: String = raw
        .trim()
        .chars()
        .filter(|c| *c != ',')
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    numeric
        .parse::<f64>()
        .ok()
        .filter(|q| q.is_finite())
        .ok_or_else(|| CoercionError::Number(raw.to_string()))
}

//! Normalized drafts: typed projections of a [`RawExtraction`](crate::models::RawExtraction).
//!
//! Every value is wrapped in a [`Field`] that keeps the confidence it was
//! extracted with and the raw field names (or table cells) it came from.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::{Amount, DocumentType, RawField};

/// A canonical value with its source confidence and provenance.
///
/// `value == None` with non-empty `sources` means the raw value failed
/// coercion; its confidence is then zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field<T> {
    pub value: Option<T>,
    pub confidence: f32,
    #[serde(default)]
    pub sources: Vec<String>,
}

impl<T> Field<T> {
    pub fn missing() -> Self {
        Self {
            value: None,
            confidence: 0.0,
            sources: Vec::new(),
        }
    }

    pub fn new(value: T, confidence: f32, source: impl Into<String>) -> Self {
        Self {
            value: Some(value),
            confidence,
            sources: vec![source.into()],
        }
    }

    pub fn coercion_failed(source: impl Into<String>) -> Self {
        Self {
            value: None,
            confidence: 0.0,
            sources: vec![source.into()],
        }
    }

    /// The extraction produced something for this field, usable or not.
    pub fn was_extracted(&self) -> bool {
        !self.sources.is_empty()
    }

    pub fn is_present(&self) -> bool {
        self.value.is_some()
    }

    pub fn view(&self, name: impl Into<String>) -> FieldView {
        FieldView {
            name: name.into(),
            confidence: self.confidence,
            extracted: self.was_extracted(),
            present: self.is_present(),
        }
    }
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Self::missing()
    }
}

/// Type-erased view of a field, used by rules that only need confidence and presence.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldView {
    pub name: String,
    pub confidence: f32,
    pub extracted: bool,
    pub present: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineItemDraft {
    pub line_no: usize,
    pub description: Field<String>,
    pub quantity: Field<f64>,
    pub unit_price: Field<Amount>,
    pub amount: Field<Amount>,
    /// Milestone or phase label printed on the line, if the table carries one.
    pub milestone_hint: Field<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvoiceDraft {
    pub invoice_number: Field<String>,
    pub vendor_name: Field<String>,
    pub issue_date: Field<NaiveDate>,
    pub due_date: Field<NaiveDate>,
    pub subtotal: Field<Amount>,
    pub tax: Field<Amount>,
    pub total: Field<Amount>,
    pub currency: Field<String>,
    pub sow_reference: Field<String>,
    pub line_items: Vec<LineItemDraft>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MilestoneDraft {
    pub name: Field<String>,
    pub description: Field<String>,
    pub amount: Field<Amount>,
    pub due_date: Field<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliverableDraft {
    pub name: Field<String>,
    pub description: Field<String>,
    pub milestone: Field<String>,
    pub due_date: Field<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SowDraft {
    pub sow_number: Field<String>,
    pub title: Field<String>,
    pub vendor_name: Field<String>,
    pub start_date: Field<NaiveDate>,
    pub end_date: Field<NaiveDate>,
    pub total_value: Field<Amount>,
    pub currency: Field<String>,
    pub milestones: Vec<MilestoneDraft>,
    pub deliverables: Vec<DeliverableDraft>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DraftBody {
    Invoice(InvoiceDraft),
    Sow(SowDraft),
    /// The type could not be determined; nothing was projected.
    Unclassified,
}

/// Points back at the RawExtraction a draft was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawExtractionRef {
    pub document_id: String,
    pub attempt_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedDraft {
    pub source: RawExtractionRef,
    pub doc_type: DocumentType,
    pub body: DraftBody,
    /// Raw fields no canonical name claimed. Kept for audit, never dropped.
    #[serde(default)]
    pub unmapped: Vec<RawField>,
}

impl InvoiceDraft {
    /// Header-level fields by canonical name.
    pub fn field_views(&self) -> Vec<FieldView> {
        let mut views = vec![
            self.invoice_number.view("invoiceNumber"),
            self.vendor_name.view("vendorName"),
            self.issue_date.view("issueDate"),
            self.due_date.view("dueDate"),
            self.subtotal.view("subtotal"),
            self.tax.view("tax"),
            self.total.view("total"),
            self.currency.view("currency"),
            self.sow_reference.view("sowReference"),
        ];
        for (i, item) in self.line_items.iter().enumerate() {
            views.push(item.description.view(format!("lineItems[{}].description", i)));
            views.push(item.quantity.view(format!("lineItems[{}].quantity", i)));
            views.push(item.unit_price.view(format!("lineItems[{}].unitPrice", i)));
            views.push(item.amount.view(format!("lineItems[{}].amount", i)));
        }
        views
    }
}

impl SowDraft {
    pub fn field_views(&self) -> Vec<FieldView> {
        let mut views = vec![
            self.sow_number.view("sowNumber"),
            self.title.view("title"),
            self.vendor_name.view("vendorName"),
            self.start_date.view("startDate"),
            self.end_date.view("endDate"),
            self.total_value.view("totalValue"),
            self.currency.view("currency"),
        ];
        for (i, m) in self.milestones.iter().enumerate() {
            views.push(m.name.view(format!("milestones[{}].name", i)));
            views.push(m.amount.view(format!("milestones[{}].amount", i)));
            views.push(m.due_date.view(format!("milestones[{}].dueDate", i)));
        }
        for (i, d) in self.deliverables.iter().enumerate() {
            views.push(d.name.view(format!("deliverables[{}].name", i)));
            views.push(d.due_date.view(format!("deliverables[{}].dueDate", i)));
        }
        views
    }
}

impl NormalizedDraft {
    pub fn field_views(&self) -> Vec<FieldView> {
        match &self.body {
            DraftBody::Invoice(inv) => inv.field_views(),
            DraftBody::Sow(sow) => sow.field_views(),
            DraftBody::Unclassified => Vec::new(),
        }
    }

    pub fn invoice(&self) -> Option<&InvoiceDraft> {
        match &self.body {
            DraftBody::Invoice(inv) => Some(inv),
            _ => None,
        }
    }

    pub fn sow(&self) -> Option<&SowDraft> {
        match &self.body {
            DraftBody::Sow(sow) => Some(sow),
            _ => None,
        }
    }

    /// Vendor name as extracted, for reference lookups.
    pub fn vendor_name(&self) -> Option<&str> {
        match &self.body {
            DraftBody::Invoice(inv) => inv.vendor_name.value.as_deref(),
            DraftBody::Sow(sow) => sow.vendor_name.value.as_deref(),
            DraftBody::Unclassified => None,
        }
    }
}

//! # Paperline
//!
//! Ingestion and validation pipeline for scanned invoices and statements of
//! work (SOWs).
//!
//! An uploaded document goes through extraction, normalization into a typed
//! draft, heading-aware chunking, embedding, and a rule engine that checks the
//! draft against reference data (vendors, SOWs, milestone budgets). Each
//! document ends `validated`, `needs_review` (with graded findings), or
//! `failed` (with a reason).
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────────────────────────────┐   ┌──────────┐
//! │ Extraction │──▶│ Orchestrator                          │──▶│  SQLite  │
//! │  service   │   │ extract → chunk → embed → validate    │   │ (WAL)    │
//! └────────────┘   └──────────────────────────────────────┘   └────┬─────┘
//!                                                                   │
//!                                  ┌────────────────────────────────┤
//!                                  ▼                                ▼
//!                             ┌──────────┐                    ┌──────────┐
//!                             │   CLI    │                    │   HTTP   │
//!                             └──────────┘                    └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types |
//! | [`state`] | Processing states and transitions |
//! | [`draft`] | Normalized draft types |
//! | [`extract`] | Extraction service adapters |
//! | [`normalize`] | Raw extraction → typed draft |
//! | [`chunk`] | Heading-aware text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`summarize`] | Summarization provider abstraction |
//! | [`embed`] | Embedding coordinator |
//! | [`rules`] | Validation rule engine |
//! | [`reference`] | Reference data snapshot and import |
//! | [`gateway`] | Persistence gateway: claims, stage commits |
//! | [`retry`] | Backoff and timeouts for service calls |
//! | [`orchestrator`] | Document orchestrator and worker pool |
//! | [`server`] | HTTP server |
//! | [`stats`] | Pipeline statistics |

pub mod chunk;
pub mod config;
pub mod db;
pub mod draft;
pub mod embed;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod gateway;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod orchestrator;
pub mod reference;
pub mod retry;
pub mod rules;
pub mod server;
pub mod state;
pub mod stats;
pub mod summarize;

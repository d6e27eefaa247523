//! # biblioport
//!
//! Migrates a Papers2-style reference library (local SQLite database plus
//! attachment folder) into a Zotero cloud library, preserving metadata,
//! deduplicating across interrupted runs, and relocating attachment files
//! without re-uploading bytes where storage allows.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌──────────────┐
//! │  Papers2   │──▶│  Importer   │──▶│ Remote API   │
//! │  (SQLite)  │   │ extract +  │   │ batched items │
//! └────────────┘   │ batch +    │   └──────┬───────┘
//!                  │ checkpoint │          │ per-item keys
//!                  └─────┬──────┘          ▼
//!                        │          ┌──────────────┐
//!                        │          │ notes + files │
//!                        ▼          │  (relocator)  │
//!                  ┌────────────┐   └──────────────┘
//!                  │ checkpoint │
//!                  │   (JSON)   │
//!                  └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! biblioport collections        # see what the source library holds
//! biblioport run --dry-run     # inspect the payloads, nothing sent
//! biblioport run               # migrate, resumable at any point
//! biblioport run --retry       # re-attempt previously failed records
//! biblioport status            # checkpoint summary
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Hydrated source record types |
//! | [`kinds`] | Closed code tables (publication kinds, labels, …) |
//! | [`source`] | Read-only legacy-database access |
//! | [`checkpoint`] | Durable resume state |
//! | [`batch`] | Bounded submission buffer |
//! | [`extract`] | Declarative field extraction rules |
//! | [`importer`] | Import orchestration |
//! | [`zotero`] | Remote library client |
//! | [`relocate`] | Attachment relocation backends |
//! | [`dryrun`] | Dry-run output sink |
//! | [`run`] | Top-level migration loop |

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod dryrun;
pub mod extract;
pub mod importer;
pub mod kinds;
pub mod logging;
pub mod models;
pub mod relocate;
pub mod run;
pub mod source;
pub mod stats;
pub mod zotero;

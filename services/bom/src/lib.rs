//! Fabspace BOM Service
//!
//! Prices a bill of materials against two distributors. A spreadsheet goes
//! through three steps:
//!
//! - **Upload**: the file is forwarded to the BOM checker, which detects
//!   its columns, and an upload record is created
//! - **Process**: the chosen column mapping and build quantities are saved,
//!   the checker extracts rows, and every part gets one lookup per supplier
//! - **Stream**: the checker queries Digi-Key and Mouser, streaming NDJSON
//!   results that are written to the lookups and relayed to the browser
//!
//! The dashboard reads per-supplier counts from a materialized view that is
//! refreshed in the background as results arrive.
//!
//! ## Architecture
//!
//! ```text
//!   Browser                 BOM Service                      BOM checker
//! ┌──────────┐  HTTP   ┌─────────────────┐  upload/process  ┌─────────────┐
//! │ /bom/*   │────────▶│ BomService      │─────────────────▶│ /api/upload │
//! └──────────┘         └─────────────────┘                  │ /api/...    │
//!      ▲                   │          │                     └─────────────┘
//!      │ NDJSON            │          ▼                            │
//!      │             ┌───────────┐  ┌──────────────────┐  NDJSON   │
//!      └─────────────│ Supplier  │◀─┼──────────────────┼───────────┘
//!                    │ Streamer  │  │ Metrics          │
//!                    └───────────┘  │ Refresher        │
//!                          │        └──────────────────┘
//!                          ▼                 │
//!                    ┌──────────────────────────────┐
//!                    │ BomStore (PostgreSQL)        │
//!                    │ uploads, rows, lookups, view │
//!                    └──────────────────────────────┘
//! ```

pub mod api;
pub mod auth;
pub mod checker;
pub mod config;
pub mod error;
pub mod ndjson;
pub mod price_breaks;
pub mod refresher;
pub mod service;
pub mod store;
pub mod streaming;
pub mod supplier;
pub mod tasks;

pub use api::{create_router, start_api_server, AppState};
pub use checker::BomCheckerClient;
pub use config::Config;
pub use error::{BomError, Result};
pub use refresher::MetricsRefresher;
pub use service::BomService;
pub use store::{BomStore, MemoryBomStore, PgBomStore};
pub use streaming::{StreamReport, SupplierStreamer};
pub use supplier::{LookupStatus, Supplier};

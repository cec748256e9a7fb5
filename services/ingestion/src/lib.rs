//! Fabspace Ingestion Service
//!
//! Brings design archives (ZIP files) into the marketplace's object store so
//! that quoting can start. Files arrive three ways:
//!
//! - **Remote download**: a partner URL is fetched by a background worker,
//!   hashed while streaming, and written to S3 without buffering the payload
//! - **Staged upload**: small files posted to the API are hashed in memory
//!   and stored by the same worker
//! - **Direct upload**: the client PUTs straight to S3 with a presigned URL
//!   and confirms afterwards
//!
//! Every job is tracked in PostgreSQL and always ends `completed` or `failed`.
//!
//! ## Architecture
//!
//! ```text
//!  Partner URL          HTTP API                    S3 Bucket
//! ┌────────────┐      ┌──────────────┐            ┌──────────────────┐
//! │ ZIP export │      │ /ingestions  │            │ ingestions/      │
//! └────────────┘      │ /recent      │            │   {user}/        │
//!       │             │ /files/:id   │            │     {job}.zip    │
//!       │             └──────────────┘            └──────────────────┘
//!       │                    │                            ▲
//!       ▼                    ▼                            │
//! ┌──────────────┐    ┌──────────────┐    stream   ┌──────────────┐
//! │ Ingestion    │◀───│ Ingestion    │   + SHA-256 │ Object       │
//! │ Worker       │────┼──────────────┼────────────▶│ Store        │
//! └──────────────┘    │ Service      │             └──────────────┘
//!       │             └──────────────┘
//!       ▼                    │
//! ┌──────────────┐           ▼
//! │ Quick quote  │    ┌──────────────┐
//! │ hook         │    │ Job Store    │ (PostgreSQL)
//! └──────────────┘    └──────────────┘
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod job_store;
pub mod object_store;
pub mod quick_quote;
pub mod s3_store;
pub mod service;
pub mod tasks;
pub mod worker;

pub use api::{create_router, start_api_server, AppState};
pub use config::Config;
pub use error::{IngestionError, Result};
pub use job_store::{IngestionJob, JobStatus, JobStore, MemoryJobStore, PgJobStore};
pub use object_store::{MemoryObjectStore, ObjectStore, StorageError};
pub use quick_quote::{NoopQuickQuotes, PgQuickQuotes, QuickQuoteHook};
pub use s3_store::S3ObjectStore;
pub use service::IngestionService;
pub use worker::IngestionWorker;

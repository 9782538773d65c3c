//! Prediction Storage Service
//!
//! Persists object-detection prediction sessions and the detections each one
//! owns, and answers lookups by uid, by label and by minimum score. Two
//! backends sit behind one contract and are chosen once at startup:
//!
//! - **Relational**: SQLite, one short-lived connection per operation, with
//!   a session table, a detection table and indexes on label and score
//! - **Partitioned**: DynamoDB, sessions keyed by uid and detections keyed by
//!   owning uid, with a label index and a global score index; lookups fan in
//!   to session point reads
//!
//! ## Architecture
//!
//! ```text
//!  HTTP API (axum)
//! ┌──────────────┐     ┌──────────────┐
//! │ /predict     │────▶│ Ingest       │
//! │ /prediction  │     │ (session,    │
//! │ /predictions │     │  detections) │
//! └──────────────┘     └──────────────┘
//!        │                    │
//!        ▼                    ▼
//! ┌─────────────────────────────────────┐
//! │ PredictionStorage                   │
//! ├──────────────────┬──────────────────┤
//! │ RelationalStore  │ PartitionedStore │
//! │ (SQLite)         │ (DynamoDB)       │
//! └──────────────────┴──────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod ingest;
pub mod model;
pub mod storage;
pub mod validation;

pub use api::{create_router, start_api_server, AppState};
pub use config::Config;
pub use error::{Result, StorageError};
pub use ingest::{record_run, DetectionRun, RunReceipt};
pub use model::{BoundingBox, DetectionInput, DetectionView, SessionSummary, SessionView};
pub use storage::{BackendKind, PredictionStorage, Storage};
pub use validation::LabelVocabulary;

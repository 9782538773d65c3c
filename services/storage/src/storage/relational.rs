//! Relational backend on SQLite.
//!
//! Sessions and detections live in two tables joined on `prediction_uid`.
//! Every call opens its own connection and closes it before returning, so the
//! store carries no connection state between requests.

use crate::config::SqliteConfig;
use crate::error::{Result, StorageError};
use crate::model::{BoundingBox, DetectionView, SessionSummary, SessionView};
use crate::storage::PredictionStorage;
use crate::validation::validate_storable_score;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection, FromRow};
use tracing::{debug, info, instrument, warn};

/// Schema created on first start; every statement is idempotent
const SCHEMA: [&str; 5] = [
    r#"
    CREATE TABLE IF NOT EXISTS prediction_sessions (
        uid TEXT PRIMARY KEY,
        timestamp DATETIME DEFAULT CURRENT_TIMESTAMP,
        original_image TEXT,
        predicted_image TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS detection_objects (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        prediction_uid TEXT,
        label TEXT,
        score REAL,
        box TEXT,
        FOREIGN KEY (prediction_uid) REFERENCES prediction_sessions(uid)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_detection_objects_prediction_uid ON detection_objects (prediction_uid)",
    "CREATE INDEX IF NOT EXISTS idx_detection_objects_label ON detection_objects (label)",
    "CREATE INDEX IF NOT EXISTS idx_detection_objects_score ON detection_objects (score)",
];

#[derive(Debug, FromRow)]
struct SessionRow {
    uid: String,
    timestamp: DateTime<Utc>,
    original_image: String,
    predicted_image: String,
}

#[derive(Debug, FromRow)]
struct DetectionRow {
    label: String,
    score: f64,
    bbox: String,
}

#[derive(Debug, FromRow)]
struct SummaryRow {
    uid: String,
    timestamp: DateTime<Utc>,
}

impl TryFrom<DetectionRow> for DetectionView {
    type Error = StorageError;

    fn try_from(row: DetectionRow) -> Result<Self> {
        Ok(Self {
            label: row.label,
            score: row.score,
            bbox: BoundingBox::from_text(&row.bbox)?,
        })
    }
}

impl From<SummaryRow> for SessionSummary {
    fn from(row: SummaryRow) -> Self {
        Self {
            uid: row.uid,
            timestamp: row.timestamp,
        }
    }
}

/// Prediction store backed by a SQLite database file
#[derive(Debug, Clone)]
pub struct RelationalStore {
    options: SqliteConnectOptions,
}

impl RelationalStore {
    /// Create a store for the configured database file. No connection is
    /// opened until the first call.
    pub fn new(config: &SqliteConfig) -> Self {
        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            // Detections may be written for sessions that do not exist
            .foreign_keys(false)
            .busy_timeout(config.busy_timeout());

        Self { options }
    }

    /// Create both tables and all three detection indexes if absent
    pub async fn init_schema(&self) -> Result<()> {
        info!("Initializing relational schema");

        let mut conn = self.connect("init_schema").await?;
        let result = create_schema(&mut conn).await;
        release(conn).await;
        result.map_err(|e| StorageError::Config(format!("failed to initialize schema: {e}")))?;

        info!("Relational schema ready");
        Ok(())
    }

    /// Open a connection for exactly one store call
    async fn connect(&self, operation: &'static str) -> Result<SqliteConnection> {
        self.options.connect().await.map_err(|e| {
            if operation.starts_with("save") {
                StorageError::write(operation, e)
            } else {
                StorageError::backend(operation, e)
            }
        })
    }
}

/// Close a per-call connection; a failed close never masks the call's outcome
async fn release(conn: SqliteConnection) {
    if let Err(e) = conn.close().await {
        warn!(error = %e, "Failed to close SQLite connection");
    }
}

async fn create_schema(conn: &mut SqliteConnection) -> sqlx::Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(&mut *conn).await?;
    }
    Ok(())
}

async fn fetch_prediction(
    conn: &mut SqliteConnection,
    uid: &str,
) -> sqlx::Result<Option<(SessionRow, Vec<DetectionRow>)>> {
    let session = sqlx::query_as::<_, SessionRow>(
        r#"
        SELECT uid, timestamp, original_image, predicted_image
        FROM prediction_sessions
        WHERE uid = ?
        "#,
    )
    .bind(uid)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(session) = session else {
        return Ok(None);
    };

    let detections = sqlx::query_as::<_, DetectionRow>(
        r#"
        SELECT label, score, box AS bbox
        FROM detection_objects
        WHERE prediction_uid = ?
        "#,
    )
    .bind(uid)
    .fetch_all(&mut *conn)
    .await?;

    Ok(Some((session, detections)))
}

#[async_trait]
impl PredictionStorage for RelationalStore {
    #[instrument(skip(self, original_image, predicted_image), fields(backend = "sqlite"))]
    async fn save_prediction(
        &self,
        uid: &str,
        original_image: &str,
        predicted_image: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.connect("save_prediction").await?;
        // Re-saving a uid replaces the session row; its detections are kept
        let result = sqlx::query(
            r#"
            INSERT INTO prediction_sessions (uid, timestamp, original_image, predicted_image)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (uid) DO UPDATE SET
                timestamp = excluded.timestamp,
                original_image = excluded.original_image,
                predicted_image = excluded.predicted_image
            "#,
        )
        .bind(uid)
        .bind(timestamp)
        .bind(original_image)
        .bind(predicted_image)
        .execute(&mut conn)
        .await;
        release(conn).await;

        result.map_err(|e| StorageError::write("save_prediction", e))?;

        debug!(uid = %uid, "Prediction session saved");
        Ok(())
    }

    #[instrument(skip(self, bbox), fields(backend = "sqlite"))]
    async fn save_detection(
        &self,
        uid: &str,
        label: &str,
        score: f64,
        bbox: &BoundingBox,
    ) -> Result<()> {
        validate_storable_score(score)?;
        let box_text = bbox.to_text()?;

        let mut conn = self.connect("save_detection").await?;
        let result = sqlx::query(
            r#"
            INSERT INTO detection_objects (prediction_uid, label, score, box)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(uid)
        .bind(label)
        .bind(score)
        .bind(&box_text)
        .execute(&mut conn)
        .await;
        release(conn).await;

        result.map_err(|e| StorageError::write("save_detection", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "sqlite"))]
    async fn get_prediction(&self, uid: &str) -> Result<SessionView> {
        let mut conn = self.connect("get_prediction").await?;
        let result = fetch_prediction(&mut conn, uid).await;
        release(conn).await;

        let (session, detections) = result
            .map_err(|e| StorageError::backend("get_prediction", e))?
            .ok_or_else(|| StorageError::not_found(uid))?;

        let detection_objects = detections
            .into_iter()
            .map(DetectionView::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok(SessionView {
            uid: session.uid,
            timestamp: session.timestamp,
            original_image: session.original_image,
            predicted_image: session.predicted_image,
            detection_objects,
        })
    }

    #[instrument(skip(self), fields(backend = "sqlite"))]
    async fn get_predictions_by_label(&self, label: &str) -> Result<Vec<SessionSummary>> {
        let mut conn = self.connect("get_predictions_by_label").await?;
        let result = sqlx::query_as::<_, SummaryRow>(
            r#"
            SELECT DISTINCT ps.uid AS uid, ps.timestamp AS timestamp
            FROM prediction_sessions ps
            JOIN detection_objects d ON ps.uid = d.prediction_uid
            WHERE d.label = ?
            "#,
        )
        .bind(label)
        .fetch_all(&mut conn)
        .await;
        release(conn).await;

        let rows = result.map_err(|e| StorageError::backend("get_predictions_by_label", e))?;
        Ok(rows.into_iter().map(SessionSummary::from).collect())
    }

    #[instrument(skip(self), fields(backend = "sqlite"))]
    async fn get_predictions_by_score(&self, min_score: f64) -> Result<Vec<SessionSummary>> {
        let mut conn = self.connect("get_predictions_by_score").await?;
        let result = sqlx::query_as::<_, SummaryRow>(
            r#"
            SELECT DISTINCT ps.uid AS uid, ps.timestamp AS timestamp
            FROM prediction_sessions ps
            JOIN detection_objects d ON ps.uid = d.prediction_uid
            WHERE d.score >= ?
            "#,
        )
        .bind(min_score)
        .fetch_all(&mut conn)
        .await;
        release(conn).await;

        let rows = result.map_err(|e| StorageError::backend("get_predictions_by_score", e))?;
        Ok(rows.into_iter().map(SessionSummary::from).collect())
    }

    async fn check_health(&self) -> Result<()> {
        let mut conn = self.connect("check_health").await?;
        let result = sqlx::query("SELECT 1").execute(&mut conn).await;
        release(conn).await;

        result
            .map(|_| ())
            .map_err(|e| StorageError::backend("check_health", e))
    }
}

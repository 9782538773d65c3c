//! Partitioned backend: sessions and detections as key-addressed items.
//!
//! Layout:
//!
//! ```text
//! sessions table     pk uid
//! detections table   pk prediction_uid   sk label_score = "{label}#{score}#{detection_id}"
//! label index        pk label
//! score index        pk score_partition (constant "score")   sk score (number)
//! ```
//!
//! There is no join. Label and score queries read an index, collect the
//! owning `prediction_uid`s, drop repeats with a seen-set, then issue one
//! session point read per distinct uid to recover its timestamp. Session
//! reads and the detection read of `get_prediction` are strongly consistent;
//! the label and score indexes are global secondary indexes and only
//! eventually consistent, so a detection can briefly be missing from them
//! after its write returns. Every
//! detection lands in the single `score` partition of the score index, which
//! caps that index's write throughput.

pub mod dynamodb;
#[cfg(test)]
pub(crate) mod memory;

use crate::error::{Result, StorageError};
use crate::model::{BoundingBox, DetectionView, SessionSummary, SessionView};
use crate::storage::PredictionStorage;
use crate::validation::{
    validate_storable_score, MAX_STORABLE_MAGNITUDE, MIN_STORABLE_MAGNITUDE,
};
use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

/// One stored item, attribute name to value
pub type Item = HashMap<String, AttributeValue>;

/// Sentinel partition funnelling every detection into one range-scannable
/// collection of the score index
pub const SCORE_PARTITION: &str = "score";

pub(crate) mod attr {
    pub const UID: &str = "uid";
    pub const TIMESTAMP: &str = "timestamp";
    pub const ORIGINAL_IMAGE: &str = "original_image";
    pub const PREDICTED_IMAGE: &str = "predicted_image";
    pub const PREDICTION_UID: &str = "prediction_uid";
    pub const LABEL_SCORE: &str = "label_score";
    pub const DETECTION_ID: &str = "detection_id";
    pub const LABEL: &str = "label";
    pub const SCORE: &str = "score";
    pub const SCORE_PARTITION: &str = "score_partition";
    pub const BOX: &str = "box";
}

/// Item collections of the partitioned layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Sessions,
    Detections,
}

/// Secondary indexes on the detections table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Index {
    Label,
    Score,
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Table::Sessions => write!(f, "sessions"),
            Table::Detections => write!(f, "detections"),
        }
    }
}

/// Key-condition query: exact partition match, optional `sort >= value`
#[derive(Debug, Clone, PartialEq)]
pub struct KeyQuery {
    pub table: Table,
    pub index: Option<Index>,
    pub partition_key: &'static str,
    pub partition_value: AttributeValue,
    pub sort_at_least: Option<(&'static str, AttributeValue)>,
    /// Read-after-write on the base table; indexes cannot serve it
    pub consistent: bool,
}

impl KeyQuery {
    pub fn partition(table: Table, key: &'static str, value: AttributeValue) -> Self {
        Self {
            table,
            index: None,
            partition_key: key,
            partition_value: value,
            sort_at_least: None,
            consistent: false,
        }
    }

    pub fn consistent_read(mut self) -> Self {
        self.consistent = true;
        self
    }

    pub fn on_index(mut self, index: Index) -> Self {
        self.index = Some(index);
        self
    }

    pub fn sort_at_least(mut self, key: &'static str, value: AttributeValue) -> Self {
        self.sort_at_least = Some((key, value));
        self
    }
}

/// Failure reported by the item engine
#[derive(Error, Debug)]
#[error("{operation} on {table} table: {message}")]
pub struct TableError {
    pub operation: &'static str,
    pub table: Table,
    pub message: String,
}

/// The operations of a partition/sort-key engine the store relies on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ItemTables: Send + Sync {
    /// Insert or fully replace the item with the same primary key
    async fn put_item(&self, table: Table, item: Item) -> std::result::Result<(), TableError>;

    /// Point read by primary key
    async fn get_item(&self, table: Table, key: Item)
        -> std::result::Result<Option<Item>, TableError>;

    /// Key-condition query, following pagination to the last page
    async fn query(&self, query: KeyQuery) -> std::result::Result<Vec<Item>, TableError>;

    /// Confirm both tables are reachable
    async fn ping(&self) -> std::result::Result<(), TableError>;
}

/// Prediction store over a partition/sort-key engine
#[derive(Clone)]
pub struct PartitionedStore {
    tables: Arc<dyn ItemTables>,
    fan_in_concurrency: usize,
}

impl PartitionedStore {
    pub fn new(tables: Arc<dyn ItemTables>, fan_in_concurrency: usize) -> Self {
        Self {
            tables,
            fan_in_concurrency: fan_in_concurrency.max(1),
        }
    }

    async fn fetch_session(&self, uid: &str) -> Result<Option<Item>> {
        let key = HashMap::from([(attr::UID.to_string(), AttributeValue::S(uid.to_string()))]);
        metrics::counter!("storage.partitioned.session_reads").increment(1);
        self.tables
            .get_item(Table::Sessions, key)
            .await
            .map_err(|e| StorageError::backend("get_item", e))
    }

    /// Collapse index hits to distinct sessions, in first-seen order, and
    /// read each session once for its timestamp
    async fn fan_in(&self, hits: Vec<Item>) -> Result<Vec<SessionSummary>> {
        let mut seen = HashSet::new();
        let mut uids = Vec::new();
        for hit in &hits {
            let uid = string_attr(hit, attr::PREDICTION_UID)?;
            if seen.insert(uid.clone()) {
                uids.push(uid);
            }
        }

        debug!(hits = hits.len(), distinct = uids.len(), "Fanning in index hits");

        let sessions: Vec<(String, Option<Item>)> = stream::iter(uids)
            .map(|uid| async move {
                let session = self.fetch_session(&uid).await?;
                Ok::<_, StorageError>((uid, session))
            })
            .buffered(self.fan_in_concurrency)
            .try_collect()
            .await?;

        let mut summaries = Vec::with_capacity(sessions.len());
        for (uid, session) in sessions {
            match session {
                Some(item) => summaries.push(SessionSummary {
                    timestamp: timestamp_attr(&item)?,
                    uid,
                }),
                // Detections written without their session are not reported
                None => debug!(uid = %uid, "Skipping detections with no session"),
            }
        }

        Ok(summaries)
    }
}

/// Sort key for one detection; the trailing id keeps repeated
/// label/score pairs within a session from replacing each other
pub fn label_score_key(label: &str, score: f64, detection_id: &str) -> String {
    format!("{label}#{score}#{detection_id}")
}

/// Translate a score floor into one the engine accepts with the same
/// matches. Stored scores are zero or at least [`MIN_STORABLE_MAGNITUDE`] in
/// magnitude, so a floor in the unrepresentable gap around zero selects the
/// same items as the nearest representable floor. `None` means nothing
/// stored can match.
fn storable_floor(min_score: f64) -> Option<f64> {
    if min_score > MAX_STORABLE_MAGNITUDE {
        None
    } else if min_score < -MAX_STORABLE_MAGNITUDE {
        Some(-MAX_STORABLE_MAGNITUDE)
    } else if min_score > 0.0 && min_score < MIN_STORABLE_MAGNITUDE {
        Some(MIN_STORABLE_MAGNITUDE)
    } else if min_score < 0.0 && min_score > -MIN_STORABLE_MAGNITUDE {
        Some(0.0)
    } else {
        Some(min_score)
    }
}

/// Numeric attribute text; the shortest round-trip form keeps stored order
/// identical to `f64` order
fn number(value: f64) -> AttributeValue {
    AttributeValue::N(value.to_string())
}

fn string_attr(item: &Item, name: &str) -> Result<String> {
    item.get(name)
        .and_then(|v| v.as_s().ok())
        .cloned()
        .ok_or_else(|| StorageError::Decode(format!("missing string attribute {name}")))
}

fn number_attr(item: &Item, name: &str) -> Result<f64> {
    let text = item
        .get(name)
        .and_then(|v| v.as_n().ok())
        .ok_or_else(|| StorageError::Decode(format!("missing number attribute {name}")))?;
    text.parse()
        .map_err(|e| StorageError::Decode(format!("invalid number {text:?} in {name}: {e}")))
}

fn timestamp_attr(item: &Item) -> Result<DateTime<Utc>> {
    let text = string_attr(item, attr::TIMESTAMP)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Decode(format!("invalid timestamp {text:?}: {e}")))
}

fn session_item(
    uid: &str,
    original_image: &str,
    predicted_image: &str,
    timestamp: DateTime<Utc>,
) -> Item {
    HashMap::from([
        (attr::UID.to_string(), AttributeValue::S(uid.to_string())),
        (
            attr::TIMESTAMP.to_string(),
            AttributeValue::S(timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)),
        ),
        (
            attr::ORIGINAL_IMAGE.to_string(),
            AttributeValue::S(original_image.to_string()),
        ),
        (
            attr::PREDICTED_IMAGE.to_string(),
            AttributeValue::S(predicted_image.to_string()),
        ),
    ])
}

fn detection_item(uid: &str, label: &str, score: f64, box_text: String) -> Item {
    let detection_id = Uuid::new_v4().to_string();
    HashMap::from([
        (attr::PREDICTION_UID.to_string(), AttributeValue::S(uid.to_string())),
        (
            attr::LABEL_SCORE.to_string(),
            AttributeValue::S(label_score_key(label, score, &detection_id)),
        ),
        (attr::DETECTION_ID.to_string(), AttributeValue::S(detection_id)),
        (attr::LABEL.to_string(), AttributeValue::S(label.to_string())),
        (attr::SCORE.to_string(), number(score)),
        (
            attr::SCORE_PARTITION.to_string(),
            AttributeValue::S(SCORE_PARTITION.to_string()),
        ),
        (attr::BOX.to_string(), AttributeValue::S(box_text)),
    ])
}

fn detection_view(item: &Item) -> Result<DetectionView> {
    Ok(DetectionView {
        label: string_attr(item, attr::LABEL)?,
        score: number_attr(item, attr::SCORE)?,
        bbox: BoundingBox::from_text(&string_attr(item, attr::BOX)?)?,
    })
}

#[async_trait]
impl PredictionStorage for PartitionedStore {
    #[instrument(skip(self, original_image, predicted_image), fields(backend = "dynamodb"))]
    async fn save_prediction(
        &self,
        uid: &str,
        original_image: &str,
        predicted_image: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let item = session_item(uid, original_image, predicted_image, timestamp);
        self.tables
            .put_item(Table::Sessions, item)
            .await
            .map_err(|e| StorageError::write("save_prediction", e))?;

        debug!(uid = %uid, "Prediction session saved");
        Ok(())
    }

    #[instrument(skip(self, bbox), fields(backend = "dynamodb"))]
    async fn save_detection(
        &self,
        uid: &str,
        label: &str,
        score: f64,
        bbox: &BoundingBox,
    ) -> Result<()> {
        let score = validate_storable_score(score)?;
        let item = detection_item(uid, label, score, bbox.to_text()?);
        self.tables
            .put_item(Table::Detections, item)
            .await
            .map_err(|e| StorageError::write("save_detection", e))
    }

    #[instrument(skip(self), fields(backend = "dynamodb"))]
    async fn get_prediction(&self, uid: &str) -> Result<SessionView> {
        let session = self
            .fetch_session(uid)
            .await?
            .ok_or_else(|| StorageError::not_found(uid))?;

        let query = KeyQuery::partition(
            Table::Detections,
            attr::PREDICTION_UID,
            AttributeValue::S(uid.to_string()),
        )
        .consistent_read();
        let items = self
            .tables
            .query(query)
            .await
            .map_err(|e| StorageError::backend("get_prediction", e))?;

        let detection_objects = items
            .iter()
            .map(detection_view)
            .collect::<Result<Vec<_>>>()?;

        Ok(SessionView {
            uid: uid.to_string(),
            timestamp: timestamp_attr(&session)?,
            original_image: string_attr(&session, attr::ORIGINAL_IMAGE)?,
            predicted_image: string_attr(&session, attr::PREDICTED_IMAGE)?,
            detection_objects,
        })
    }

    #[instrument(skip(self), fields(backend = "dynamodb"))]
    async fn get_predictions_by_label(&self, label: &str) -> Result<Vec<SessionSummary>> {
        let query = KeyQuery::partition(
            Table::Detections,
            attr::LABEL,
            AttributeValue::S(label.to_string()),
        )
        .on_index(Index::Label);

        let hits = self
            .tables
            .query(query)
            .await
            .map_err(|e| StorageError::backend("get_predictions_by_label", e))?;

        self.fan_in(hits).await
    }

    #[instrument(skip(self), fields(backend = "dynamodb"))]
    async fn get_predictions_by_score(&self, min_score: f64) -> Result<Vec<SessionSummary>> {
        let Some(floor) = storable_floor(min_score) else {
            return Ok(Vec::new());
        };

        let query = KeyQuery::partition(
            Table::Detections,
            attr::SCORE_PARTITION,
            AttributeValue::S(SCORE_PARTITION.to_string()),
        )
        .on_index(Index::Score)
        .sort_at_least(attr::SCORE, number(floor));

        let hits = self
            .tables
            .query(query)
            .await
            .map_err(|e| StorageError::backend("get_predictions_by_score", e))?;

        self.fan_in(hits).await
    }

    async fn check_health(&self) -> Result<()> {
        self.tables
            .ping()
            .await
            .map_err(|e| StorageError::backend("check_health", e))
    }
}

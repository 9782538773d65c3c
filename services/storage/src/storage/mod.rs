//! Storage contract and backend selection.
//!
//! Callers obtain one [`Storage`] at startup from [`Storage::from_config`] and
//! dispatch every request through [`PredictionStorage`]. The backend is fixed
//! for the lifetime of the process.

pub mod partitioned;
pub mod relational;

use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::model::{BoundingBox, SessionSummary, SessionView};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use partitioned::dynamodb::DynamoDbTables;
use partitioned::PartitionedStore;
use relational::RelationalStore;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Operations every backend exposes with identical observable behavior
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PredictionStorage: Send + Sync {
    /// Persist a session. Saving an existing uid overwrites its session
    /// fields and leaves its detections in place.
    async fn save_prediction(
        &self,
        uid: &str,
        original_image: &str,
        predicted_image: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<()>;

    /// Persist one detection owned by `uid`. Referential integrity is not
    /// checked; the session must be written first.
    async fn save_detection(
        &self,
        uid: &str,
        label: &str,
        score: f64,
        bbox: &BoundingBox,
    ) -> Result<()>;

    /// The session and every one of its detections
    async fn get_prediction(&self, uid: &str) -> Result<SessionView>;

    /// Each session owning at least one detection with exactly this label,
    /// reported once
    async fn get_predictions_by_label(&self, label: &str) -> Result<Vec<SessionSummary>>;

    /// Each session owning at least one detection with `score >= min_score`,
    /// reported once. `min_score` is not re-validated here.
    async fn get_predictions_by_score(&self, min_score: f64) -> Result<Vec<SessionSummary>>;

    /// Readiness probe against the backend
    async fn check_health(&self) -> Result<()>;
}

/// Supported backend kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Relational store on SQLite
    Sqlite,
    /// Partitioned store on DynamoDB
    DynamoDb,
}

impl FromStr for BackendKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sqlite" | "relational" => Ok(Self::Sqlite),
            "dynamodb" | "partitioned" => Ok(Self::DynamoDb),
            other => Err(StorageError::Config(format!(
                "unsupported storage backend: {other}"
            ))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Sqlite => write!(f, "sqlite"),
            BackendKind::DynamoDb => write!(f, "dynamodb"),
        }
    }
}

/// The active backend
#[derive(Clone)]
pub enum Storage {
    Relational(RelationalStore),
    Partitioned(PartitionedStore),
}

impl Storage {
    /// Construct the configured backend. The relational backend gets its
    /// schema created before it is returned.
    pub async fn from_config(config: &StorageConfig) -> Result<Self> {
        let kind: BackendKind = config.backend.parse()?;

        let storage = match kind {
            BackendKind::Sqlite => {
                let store = RelationalStore::new(&config.sqlite);
                store.init_schema().await?;
                Storage::Relational(store)
            }
            BackendKind::DynamoDb => {
                let tables = DynamoDbTables::new(&config.dynamodb).await?;
                if config.dynamodb.create_tables {
                    tables.ensure_tables().await?;
                }
                Storage::Partitioned(PartitionedStore::new(
                    Arc::new(tables),
                    config.dynamodb.fan_in_concurrency,
                ))
            }
        };

        info!(backend = %kind, "Prediction storage initialized");
        Ok(storage)
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Storage::Relational(_) => BackendKind::Sqlite,
            Storage::Partitioned(_) => BackendKind::DynamoDb,
        }
    }

    fn backend(&self) -> &dyn PredictionStorage {
        match self {
            Storage::Relational(store) => store,
            Storage::Partitioned(store) => store,
        }
    }
}

#[async_trait]
impl PredictionStorage for Storage {
    async fn save_prediction(
        &self,
        uid: &str,
        original_image: &str,
        predicted_image: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        self.backend()
            .save_prediction(uid, original_image, predicted_image, timestamp)
            .await?;
        metrics::counter!("storage.sessions.saved").increment(1);
        Ok(())
    }

    async fn save_detection(
        &self,
        uid: &str,
        label: &str,
        score: f64,
        bbox: &BoundingBox,
    ) -> Result<()> {
        self.backend().save_detection(uid, label, score, bbox).await?;
        metrics::counter!("storage.detections.saved").increment(1);
        Ok(())
    }

    async fn get_prediction(&self, uid: &str) -> Result<SessionView> {
        self.backend().get_prediction(uid).await
    }

    async fn get_predictions_by_label(&self, label: &str) -> Result<Vec<SessionSummary>> {
        self.backend().get_predictions_by_label(label).await
    }

    async fn get_predictions_by_score(&self, min_score: f64) -> Result<Vec<SessionSummary>> {
        self.backend().get_predictions_by_score(min_score).await
    }

    async fn check_health(&self) -> Result<()> {
        self.backend().check_health().await
    }
}

#[cfg(test)]
mod tests {
    use super::partitioned::memory::MemoryTables;
    use super::*;
    use crate::config::SqliteConfig;
    use crate::model::DetectionView;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    async fn both_backends() -> (Vec<Storage>, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            backend: "sqlite".to_string(),
            sqlite: SqliteConfig {
                path: dir.path().join("predictions.db"),
                busy_timeout_secs: 10,
            },
            ..Default::default()
        };
        let relational = Storage::from_config(&config).await.unwrap();
        let partitioned =
            Storage::Partitioned(PartitionedStore::new(Arc::new(MemoryTables::default()), 4));
        (vec![relational, partitioned], dir)
    }

    fn uids(summaries: &[SessionSummary]) -> BTreeSet<String> {
        summaries.iter().map(|s| s.uid.clone()).collect()
    }

    fn detection_set(view: &SessionView) -> Vec<String> {
        let mut detections: Vec<String> = view
            .detection_objects
            .iter()
            .map(|d: &DetectionView| format!("{}|{}|{:?}", d.label, d.score, d.bbox.0))
            .collect();
        detections.sort();
        detections
    }

    /// Session uid, detections as (label, score)
    fn workload() -> Vec<(&'static str, Vec<(&'static str, f64)>)> {
        vec![
            ("s1", vec![("person", 0.9), ("person", 0.9), ("person", 0.2), ("dog", 0.5)]),
            ("s2", vec![("cat", 0.5), ("car", 0.05)]),
            ("s3", vec![]),
            ("s4", vec![("person", 0.49999), ("truck", 1.0)]),
        ]
    }

    async fn apply_workload(storage: &Storage) {
        let bbox = BoundingBox([0.0, 1.5, 64.0, 128.25]);
        for (uid, detections) in workload() {
            storage
                .save_prediction(uid, &format!("original/{uid}.jpg"), &format!("predicted/{uid}.jpg"), Utc::now())
                .await
                .unwrap();
            for (label, score) in detections {
                storage.save_detection(uid, label, score, &bbox).await.unwrap();
            }
        }
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("sqlite".parse::<BackendKind>().unwrap(), BackendKind::Sqlite);
        assert_eq!("SQLite".parse::<BackendKind>().unwrap(), BackendKind::Sqlite);
        assert_eq!("dynamodb".parse::<BackendKind>().unwrap(), BackendKind::DynamoDb);
        assert_eq!("partitioned".parse::<BackendKind>().unwrap(), BackendKind::DynamoDb);
        assert!(matches!(
            "mongodb".parse::<BackendKind>(),
            Err(StorageError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_selector_rejects_unknown_backend() {
        let config = StorageConfig {
            backend: "cassandra".to_string(),
            ..Default::default()
        };
        let err = Storage::from_config(&config).await.err().unwrap();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[tokio::test]
    async fn test_selector_builds_relational_with_schema() {
        let (backends, _dir) = both_backends().await;
        assert_eq!(backends[0].kind(), BackendKind::Sqlite);
        assert_eq!(backends[1].kind(), BackendKind::DynamoDb);
        for storage in &backends {
            storage.check_health().await.unwrap();
            assert!(storage.get_predictions_by_score(0.0).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_documented_scenario() {
        let (backends, _dir) = both_backends().await;
        let box1 = BoundingBox([1.0, 2.0, 3.0, 4.0]);

        for storage in &backends {
            storage.save_prediction("abc", "in.jpg", "out.jpg", Utc::now()).await.unwrap();
            storage.save_detection("abc", "cat", 0.91, &box1).await.unwrap();
            storage.save_detection("abc", "dog", 0.40, &box1).await.unwrap();

            let by_label = storage.get_predictions_by_label("cat").await.unwrap();
            assert_eq!(by_label.len(), 1, "backend {}", storage.kind());
            assert_eq!(by_label[0].uid, "abc");

            let by_score = storage.get_predictions_by_score(0.5).await.unwrap();
            assert_eq!(by_score.len(), 1, "backend {}", storage.kind());
            assert_eq!(by_score[0].uid, "abc");

            assert!(storage.get_predictions_by_score(0.95).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_backends_agree() {
        let (backends, _dir) = both_backends().await;
        for storage in &backends {
            apply_workload(storage).await;
        }
        let (relational, partitioned) = (&backends[0], &backends[1]);

        for (uid, detections) in workload() {
            let left = relational.get_prediction(uid).await.unwrap();
            let right = partitioned.get_prediction(uid).await.unwrap();
            assert_eq!(left.original_image, right.original_image);
            assert_eq!(left.predicted_image, right.predicted_image);
            assert_eq!(left.detection_objects.len(), detections.len());
            assert_eq!(detection_set(&left), detection_set(&right), "uid {uid}");
        }

        for label in ["person", "dog", "cat", "car", "truck", "bicycle"] {
            let left = relational.get_predictions_by_label(label).await.unwrap();
            let right = partitioned.get_predictions_by_label(label).await.unwrap();
            assert_eq!(left.len(), uids(&left).len(), "duplicate uid for {label}");
            assert_eq!(right.len(), uids(&right).len(), "duplicate uid for {label}");
            assert_eq!(uids(&left), uids(&right), "label {label}");
        }

        for min_score in [0.0, 0.05, 0.2, 0.49999, 0.5, 0.9, 0.95, 1.0] {
            let left = relational.get_predictions_by_score(min_score).await.unwrap();
            let right = partitioned.get_predictions_by_score(min_score).await.unwrap();
            assert_eq!(left.len(), uids(&left).len());
            assert_eq!(right.len(), uids(&right).len());
            assert_eq!(uids(&left), uids(&right), "min_score {min_score}");
        }

        let expected: BTreeSet<String> = ["s1", "s4"].iter().map(|s| s.to_string()).collect();
        assert_eq!(uids(&relational.get_predictions_by_label("person").await.unwrap()), expected);
        let expected: BTreeSet<String> = ["s1", "s2", "s4"].iter().map(|s| s.to_string()).collect();
        assert_eq!(uids(&partitioned.get_predictions_by_score(0.5).await.unwrap()), expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_are_isolated_and_complete() {
        const SESSIONS: usize = 8;
        const PER_SESSION: usize = 20;

        let (backends, _dir) = both_backends().await;
        for storage in &backends {
            let sessions = (0..SESSIONS).map(|s| {
                let storage = storage.clone();
                tokio::spawn(async move {
                    storage
                        .save_prediction(&format!("c{s}"), "in.jpg", "out.jpg", Utc::now())
                        .await
                })
            });
            for result in futures::future::join_all(sessions).await {
                result.unwrap().unwrap();
            }

            let mut writes = Vec::new();
            for s in 0..SESSIONS {
                for d in 0..PER_SESSION {
                    let storage = storage.clone();
                    writes.push(tokio::spawn(async move {
                        // The box records which session and write produced it
                        let bbox = BoundingBox([s as f64, d as f64, 1.0, 1.0]);
                        storage
                            .save_detection(&format!("c{s}"), "person", 0.5, &bbox)
                            .await
                    }));
                }
            }
            for result in futures::future::join_all(writes).await {
                result.unwrap().unwrap();
            }

            for s in 0..SESSIONS {
                let view = storage.get_prediction(&format!("c{s}")).await.unwrap();
                assert_eq!(
                    view.detection_objects.len(),
                    PER_SESSION,
                    "backend {} session c{s}",
                    storage.kind()
                );
                assert!(view.detection_objects.iter().all(|d| d.bbox.0[0] == s as f64));

                let mut writes: Vec<usize> = view
                    .detection_objects
                    .iter()
                    .map(|d| d.bbox.0[1] as usize)
                    .collect();
                writes.sort_unstable();
                assert_eq!(writes, (0..PER_SESSION).collect::<Vec<_>>());
            }

            let by_label = storage.get_predictions_by_label("person").await.unwrap();
            assert_eq!(by_label.len(), SESSIONS);
            assert_eq!(uids(&by_label).len(), SESSIONS);
        }
    }

    #[tokio::test]
    async fn test_missing_session_not_found_everywhere() {
        let (backends, _dir) = both_backends().await;
        for storage in &backends {
            let err = storage.get_prediction("never-created").await.unwrap_err();
            assert!(matches!(err, StorageError::NotFound { .. }), "backend {}", storage.kind());
        }
    }
}

use crate::error::Result;
use crate::model::DetectionInput;
use crate::storage::PredictionStorage;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Output of one detector invocation over one image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRun {
    /// Location of the uploaded input image
    pub original_image: String,
    /// Location of the annotated output image
    pub predicted_image: String,
    /// Detector records, one per detected object
    #[serde(default)]
    pub detections: Vec<DetectionInput>,
}

/// What was recorded for a detection run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReceipt {
    pub prediction_uid: String,
    /// Objects reported by the detector
    pub detection_count: usize,
    pub labels: Vec<String>,
    /// Detection writes that failed and were dropped
    #[serde(default)]
    pub dropped_detections: usize,
}

/// Persist a detection run: the session first, then one write per detection.
///
/// A failed session write fails the run. A failed detection write is logged
/// and counted, and the remaining detections are still written; the run
/// succeeds with partial detections.
#[instrument(skip(storage, run), fields(detections = run.detections.len()))]
pub async fn record_run(storage: &dyn PredictionStorage, run: &DetectionRun) -> Result<RunReceipt> {
    let uid = Uuid::new_v4().to_string();

    storage
        .save_prediction(&uid, &run.original_image, &run.predicted_image, Utc::now())
        .await?;

    let mut dropped = 0;
    for detection in &run.detections {
        if let Err(e) = storage
            .save_detection(&uid, &detection.label, detection.score, &detection.bbox)
            .await
        {
            warn!(
                uid = %uid,
                label = %detection.label,
                error = %e,
                "Dropping detection after failed write"
            );
            metrics::counter!("storage.detections.dropped").increment(1);
            dropped += 1;
        }
    }

    info!(
        uid = %uid,
        detection_count = run.detections.len(),
        dropped = dropped,
        "Detection run recorded"
    );

    Ok(RunReceipt {
        prediction_uid: uid,
        detection_count: run.detections.len(),
        labels: run.detections.iter().map(|d| d.label.clone()).collect(),
        dropped_detections: dropped,
    })
}

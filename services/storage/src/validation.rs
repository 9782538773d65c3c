//! Request-layer input checks.
//!
//! Score bounds and label membership are enforced here, before a call is
//! dispatched to a backend. The one check the stores repeat is
//! [`validate_storable_score`], so both backends reject the same scores.

use crate::error::{Result, StorageError};
use crate::model::DetectionInput;
use std::collections::HashSet;

/// Class names emitted by the COCO-trained reference detector
pub const COCO_LABELS: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat",
    "dog", "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack",
    "umbrella", "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball",
    "kite", "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket",
    "bottle", "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple",
    "sandwich", "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair",
    "couch", "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse",
    "remote", "keyboard", "cell phone", "microwave", "oven", "toaster", "sink",
    "refrigerator", "book", "clock", "vase", "scissors", "teddy bear", "hair drier",
    "toothbrush",
];

/// Smallest non-zero magnitude a DynamoDB number can hold
pub const MIN_STORABLE_MAGNITUDE: f64 = 1e-130;

/// Largest magnitude a DynamoDB number can hold
pub const MAX_STORABLE_MAGNITUDE: f64 = 9.999_999_999_999_999e125;

/// Check a score can be persisted by every backend: finite, and either zero
/// or within the magnitude range of a DynamoDB number
pub fn validate_storable_score(score: f64) -> Result<f64> {
    let magnitude = score.abs();
    if score.is_finite()
        && (magnitude == 0.0
            || (MIN_STORABLE_MAGNITUDE..=MAX_STORABLE_MAGNITUDE).contains(&magnitude))
    {
        Ok(score)
    } else {
        Err(StorageError::Validation(format!(
            "score {score:e} cannot be stored"
        )))
    }
}

/// Check a confidence threshold or detection score lies in [0.0, 1.0]
pub fn validate_score(score: f64) -> Result<f64> {
    if score.is_finite() && (0.0..=1.0).contains(&score) {
        Ok(score)
    } else {
        Err(StorageError::Validation(format!(
            "score must be between 0.0 and 1.0, got {score}"
        )))
    }
}

/// Check one detector record before it is persisted
pub fn validate_detection(detection: &DetectionInput) -> Result<()> {
    if detection.label.trim().is_empty() {
        return Err(StorageError::Validation(
            "detection label must not be empty".to_string(),
        ));
    }
    validate_score(detection.score)?;
    validate_storable_score(detection.score)?;
    detection.bbox.to_text().map(|_| ())
}

/// The detector's fixed label vocabulary
#[derive(Debug, Clone)]
pub struct LabelVocabulary {
    /// `None` accepts any label
    labels: Option<HashSet<String>>,
}

impl LabelVocabulary {
    /// Vocabulary of the reference detector
    pub fn coco() -> Self {
        Self {
            labels: Some(COCO_LABELS.iter().map(|l| l.to_string()).collect()),
        }
    }

    /// Vocabulary that accepts every label
    pub fn open() -> Self {
        Self { labels: None }
    }

    /// Build from configuration: absent means COCO, empty means open
    pub fn from_config(labels: Option<&[String]>) -> Self {
        match labels {
            None => Self::coco(),
            Some([]) => Self::open(),
            Some(labels) => Self {
                labels: Some(labels.iter().cloned().collect()),
            },
        }
    }

    pub fn contains(&self, label: &str) -> bool {
        self.labels
            .as_ref()
            .map(|labels| labels.contains(label))
            .unwrap_or(true)
    }

    /// Reject labels the detector can never produce
    pub fn validate(&self, label: &str) -> Result<()> {
        if self.contains(label) {
            Ok(())
        } else {
            Err(StorageError::Validation(format!("unknown label: {label}")))
        }
    }
}

impl Default for LabelVocabulary {
    fn default() -> Self {
        Self::coco()
    }
}

//! Prediction session and detection record model.
//!
//! These are the plain structures that cross the storage contract boundary.
//! Neither backend leaks its own row or item types past this module.

use crate::error::{Result, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bounding box geometry as emitted by the detector, `[x1, y1, x2, y2]`.
///
/// The stores never interpret the coordinates. Both backends persist the
/// JSON text form and hand back the same value on read.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoundingBox(pub [f64; 4]);

impl BoundingBox {
    /// Serialized textual form stored in the `box` column / attribute
    pub fn to_text(&self) -> Result<String> {
        if self.0.iter().any(|c| !c.is_finite()) {
            return Err(StorageError::Validation(format!(
                "bounding box has non-finite coordinates: {:?}",
                self.0
            )));
        }
        serde_json::to_string(&self.0)
            .map_err(|e| StorageError::Validation(format!("unserializable bounding box: {e}")))
    }

    /// Parse the stored textual form back into coordinates
    pub fn from_text(text: &str) -> Result<Self> {
        serde_json::from_str::<[f64; 4]>(text)
            .map(Self)
            .map_err(|e| StorageError::Decode(format!("invalid box {text:?}: {e}")))
    }
}

/// One detector output record, as handed to `save_detection`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionInput {
    /// Category name from the detector vocabulary
    pub label: String,
    /// Confidence in [0.0, 1.0]
    pub score: f64,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
}

/// A stored detection as returned inside a [`SessionView`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionView {
    pub label: String,
    pub score: f64,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
}

/// A session with its complete detection set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionView {
    pub uid: String,
    pub timestamp: DateTime<Utc>,
    pub original_image: String,
    pub predicted_image: String,
    /// No insertion order is implied
    pub detection_objects: Vec<DetectionView>,
}

/// Session identity returned by label and score queries
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionSummary {
    pub uid: String,
    pub timestamp: DateTime<Utc>,
}

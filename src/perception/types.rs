use serde::{Deserialize, Serialize};

pub const DETECTION_SOURCE: &str = "holo-localization";

/// Coarse reliability bucket, independent of the acceptance threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceZone {
    VeryLow,
    Low,
    Medium,
    High,
}

impl ConfidenceZone {
    /// Each zone is inclusive of its lower bound.
    pub fn of(confidence: f64) -> Self {
        if confidence >= 0.70 {
            ConfidenceZone::High
        } else if confidence >= 0.40 {
            ConfidenceZone::Medium
        } else if confidence >= 0.20 {
            ConfidenceZone::Low
        } else {
            ConfidenceZone::VeryLow
        }
    }
}

/// One finalized, geometrically valid UI element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// `[x, y, width, height]` in original-image pixels.
    pub bbox: [u32; 4],
    /// `[x, y]` in original-image pixels, always inside `bbox`.
    pub center: [u32; 2],
    pub confidence: f64,
    #[serde(rename = "type")]
    pub element_type: String,
    pub caption: String,
    pub content: String,
    pub interactable: bool,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_zone: Option<ConfidenceZone>,
    /// Dense index assigned after final ordering.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub element_id: Option<usize>,
    #[serde(skip_serializing, default)]
    pub raw_output: String,
    #[serde(skip_serializing, default)]
    pub task: String,
}

impl Detection {
    pub fn center_f64(&self) -> (f64, f64) {
        (self.center[0] as f64, self.center[1] as f64)
    }

    /// Half-open containment test of `center` against `bbox`.
    pub fn center_in_bbox(&self) -> bool {
        let [x, y, w, h] = self.bbox;
        let [cx, cy] = self.center;
        cx >= x && cx < x + w && cy >= y && cy < y + h
    }

    /// Lowercased type used for threshold lookup.
    pub fn type_key(&self) -> String {
        self.element_type.trim().to_lowercase()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

/// Reassign dense `element_id`s in current order.
pub fn assign_ids(detections: &mut [Detection]) {
    for (idx, det) in detections.iter_mut().enumerate() {
        det.element_id = Some(idx);
    }
}

#[cfg(test)]
pub(crate) fn sample(x: u32, y: u32, confidence: f64, element_type: &str) -> Detection {
    Detection {
        bbox: [x.saturating_sub(10), y.saturating_sub(10), 20, 20],
        center: [x, y],
        confidence,
        element_type: element_type.into(),
        caption: format!("{element_type} at {x},{y}"),
        content: format!("{element_type} at {x},{y}"),
        interactable: true,
        source: DETECTION_SOURCE.into(),
        confidence_zone: None,
        element_id: None,
        raw_output: String::new(),
        task: String::new(),
    }
}

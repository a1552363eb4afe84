use serde::{Deserialize, Serialize};

use crate::perception::confidence::ConfidenceStats;
use crate::perception::types::{Detection, ImageSize};

/// Where an attempt loop ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "attempt", rename_all = "snake_case")]
pub enum LoopState {
    Attempt(u32),
    /// The model answer was parsed into a structured result.
    Success,
    /// Every attempt was spent without a structured result.
    Exhausted,
    /// A model-call failure or cancellation ended the loop early.
    Aborted,
}

impl LoopState {
    pub fn is_success(&self) -> bool {
        matches!(self, LoopState::Success)
    }
}

/// One step of the retry fold: the prompt sent on attempt `index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub index: u32,
    pub prompt: String,
}

impl Attempt {
    pub fn first(prompt: String) -> Self {
        Self { index: 0, prompt }
    }

    /// The next attempt, with its prompt derived from this one.
    pub fn next(&self, augment: impl FnOnce(&str) -> String) -> Self {
        Self {
            index: self.index + 1,
            prompt: augment(&self.prompt),
        }
    }
}

/// Result of one multi-element detection pass, before confidence filtering.
#[derive(Debug, Clone, Default)]
pub struct DetectionRun {
    pub detections: Vec<Detection>,
    /// Raw model text of every call made, in order.
    pub raw_outputs: Vec<String>,
    pub structured_success: bool,
    pub used_legacy_fallback: bool,
}

/// Per-request options; `None` defers to the resolved profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseRequest {
    /// Single-element mode when set.
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default = "default_true")]
    pub detect_multiple: bool,
    #[serde(default = "default_true")]
    pub include_som: bool,
    #[serde(default)]
    pub max_detections: Option<usize>,
    #[serde(default)]
    pub min_confidence: Option<f64>,
    #[serde(default)]
    pub return_raw_outputs: Option<bool>,
    #[serde(default)]
    pub performance_profile: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for ParseRequest {
    fn default() -> Self {
        Self {
            task: None,
            detect_multiple: true,
            include_som: true,
            max_detections: None,
            min_confidence: None,
            return_raw_outputs: None,
            performance_profile: None,
        }
    }
}

impl ParseRequest {
    pub fn task(task: impl Into<String>) -> Self {
        Self {
            task: Some(task.into()),
            ..Self::default()
        }
    }
}

/// What the serving layer receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseOutcome {
    pub request_id: String,
    pub elements: Vec<Detection>,
    pub count: usize,
    pub processing_time_ms: f64,
    pub image_size: ImageSize,
    pub model: String,
    pub profile: String,
    pub max_detections: usize,
    pub min_confidence: f64,
    pub confidence_stats: ConfidenceStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub som_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_model_outputs: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_fold_their_prompts() {
        let a0 = Attempt::first("base".into());
        let a1 = a0.next(|p| format!("{p}+"));
        let a2 = a1.next(|p| format!("{p}+"));
        assert_eq!(a0.prompt, "base");
        assert_eq!((a2.index, a2.prompt.as_str()), (2, "base++"));
    }

    #[test]
    fn request_defaults_from_empty_json() {
        let req: ParseRequest = serde_json::from_str("{}").unwrap();
        assert!(req.detect_multiple);
        assert!(req.include_som);
        assert!(req.task.is_none());
    }

    #[test]
    fn loop_state_serializes_with_attempt_index() {
        let json = serde_json::to_value(LoopState::Attempt(2)).unwrap();
        assert_eq!(json["state"], "attempt");
        assert_eq!(json["attempt"], 2);
        assert!(LoopState::Success.is_success());
        assert!(!LoopState::Exhausted.is_success());
    }
}

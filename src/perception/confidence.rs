/// Confidence zoning and per-type acceptance thresholds.
use serde::{Deserialize, Serialize};

use crate::perception::types::{ConfidenceZone, Detection};

/// Element-type thresholds; types not listed use `default`.
pub const ADAPTIVE_THRESHOLDS: &[(&str, f64)] = &[
    ("button", 0.35),
    ("icon", 0.30),
    ("link", 0.40),
    ("input", 0.45),
    ("text", 0.25),
    ("menu", 0.35),
    ("clickable", 0.30),
    ("default", 0.30),
];

pub fn adaptive_threshold(element_type: &str) -> f64 {
    let key = element_type.trim().to_lowercase();
    ADAPTIVE_THRESHOLDS
        .iter()
        .find(|(t, _)| *t == key)
        .or_else(|| ADAPTIVE_THRESHOLDS.iter().find(|(t, _)| *t == "default"))
        .map(|(_, v)| *v)
        .unwrap_or(0.30)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdMode {
    /// Per-element-type table.
    Adaptive,
    /// One floor for every type.
    Fixed(f64),
}

impl ThresholdMode {
    pub fn threshold_for(&self, element_type: &str) -> f64 {
        match self {
            ThresholdMode::Adaptive => adaptive_threshold(element_type),
            ThresholdMode::Fixed(floor) => *floor,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ThresholdMode::Adaptive => "adaptive",
            ThresholdMode::Fixed(_) => "fixed",
        }
    }
}

/// Zone distribution of the classified detections plus the number dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidenceStats {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub very_low: usize,
    pub filtered: usize,
}

impl ConfidenceStats {
    fn record(&mut self, zone: ConfidenceZone) {
        match zone {
            ConfidenceZone::High => self.high += 1,
            ConfidenceZone::Medium => self.medium += 1,
            ConfidenceZone::Low => self.low += 1,
            ConfidenceZone::VeryLow => self.very_low += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.high + self.medium + self.low + self.very_low
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// Drop detections under their threshold; tag survivors with their zone and
/// round their confidence to 4 decimals. Order is preserved.
pub fn classify(detections: Vec<Detection>, mode: ThresholdMode) -> (Vec<Detection>, ConfidenceStats) {
    let mut stats = ConfidenceStats::default();
    let mut kept = Vec::with_capacity(detections.len());

    for mut det in detections {
        let confidence = det.confidence;
        let zone = ConfidenceZone::of(confidence);
        stats.record(zone);

        if confidence >= mode.threshold_for(&det.type_key()) {
            det.confidence_zone = Some(zone);
            det.confidence = round4(confidence);
            kept.push(det);
        } else {
            stats.filtered += 1;
        }
    }

    let total = stats.total();
    if total > 0 {
        tracing::info!(
            mode = mode.label(),
            high = stats.high,
            medium = stats.medium,
            low = stats.low,
            very_low = stats.very_low,
            filtered = stats.filtered,
            retained = kept.len(),
            total,
            "confidence filtering"
        );
    }
    (kept, stats)
}

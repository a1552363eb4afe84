/// Center-radius deduplication of detections.
use crate::perception::types::Detection;

/// Ordered set of accepted centers. A candidate is a duplicate iff its
/// Euclidean distance to any accepted center is strictly below `radius`.
#[derive(Debug, Clone)]
pub struct CenterSet {
    radius: f64,
    centers: Vec<(f64, f64)>,
}

impl CenterSet {
    pub fn new(radius: f64) -> Self {
        Self {
            radius: radius.max(0.0),
            centers: Vec::new(),
        }
    }

    pub fn is_duplicate(&self, (x, y): (f64, f64)) -> bool {
        let r2 = self.radius * self.radius;
        self.centers.iter().any(|&(sx, sy)| {
            let dx = x - sx;
            let dy = y - sy;
            dx * dx + dy * dy < r2
        })
    }

    /// Accept `center` unless it is a duplicate; returns whether it was accepted.
    pub fn insert(&mut self, center: (f64, f64)) -> bool {
        if self.is_duplicate(center) {
            return false;
        }
        self.centers.push(center);
        true
    }

    pub fn len(&self) -> usize {
        self.centers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.centers.is_empty()
    }
}

/// First-seen wins.
pub fn deduplicate(detections: Vec<Detection>, radius: f64) -> Vec<Detection> {
    let mut seen = CenterSet::new(radius);
    detections
        .into_iter()
        .filter(|d| seen.insert(d.center_f64()))
        .collect()
}

/// Highest confidence wins; result is ordered by descending confidence.
pub fn deduplicate_ranked(mut detections: Vec<Detection>, radius: f64) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    deduplicate(detections, radius)
}

/// Merge two already-deduplicated sets, treating `accepted` as fixed.
pub fn merge(accepted: Vec<Detection>, extra: Vec<Detection>, radius: f64) -> Vec<Detection> {
    let before = accepted.len() + extra.len();
    let mut seen = CenterSet::new(radius);
    for d in &accepted {
        seen.centers.push(d.center_f64());
    }
    let mut out = accepted;
    out.extend(extra.into_iter().filter(|d| seen.insert(d.center_f64())));
    tracing::debug!(before, after = out.len(), "merged detection sets");
    out
}

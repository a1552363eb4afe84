/// Turn one raw element description into a canonical [`Detection`].
///
/// Coordinates are resolved from `x`/`y`, then from `bbox` corners, then from
/// `x_norm`/`y_norm`. Any value in `[0, 1]` is read as normalized to the
/// resized image, so a literal pixel coordinate of 0 or 1 is scaled too; tiny
/// elements hugging the origin can be misplaced by this.
use crate::perception::raw_element::{Field, RawElement};
use crate::perception::scaling::ScaleFactors;
use crate::perception::types::{Detection, DETECTION_SOURCE};

pub const DEFAULT_ELEMENT_TYPE: &str = "clickable";

#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    /// Box side used when the model gives no size hint.
    pub click_box_size: u32,
    pub default_confidence: f64,
}

/// Provenance carried into every detection built from one model answer.
#[derive(Debug, Clone, Copy)]
pub struct Origin<'a> {
    /// Label used when the element carries none or an unusable one.
    pub fallback_label: &'a str,
    /// Instruction the answer was produced for.
    pub task: &'a str,
    pub raw_output: &'a str,
}

impl Normalizer {
    pub fn new(click_box_size: u32, default_confidence: f64) -> Self {
        Self {
            click_box_size: click_box_size.max(1),
            default_confidence: default_confidence.clamp(0.0, 1.0),
        }
    }

    /// Convert a structured element. Returns `None` when no point can be resolved.
    pub fn element(
        &self,
        elem: RawElement<'_>,
        scale: &ScaleFactors,
        origin: Origin<'_>,
    ) -> Option<Detection> {
        let rw = scale.resized_width as f64;
        let rh = scale.resized_height as f64;

        let mut x = elem.number(Field::X);
        let mut y = elem.number(Field::Y);
        let mut corner_size = (None, None);

        if x.is_none() && y.is_none() {
            if let Some([x1, y1, x2, y2]) = elem.corners() {
                let (w, h) = (x2 - x1, y2 - y1);
                x = Some(x1 + w / 2.0);
                y = Some(y1 + h / 2.0);
                corner_size = (Some(w), Some(h));
            }
        }
        if x.is_none() {
            x = elem.number(Field::XNorm).map(|v| v * rw);
        }
        if y.is_none() {
            y = elem.number(Field::YNorm).map(|v| v * rh);
        }
        let (x, y) = (x?, y?);

        let raw_label = elem
            .text(Field::Label)
            .unwrap_or_else(|| origin.fallback_label.to_string());
        let label = clean_label(&raw_label, origin.fallback_label);
        let element_type = elem
            .text(Field::Type)
            .unwrap_or_else(|| DEFAULT_ELEMENT_TYPE.to_string());

        let width = elem
            .number(Field::Width)
            .or(corner_size.0)
            .or_else(|| elem.number(Field::WidthNorm).map(|v| v * rw));
        let height = elem
            .number(Field::Height)
            .or(corner_size.1)
            .or_else(|| elem.number(Field::HeightNorm).map(|v| v * rh));

        Some(self.point(
            (x, y),
            (width, height),
            scale,
            &label,
            &element_type,
            elem.number(Field::Confidence),
            origin,
        ))
    }

    /// Build a detection around a model-space point.
    ///
    /// The point is clamped into the image first, then the box is centered on
    /// it, pushed to non-negative offsets and shrunk at the far edges, which
    /// keeps the center inside the box.
    #[allow(clippy::too_many_arguments)]
    pub fn point(
        &self,
        (x, y): (f64, f64),
        (width_hint, height_hint): (Option<f64>, Option<f64>),
        scale: &ScaleFactors,
        label: &str,
        element_type: &str,
        confidence: Option<f64>,
        origin: Origin<'_>,
    ) -> Detection {
        let rw = scale.resized_width as f64;
        let rh = scale.resized_height as f64;

        let (ox, oy) = scale.to_original(denormalize(x, rw), denormalize(y, rh));
        let img_w = i64::from(scale.original_width.max(1));
        let img_h = i64::from(scale.original_height.max(1));
        let cx = ox.clamp(0, img_w - 1);
        let cy = oy.clamp(0, img_h - 1);

        let side = |hint: Option<f64>, resized: f64, factor: f64| -> i64 {
            match hint {
                Some(v) => ((denormalize(v, resized) * factor).round() as i64).max(1),
                None => i64::from(self.click_box_size),
            }
        };
        let bw = side(width_hint, rw, scale.width_scale);
        let bh = side(height_hint, rh, scale.height_scale);

        let bx = (cx - bw / 2).max(0);
        let by = (cy - bh / 2).max(0);
        let bw = bw.min(img_w - bx).max(1);
        let bh = bh.min(img_h - by).max(1);

        let confidence = confidence
            .unwrap_or(self.default_confidence)
            .clamp(0.0, 1.0);
        let caption = if label.is_empty() {
            origin.fallback_label.to_string()
        } else {
            label.to_string()
        };
        let element_type = if element_type.is_empty() {
            DEFAULT_ELEMENT_TYPE
        } else {
            element_type
        };

        Detection {
            bbox: [bx as u32, by as u32, bw as u32, bh as u32],
            center: [cx as u32, cy as u32],
            confidence,
            element_type: element_type.to_string(),
            caption: caption.clone(),
            content: caption,
            interactable: true,
            source: DETECTION_SOURCE.to_string(),
            confidence_zone: None,
            element_id: None,
            raw_output: origin.raw_output.to_string(),
            task: origin.task.to_string(),
        }
    }
}

/// `[0, 1]` values are fractions of the resized side.
fn denormalize(v: f64, resized_side: f64) -> f64 {
    if (0.0..=1.0).contains(&v) && resized_side > 1.0 {
        v * resized_side
    } else {
        v
    }
}

// ── Label cleanup ────────────────────────────────────────────────────────────

const PROMPT_OPENERS: &[&str] = &[
    "identify ",
    "highlight ",
    "list ",
    "surface ",
    "find ",
    "locate ",
    "detect ",
    "show ",
    "point out ",
    "mark ",
];

const PROMPT_PHRASES: &[&str] = &[
    "such as",
    "that appear",
    "elements like",
    "controls such",
    "the user might",
    "interactive elements",
    "ui elements",
];

const UI_NOUNS: &[&str] = &["button", "icon", "menu", "tab", "input", "field", "link", "window"];

/// True when the text reads like an echoed instruction rather than a UI label.
pub fn is_prompt_instruction(text: &str) -> bool {
    if text.chars().count() < 5 {
        return false;
    }
    let normalized = text.trim().to_lowercase();

    if PROMPT_OPENERS.iter().any(|p| normalized.starts_with(p)) {
        return true;
    }
    if PROMPT_PHRASES.iter().any(|p| normalized.contains(p)) {
        return true;
    }
    // Real labels are short unless they name a concrete control.
    text.chars().count() > 60 && !UI_NOUNS.iter().any(|n| normalized.contains(n))
}

/// Trim, reject echoed instructions, and drop a leading article.
pub fn clean_label(label: &str, fallback: &str) -> String {
    let cleaned = label.trim();
    if cleaned.is_empty() {
        return fallback.to_string();
    }
    if is_prompt_instruction(cleaned) {
        tracing::debug!(label = %truncate(cleaned, 60), "dropping instruction-like label");
        return fallback.to_string();
    }

    let mut cleaned = cleaned;
    for article in ["a ", "an ", "the "] {
        let lower_prefix = cleaned.get(..article.len()).map(str::to_lowercase);
        if lower_prefix.as_deref() == Some(article) && cleaned.len() > article.len() + 5 {
            cleaned = &cleaned[article.len()..];
        }
    }
    cleaned.to_string()
}

pub(crate) fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    const TASK: &str = "Click the save button";

    fn normalizer() -> Normalizer {
        Normalizer::new(40, 0.85)
    }

    fn origin() -> Origin<'static> {
        Origin {
            fallback_label: TASK,
            task: TASK,
            raw_output: "raw",
        }
    }

    fn run(v: &Value, scale: &ScaleFactors) -> Option<Detection> {
        normalizer().element(RawElement::from_value(v).unwrap(), scale, origin())
    }

    #[test]
    fn absolute_point_on_unscaled_image() {
        let scale = ScaleFactors::identity(800, 600);
        let det = run(&json!({"x": 100, "y": 50, "label": "Save"}), &scale).unwrap();
        assert_eq!(det.center, [100, 50]);
        assert_eq!(det.bbox, [80, 30, 40, 40]);
        assert_eq!(det.caption, "Save");
        assert_eq!(det.content, "Save");
        assert_eq!(det.element_type, "clickable");
        assert_eq!(det.confidence, 0.85);
        assert_eq!(det.task, TASK);
        assert!(det.center_in_bbox());
    }

    #[test]
    fn normalized_point_uses_resized_dimensions() {
        let scale = ScaleFactors::identity(1000, 800);
        let det = run(&json!({"x": 0.5, "y": 0.5, "label": "Center"}), &scale).unwrap();
        assert_eq!(det.center, [500, 400]);
    }

    #[test]
    fn resized_coordinates_map_back_to_original() {
        let scale = ScaleFactors::compute(2000, 1000, 1000 * 500, 28).unwrap();
        let det = run(&json!({"x": 100, "y": 100}), &scale).unwrap();
        let (ex, ey) = scale.to_original(100.0, 100.0);
        assert_eq!(det.center, [ex as u32, ey as u32]);
    }

    #[test]
    fn bbox_corners_give_center_and_size() {
        let scale = ScaleFactors::identity(800, 600);
        let det = run(&json!({"bbox": [100, 100, 200, 140]}), &scale).unwrap();
        assert_eq!(det.center, [150, 120]);
        assert_eq!(det.bbox, [100, 100, 100, 40]);
    }

    #[test]
    fn explicit_size_wins_over_corners() {
        let scale = ScaleFactors::identity(800, 600);
        let det = run(&json!({"bbox": [100, 100, 200, 140], "w": 20}), &scale).unwrap();
        assert_eq!(det.bbox[2], 20);
        assert_eq!(det.bbox[3], 40);
    }

    #[test]
    fn norm_fields_fill_missing_axes() {
        let scale = ScaleFactors::identity(1000, 800);
        let det = run(
            &json!({"x_norm": 0.25, "y": 200, "width_norm": 0.1, "height_pixels": 30}),
            &scale,
        )
        .unwrap();
        assert_eq!(det.center, [250, 200]);
        assert_eq!(det.bbox, [200, 185, 100, 30]);
    }

    #[test]
    fn unresolvable_point_is_rejected() {
        let scale = ScaleFactors::identity(800, 600);
        assert!(run(&json!({"x": 10, "label": "half"}), &scale).is_none());
        assert!(run(&json!({"x": null, "y": null, "label": "not found"}), &scale).is_none());
        assert!(run(&json!({"label": "nothing"}), &scale).is_none());
    }

    #[test]
    fn far_edge_shrinks_box_without_shifting() {
        let scale = ScaleFactors::identity(800, 600);
        let det = run(&json!({"x": 795, "y": 598}), &scale).unwrap();
        assert_eq!(det.center, [795, 598]);
        assert_eq!(det.bbox, [775, 578, 25, 22]);
        assert!(det.center_in_bbox());
    }

    #[test]
    fn near_edge_clamps_offset() {
        let scale = ScaleFactors::identity(800, 600);
        let det = run(&json!({"x": 5, "y": 3}), &scale).unwrap();
        assert_eq!(det.bbox[0], 0);
        assert_eq!(det.bbox[1], 0);
        assert!(det.center_in_bbox());
    }

    #[test]
    fn off_image_points_stay_inside() {
        let scale = ScaleFactors::identity(800, 600);
        for v in [
            json!({"x": 5000, "y": -40}),
            json!({"x": -3, "y": 9000}),
            json!({"x": 799.6, "y": 599.6, "width": 300, "height": 300}),
        ] {
            let det = run(&v, &scale).unwrap();
            let [bx, by, bw, bh] = det.bbox;
            assert!(det.center[0] < 800 && det.center[1] < 600);
            assert!(bw >= 1 && bh >= 1);
            assert!(bx + bw <= 800 && by + bh <= 600);
            assert!(det.center_in_bbox(), "{v}: {:?} {:?}", det.center, det.bbox);
        }
    }

    #[test]
    fn confidence_is_clamped() {
        let scale = ScaleFactors::identity(800, 600);
        let high = run(&json!({"x": 10, "y": 10, "confidence": 7.5}), &scale).unwrap();
        let low = run(&json!({"x": 10, "y": 10, "confidence": -2}), &scale).unwrap();
        let text = run(&json!({"x": 10, "y": 10, "confidence": "0.42"}), &scale).unwrap();
        assert_eq!(high.confidence, 1.0);
        assert_eq!(low.confidence, 0.0);
        assert_eq!(text.confidence, 0.42);
    }

    #[test]
    fn label_priority_and_type_alias() {
        let scale = ScaleFactors::identity(800, 600);
        let det = run(
            &json!({"x": 10, "y": 10, "description": "Search field", "name": "x", "category": "input"}),
            &scale,
        )
        .unwrap();
        assert_eq!(det.caption, "Search field");
        assert_eq!(det.element_type, "input");
    }

    #[test]
    fn instruction_labels_fall_back() {
        assert!(is_prompt_instruction("Identify all buttons on screen"));
        assert!(is_prompt_instruction("controls such as tabs"));
        assert!(is_prompt_instruction(
            "A long rambling sentence about what the screenshot contains overall"
        ));
        assert!(!is_prompt_instruction("Save"));
        assert!(!is_prompt_instruction("Settings icon in the top right corner of the main window"));
        assert_eq!(clean_label("Locate the install button", "UI element"), "UI element");
    }

    #[test]
    fn leading_article_is_stripped() {
        assert_eq!(clean_label("The settings gear", "x"), "settings gear");
        assert_eq!(clean_label("a Submit button", "x"), "Submit button");
        assert_eq!(clean_label("the OK", "x"), "the OK");
        assert_eq!(clean_label("   ", "fallback"), "fallback");
    }
}

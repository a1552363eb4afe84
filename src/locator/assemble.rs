/// Turning one raw model answer into detections.
use crate::config::DedupMode;
use crate::llm::extract::{extract_json, parse_coordinates, parse_description};
use crate::perception::dedup::{deduplicate_ranked, CenterSet};
use crate::perception::normalize::{Normalizer, Origin, DEFAULT_ELEMENT_TYPE};
use crate::perception::raw_element::{candidates, RawElement};
use crate::perception::scaling::ScaleFactors;
use crate::perception::types::Detection;

/// First valid structured candidate, else the legacy coordinate formats.
pub fn single_from_output(
    output: &str,
    normalizer: &Normalizer,
    scale: &ScaleFactors,
    task: &str,
) -> Option<Detection> {
    let origin = Origin {
        fallback_label: task,
        task,
        raw_output: output,
    };

    if let Some(data) = extract_json(output) {
        let found = candidates(&data)
            .unwrap_or_default()
            .into_iter()
            .find_map(|map| normalizer.element(RawElement::new(map), scale, origin));
        if found.is_some() {
            return found;
        }
    }

    let (x, y) = parse_coordinates(output)?;
    let label = parse_description(output).unwrap_or_else(|| task.to_string());
    Some(normalizer.point(
        (x, y),
        (None, None),
        scale,
        &label,
        DEFAULT_ELEMENT_TYPE,
        None,
        origin,
    ))
}

/// Structured multi-element parse.
///
/// `None` only when no JSON object or array could be recovered; a JSON answer
/// whose elements are all invalid yields `Some(vec![])`. Elements without a
/// usable label are captioned with `discovery`.
pub fn multi_from_output(
    output: &str,
    normalizer: &Normalizer,
    scale: &ScaleFactors,
    discovery: &str,
    radius: f64,
    max: usize,
    mode: DedupMode,
) -> Option<Vec<Detection>> {
    let data = extract_json(output)?;
    let maps = candidates(&data)?;
    let origin = Origin {
        fallback_label: discovery,
        task: discovery,
        raw_output: output,
    };
    let total = maps.len();
    let normalized = maps
        .into_iter()
        .filter_map(|map| normalizer.element(RawElement::new(map), scale, origin));

    let detections = match mode {
        DedupMode::FirstSeen => {
            let mut seen = CenterSet::new(radius);
            let mut out = Vec::new();
            for det in normalized {
                if !seen.insert(det.center_f64()) {
                    continue;
                }
                out.push(det);
                if out.len() >= max {
                    break;
                }
            }
            out
        }
        DedupMode::Ranked => {
            let mut out = deduplicate_ranked(normalized.collect(), radius);
            out.truncate(max);
            out
        }
    };

    tracing::debug!(candidates = total, kept = detections.len(), "structured answer parsed");
    Some(detections)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer() -> Normalizer {
        Normalizer::new(40, 0.85)
    }

    #[test]
    fn single_takes_first_valid_candidate() {
        let scale = ScaleFactors::identity(800, 600);
        let out = r#"{"elements":[{"label":"no coords"},{"x":300,"y":200,"label":"OK"},{"x":1,"y":2}]}"#;
        let det = single_from_output(out, &normalizer(), &scale, "Click OK").unwrap();
        assert_eq!(det.center, [300, 200]);
        assert_eq!(det.caption, "OK");
        assert_eq!(det.task, "Click OK");
        assert_eq!(det.raw_output, out);
    }

    #[test]
    fn single_falls_back_to_click_syntax() {
        let scale = ScaleFactors::identity(800, 600);
        let det = single_from_output("Click(352, 128) - Submit button", &normalizer(), &scale, "Submit")
            .unwrap();
        assert_eq!(det.center, [352, 128]);
        assert_eq!(det.caption, "Submit button");
        assert_eq!(det.element_type, "clickable");
        assert_eq!(det.bbox, [332, 108, 40, 40]);
    }

    #[test]
    fn single_not_found_answer_is_none() {
        let scale = ScaleFactors::identity(800, 600);
        let out = r#"{"x": null, "y": null, "label": "not found"}"#;
        assert!(single_from_output(out, &normalizer(), &scale, "Find it").is_none());
        assert!(single_from_output("I cannot see it.", &normalizer(), &scale, "Find it").is_none());
    }

    #[test]
    fn multi_dedups_and_caps() {
        let scale = ScaleFactors::identity(800, 600);
        let out = r#"```json
{"elements":[
  {"x":100,"y":100,"label":"Save","type":"button"},
  {"x":105,"y":103,"label":"Save again","type":"button"},
  {"x":400,"y":300,"label":"Search","type":"input"},
  {"x":700,"y":50,"label":"Gear","type":"icon"}
]}
```"#;
        let dets = multi_from_output(out, &normalizer(), &scale, "discover", 30.0, 2, DedupMode::FirstSeen)
            .unwrap();
        let captions: Vec<_> = dets.iter().map(|d| d.caption.as_str()).collect();
        assert_eq!(captions, vec!["Save", "Search"]);
        assert_eq!(dets[0].task, "discover");
    }

    #[test]
    fn multi_unlabelled_elements_take_discovery_prompt() {
        let scale = ScaleFactors::identity(800, 600);
        let discovery = "Identify up to 20 interactive UI elements in this screenshot.";
        let out = r#"[{"x":10,"y":10},{"x":200,"y":200,"label":"Identify all buttons"}]"#;
        let dets =
            multi_from_output(out, &normalizer(), &scale, discovery, 30.0, 20, DedupMode::FirstSeen)
                .unwrap();
        assert_eq!(dets.len(), 2);
        for det in &dets {
            assert_eq!(det.caption, discovery);
            assert_eq!(det.content, discovery);
            assert_eq!(det.task, discovery);
        }
    }

    #[test]
    fn multi_ranked_mode_keeps_confident_duplicate() {
        let scale = ScaleFactors::identity(800, 600);
        let out = r#"[{"x":100,"y":100,"confidence":0.3},{"x":104,"y":100,"confidence":0.9}]"#;
        let dets = multi_from_output(out, &normalizer(), &scale, "d", 30.0, 10, DedupMode::Ranked).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].confidence, 0.9);
    }

    #[test]
    fn multi_empty_list_is_success_and_prose_is_failure() {
        let scale = ScaleFactors::identity(800, 600);
        let n = normalizer();
        let empty = multi_from_output(r#"{"elements": []}"#, &n, &scale, "d", 30.0, 10, DedupMode::FirstSeen);
        assert_eq!(empty, Some(Vec::new()));
        let prose = multi_from_output("There is a button.", &n, &scale, "d", 30.0, 10, DedupMode::FirstSeen);
        assert!(prose.is_none());
    }
}

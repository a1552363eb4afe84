use std::sync::Arc;
use std::time::Instant;

use image::DynamicImage;
use tracing::Instrument;

use crate::config::{AppConfig, DedupMode, DetectionProfile, DetectionStrategy, MAX_DETECTIONS_CAP};
use crate::errors::LocatorResult;
use crate::llm::prompt::PromptBuilder;
use crate::llm::provider::VisionModel;
use crate::llm::types::GenerationParams;
use crate::locator::assemble::{multi_from_output, single_from_output};
use crate::locator::loop_control::{run_attempts, CancelFlag, RetryPolicy};
use crate::locator::state::{DetectionRun, ParseOutcome, ParseRequest};
use crate::perception::annotator::{Annotator, SetOfMarkAnnotator};
use crate::perception::confidence::{classify, ThresholdMode};
use crate::perception::dedup::{deduplicate_ranked, merge, CenterSet};
use crate::perception::normalize::Normalizer;
use crate::perception::scaling::ImagePayload;
use crate::perception::types::{assign_ids, Detection, ImageSize};

/// Localizes UI elements on screenshots through an injected vision model.
///
/// Model calls are strictly sequential. The cancel flag is checked between
/// attempts; an in-flight call always runs to completion. A cancellation stays
/// in effect for every later request until the flag is reset.
pub struct Locator {
    model: Arc<dyn VisionModel>,
    config: AppConfig,
    annotator: Arc<dyn Annotator>,
    cancel: CancelFlag,
}

impl Locator {
    pub fn new(model: Arc<dyn VisionModel>, config: AppConfig) -> Self {
        Self {
            model,
            config,
            annotator: Arc::new(SetOfMarkAnnotator::default()),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_annotator(mut self, annotator: Arc<dyn Annotator>) -> Self {
        self.annotator = annotator;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle that stops this locator between attempts. Call
    /// [`CancelFlag::reset`] before reusing the locator after a cancellation.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Resize and encode once; the payload is shared by every call of a request.
    pub fn prepare(&self, image: &DynamicImage) -> LocatorResult<ImagePayload> {
        ImagePayload::prepare(
            image,
            self.config.detection.max_pixels,
            self.config.detection.patch_size,
        )
    }

    fn normalizer(&self, profile: &DetectionProfile) -> Normalizer {
        Normalizer::new(profile.click_box_size, self.config.detection.default_confidence)
    }

    fn dedup_mode(&self) -> DedupMode {
        self.config.detection.dedup_mode
    }

    /// Find the single element described by `task`.
    ///
    /// Returns the detection (if any) and every raw model output produced.
    pub async fn localize_element(
        &self,
        payload: &ImagePayload,
        task: &str,
        guidelines: Option<&str>,
        profile: &DetectionProfile,
    ) -> (Option<Detection>, Vec<String>) {
        let builder = PromptBuilder::new(&self.config.prompts);
        let normalizer = self.normalizer(profile);
        let prompt = builder.single(task, &payload.scale, guidelines);

        let outcome = run_attempts(
            self.model.as_ref(),
            &payload.image_url,
            prompt,
            &generation_params(profile),
            retry_policy(profile),
            &self.cancel,
            |p| builder.augment(p),
            |text| single_from_output(text, &normalizer, &payload.scale, task),
        )
        .await;

        if outcome.value.is_none() {
            match &outcome.error {
                Some(e) => tracing::info!(task, error = %e, "element not localized"),
                None => tracing::info!(task, state = ?outcome.state, "element not localized"),
            }
        }
        (outcome.value, outcome.outputs)
    }

    /// Discover up to `max` elements, sorted by confidence with dense ids.
    pub async fn detect_multiple(
        &self,
        payload: &ImagePayload,
        max: usize,
        profile: &DetectionProfile,
    ) -> DetectionRun {
        let detection = &self.config.detection;
        let mut run = DetectionRun::default();

        match detection.strategy {
            DetectionStrategy::StructuredFirst => {
                let builder = PromptBuilder::new(&self.config.prompts);
                let normalizer = self.normalizer(profile);
                let discovery = builder.discovery(max);
                let hints = detection.hint_prompts();
                let prompt = builder.multi(&discovery, &payload.scale, &hints);
                let mode = self.dedup_mode();

                let outcome = run_attempts(
                    self.model.as_ref(),
                    &payload.image_url,
                    prompt,
                    &generation_params(profile),
                    retry_policy(profile),
                    &self.cancel,
                    |p| builder.augment(p),
                    |text| {
                        multi_from_output(
                            text,
                            &normalizer,
                            &payload.scale,
                            &discovery,
                            profile.deduplication_radius,
                            // `finalize` keeps the most confident `max`.
                            MAX_DETECTIONS_CAP,
                            mode,
                        )
                    },
                )
                .await;
                run.raw_outputs = outcome.outputs;

                if let Some(found) = outcome.value {
                    tracing::info!(count = found.len(), "structured parsing succeeded");
                    run.detections = found;
                    run.structured_success = true;
                } else if detection.allow_legacy_fallback && !self.cancel.is_cancelled() {
                    tracing::info!(prompts = hints.len(), state = ?outcome.state, "falling back to per-prompt localization");
                    let (legacy, outputs) = self.sequential(payload, &hints, max, profile).await;
                    run.raw_outputs.extend(outputs);
                    run.used_legacy_fallback = true;
                    if legacy.is_empty() {
                        tracing::warn!("legacy fallback found no elements");
                    }
                    let prior = std::mem::take(&mut run.detections);
                    run.detections = self.combine(prior, legacy, profile.deduplication_radius);
                }
            }
            DetectionStrategy::LegacySequential => {
                let prompts = detection.sequential_prompts();
                let (found, outputs) = self.sequential(payload, &prompts, max, profile).await;
                run.detections = found;
                run.raw_outputs = outputs;
                run.used_legacy_fallback = true;
            }
        }

        finalize(&mut run.detections, max);
        run
    }

    /// One single-element localization per prompt, deduplicated and capped.
    async fn sequential(
        &self,
        payload: &ImagePayload,
        prompts: &[String],
        max: usize,
        profile: &DetectionProfile,
    ) -> (Vec<Detection>, Vec<String>) {
        let mut seen = CenterSet::new(profile.deduplication_radius);
        let mut found = Vec::new();
        let mut outputs = Vec::new();

        for prompt in prompts {
            if self.cancel.is_cancelled() {
                tracing::info!("cancelled during sequential localization");
                break;
            }
            let (det, raw) = self.localize_element(payload, prompt, None, profile).await;
            outputs.extend(raw);

            let Some(det) = det else { continue };
            if !seen.insert(det.center_f64()) {
                continue;
            }
            found.push(det);
            if found.len() >= max {
                break;
            }
        }
        (found, outputs)
    }

    fn combine(&self, accepted: Vec<Detection>, extra: Vec<Detection>, radius: f64) -> Vec<Detection> {
        match self.dedup_mode() {
            DedupMode::FirstSeen => merge(accepted, extra, radius),
            DedupMode::Ranked => {
                let mut all = accepted;
                all.extend(extra);
                deduplicate_ranked(all, radius)
            }
        }
    }

    /// Full request: localize, filter by confidence, number, annotate.
    ///
    /// Never fails; every error degrades to a smaller (possibly empty) result.
    pub async fn parse_screenshot(&self, image: &DynamicImage, request: &ParseRequest) -> ParseOutcome {
        let request_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("parse_screenshot", request_id = %request_id);
        self.parse_inner(image, request, request_id)
            .instrument(span)
            .await
    }

    /// Decode encoded image bytes, then [`Locator::parse_screenshot`].
    /// Undecodable input yields an empty result.
    pub async fn parse_image_bytes(&self, bytes: &[u8], request: &ParseRequest) -> ParseOutcome {
        match image::load_from_memory(bytes) {
            Ok(image) => self.parse_screenshot(&image, request).await,
            Err(e) => {
                tracing::warn!(error = %e, len = bytes.len(), "image decode failed");
                let empty = DynamicImage::new_rgb8(0, 0);
                self.parse_screenshot(&empty, request).await
            }
        }
    }

    async fn parse_inner(&self, image: &DynamicImage, request: &ParseRequest, request_id: String) -> ParseOutcome {
        let started = Instant::now();
        let profile = self
            .config
            .resolve_profile(request.performance_profile.as_deref());
        let effective_max = profile.effective_max(request.max_detections);
        let floor = request
            .min_confidence
            .unwrap_or(profile.min_confidence_threshold);
        let include_raw = request
            .return_raw_outputs
            .unwrap_or(profile.return_raw_outputs);
        let image_size = ImageSize {
            width: image.width(),
            height: image.height(),
        };
        let task = request.task.as_deref().map(str::trim).filter(|t| !t.is_empty());

        let (detections, raw_outputs) = match self.prepare(image) {
            Ok(payload) => match task {
                Some(task) => {
                    let (det, outputs) = self.localize_element(&payload, task, None, &profile).await;
                    (det.into_iter().collect(), outputs)
                }
                None => {
                    let run = self.detect_multiple(&payload, effective_max, &profile).await;
                    (run.detections, run.raw_outputs)
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, fatal = e.is_image_fatal(), "image preprocessing failed");
                (Vec::new(), Vec::new())
            }
        };

        let mode = if profile.use_adaptive_thresholds {
            ThresholdMode::Adaptive
        } else {
            ThresholdMode::Fixed(floor)
        };
        let (mut elements, confidence_stats) = classify(detections, mode);
        assign_ids(&mut elements);

        let som_image = if request.include_som && !elements.is_empty() {
            self.annotator.render(image, &elements)
        } else {
            None
        };

        let processing_time_ms = (started.elapsed().as_secs_f64() * 100_000.0).round() / 100.0;
        if elements.is_empty() {
            tracing::warn!(
                task = task.unwrap_or(""),
                detect_multiple = request.detect_multiple,
                outputs = raw_outputs.len(),
                processing_time_ms,
                "no elements found"
            );
        } else {
            let avg = elements.iter().map(|d| d.confidence).sum::<f64>() / elements.len() as f64;
            tracing::info!(
                count = elements.len(),
                avg_confidence = (avg * 100.0).round() / 100.0,
                processing_time_ms,
                profile = %profile.name,
                model = self.model.name(),
                "screenshot parsed"
            );
        }

        ParseOutcome {
            request_id,
            count: elements.len(),
            elements,
            processing_time_ms,
            image_size,
            model: self.model.name().to_string(),
            profile: profile.name.clone(),
            max_detections: effective_max,
            min_confidence: (floor * 1000.0).round() / 1000.0,
            confidence_stats,
            som_image,
            raw_model_outputs: (include_raw && !raw_outputs.is_empty()).then_some(raw_outputs),
        }
    }
}

fn generation_params(profile: &DetectionProfile) -> GenerationParams {
    GenerationParams {
        max_tokens: profile.max_new_tokens,
        temperature: profile.temperature,
        top_p: profile.top_p,
    }
}

fn retry_policy(profile: &DetectionProfile) -> RetryPolicy {
    RetryPolicy {
        max_retries: profile.max_retries,
        backoff_seconds: profile.retry_backoff_seconds,
    }
}

/// Confidence-descending (stable), capped, densely numbered.
fn finalize(detections: &mut Vec<Detection>, max: usize) {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    detections.truncate(max);
    assign_ids(detections);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::LocatorError;
    use crate::llm::provider::scripted::ScriptedModel;
    use crate::perception::types::ConfidenceZone;

    const MALFORMED: &str = "I see several buttons but cannot format them.";

    fn config(max_retries: u32) -> AppConfig {
        let mut c = AppConfig::default();
        c.detection.performance_profile = "balanced".into();
        c.detection.overrides.max_retries = Some(max_retries);
        c.detection.overrides.retry_backoff_seconds = Some(0.0);
        c
    }

    fn screen() -> DynamicImage {
        DynamicImage::new_rgb8(800, 600)
    }

    fn locator(model: &Arc<ScriptedModel>, config: AppConfig) -> Locator {
        Locator::new(model.clone(), config)
    }

    #[tokio::test]
    async fn single_task_on_unscaled_image() {
        let model = Arc::new(ScriptedModel::new([r#"{"x":100,"y":50,"label":"Save"}"#]));
        let loc = locator(&model, config(1));
        let out = loc
            .parse_screenshot(&screen(), &ParseRequest::task("Click the save button"))
            .await;

        assert_eq!(out.count, 1);
        let det = &out.elements[0];
        assert_eq!(det.center, [100, 50]);
        assert_eq!(det.bbox, [80, 30, 40, 40]);
        assert_eq!(det.caption, "Save");
        assert_eq!(det.element_id, Some(0));
        assert_eq!(det.confidence_zone, Some(ConfidenceZone::High));
        assert_eq!(out.image_size, ImageSize { width: 800, height: 600 });
        assert_eq!(out.profile, "balanced");
        assert_eq!(out.model, "scripted");
        assert!(out.som_image.is_some());
        assert!(model.prompt(0).contains("Task: Click the save button"));
    }

    #[tokio::test]
    async fn malformed_outputs_fall_back_to_legacy_prompts() {
        let model = Arc::new(ScriptedModel::new([
            MALFORMED,
            MALFORMED,
            MALFORMED,
            r#"{"x":100,"y":100,"label":"OK","type":"button","confidence":0.6}"#,
            r#"{"x":500,"y":300,"label":"Gear","type":"icon","confidence":0.9}"#,
        ]));
        let mut cfg = config(2);
        cfg.detection.detection_prompts = vec!["Find buttons".into(), "Find icons".into()];
        let loc = locator(&model, cfg);
        let profile = loc.config().resolve_profile(None);
        let payload = loc.prepare(&screen()).unwrap();

        let run = loc.detect_multiple(&payload, 10, &profile).await;

        assert!(!run.structured_success);
        assert!(run.used_legacy_fallback);
        assert_eq!(run.raw_outputs.len(), 5);
        let captions: Vec<_> = run.detections.iter().map(|d| d.caption.as_str()).collect();
        assert_eq!(captions, vec!["Gear", "OK"]);
        assert_eq!(run.detections[1].element_id, Some(1));

        let retry_guidance = &loc.config().prompts.retry_guidance;
        assert!(!model.prompt(0).contains(retry_guidance.as_str()));
        assert!(model.prompt(2).ends_with(retry_guidance.as_str()));
        assert!(model.prompt(3).contains("Task: Find buttons"));
    }

    #[tokio::test]
    async fn structured_answer_is_sorted_capped_and_numbered() {
        let model = Arc::new(ScriptedModel::new([r#"Here you go:
```json
{"elements":[
 {"x":100,"y":100,"label":"Low","type":"button","confidence":0.5},
 {"x":300,"y":100,"label":"High","type":"button","confidence":0.95},
 {"x":500,"y":100,"label":"Mid","type":"button","confidence":0.7}
]}
```"#]));
        let loc = locator(&model, config(0));
        let request = ParseRequest {
            max_detections: Some(2),
            include_som: false,
            ..ParseRequest::default()
        };
        let out = loc.parse_screenshot(&screen(), &request).await;

        let captions: Vec<_> = out.elements.iter().map(|d| d.caption.as_str()).collect();
        assert_eq!(captions, vec!["High", "Mid"]);
        let ids: Vec<_> = out.elements.iter().map(|d| d.element_id).collect();
        assert_eq!(ids, vec![Some(0), Some(1)]);
        assert_eq!(out.max_detections, 2);
        assert!(out.som_image.is_none());
        assert!(model.prompt(0).contains("Identify up to 2 interactive UI elements"));
    }

    #[tokio::test]
    async fn empty_element_list_is_a_success() {
        let model = Arc::new(ScriptedModel::new([r#"{"elements": []}"#]));
        let loc = locator(&model, config(2));
        let profile = loc.config().resolve_profile(None);
        let payload = loc.prepare(&screen()).unwrap();

        let run = loc.detect_multiple(&payload, 10, &profile).await;
        assert!(run.structured_success);
        assert!(!run.used_legacy_fallback);
        assert!(run.detections.is_empty());
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn model_error_ends_loop_then_legacy_runs() {
        let model = Arc::new(ScriptedModel::with_results(vec![
            Err(LocatorError::Model("500 Internal Server Error".into())),
            Ok(r#"{"x":40,"y":40,"label":"Menu"}"#.into()),
        ]));
        let loc = locator(&model, config(3));
        let profile = loc.config().resolve_profile(None);
        let payload = loc.prepare(&screen()).unwrap();

        let run = loc.detect_multiple(&payload, 10, &profile).await;
        assert_eq!(model.calls(), 2);
        assert_eq!(run.detections.len(), 1);
        assert_eq!(run.raw_outputs.len(), 1);
    }

    #[tokio::test]
    async fn model_error_without_fallback_yields_empty_result() {
        let model = Arc::new(ScriptedModel::with_results(vec![Err(LocatorError::Model(
            "connection refused".into(),
        ))]));
        let mut cfg = config(3);
        cfg.detection.allow_legacy_fallback = false;
        let loc = locator(&model, cfg);

        let out = loc.parse_screenshot(&screen(), &ParseRequest::default()).await;
        assert_eq!(out.count, 0);
        assert_eq!(out.confidence_stats.total(), 0);
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn cancelled_locator_makes_no_calls() {
        let model = Arc::new(ScriptedModel::new([r#"{"x":1,"y":1}"#]));
        let loc = locator(&model, config(2));
        loc.cancel_flag().cancel();

        let out = loc.parse_screenshot(&screen(), &ParseRequest::default()).await;
        assert_eq!(out.count, 0);
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn reset_flag_makes_locator_usable_again() {
        let model = Arc::new(ScriptedModel::new([r#"{"x":100,"y":50,"label":"Save"}"#]));
        let loc = locator(&model, config(0));
        let cancel = loc.cancel_flag();
        let request = ParseRequest::task("Click the save button");

        cancel.cancel();
        let stopped = loc.parse_screenshot(&screen(), &request).await;
        assert_eq!(stopped.count, 0);
        assert_eq!(model.calls(), 0);

        cancel.reset();
        let out = loc.parse_screenshot(&screen(), &request).await;
        assert_eq!(out.count, 1);
        assert_eq!(out.elements[0].center, [100, 50]);
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn sequential_strategy_uses_builtin_prompts() {
        let model = Arc::new(ScriptedModel::new([
            "Click(100, 100) - Install button",
            "Click(104, 102) - Install again",
            r#"{"x":400,"y":20,"label":"Settings tab","type":"menu"}"#,
            r#"{"x":780,"y":10,"label":"Bell icon","type":"icon"}"#,
        ]));
        let mut cfg = config(0);
        cfg.detection.strategy = DetectionStrategy::LegacySequential;
        let loc = locator(&model, cfg);
        let profile = loc.config().resolve_profile(None);
        let payload = loc.prepare(&screen()).unwrap();

        let run = loc.detect_multiple(&payload, 10, &profile).await;
        assert_eq!(model.calls(), 4);
        assert_eq!(run.detections.len(), 3);
        assert!(model.prompt(0).contains("Task: Locate all clickable buttons"));
        assert!(run.used_legacy_fallback);
    }

    #[tokio::test]
    async fn fixed_threshold_uses_request_floor() {
        let model = Arc::new(ScriptedModel::new([r#"[{"x":100,"y":100,"label":"Save"}]"#]));
        let mut cfg = config(0);
        cfg.detection.overrides.use_adaptive_thresholds = Some(false);
        let loc = locator(&model, cfg);
        let request = ParseRequest {
            min_confidence: Some(0.9),
            ..ParseRequest::default()
        };

        let out = loc.parse_screenshot(&screen(), &request).await;
        assert_eq!(out.count, 0);
        assert_eq!(out.confidence_stats.filtered, 1);
        assert_eq!(out.confidence_stats.high, 1);
        assert_eq!(out.min_confidence, 0.9);
    }

    #[tokio::test]
    async fn raw_outputs_follow_request_flag() {
        let model = Arc::new(ScriptedModel::new([MALFORMED, r#"{"x":5,"y":5}"#]));
        let mut cfg = config(1);
        cfg.detection.allow_legacy_fallback = false;
        let loc = locator(&model, cfg);
        let request = ParseRequest {
            return_raw_outputs: Some(true),
            ..ParseRequest::default()
        };

        let out = loc.parse_screenshot(&screen(), &request).await;
        assert_eq!(out.count, 1);
        assert_eq!(out.raw_model_outputs.as_ref().map(Vec::len), Some(2));
        let json = serde_json::to_value(&out).unwrap();
        assert!(json["raw_model_outputs"].is_array());
        assert_eq!(json["elements"][0]["source"], "holo-localization");
    }

    #[tokio::test]
    async fn empty_image_yields_empty_result_without_calls() {
        let model = Arc::new(ScriptedModel::new([r#"{"x":1,"y":1}"#]));
        let loc = locator(&model, config(0));

        let out = loc
            .parse_screenshot(&DynamicImage::new_rgb8(0, 0), &ParseRequest::default())
            .await;
        assert_eq!(out.count, 0);
        assert_eq!(model.calls(), 0);

        let garbage = loc.parse_image_bytes(b"not an image", &ParseRequest::default()).await;
        assert_eq!(garbage.count, 0);
        assert_eq!(garbage.image_size, ImageSize { width: 0, height: 0 });
    }
}

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{LocatorError, LocatorResult};

/// Hard upper bound on detections per request, regardless of profile or request.
pub const MAX_DETECTIONS_CAP: usize = 200;

/// Qwen2.5-VL pixel budget (1280 patches of 28×28).
pub const DEFAULT_MAX_PIXELS: u64 = 1280 * 28 * 28;

pub const DEFAULT_PATCH_SIZE: u32 = 28;

/// Single comprehensive discovery hint; one call instead of four sequential ones.
pub const DEFAULT_DETECTION_PROMPTS: &[&str] = &[
    "Detect all interactive UI elements in this screenshot. \
     Include buttons, links, input fields, dropdowns, checkboxes, tabs, menus, icons, and navigation controls. \
     Return center coordinates and functional labels for each element.",
];

/// Per-element prompts used by the sequential detection strategy.
pub const LEGACY_DETECTION_PROMPTS: &[&str] = &[
    "Locate all clickable buttons that perform actions (Install, Save, Open, Close, Submit, etc.)",
    "Find all navigation controls for moving between sections (tabs, menus, sidebar entries, breadcrumbs)",
    "Identify all input fields where users can enter or select data (search boxes, text inputs, dropdowns, checkboxes)",
    "Detect all toolbar and system icons that provide quick access to features (settings, extensions, tools, notifications)",
];

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Display name reported in results.
    #[serde(default = "default_model_name")]
    pub display_name: String,
    /// Chat-completions endpoint of an OpenAI-compatible server (llama.cpp, vLLM, …).
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_model_id")]
    pub model: String,
    /// Optional API key (falls back to env var HOLO_API_KEY).
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            display_name: default_model_name(),
            api_base: default_api_base(),
            model: default_model_id(),
            api_key: None,
            stream: false,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_model_name() -> String {
    "holo-1.5-7b".into()
}

fn default_api_base() -> String {
    "http://127.0.0.1:8080/v1/chat/completions".into()
}

fn default_model_id() -> String {
    "Holo1.5-7B".into()
}

fn default_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DetectionStrategy {
    /// One structured multi-element call, legacy prompts only if parsing fails entirely.
    #[default]
    StructuredFirst,
    /// One single-element call per hint prompt.
    LegacySequential,
}

/// Which occurrence survives when two centers collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DedupMode {
    /// Model order; the first occurrence wins.
    #[default]
    FirstSeen,
    /// The highest-confidence occurrence wins.
    Ranked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    #[serde(default = "default_profile")]
    pub performance_profile: String,
    #[serde(default = "default_max_pixels")]
    pub max_pixels: u64,
    #[serde(default = "default_patch_size")]
    pub patch_size: u32,
    /// Used when the model does not report a confidence.
    #[serde(default = "default_confidence")]
    pub default_confidence: f64,
    #[serde(default = "default_true")]
    pub allow_legacy_fallback: bool,
    #[serde(default)]
    pub strategy: DetectionStrategy,
    #[serde(default)]
    pub dedup_mode: DedupMode,
    /// Auxiliary hint prompts; empty means the built-in defaults.
    #[serde(default)]
    pub detection_prompts: Vec<String>,
    /// Explicit values here win over the selected profile.
    #[serde(default)]
    pub overrides: ProfileOverrides,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            performance_profile: default_profile(),
            max_pixels: default_max_pixels(),
            patch_size: default_patch_size(),
            default_confidence: default_confidence(),
            allow_legacy_fallback: true,
            strategy: DetectionStrategy::default(),
            dedup_mode: DedupMode::default(),
            detection_prompts: Vec::new(),
            overrides: ProfileOverrides::default(),
        }
    }
}

impl DetectionConfig {
    /// Hint prompts in effect, falling back to the built-in list.
    pub fn hint_prompts(&self) -> Vec<String> {
        if self.detection_prompts.is_empty() {
            DEFAULT_DETECTION_PROMPTS.iter().map(|p| p.to_string()).collect()
        } else {
            self.detection_prompts.clone()
        }
    }

    /// Prompts for the sequential strategy: the configured list, or the
    /// built-in per-category prompts.
    pub fn sequential_prompts(&self) -> Vec<String> {
        if self.detection_prompts.is_empty() {
            LEGACY_DETECTION_PROMPTS.iter().map(|p| p.to_string()).collect()
        } else {
            self.detection_prompts.clone()
        }
    }
}

fn default_profile() -> String {
    "speed".into()
}

fn default_max_pixels() -> u64 {
    DEFAULT_MAX_PIXELS
}

fn default_patch_size() -> u32 {
    DEFAULT_PATCH_SIZE
}

fn default_confidence() -> f64 {
    0.85
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptsConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_guidelines")]
    pub guidelines: String,
    #[serde(default = "default_single_format")]
    pub single_detection_format: String,
    #[serde(default = "default_retry_guidance")]
    pub retry_guidance: String,
    /// `{max_detections}` is replaced with the effective cap.
    #[serde(default = "default_discovery_prompt")]
    pub discovery_prompt: String,
    #[serde(default = "default_multi_format")]
    pub multi_detection_format: String,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            guidelines: default_guidelines(),
            single_detection_format: default_single_format(),
            retry_guidance: default_retry_guidance(),
            discovery_prompt: default_discovery_prompt(),
            multi_detection_format: default_multi_format(),
        }
    }
}

fn default_system_prompt() -> String {
    "You are a UI localization expert. Analyze screenshots and provide precise pixel coordinates in JSON format.".into()
}

fn default_guidelines() -> String {
    "Identify interactive UI elements in this screenshot. \
     For each element, provide its center point coordinates (x, y in pixels) and a brief functional label."
        .into()
}

fn default_single_format() -> String {
    "Return JSON: {\"x\": <int>, \"y\": <int>, \"label\": \"description\"}. \
     Example: {\"x\": 352, \"y\": 128, \"label\": \"Submit button\"}. \
     If not found: {\"x\": null, \"y\": null, \"label\": \"not found\"}."
        .into()
}

fn default_retry_guidance() -> String {
    "Please return valid JSON only, no markdown or extra text.".into()
}

fn default_discovery_prompt() -> String {
    "Identify up to {max_detections} interactive UI elements in this screenshot.".into()
}

fn default_multi_format() -> String {
    "ANALYZE THE SCREENSHOT and return detected UI elements as JSON:\n\
     {\"elements\":[{\"x\":<pixel_x>,\"y\":<pixel_y>,\"label\":<element_description>,\"type\":<element_type>}]}\n\n\
     Format requirements:\n\
     - x, y: Center coordinates in pixels (integers from the actual screenshot)\n\
     - label: Brief functional description (e.g., 'Install button', 'Settings icon')\n\
     - type: One of: button, icon, input, link, menu, text\n\n\
     Return ONLY the JSON object with elements you detect in THIS screenshot."
        .into()
}

// ── Performance profiles ─────────────────────────────────────────────────────

/// Fully resolved per-request tuning knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionProfile {
    pub name: String,
    pub max_detections: usize,
    pub max_new_tokens: u32,
    pub max_retries: u32,
    pub retry_backoff_seconds: f64,
    pub click_box_size: u32,
    pub deduplication_radius: f64,
    pub temperature: f64,
    pub top_p: Option<f64>,
    pub min_confidence_threshold: f64,
    pub use_adaptive_thresholds: bool,
    pub return_raw_outputs: bool,
}

impl DetectionProfile {
    pub fn speed() -> Self {
        Self {
            name: "speed".into(),
            max_detections: 20,
            max_new_tokens: 256,
            max_retries: 0,
            retry_backoff_seconds: 0.0,
            click_box_size: 32,
            deduplication_radius: 22.0,
            temperature: 0.0,
            top_p: None,
            min_confidence_threshold: 0.5,
            use_adaptive_thresholds: true,
            return_raw_outputs: false,
        }
    }

    pub fn balanced() -> Self {
        Self {
            name: "balanced".into(),
            max_detections: 40,
            max_new_tokens: 512,
            max_retries: 1,
            retry_backoff_seconds: 0.3,
            click_box_size: 40,
            deduplication_radius: 30.0,
            temperature: 0.0,
            top_p: None,
            min_confidence_threshold: 0.3,
            use_adaptive_thresholds: true,
            return_raw_outputs: false,
        }
    }

    pub fn quality() -> Self {
        Self {
            name: "quality".into(),
            max_detections: 100,
            max_new_tokens: 1024,
            max_retries: 2,
            retry_backoff_seconds: 0.5,
            click_box_size: 48,
            deduplication_radius: 36.0,
            temperature: 0.0,
            top_p: None,
            min_confidence_threshold: 0.2,
            use_adaptive_thresholds: true,
            return_raw_outputs: true,
        }
    }

    /// Look up a built-in profile by name; unknown names resolve to `balanced`.
    pub fn by_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "speed" => Self::speed(),
            "balanced" => Self::balanced(),
            "quality" => Self::quality(),
            other => {
                tracing::warn!(profile = other, "unknown performance profile, using balanced");
                Self::balanced()
            }
        }
    }

    /// Detection cap clamped to `1..=200`, with an optional per-request value taking priority.
    pub fn effective_max(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.max_detections)
            .clamp(1, MAX_DETECTIONS_CAP)
    }

    pub fn apply(mut self, o: &ProfileOverrides) -> Self {
        if let Some(v) = o.max_detections {
            self.max_detections = v;
        }
        if let Some(v) = o.max_new_tokens {
            self.max_new_tokens = v;
        }
        if let Some(v) = o.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = o.retry_backoff_seconds {
            self.retry_backoff_seconds = v.max(0.0);
        }
        if let Some(v) = o.click_box_size {
            self.click_box_size = v.max(1);
        }
        if let Some(v) = o.deduplication_radius {
            self.deduplication_radius = v;
        }
        if let Some(v) = o.temperature {
            self.temperature = v;
        }
        if o.top_p.is_some() {
            self.top_p = o.top_p;
        }
        if let Some(v) = o.min_confidence_threshold {
            self.min_confidence_threshold = v;
        }
        if let Some(v) = o.use_adaptive_thresholds {
            self.use_adaptive_thresholds = v;
        }
        if let Some(v) = o.return_raw_outputs {
            self.return_raw_outputs = v;
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProfileOverrides {
    pub max_detections: Option<usize>,
    pub max_new_tokens: Option<u32>,
    pub max_retries: Option<u32>,
    pub retry_backoff_seconds: Option<f64>,
    pub click_box_size: Option<u32>,
    pub deduplication_radius: Option<f64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub min_confidence_threshold: Option<f64>,
    pub use_adaptive_thresholds: Option<bool>,
    pub return_raw_outputs: Option<bool>,
}

impl AppConfig {
    /// Profile for a request: the requested (or configured) built-in profile
    /// with the config-file overrides layered on top.
    pub fn resolve_profile(&self, requested: Option<&str>) -> DetectionProfile {
        let name = requested.unwrap_or(&self.detection.performance_profile);
        DetectionProfile::by_name(name).apply(&self.detection.overrides)
    }

    /// Apply `HOLO_*` environment overrides on top of the file contents.
    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("HOLO_API_KEY") {
            if !key.is_empty() {
                self.model.api_key = Some(key);
            }
        }
        if let Ok(base) = std::env::var("HOLO_API_BASE") {
            if !base.is_empty() {
                self.model.api_base = base;
            }
        }
        if let Ok(model) = std::env::var("HOLO_MODEL") {
            if !model.is_empty() {
                self.model.model = model;
            }
        }
        if let Ok(profile) = std::env::var("HOLO_PERFORMANCE_PROFILE") {
            if !profile.is_empty() {
                self.detection.performance_profile = profile;
            }
        }
    }
}

fn resolve_config_path() -> LocatorResult<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join("config.toml");
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Ok(candidate);
            }
        }
    }

    let cwd = std::env::current_dir()?;
    let candidate = cwd.join("config.toml");
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in working directory");
        return Ok(candidate);
    }

    Err(LocatorError::Config(
        "config.toml not found next to executable or in working directory".into(),
    ))
}

/// Load `config.toml` from the default locations.
pub fn load_config() -> LocatorResult<AppConfig> {
    let path = resolve_config_path()?;
    load_config_from(&path)
}

pub fn load_config_from(path: &Path) -> LocatorResult<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    validate(&config)?;
    tracing::info!(
        path = %path.display(),
        profile = %config.detection.performance_profile,
        "config loaded"
    );
    Ok(config)
}

fn validate(config: &AppConfig) -> LocatorResult<()> {
    let d = &config.detection;
    if d.patch_size == 0 {
        return Err(LocatorError::Config("detection.patch_size must be positive".into()));
    }
    if d.max_pixels < u64::from(d.patch_size) * u64::from(d.patch_size) {
        return Err(LocatorError::Config(
            "detection.max_pixels must hold at least one patch".into(),
        ));
    }
    if !(0.0..=1.0).contains(&d.default_confidence) {
        return Err(LocatorError::Config(
            "detection.default_confidence must be within [0, 1]".into(),
        ));
    }
    if let Some(backoff) = d.overrides.retry_backoff_seconds {
        if !backoff.is_finite() || backoff < 0.0 {
            return Err(LocatorError::Config(
                "detection.overrides.retry_backoff_seconds must be a finite, non-negative number"
                    .into(),
            ));
        }
    }
    Ok(())
}

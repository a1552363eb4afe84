/// Prompt assembly for single- and multi-element localization.
use crate::config::PromptsConfig;
use crate::perception::scaling::ScaleFactors;

fn resolution_line(scale: &ScaleFactors) -> String {
    format!(
        "Image resolution: {}x{} pixels.",
        scale.resized_width, scale.resized_height
    )
}

fn join_parts<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    parts
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub struct PromptBuilder<'a> {
    prompts: &'a PromptsConfig,
}

impl<'a> PromptBuilder<'a> {
    pub fn new(prompts: &'a PromptsConfig) -> Self {
        Self { prompts }
    }

    /// Discovery instruction with the effective detection cap filled in.
    pub fn discovery(&self, max_detections: usize) -> String {
        self.prompts
            .discovery_prompt
            .replace("{max_detections}", &max_detections.to_string())
    }

    /// guidelines, resolution, task, single-element format.
    pub fn single(&self, task: &str, scale: &ScaleFactors, guidelines: Option<&str>) -> String {
        let guidelines = guidelines.unwrap_or(&self.prompts.guidelines);
        let resolution = resolution_line(scale);
        let task_line = format!("Task: {task}");
        join_parts([
            guidelines,
            resolution.as_str(),
            task_line.as_str(),
            self.prompts.single_detection_format.as_str(),
        ])
    }

    /// guidelines, resolution, discovery, multi-element format and a bullet
    /// list of distinct hints (the discovery prompt itself excluded).
    pub fn multi(&self, discovery: &str, scale: &ScaleFactors, hints: &[String]) -> String {
        let discovery = discovery.trim();
        let mut seen: Vec<&str> = Vec::new();
        for hint in hints {
            let h = hint.trim();
            if h.is_empty() || h == discovery || seen.contains(&h) {
                continue;
            }
            seen.push(h);
        }

        let resolution = resolution_line(scale);
        let hint_block = if seen.is_empty() {
            String::new()
        } else {
            let bullets: Vec<String> = seen.iter().map(|h| format!("- {h}")).collect();
            format!("Additional context hints:\n{}", bullets.join("\n"))
        };

        join_parts([
            self.prompts.guidelines.as_str(),
            resolution.as_str(),
            discovery,
            self.prompts.multi_detection_format.as_str(),
            hint_block.as_str(),
        ])
    }

    /// Previous prompt plus the retry guidance. Repeated calls keep appending.
    pub fn augment(&self, prompt: &str) -> String {
        let guidance = self.prompts.retry_guidance.trim();
        if guidance.is_empty() {
            return prompt.to_string();
        }
        format!("{prompt}\n\n{guidance}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompts() -> PromptsConfig {
        PromptsConfig {
            system_prompt: "sys".into(),
            guidelines: "Guidelines.".into(),
            single_detection_format: "Return JSON.".into(),
            retry_guidance: "JSON only.".into(),
            discovery_prompt: "Find up to {max_detections} elements.".into(),
            multi_detection_format: "Return {\"elements\": []}.".into(),
        }
    }

    #[test]
    fn single_prompt_layout() {
        let p = prompts();
        let scale = ScaleFactors::identity(1280, 720);
        let text = PromptBuilder::new(&p).single("Click OK", &scale, None);
        assert_eq!(
            text,
            "Guidelines.\n\nImage resolution: 1280x720 pixels.\n\nTask: Click OK\n\nReturn JSON."
        );
    }

    #[test]
    fn empty_parts_are_skipped() {
        let p = prompts();
        let scale = ScaleFactors::identity(10, 10);
        let text = PromptBuilder::new(&p).single("Click OK", &scale, Some("   "));
        assert!(text.starts_with("Image resolution: 10x10 pixels."));
    }

    #[test]
    fn resolution_reports_resized_dimensions() {
        let p = prompts();
        let scale = ScaleFactors::compute(3840, 2160, 1280 * 28 * 28, 28).unwrap();
        let text = PromptBuilder::new(&p).single("x", &scale, None);
        assert!(text.contains(&format!(
            "Image resolution: {}x{} pixels.",
            scale.resized_width, scale.resized_height
        )));
    }

    #[test]
    fn multi_prompt_dedups_hints_and_skips_discovery() {
        let p = prompts();
        let b = PromptBuilder::new(&p);
        let discovery = b.discovery(25);
        assert_eq!(discovery, "Find up to 25 elements.");
        let hints = vec![
            "Find up to 25 elements.".to_string(),
            " Buttons ".to_string(),
            "Buttons".to_string(),
            "".to_string(),
            "Icons".to_string(),
        ];
        let text = b.multi(&discovery, &ScaleFactors::identity(100, 50), &hints);
        assert_eq!(
            text,
            "Guidelines.\n\nImage resolution: 100x50 pixels.\n\nFind up to 25 elements.\n\n\
             Return {\"elements\": []}.\n\nAdditional context hints:\n- Buttons\n- Icons"
        );
    }

    #[test]
    fn multi_prompt_without_hints_has_no_hint_block() {
        let p = prompts();
        let b = PromptBuilder::new(&p);
        let text = b.multi("Find all.", &ScaleFactors::identity(10, 10), &[]);
        assert!(!text.contains("Additional context hints"));
    }

    #[test]
    fn augmentation_accumulates() {
        let p = prompts();
        let b = PromptBuilder::new(&p);
        let once = b.augment("base");
        let twice = b.augment(&once);
        assert_eq!(once, "base\n\nJSON only.");
        assert_eq!(twice, "base\n\nJSON only.\n\nJSON only.");
    }
}

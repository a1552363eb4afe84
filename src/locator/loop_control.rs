use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::LocatorError;
use crate::llm::extract::extract_json;
use crate::llm::provider::VisionModel;
use crate::llm::types::GenerationParams;
use crate::locator::state::{Attempt, LoopState};
use crate::perception::normalize::truncate;

/// Bounded retries with linear backoff: attempt `n` failing waits
/// `backoff * (n + 1)` before attempt `n + 1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_seconds: f64,
}

impl RetryPolicy {
    /// A backoff that is not a finite, non-negative number means no wait.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let secs = self.backoff_seconds.max(0.0) * f64::from(attempt + 1);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
    }

    pub fn total_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// Caller-owned stop flag, checked between attempts.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Clear a previous cancellation so the flag can guard new work.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// Outcome of one attempt loop.
#[derive(Debug)]
pub struct LoopOutcome<T> {
    pub value: Option<T>,
    pub outputs: Vec<String>,
    /// Prompt sent on each attempt, for reproducing a run.
    pub prompts: Vec<String>,
    pub state: LoopState,
    /// Why the loop was aborted, if it was.
    pub error: Option<LocatorError>,
}

/// Drive `model` until `parse` accepts an answer or the policy is spent.
///
/// Each attempt is a pure step `(prompt, index) → (output, next_prompt)`;
/// `augment` derives the next prompt from the previous one. A model error or
/// cancellation ends the loop immediately.
#[allow(clippy::too_many_arguments)]
pub async fn run_attempts<T>(
    model: &dyn VisionModel,
    image_url: &str,
    first_prompt: String,
    params: &GenerationParams,
    policy: RetryPolicy,
    cancel: &CancelFlag,
    augment: impl Fn(&str) -> String,
    mut parse: impl FnMut(&str) -> Option<T>,
) -> LoopOutcome<T> {
    let mut attempt = Attempt::first(first_prompt);
    let mut outputs = Vec::new();
    let mut prompts = Vec::new();

    loop {
        if cancel.is_cancelled() {
            tracing::info!(attempt = attempt.index, "cancelled between attempts");
            return LoopOutcome {
                value: None,
                outputs,
                prompts,
                state: LoopState::Aborted,
                error: Some(LocatorError::Cancelled),
            };
        }

        tracing::debug!(state = ?LoopState::Attempt(attempt.index), "calling model");
        prompts.push(attempt.prompt.clone());
        let output = match model.generate(image_url, &attempt.prompt, params).await {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, attempt = attempt.index, "model call failed");
                return LoopOutcome {
                    value: None,
                    outputs,
                    prompts,
                    state: LoopState::Aborted,
                    error: Some(e),
                };
            }
        };

        let parsed = parse(&output);
        if parsed.is_none() {
            log_parse_failure(&output, attempt.index, policy.total_attempts());
        }
        outputs.push(output);

        if let Some(value) = parsed {
            return LoopOutcome {
                value: Some(value),
                outputs,
                prompts,
                state: LoopState::Success,
                error: None,
            };
        }

        if attempt.index >= policy.max_retries {
            return LoopOutcome {
                value: None,
                outputs,
                prompts,
                state: LoopState::Exhausted,
                error: None,
            };
        }

        let delay = policy.delay_after(attempt.index);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt = attempt.next(&augment);
    }
}

fn log_parse_failure(output: &str, attempt: u32, total: u32) {
    tracing::warn!(
        attempt = attempt + 1,
        total,
        output_len = output.len(),
        preview = %truncate(output, 300),
        "structured parsing failed"
    );
    if attempt == 0 {
        let looks_like_json = extract_json(output).is_some()
            || matches!(output.trim_start().chars().next(), Some('{' | '['));
        tracing::debug!(looks_like_json, "first attempt output shape");
    }
}

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;

use crate::config::ModelConfig;
use crate::errors::{LocatorError, LocatorResult};
use crate::llm::provider::VisionModel;
use crate::llm::sse_parser;
use crate::llm::types::{ChatMessage, GenerationParams, StreamChunkKind};

/// Chat-completions client for llama.cpp / vLLM / any OpenAI-compatible server.
pub struct OpenAiCompatibleProvider {
    id: String,
    api_base: String,
    api_key: String,
    model: String,
    system_prompt: String,
    stream: bool,
    client: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        id: String,
        api_base: String,
        api_key: String,
        model: String,
        system_prompt: String,
        stream: bool,
        timeout: Duration,
    ) -> LocatorResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            id,
            api_base,
            api_key,
            model,
            system_prompt,
            stream,
            client,
        })
    }

    pub fn from_config(cfg: &ModelConfig, system_prompt: &str) -> LocatorResult<Self> {
        Self::new(
            cfg.display_name.clone(),
            cfg.api_base.clone(),
            cfg.api_key.clone().unwrap_or_default(),
            cfg.model.clone(),
            system_prompt.to_string(),
            cfg.stream,
            Duration::from_secs(cfg.timeout_secs.max(1)),
        )
    }

    fn build_body(&self, image_url: &str, prompt: &str, params: &GenerationParams) -> serde_json::Value {
        let mut messages = Vec::with_capacity(2);
        if !self.system_prompt.trim().is_empty() {
            messages.push(ChatMessage::system(&self.system_prompt));
        }
        messages.push(ChatMessage::user_with_image(image_url, prompt));

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": self.stream,
            "max_tokens": params.max_tokens,
            "temperature": params.temperature,
        });
        if let Some(top_p) = params.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        body
    }
}

#[async_trait]
impl VisionModel for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.id
    }

    async fn generate(
        &self,
        image_url: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> LocatorResult<String> {
        let body = self.build_body(image_url, prompt, params);
        let start = Instant::now();

        tracing::debug!(
            provider = %self.id,
            model = %self.model,
            stream = self.stream,
            max_tokens = params.max_tokens,
            prompt_len = prompt.len(),
            "sending model request"
        );
        if params.max_tokens < 256 {
            tracing::warn!(
                max_tokens = params.max_tokens,
                "token budget is very low for multi-element detection"
            );
        }

        let mut request = self.client.post(&self.api_base).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let err_body = response.text().await.unwrap_or_default();
            return Err(LocatorError::Model(format!("{}: {}", status, err_body)));
        }

        let output = if self.stream {
            self.handle_stream(response).await?
        } else {
            self.handle_json(response).await?
        };

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            max_tokens = params.max_tokens,
            output_len = output.len(),
            "model inference complete"
        );
        Ok(output)
    }
}

impl OpenAiCompatibleProvider {
    /// Accumulate SSE content deltas into the full answer.
    async fn handle_stream(&self, response: reqwest::Response) -> LocatorResult<String> {
        let mut byte_stream = response.bytes_stream();
        let mut line_buf: Vec<u8> = Vec::new();
        let mut content = String::new();

        'stream: while let Some(result) = byte_stream.next().await {
            let bytes = result?;
            line_buf.extend_from_slice(&bytes);

            for line in take_lines(&mut line_buf) {
                match sse_parser::parse_sse_line(&line) {
                    Ok(Some(chunk)) => match chunk.kind {
                        StreamChunkKind::Content => content.push_str(&chunk.content),
                        StreamChunkKind::Done => break 'stream,
                    },
                    Ok(None) => {}
                    Err(e) => {
                        tracing::debug!("SSE parse skipped: {e}");
                    }
                }
            }
        }

        Ok(content)
    }

    async fn handle_json(&self, response: reqwest::Response) -> LocatorResult<String> {
        let json: serde_json::Value = response.json().await?;
        json["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| LocatorError::Model("response has no message content".into()))
    }
}

/// Drain every complete line from `buf`, decoding each only once its bytes
/// are all present. A trailing partial line stays in the buffer.
fn take_lines(buf: &mut Vec<u8>) -> Vec<String> {
    let Some(last_newline) = buf.iter().rposition(|&b| b == b'\n') else {
        return Vec::new();
    };
    let rest = buf.split_off(last_newline + 1);
    let complete = std::mem::replace(buf, rest);
    complete
        .split(|&b| b == b'\n')
        .map(|line| String::from_utf8_lossy(line).trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

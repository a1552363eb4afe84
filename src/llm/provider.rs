use async_trait::async_trait;

use crate::errors::LocatorResult;
use crate::llm::types::GenerationParams;

/// The loaded vision-language model, injected into the locator.
///
/// Implementations must report failures as errors rather than sentinel text.
/// The locator never issues two calls at once against the same handle.
#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Identifier reported in results and logs.
    fn name(&self) -> &str;

    /// Run one chat completion over `image_url` + `prompt` and return the text.
    async fn generate(
        &self,
        image_url: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> LocatorResult<String>;
}

#[cfg(test)]
pub(crate) mod scripted {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use crate::errors::LocatorError;

    /// Replays canned replies in order and records every prompt it receives.
    pub struct ScriptedModel {
        replies: Mutex<VecDeque<LocatorResult<String>>>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        pub fn new<I, S>(replies: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self {
                replies: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn with_results(replies: Vec<LocatorResult<String>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }

        pub fn prompt(&self, idx: usize) -> String {
            self.prompts.lock().unwrap()[idx].clone()
        }
    }

    #[async_trait]
    impl VisionModel for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(
            &self,
            _image_url: &str,
            prompt: &str,
            _params: &GenerationParams,
        ) -> LocatorResult<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(LocatorError::Model("script exhausted".into())))
        }
    }
}

//! Grounded answer composition with bounded retries.
//!
//! [`AnswerComposer::answer`] enforces the no-evidence guard before any
//! generation call: an empty passage list yields the fixed refusal and the
//! language model is never contacted. Otherwise it builds the prompt,
//! calls the model (retrying transient failures with exponential backoff),
//! and maps citation markers back to source URIs.
//!
//! [`AnswerComposer::answer_streaming`] does the same over a streamed
//! completion. A failed attempt is retried only while nothing has been
//! streamed yet; once text reached the caller, a failure ends the answer
//! with [`AnswerError::Interrupted`].

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use policy_qa_core::error::LanguageModelError;
use policy_qa_core::llm::{ChatMessage, Completion, LanguageModel};
use policy_qa_core::models::{AnswerResult, ConversationTurn, RetrievedPassage};
use policy_qa_core::prompt::{build_prompt, finalize_answer, PromptConfig};

use crate::config::LlmConfig;

/// Retry budget for transient language-model failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(32),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.backoff_ms),
            ..Default::default()
        }
    }

    /// No waiting between attempts. For tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based): initial, 2×, 4×, … capped.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(5);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Error)]
pub enum AnswerError {
    /// Every attempt failed with a transient error. The caller may retry later.
    #[error("language model unavailable after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: LanguageModelError,
    },
    /// The request can never succeed as sent (bad key, 4xx, malformed reply).
    #[error("language model request failed: {0}")]
    Rejected(LanguageModelError),
    /// A streamed answer failed after part of it was delivered.
    #[error("language model stream interrupted: {0}")]
    Interrupted(LanguageModelError),
}

impl AnswerError {
    pub fn is_retryable(&self) -> bool {
        match self {
            AnswerError::Exhausted { .. } => true,
            AnswerError::Interrupted(e) => e.is_retryable(),
            AnswerError::Rejected(_) => false,
        }
    }

    /// True when the final attempt timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            AnswerError::Exhausted {
                last: LanguageModelError::Timeout,
                ..
            }
        )
    }
}

pub struct AnswerComposer {
    llm: Arc<dyn LanguageModel>,
    prompt: PromptConfig,
    retry: RetryPolicy,
}

impl AnswerComposer {
    pub fn new(llm: Arc<dyn LanguageModel>, prompt: PromptConfig, retry: RetryPolicy) -> Self {
        Self { llm, prompt, retry }
    }

    pub fn prompt_config(&self) -> &PromptConfig {
        &self.prompt
    }

    pub fn language_model(&self) -> Arc<dyn LanguageModel> {
        Arc::clone(&self.llm)
    }

    /// Answer `query` strictly from `passages`.
    ///
    /// History beyond `max_history` turns is ignored regardless of what the
    /// caller passes.
    pub async fn answer(
        &self,
        query: &str,
        passages: &[RetrievedPassage],
        history: &[ConversationTurn],
    ) -> Result<AnswerResult, AnswerError> {
        if passages.is_empty() {
            debug!("no passages cleared the threshold, refusing without a model call");
            return Ok(AnswerResult::refusal());
        }

        let prompt = build_prompt(query, passages, history, &self.prompt);
        debug!(
            placed = prompt.sources.len(),
            retrieved = passages.len(),
            truncated = prompt.truncated,
            "prompt assembled"
        );

        let completion = self.complete_with_retry(&prompt.messages).await?;
        let result = finalize_answer(&completion.text, &prompt);
        debug!(
            grounded = result.grounded,
            citations = result.citations.len(),
            model = %completion.model,
            "answer composed"
        );
        Ok(result)
    }

    /// [`answer`](Self::answer) with the model output handed to `on_delta`
    /// as it arrives. A refusal is returned without opening a stream and
    /// without calling `on_delta`.
    pub async fn answer_streaming(
        &self,
        query: &str,
        passages: &[RetrievedPassage],
        history: &[ConversationTurn],
        on_delta: &mut (dyn for<'d> FnMut(&'d str) + Send),
    ) -> Result<AnswerResult, AnswerError> {
        if passages.is_empty() {
            debug!("no passages cleared the threshold, refusing without a model call");
            return Ok(AnswerResult::refusal());
        }

        let prompt = build_prompt(query, passages, history, &self.prompt);
        let mut attempt = 0u32;
        let completion = loop {
            attempt += 1;
            let mut streamed = false;
            let outcome = {
                let mut forward = |delta: &str| {
                    streamed = true;
                    on_delta(delta);
                };
                self.llm.complete_stream(&prompt.messages, &mut forward).await
            };
            match outcome {
                Ok(completion) => break completion,
                Err(e) if streamed => return Err(AnswerError::Interrupted(e)),
                Err(e) => tokio::time::sleep(self.retry_delay(attempt, e)?).await,
            }
        };

        let result = finalize_answer(&completion.text, &prompt);
        debug!(
            grounded = result.grounded,
            citations = result.citations.len(),
            model = %completion.model,
            "streamed answer composed"
        );
        Ok(result)
    }

    async fn complete_with_retry(
        &self,
        messages: &[ChatMessage],
    ) -> Result<Completion, AnswerError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.llm.complete(messages).await {
                Ok(completion) => return Ok(completion),
                Err(e) => tokio::time::sleep(self.retry_delay(attempt, e)?).await,
            }
        }
    }

    /// How long to wait before retrying after failed attempt `attempt`, or
    /// the error to give up with.
    fn retry_delay(&self, attempt: u32, e: LanguageModelError) -> Result<Duration, AnswerError> {
        if !e.is_retryable() {
            return Err(AnswerError::Rejected(e));
        }
        if attempt > self.retry.max_retries {
            return Err(AnswerError::Exhausted {
                attempts: attempt,
                last: e,
            });
        }
        let delay = self.retry.delay(attempt);
        warn!(attempt, error = %e, ?delay, "language model call failed, retrying");
        Ok(delay)
    }
}

//! Language-model trait used by the answer composer.
//!
//! The app crate provides an OpenAI-compatible chat-completions client;
//! tests plug in call-counting doubles.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LanguageModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Raw model output for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub model: String,
}

/// A chat-style text generator. One call is one attempt; retry policy is
/// the caller's concern.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion, LanguageModelError>;

    /// Like [`complete`](LanguageModel::complete), handing text to
    /// `on_delta` as it is generated. The returned completion holds the
    /// concatenation of every delta.
    ///
    /// The default makes one non-streaming call and emits its text as a
    /// single delta.
    async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        on_delta: &mut (dyn for<'d> FnMut(&'d str) + Send),
    ) -> Result<Completion, LanguageModelError> {
        let completion = self.complete(messages).await?;
        on_delta(&completion.text);
        Ok(completion)
    }
}

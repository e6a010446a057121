//! Question answering over a transcript.
//!
//! One chat-completion call per question. The engine is stateless between
//! calls; the caller supplies the full context every time.

use crate::config::Prompts;
use crate::error::{Result, SvarError};
use crate::openai::create_client;
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, instrument};

/// Trait for answering a question grounded in a context text.
#[async_trait]
pub trait Answerer: Send + Sync {
    /// Answer `question` using `context` as grounding.
    async fn ask(&self, context: &str, question: &str) -> Result<String>;
}

/// Chat-completion backed answering engine.
pub struct AnsweringEngine {
    client: async_openai::Client<async_openai::config::OpenAIConfig>,
    model: String,
    temperature: f32,
    prompts: Prompts,
}

impl AnsweringEngine {
    /// Create a new answering engine.
    pub fn new(model: &str, temperature: f32, prompts: Prompts) -> Self {
        Self {
            client: create_client(),
            model: model.to_string(),
            temperature,
            prompts,
        }
    }
}

#[async_trait]
impl Answerer for AnsweringEngine {
    #[instrument(skip(self, context), fields(question = %question))]
    async fn ask(&self, context: &str, question: &str) -> Result<String> {
        let mut vars = HashMap::new();
        vars.insert("context".to_string(), context.to_string());
        vars.insert("question".to_string(), question.to_string());

        let user_prompt = self.prompts.render(&self.prompts.answer.user, &vars);

        let messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(self.prompts.answer.system.clone())
                .build()
                .map_err(|e| SvarError::Answer(e.to_string()))?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(user_prompt)
                .build()
                .map_err(|e| SvarError::Answer(e.to_string()))?
                .into(),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .temperature(self.temperature)
            .build()
            .map_err(|e| SvarError::Answer(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| SvarError::OpenAI(format!("Failed to generate answer: {}", e)))?;

        let answer = response
            .choices
            .first()
            .and_then(|c| c.message.content.as_ref())
            .ok_or_else(|| SvarError::Answer("Empty response from model".to_string()))?
            .clone();

        debug!("Generated answer ({} characters)", answer.len());
        Ok(answer)
    }
}

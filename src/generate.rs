//! Answer generation.
//!
//! The [`Generator`] receives the assembled context, the question, and the
//! grounding instructions, and returns the answer text. It is called once
//! per question and never retried.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::config::GenerationConfig;
use crate::error::GenerationError;

/// Returned verbatim when the context cannot answer the question.
pub const REFUSAL: &str = "I don't have enough information to answer that question.";

pub const SYSTEM_INSTRUCTIONS: &str = "\
Your primary task is to answer the user's question based only on the provided context. \
Do not use any external knowledge or information you were trained on.

Instructions:
1. Read the user's question and the context carefully.
2. If the context contains enough information to answer the question, formulate a concise answer.
3. Cite the source document's filename for each piece of information you use. \
For example: \"The sky is blue [source: science_paper.pdf].\"
4. If the context does not contain information to answer the question, you MUST respond with exactly: \
\"I don't have enough information to answer that question.\"
5. Refuse to answer any questions that are harmful, unethical, or off-topic.";

#[async_trait]
pub trait Generator: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(
        &self,
        context: &str,
        question: &str,
        system_instructions: &str,
    ) -> Result<String, GenerationError>;
}

pub fn user_message(context: &str, question: &str) -> String {
    format!(
        "Context:\n{}\n\nQuestion:\n{}\n\nAnswer:",
        context, question
    )
}

/// Chat completion through Ollama's `/api/chat`.
pub struct OllamaGenerator {
    client: reqwest::Client,
    url: String,
    model: String,
    timeout_secs: u64,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GenerationError::Request(e.to_string()))?;
        Ok(Self {
            client,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            model: config.model.clone(),
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        context: &str,
        question: &str,
        system_instructions: &str,
    ) -> Result<String, GenerationError> {
        let body = serde_json::json!({
            "model": self.model,
            "stream": false,
            "messages": [
                { "role": "system", "content": system_instructions },
                { "role": "user", "content": user_message(context, question) },
            ],
        });

        let response = self
            .client
            .post(format!("{}/api/chat", self.url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GenerationError::Timeout(self.timeout_secs)
                } else {
                    GenerationError::Request(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| GenerationError::Request(e.to_string()))?;
        parse_chat_response(&text)
    }
}

fn parse_chat_response(text: &str) -> Result<String, GenerationError> {
    let parsed: ChatResponse =
        serde_json::from_str(text).map_err(|e| GenerationError::Malformed(e.to_string()))?;
    let answer = parsed.message.content.trim().to_string();
    if answer.is_empty() {
        return Err(GenerationError::Malformed("empty answer".to_string()));
    }
    Ok(answer)
}

pub fn create_generator(config: &GenerationConfig) -> anyhow::Result<Box<dyn Generator>> {
    match config.provider.as_str() {
        "ollama" => Ok(Box::new(OllamaGenerator::new(config)?)),
        other => anyhow::bail!("Unknown generation provider: {}", other),
    }
}

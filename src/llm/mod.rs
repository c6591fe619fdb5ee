//! Chat completion client.
//!
//! Talks to any endpoint that implements the OpenAI chat completions API
//! (OpenAI itself, DeepSeek, Moonshot, a local Ollama, ...) and exposes the
//! answer as a pull-driven stream of text fragments.

pub mod openai;
pub mod sse;

pub use openai::{ChatStream, OpenAIClient};

use serde::Serialize;

/// Request body for a streamed chat completion.
#[derive(Debug, Serialize)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<ChatMessage<'a>>,
    pub temperature: f32,
    pub stream: bool,
}

impl<'a> ChatRequest<'a> {
    /// Build a streamed request with a system prompt and one user message.
    pub fn streaming(
        model: &'a str,
        system_prompt: &'a str,
        user_query: &'a str,
        temperature: f32,
    ) -> Self {
        Self {
            model,
            messages: vec![
                ChatMessage {
                    role: Role::System,
                    content: system_prompt,
                },
                ChatMessage {
                    role: Role::User,
                    content: user_query,
                },
            ],
            temperature,
            stream: true,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChatMessage<'a> {
    pub role: Role,
    pub content: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

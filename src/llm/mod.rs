//! Language-model collaborator used for extraction, hydration and summarization.

pub mod openai;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

pub use openai::OpenAiChatClient;

/// A chat message for the LLM conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }
}

/// Speaker role in a chat conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// What a request asks the model to do. Lets clients and test doubles route by task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptKind {
    ExtractEntities,
    ExtractRelationships,
    HydrateAttributes,
    SummarizeCommunity,
    JudgeContradiction,
}

impl PromptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptKind::ExtractEntities => "extract_entities",
            PromptKind::ExtractRelationships => "extract_relationships",
            PromptKind::HydrateAttributes => "hydrate_attributes",
            PromptKind::SummarizeCommunity => "summarize_community",
            PromptKind::JudgeContradiction => "judge_contradiction",
        }
    }
}

impl fmt::Display for PromptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One model call.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    pub kind: PromptKind,
    pub messages: Vec<Message>,
}

impl LlmRequest {
    pub fn new(kind: PromptKind, messages: Vec<Message>) -> Self {
        Self { kind, messages }
    }

    /// The last user message, where prompts put the task payload.
    pub fn user_text(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

/// Trait for chat-completion style language models.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a request and return the raw response text.
    async fn generate(&self, request: &LlmRequest) -> Result<String>;
}

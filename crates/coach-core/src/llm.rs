//! ============================================================================
//! Language Model - Chat completions for coach replies
//! ============================================================================
//! `LanguageModel` is the seam between the memory subsystem and whatever
//! generates the reply. `OpenAiChatModel` talks to any OpenAI-compatible
//! `/chat/completions` endpoint.
//!
//! Tools are advertised in the system prompt; executing them belongs to the
//! surrounding application.
//! ============================================================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::types::{MemoryError, MemoryResult};

/// Reply sent when the model cannot be reached
pub const FALLBACK_REPLY: &str = "Oops! Something went wrong. Can you try that again?";

const SYSTEM_PROMPT: &str = "You are a friendly, knowledgeable nutrition coach. \
Use the user profile, relevant memories and recent conversation you are given \
to personalize every answer. Keep replies short and practical.";

/// A tool the model may ask the application to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments
    pub parameters: serde_json::Value,
}

impl ToolSpec {
    pub fn new(name: &str, description: &str, parameters: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        }
    }
}

/// Tools offered with every turn
pub fn default_tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec::new(
            "get_user_profile",
            "Get the user's nutrition profile and goals",
            json!({"type": "object", "properties": {}}),
        ),
        ToolSpec::new(
            "update_user_profile",
            "Update fields of the user's profile (name, age, weight, height, goals, ...)",
            json!({
                "type": "object",
                "properties": {
                    "fields": {
                        "type": "object",
                        "additionalProperties": {"type": "string"}
                    }
                },
                "required": ["fields"]
            }),
        ),
        ToolSpec::new(
            "get_semantic_memories",
            "Search past conversations relevant to a query",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "k": {"type": "integer", "minimum": 1}
                },
                "required": ["query"]
            }),
        ),
        ToolSpec::new(
            "log_meal",
            "Record a meal the user ate",
            json!({
                "type": "object",
                "properties": {
                    "meal_type": {"type": "string", "enum": ["breakfast", "lunch", "dinner", "snack"]},
                    "description": {"type": "string"}
                },
                "required": ["description"]
            }),
        ),
    ]
}

/// `complete(context, tools) -> text`
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, context: &str, tools: &[ToolSpec]) -> MemoryResult<String>;

    fn name(&self) -> &str;
}

/// Chat model over an OpenAI-compatible API
pub struct OpenAiChatModel {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiChatModel {
    pub fn new(api_key: String, base_url: &str, model: &str, timeout: Duration) -> MemoryResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MemoryError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }

    fn system_prompt(tools: &[ToolSpec]) -> String {
        if tools.is_empty() {
            return SYSTEM_PROMPT.to_string();
        }
        let listing: Vec<String> = tools
            .iter()
            .map(|t| format!("- {}: {}", t.name, t.description))
            .collect();
        format!(
            "{}\n\nThe application can run these tools for you:\n{}",
            SYSTEM_PROMPT,
            listing.join("\n")
        )
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatModel {
    async fn complete(&self, context: &str, tools: &[ToolSpec]) -> MemoryResult<String> {
        debug!("Calling {} with {} chars of context", self.model, context.len());

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: Some(Self::system_prompt(tools)),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: Some(context.to_string()),
                },
            ],
            temperature: Some(0.7),
            max_tokens: Some(1024),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| MemoryError::LanguageModel(format!("Failed to call chat API: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(MemoryError::from_status(
                "Chat API",
                status,
                body,
                MemoryError::LanguageModel,
            ));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| MemoryError::LanguageModel(format!("Failed to parse API response: {}", e)))?;

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| MemoryError::LanguageModel("No response from API".to_string()))
    }

    fn name(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// API Types
// ============================================================================

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

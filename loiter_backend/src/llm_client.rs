use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::services::{GenerationPurpose, GenerationRequest, GenerationService};

#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: String,
    model: String,
    triage_model: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: String, model: String) -> Self {
        Self {
            api_url,
            api_key,
            model,
            triage_model: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_triage_model(mut self, model: Option<String>) -> Self {
        self.triage_model = model.filter(|m| !m.trim().is_empty());
        self
    }

    fn model_for(&self, purpose: GenerationPurpose) -> &str {
        match purpose {
            GenerationPurpose::Reply => &self.model,
            GenerationPurpose::Triage => self.triage_model.as_deref().unwrap_or(&self.model),
        }
    }

    /// Generate a completion with a specific model
    pub async fn generate_with_model(
        &self,
        messages: Vec<Message>,
        model: &str,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_url);

        let request = ChatCompletionRequest {
            model: model.to_string(),
            messages,
            temperature,
            max_tokens,
        };

        let mut req = self.client.post(&url).json(&request);

        // Add API key header if provided (not needed for local models)
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))?;

        Ok(content)
    }
}

/// Flatten a request into chat-completions messages: system blocks first,
/// then context, then the user message.
pub fn build_messages(request: &GenerationRequest) -> Vec<Message> {
    let mut messages = Vec::with_capacity(request.context.len() + 2);

    let system = request
        .system
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    if !system.is_empty() {
        messages.push(Message {
            role: "system".to_string(),
            content: system,
        });
    }

    for ctx in &request.context {
        // The user message is appended explicitly below.
        if ctx.role.as_str() == "user" && ctx.text == request.user_message {
            continue;
        }
        messages.push(Message {
            role: ctx.role.as_str().to_string(),
            content: ctx.text.clone(),
        });
    }

    messages.push(Message {
        role: "user".to_string(),
        content: request.user_message.clone(),
    });
    messages
}

#[async_trait]
impl GenerationService for LlmClient {
    async fn generate(&self, request: GenerationRequest) -> Result<String> {
        let messages = build_messages(&request);
        let model = self.model_for(request.purpose).to_string();
        self.generate_with_model(
            messages,
            &model,
            Some(request.temperature),
            Some(request.max_tokens),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{ContextMessage, Role};

    #[test]
    fn build_messages_merges_system_and_dedupes_target() {
        let request = GenerationRequest {
            system: vec!["persona".to_string(), " ".to_string(), "be brief".to_string()],
            context: vec![
                ContextMessage {
                    role: Role::User,
                    text: "ana: hi".to_string(),
                },
                ContextMessage {
                    role: Role::Assistant,
                    text: "hey".to_string(),
                },
                ContextMessage {
                    role: Role::User,
                    text: "ana: you there?".to_string(),
                },
            ],
            user_message: "ana: you there?".to_string(),
            max_tokens: 60,
            temperature: 0.9,
            purpose: GenerationPurpose::Reply,
        };
        let messages = build_messages(&request);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[0].content, "persona\n\nbe brief");
        assert_eq!(messages[2].role, "assistant");
        assert_eq!(messages[3].content, "ana: you there?");
    }

    #[test]
    fn triage_model_falls_back_to_main_model() {
        let client = LlmClient::new("http://x".into(), String::new(), "main".into());
        assert_eq!(client.model_for(GenerationPurpose::Triage), "main");
        let client = client.with_triage_model(Some("small".into()));
        assert_eq!(client.model_for(GenerationPurpose::Triage), "small");
        assert_eq!(client.model_for(GenerationPurpose::Reply), "main");
    }
}

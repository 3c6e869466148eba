use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::VisionService;

const CAPTION_PROMPT: &str = "Describe this image in one or two sentences for someone in a group \
chat who can't see it. Start with exactly one tag from [MEME] [SELFIE] [FOOD] [FASHION] [TRAVEL] \
[PRODUCT] [MEDICAL] [SCREENSHOT] [PHOTO]. For memes include any visible caption text.";

#[derive(Debug, Deserialize)]
struct VisionResponse {
    choices: Vec<VisionChoice>,
}

#[derive(Debug, Deserialize)]
struct VisionChoice {
    message: VisionMessage,
}

#[derive(Debug, Deserialize)]
struct VisionMessage {
    content: String,
}

/// Captions images through an OpenAI-compatible multimodal chat endpoint.
pub struct LlmVision {
    api_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl LlmVision {
    pub fn new(api_url: String, api_key: String, model: String) -> Self {
        Self {
            api_url,
            api_key,
            model,
            client: reqwest::Client::new(),
        }
    }

    async fn caption(&self, image_url: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_url);
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": 120,
            "temperature": 0.2,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": CAPTION_PROMPT },
                    { "type": "image_url", "image_url": { "url": image_url } }
                ]
            }]
        });

        let mut req = self.client.post(&url).json(&body);
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req.send().await.context("Failed to send vision request")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Vision API returned error {}: {}", status, body);
        }

        let parsed: VisionResponse = response
            .json()
            .await
            .context("Failed to parse vision response")?;
        parsed
            .choices
            .first()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| anyhow::anyhow!("No response from vision model"))
    }
}

#[async_trait]
impl VisionService for LlmVision {
    async fn describe(&self, image_url: &str, timeout: Duration) -> String {
        match tokio::time::timeout(timeout, self.caption(image_url)).await {
            Ok(Ok(caption)) => caption,
            Ok(Err(e)) => {
                tracing::warn!("Image description failed: {}", e);
                String::new()
            }
            Err(_) => {
                tracing::warn!("Image description timed out after {:?}", timeout);
                String::new()
            }
        }
    }
}

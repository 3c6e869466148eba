//! External collaborators the presence engine leans on.
//!
//! Every trait here is best-effort: callers treat errors and empty strings as
//! "no result" and carry on with less context.

pub mod memory;
pub mod sentiment;
pub mod vision;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::ArchiveMemory;
pub use sentiment::{LexiconSentiment, SentimentLabel};
pub use vision::LlmVision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: Role,
    pub text: String,
}

/// Which model class a request should go to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GenerationPurpose {
    #[default]
    Reply,
    /// Short yes/no classification; may use a cheaper model.
    Triage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub system: Vec<String>,
    pub context: Vec<ContextMessage>,
    pub user_message: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub purpose: GenerationPurpose,
}

#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<String>;
}

#[async_trait]
pub trait VisionService: Send + Sync {
    /// A `[TYPE] description` caption, or "" when nothing usable came back.
    async fn describe(&self, image_url: &str, timeout: Duration) -> String;
}

pub trait SentimentScorer: Send + Sync {
    /// Compound valence in [-1, 1].
    fn score(&self, text: &str) -> f64;

    fn label(&self, text: &str) -> SentimentLabel {
        SentimentLabel::from_compound(self.score(text))
    }
}

#[async_trait]
pub trait MemoryRetriever: Send + Sync {
    /// Formatted context block for `query`, or "" on a miss.
    async fn retrieve(&self, query: &str, top_k: usize) -> String;
}

pub struct NullVision;

#[async_trait]
impl VisionService for NullVision {
    async fn describe(&self, _image_url: &str, _timeout: Duration) -> String {
        String::new()
    }
}

pub struct NullMemory;

#[async_trait]
impl MemoryRetriever for NullMemory {
    async fn retrieve(&self, _query: &str, _top_k: usize) -> String {
        String::new()
    }
}

/// Collaborator bundle handed to the engine.
#[derive(Clone)]
pub struct Services {
    pub generation: Arc<dyn GenerationService>,
    pub vision: Arc<dyn VisionService>,
    pub sentiment: Arc<dyn SentimentScorer>,
    pub memory: Arc<dyn MemoryRetriever>,
}

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::database::EngineDatabase;

use super::MemoryRetriever;

/// Buffer-derived queries need at least this many keywords to be worth running.
pub const MIN_QUERY_KEYWORDS: usize = 2;
pub const MAX_QUERY_KEYWORDS: usize = 8;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "has", "him", "his", "how", "its", "may", "now", "who", "did", "get",
    "got", "let", "say", "she", "too", "use", "that", "with", "have", "this", "will", "your",
    "from", "they", "been", "were", "said", "each", "which", "their", "what", "there", "about",
    "would", "make", "like", "just", "know", "than", "then", "them", "these", "some", "could",
    "into", "more", "only", "other", "also", "back", "very", "when", "here", "even", "want",
    "really", "yeah", "lol", "lmao", "gonna", "dont", "don't", "its", "it's", "i'm", "im",
    "thats", "that's", "what's", "okay", "well", "much", "still", "think", "going", "being",
];

/// Up to `max` content words from `text`, most frequent first.
pub fn extract_keywords(text: &str, max: usize) -> Vec<String> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for (position, raw) in text
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .enumerate()
    {
        let word = raw.trim_matches('\'').to_lowercase();
        if word.chars().count() < 3
            || word.chars().all(|c| c.is_ascii_digit())
            || STOPWORDS.contains(&word.as_str())
        {
            continue;
        }
        let slot = counts.entry(word).or_insert((0, position));
        slot.0 += 1;
    }

    let mut ranked: Vec<(String, usize, usize)> = counts
        .into_iter()
        .map(|(word, (count, first))| (word, count, first))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked.into_iter().take(max).map(|(w, _, _)| w).collect()
}

/// Long-term memory backed by the local message archive.
pub struct ArchiveMemory {
    db: Arc<EngineDatabase>,
}

impl ArchiveMemory {
    pub fn new(db: Arc<EngineDatabase>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MemoryRetriever for ArchiveMemory {
    async fn retrieve(&self, query: &str, top_k: usize) -> String {
        let keywords = extract_keywords(query, MAX_QUERY_KEYWORDS);
        if keywords.is_empty() {
            return String::new();
        }

        let matches = match self.db.search_archive(&keywords, top_k) {
            Ok(matches) => matches,
            Err(e) => {
                tracing::warn!("Memory retrieval failed: {}", e);
                return String::new();
            }
        };
        if matches.is_empty() {
            return String::new();
        }

        let mut block = String::from("Relevant past messages from this chat:\n");
        for (i, m) in matches.iter().enumerate() {
            block.push_str(&format!(
                "{}. [{}] {}: {}\n",
                i + 1,
                m.created_at.format("%Y-%m-%d"),
                m.author_name,
                m.text
            ));
        }
        tracing::debug!("Memory: {} matches for {:?}", matches.len(), keywords);
        block
    }
}

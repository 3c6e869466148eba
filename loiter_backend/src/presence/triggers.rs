//! Trigger detection: pure text classification against pattern tables.

use anyhow::{Context, Result};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{PatternConfig, PersonaConfig};
use crate::transport::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerCategory {
    DirectAddress,
    ReplyToAgent,
    NameMention,
    IdentityDenial,
    Hostility,
    EscalationRequest,
    SoftContinuation,
}

impl TriggerCategory {
    /// Categories that still get handled while the global cooldown runs.
    pub fn bypasses_cooldown(self) -> bool {
        matches!(
            self,
            Self::EscalationRequest | Self::IdentityDenial | Self::Hostility
        )
    }

    /// Categories that feed the escalation tracker.
    pub fn is_offense(self) -> bool {
        matches!(
            self,
            Self::EscalationRequest | Self::IdentityDenial | Self::Hostility
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DirectAddress => "direct_address",
            Self::ReplyToAgent => "reply_to_agent",
            Self::NameMention => "name_mention",
            Self::IdentityDenial => "identity_denial",
            Self::Hostility => "hostility",
            Self::EscalationRequest => "escalation_request",
            Self::SoftContinuation => "soft_continuation",
        }
    }
}

impl std::fmt::Display for TriggerCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Behavioral classification strategy. Implementations must be pure.
pub trait BehaviorClassifier: Send + Sync {
    /// The behavioral category `text` belongs to, checked in the order
    /// identity denial, hostility, escalation request.
    ///
    /// Generic identity keywords only count when `agent_spoke_recently` is set,
    /// so ordinary talk about chatbots doesn't read as an accusation.
    fn classify(&self, text: &str, agent_spoke_recently: bool) -> Option<TriggerCategory>;
}

/// Regex tables compiled from [`PatternConfig`].
pub struct PatternClassifier {
    identity_denial: Vec<Regex>,
    identity_keywords: Vec<Regex>,
    hostility: Vec<Regex>,
    escalation_request: Vec<Regex>,
}

impl PatternClassifier {
    pub fn from_config(patterns: &PatternConfig, names: &[String]) -> Result<Self> {
        Ok(Self {
            identity_denial: compile_table("identity_denial", &patterns.identity_denial, names)?,
            identity_keywords: compile_table(
                "identity_keywords",
                &patterns.identity_keywords,
                names,
            )?,
            hostility: compile_table("hostility", &patterns.hostility, names)?,
            escalation_request: compile_table(
                "escalation_request",
                &patterns.escalation_request,
                names,
            )?,
        })
    }
}

impl BehaviorClassifier for PatternClassifier {
    fn classify(&self, text: &str, agent_spoke_recently: bool) -> Option<TriggerCategory> {
        let denial = any_match(&self.identity_denial, text)
            || (agent_spoke_recently && any_match(&self.identity_keywords, text));
        if denial {
            return Some(TriggerCategory::IdentityDenial);
        }
        if any_match(&self.hostility, text) {
            return Some(TriggerCategory::Hostility);
        }
        if any_match(&self.escalation_request, text) {
            return Some(TriggerCategory::EscalationRequest);
        }
        None
    }
}

fn any_match(table: &[Regex], text: &str) -> bool {
    table.iter().any(|re| re.is_match(text))
}

fn compile_table(table: &str, patterns: &[String], names: &[String]) -> Result<Vec<Regex>> {
    let name_group = if names.is_empty() {
        None
    } else {
        let alternatives: Vec<String> = names.iter().map(|n| regex_lite::escape(n)).collect();
        Some(format!("(?:{})", alternatives.join("|")))
    };

    let mut compiled = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        let expanded = match (&name_group, pattern.contains("{name}")) {
            (Some(group), true) => pattern.replace("{name}", group),
            // A name pattern with no names configured can never match.
            (None, true) => continue,
            (_, false) => pattern.clone(),
        };
        let re = Regex::new(&format!("(?i){}", expanded))
            .with_context(|| format!("Invalid {} pattern: {}", table, pattern))?;
        compiled.push(re);
    }
    Ok(compiled)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameTier {
    High,
    Low,
}

/// How the agent can be addressed: platform mention, handles and name tokens.
pub struct AddressBook {
    mention_tokens: Vec<String>,
    handles: Vec<String>,
    names_high: Vec<Regex>,
    names_low: Vec<Regex>,
}

impl AddressBook {
    pub fn from_persona(persona: &PersonaConfig) -> Result<Self> {
        Ok(Self {
            mention_tokens: mention_tokens(persona.agent_user_id),
            handles: persona
                .handles
                .iter()
                .map(|h| h.trim().to_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
            names_high: compile_names(&persona.names_high)?,
            names_low: compile_names(&persona.names_low)?,
        })
    }

    pub fn is_direct_address(&self, text: &str) -> bool {
        if self.mention_tokens.iter().any(|t| text.contains(t.as_str())) {
            return true;
        }
        let lower = text.to_lowercase();
        self.handles.iter().any(|h| lower.contains(h.as_str()))
    }

    /// Strongest name tier present in `text`.
    pub fn name_tier(&self, text: &str) -> Option<NameTier> {
        if any_match(&self.names_high, text) {
            Some(NameTier::High)
        } else if any_match(&self.names_low, text) {
            Some(NameTier::Low)
        } else {
            None
        }
    }
}

fn mention_tokens(agent_id: UserId) -> Vec<String> {
    vec![format!("<@{}>", agent_id), format!("<@!{}>", agent_id)]
}

fn compile_names(names: &[String]) -> Result<Vec<Regex>> {
    names
        .iter()
        .filter(|n| !n.trim().is_empty())
        .map(|n| {
            Regex::new(&format!(r"(?i)\b{}\b", regex_lite::escape(n.trim())))
                .with_context(|| format!("Invalid name token: {}", n))
        })
        .collect()
}

const CAPABILITY_PHRASES: [&str; 6] = [
    "can you",
    "could you",
    "do you",
    "are you",
    "will you",
    "would you",
];
const REFERRING_WORDS: [&str; 6] = ["it", "that", "this", "there", "the same", "those"];

/// Heuristic likelihood in [0, 1] that `text` continues a conversation with the agent.
///
/// `mentions_someone_else` and `others_spoke_since_agent` come from the session;
/// everything else is read off the text.
pub fn continuation_score(
    text: &str,
    mentions_someone_else: bool,
    others_spoke_since_agent: bool,
) -> f64 {
    let lower = text.to_lowercase();
    let padded = format!(" {} ", lower);
    let mut score: f64 = 0.0;

    if CAPABILITY_PHRASES.iter().any(|p| lower.contains(p)) {
        score += 0.45;
    }
    if text.contains('?') {
        score += 0.20;
    }
    if REFERRING_WORDS
        .iter()
        .any(|w| padded.contains(&format!(" {} ", w)))
    {
        score += 0.15;
    }
    if !mentions_someone_else {
        score += 0.10;
    }
    if !others_spoke_since_agent {
        score += 0.10;
    }

    score.min(1.0)
}

/// Mention of anyone: `<@123>` markup or an `@handle` token.
pub fn contains_user_mention(text: &str) -> bool {
    text.contains("<@")
        || text.split_whitespace().any(|word| {
            word.strip_prefix('@')
                .and_then(|rest| rest.chars().next())
                .map(|c| c.is_alphanumeric() || c == '_')
                .unwrap_or(false)
        })
}

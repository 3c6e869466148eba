use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::presence::session::Mood;
use crate::transport::{ChannelId, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    #[serde(default = "default_agent_name")]
    pub display_name: String,
    #[serde(default)]
    pub agent_user_id: UserId,
    /// Literal tokens that count as addressing the agent directly (e.g. "@loiter_bot").
    #[serde(default)]
    pub handles: Vec<String>,
    /// Name tokens that nearly always mean the agent.
    #[serde(default = "default_names_high")]
    pub names_high: Vec<String>,
    /// Ambiguous name tokens (shared with people, nicknames).
    #[serde(default)]
    pub names_low: Vec<String>,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default)]
    pub system_prompt_path: Option<String>,
}

fn default_agent_name() -> String {
    "Loiter".to_string()
}

fn default_names_high() -> Vec<String> {
    vec!["loiterbot".to_string(), "loiter-bot".to_string()]
}

fn default_system_prompt() -> String {
    "You are a regular in a group chat. You talk like a person: short, casual, \
     opinionated, never formal. You do not narrate actions or explain yourself."
        .to_string()
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            display_name: default_agent_name(),
            agent_user_id: 0,
            handles: Vec::new(),
            names_high: default_names_high(),
            names_low: Vec::new(),
            system_prompt: default_system_prompt(),
            system_prompt_path: None,
        }
    }
}

impl PersonaConfig {
    /// Prompt file contents when configured and readable, the inline prompt otherwise.
    pub fn resolved_system_prompt(&self) -> String {
        if let Some(path) = self.system_prompt_path.as_deref() {
            match fs::read_to_string(path) {
                Ok(contents) if !contents.trim().is_empty() => return contents,
                Ok(_) => tracing::warn!("System prompt file {:?} is empty", path),
                Err(e) => tracing::warn!("Failed to read system prompt {:?}: {}", path, e),
            }
        }
        self.system_prompt.clone()
    }

    /// Every name the agent answers to, used for `{name}` pattern expansion.
    pub fn all_names(&self) -> Vec<String> {
        let mut names = vec![self.display_name.clone()];
        names.extend(self.names_high.iter().cloned());
        names.extend(self.names_low.iter().cloned());
        names.retain(|n| !n.trim().is_empty());
        names.sort();
        names.dedup();
        names
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MembershipConfig {
    #[serde(default)]
    pub primary_user_id: Option<UserId>,
    #[serde(default)]
    pub allies: Vec<UserId>,
    #[serde(default)]
    pub adversaries: Vec<UserId>,
    /// Members who still get the punitive message but are never restricted.
    #[serde(default)]
    pub restriction_exempt: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    #[serde(default = "default_identity_denial_patterns")]
    pub identity_denial: Vec<String>,
    /// Generic keywords that only count as denial right after the agent spoke.
    #[serde(default = "default_identity_keywords")]
    pub identity_keywords: Vec<String>,
    #[serde(default = "default_hostility_patterns")]
    pub hostility: Vec<String>,
    #[serde(default = "default_escalation_request_patterns")]
    pub escalation_request: Vec<String>,
    #[serde(default = "default_interesting_keywords")]
    pub interesting_keywords: Vec<String>,
}

fn default_identity_denial_patterns() -> Vec<String> {
    vec![
        r"\b(you'?re|you are|ur|u r)\s+(just\s+)?(an?\s+)?(bot|ai|robot|chatbot|program)\b"
            .to_string(),
        r"\b(you'?re|you are)\s+not\s+(a\s+)?real\b".to_string(),
        r"\b{name}\s+is\s+(just\s+)?(an?\s+)?(bot|ai|robot|fake)\b".to_string(),
        r"\b{name}\s+(isn'?t|is not)\s+real\b".to_string(),
    ]
}

fn default_identity_keywords() -> Vec<String> {
    vec![
        r"\b(chatgpt|language model|llm)\b".to_string(),
        r"\bai\s+generated\b".to_string(),
    ]
}

fn default_hostility_patterns() -> Vec<String> {
    vec![
        r"\b(shut up|stfu)\b".to_string(),
        r"\bnobody (asked|cares)\b".to_string(),
        r"\b(go away|get lost)\b".to_string(),
        r"\bi hate (you|{name})\b".to_string(),
        r"\b(you'?re|you are)\s+(so\s+)?(annoying|pathetic|useless)\b".to_string(),
    ]
}

fn default_escalation_request_patterns() -> Vec<String> {
    vec![
        r"\b(mute|timeout|restrict)\s+me\b".to_string(),
        r"\bput me in time\s?out\b".to_string(),
    ]
}

fn default_interesting_keywords() -> Vec<String> {
    [
        "music", "album", "concert", "movie", "show", "game", "book", "travel", "food",
        "coffee", "art", "anime", "recipe",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            identity_denial: default_identity_denial_patterns(),
            identity_keywords: default_identity_keywords(),
            hostility: default_hostility_patterns(),
            escalation_request: default_escalation_request_patterns(),
            interesting_keywords: default_interesting_keywords(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MoodCooldowns {
    pub dormant: f64,
    pub engaged: f64,
    pub heated: f64,
    pub disengaged: f64,
}

impl Default for MoodCooldowns {
    fn default() -> Self {
        Self {
            dormant: 12.0,
            engaged: 5.0,
            heated: 3.0,
            disengaged: 15.0,
        }
    }
}

impl MoodCooldowns {
    pub fn for_mood(&self, mood: Mood) -> f64 {
        match mood {
            Mood::Dormant => self.dormant,
            Mood::Engaged => self.engaged,
            Mood::Heated => self.heated,
            Mood::Disengaged => self.disengaged,
        }
    }
}

/// Tuning knobs for the presence engine. Durations are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub buffer_capacity: usize,
    pub tick_interval_secs: f64,
    pub tick_message_threshold: usize,
    pub tick_poll_ms: u64,
    pub inactivity_reset_secs: f64,
    pub active_user_window_secs: f64,

    pub mood_cooldowns: MoodCooldowns,
    pub post_speak_suppress_secs: f64,
    pub focus_window_secs: f64,
    pub user_cooldown_secs: f64,
    pub user_priority_cooldown_secs: f64,
    pub bored_interjection_secs: f64,

    pub escalation_warn_threshold: u32,
    pub escalation_execute_threshold: u32,
    pub escalation_timeout_secs: f64,
    pub restriction_secs: u64,
    pub first_offense_ignore_chance: f64,

    pub opportunity_threshold: f64,
    pub scan_window: usize,
    pub scan_max_age_secs: f64,
    pub random_engagement_chance: f64,
    pub freshness_half_life_secs: f64,

    pub image_task_cap: usize,
    pub image_stale_secs: f64,
    pub vision_timeout_secs: f64,
    pub typing_wait_secs: f64,
    pub typing_stale_secs: f64,

    pub continuation_direct_threshold: f64,
    pub continuation_triage_threshold: f64,
    pub name_chance_high: f64,
    pub name_chance_low: f64,
    pub focused_name_modifier: f64,
    pub focused_mention_chance: f64,

    pub typing_chars_per_sec: f64,
    pub typing_min_secs: f64,
    pub typing_max_secs: f64,

    pub energy_decay: f64,
    pub temperature_decay: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 12,
            tick_interval_secs: 3.0,
            tick_message_threshold: 3,
            tick_poll_ms: 500,
            inactivity_reset_secs: 600.0,
            active_user_window_secs: 120.0,

            mood_cooldowns: MoodCooldowns::default(),
            post_speak_suppress_secs: 10.0,
            focus_window_secs: 90.0,
            user_cooldown_secs: 45.0,
            user_priority_cooldown_secs: 15.0,
            bored_interjection_secs: 1800.0,

            escalation_warn_threshold: 3,
            escalation_execute_threshold: 4,
            escalation_timeout_secs: 300.0,
            restriction_secs: 120,
            first_offense_ignore_chance: 0.23,

            opportunity_threshold: 0.45,
            scan_window: 5,
            scan_max_age_secs: 60.0,
            random_engagement_chance: 0.05,
            freshness_half_life_secs: 30.0,

            image_task_cap: 3,
            image_stale_secs: 30.0,
            vision_timeout_secs: 20.0,
            typing_wait_secs: 10.0,
            typing_stale_secs: 8.0,

            continuation_direct_threshold: 0.45,
            continuation_triage_threshold: 0.20,
            name_chance_high: 0.80,
            name_chance_low: 0.15,
            focused_name_modifier: 0.3,
            focused_mention_chance: 0.35,

            typing_chars_per_sec: 7.0,
            typing_min_secs: 0.8,
            typing_max_secs: 7.0,

            energy_decay: 0.02,
            temperature_decay: 0.013,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    // LLM configuration (OpenAI-compatible: Ollama, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    /// Cheaper model for the yes/no continuation check. Falls back to `llm_model`.
    #[serde(default)]
    pub triage_model: Option<String>,
    /// Multimodal model for image descriptions. Image analysis is off when unset.
    #[serde(default)]
    pub vision_model: Option<String>,

    #[serde(default)]
    pub channel_id: ChannelId,
    #[serde(default)]
    pub mod_log_channel_id: Option<ChannelId>,
    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default)]
    pub persona: PersonaConfig,
    #[serde(default)]
    pub membership: MembershipConfig,
    #[serde(default)]
    pub patterns: PatternConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_database_path() -> String {
    "loiter_memory.db".to_string()
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            triage_model: None,
            vision_model: None,
            channel_id: 0,
            mod_log_channel_id: None,
            database_path: default_database_path(),
            persona: PersonaConfig::default(),
            membership: MembershipConfig::default(),
            patterns: PatternConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl PresenceConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("loiter_config.toml")
    }

    /// Load config from loiter_config.toml (next to executable), then apply env overrides
    pub fn load() -> Self {
        let path = Self::config_path();

        let base = match fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<PresenceConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    Some(config)
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                    None
                }
            },
            Err(_) => None,
        };

        match base {
            Some(config) => config.with_env_overrides(),
            None => {
                tracing::warn!("No config file found, using defaults + env vars");
                Self::from_env()
            }
        }
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Defaults plus environment variables
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = env::var("LLM_API_URL") {
            self.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            self.llm_model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            self.llm_api_key = Some(key);
        }

        if let Ok(model) = env::var("LOITER_TRIAGE_MODEL") {
            if !model.trim().is_empty() {
                self.triage_model = Some(model);
            }
        }

        if let Ok(model) = env::var("LOITER_VISION_MODEL") {
            if !model.trim().is_empty() {
                self.vision_model = Some(model);
            }
        }

        if let Ok(id) = env::var("LOITER_CHANNEL_ID") {
            if let Ok(id) = id.trim().parse() {
                self.channel_id = id;
            }
        }

        if let Ok(id) = env::var("LOITER_AGENT_USER_ID") {
            if let Ok(id) = id.trim().parse() {
                self.persona.agent_user_id = id;
            }
        }

        if let Ok(name) = env::var("LOITER_AGENT_NAME") {
            if !name.trim().is_empty() {
                self.persona.display_name = name;
            }
        }

        if let Ok(path) = env::var("LOITER_DATABASE_PATH") {
            if !path.trim().is_empty() {
                self.database_path = path;
            }
        }

        if let Ok(flag) = env::var("LOITER_DISABLE_VISION") {
            let disabled = flag.eq_ignore_ascii_case("1")
                || flag.eq_ignore_ascii_case("true")
                || flag.eq_ignore_ascii_case("yes");
            if disabled {
                self.vision_model = None;
            }
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_documented_defaults() {
        let config: PresenceConfig = toml::from_str("").expect("parse empty config");
        assert_eq!(config.engine.buffer_capacity, 12);
        assert_eq!(config.engine.escalation_warn_threshold, 3);
        assert_eq!(config.engine.escalation_execute_threshold, 4);
        assert_eq!(config.engine.mood_cooldowns.heated, 3.0);
        assert!((config.engine.opportunity_threshold - 0.45).abs() < f64::EPSILON);
        assert!(!config.patterns.hostility.is_empty());
    }

    #[test]
    fn partial_engine_section_keeps_other_defaults() {
        let raw = r#"
            channel_id = 42

            [engine]
            buffer_capacity = 20
            image_task_cap = 1

            [engine.mood_cooldowns]
            dormant = 30.0
            engaged = 5.0
            heated = 3.0
            disengaged = 15.0
        "#;
        let config: PresenceConfig = toml::from_str(raw).expect("parse config");
        assert_eq!(config.channel_id, 42);
        assert_eq!(config.engine.buffer_capacity, 20);
        assert_eq!(config.engine.image_task_cap, 1);
        assert_eq!(config.engine.tick_message_threshold, 3);
        assert_eq!(config.engine.mood_cooldowns.for_mood(Mood::Dormant), 30.0);
    }

    #[test]
    fn config_round_trips_through_pretty_toml() {
        let mut config = PresenceConfig::default();
        config.membership.allies = vec![7, 8];
        config.persona.names_low = vec!["lo".to_string()];
        let text = toml::to_string_pretty(&config).expect("serialize");
        let parsed: PresenceConfig = toml::from_str(&text).expect("parse");
        assert_eq!(parsed.membership.allies, vec![7, 8]);
        assert_eq!(parsed.engine, config.engine);
    }

    #[test]
    fn all_names_deduplicates_and_drops_blanks() {
        let persona = PersonaConfig {
            display_name: "Loiter".to_string(),
            names_high: vec!["loiterbot".to_string(), "Loiter".to_string()],
            names_low: vec![" ".to_string()],
            ..PersonaConfig::default()
        };
        assert_eq!(persona.all_names(), vec!["Loiter", "loiterbot"]);
    }
}

//! Prompt assembly and the single generation call per action.

use std::time::Duration;

use crate::config::EngineConfig;
use crate::services::{
    ContextMessage, GenerationPurpose, GenerationRequest, GenerationService, MemoryRetriever, Role,
};
use crate::transport::MessageId;

use super::observe::truncate_chars;
use super::opportunity::{ImageKind, OpportunityKind};
use super::select::{ActionPlan, PlanSource, Targeting};
use super::session::{BufferedEntry, Classification, Mood, SessionState};

pub const REPLY_TEMPERATURE: f32 = 0.9;
pub const PUNITIVE_TEMPERATURE: f32 = 1.0;
pub const PUNITIVE_MAX_TOKENS: u32 = 150;
const PUNITIVE_CONTEXT_ENTRIES: usize = 5;
const PUNITIVE_MEMORY_TOP_K: usize = 8;
const REPLY_QUOTE_CHARS: usize = 200;

/// Used when punitive generation comes back empty, so the action is never silent.
pub const PUNITIVE_FALLBACK: &str = "That's enough from you for a while.";

const NO_TARGET_PROMPT: &str = "The chat has been active. Join in naturally with a brief comment.";

pub fn max_tokens_for(mood: Mood) -> u32 {
    match mood {
        Mood::Dormant => 60,
        Mood::Engaged => 70,
        Mood::Heated => 80,
        Mood::Disengaged => 55,
    }
}

fn mood_prompt(mood: Mood, source: Option<PlanSource>) -> &'static str {
    let adversary = source == Some(PlanSource::Opportunity(OpportunityKind::AdversaryEngagement));
    match mood {
        Mood::Dormant | Mood::Disengaged if adversary => {
            "The chat was quiet, but something this person said caught your eye. Chime in on it."
        }
        Mood::Dormant => "The chat is quiet. Keep it low-key and brief.",
        Mood::Engaged => "You're in the middle of the conversation. Keep the back-and-forth going.",
        Mood::Heated => "The chat is heated. Be quick and punchy.",
        Mood::Disengaged => "You're only half paying attention. Keep it short and a little detached.",
    }
}

fn energy_prompt(energy: f64) -> Option<&'static str> {
    if energy > 0.8 {
        Some("You're feeling energetic.")
    } else if energy < 0.3 {
        Some("You're low on energy.")
    } else {
        None
    }
}

/// Drop a leading `[TYPE]` tag from a vision caption.
fn caption_body(description: &str) -> &str {
    let trimmed = description.trim_start();
    match trimmed.strip_prefix('[').and_then(|rest| rest.split_once(']')) {
        Some((_, body)) => body.trim(),
        None => trimmed.trim(),
    }
}

fn is_own_selfie(message_text: &str) -> bool {
    let lower = format!(" {} ", message_text.to_lowercase());
    const THIRD_PERSON: [&str; 10] = [
        " my friend", " my sister", " my brother", " my mom", " my dad", " she ", " he ",
        " they ", " her ", " his ",
    ];
    !THIRD_PERSON.iter().any(|hint| lower.contains(hint))
}

fn selfie_instruction(own: bool, classification: Classification) -> &'static str {
    match (own, classification) {
        (true, Classification::Primary) => {
            "It's a selfie of them. Be genuinely warm about it and compliment something specific."
        }
        (true, Classification::Ally) => "It's a selfie of them. Hype them up a little.",
        (true, Classification::Adversary) => {
            "It's a selfie of them. Stay unimpressed and keep it short."
        }
        (true, Classification::Neutral) => {
            "It's a selfie of them. React casually, mention one detail you notice."
        }
        (false, _) => {
            "It's a photo of someone else. React to it without assuming it's the poster."
        }
    }
}

/// Type-aware instruction for reacting to an image someone posted.
pub fn image_hint(
    description: &str,
    roast: bool,
    poster: &str,
    classification: Classification,
    message_text: &str,
) -> String {
    let kind = ImageKind::from_description(description);
    let instruction = if roast {
        "Tease them about this image. Pick a concrete visual detail and keep it sharp."
    } else {
        match kind {
            ImageKind::Meme => {
                "React to the meme like you would in a group chat. Get the joke, or call it stale."
            }
            ImageKind::Selfie => selfie_instruction(is_own_selfie(message_text), classification),
            ImageKind::Food => "Have an opinion about the food. Would you eat it?",
            ImageKind::Fashion => "Give a quick take on the outfit.",
            ImageKind::Travel => "React to the place. Ask or comment about the trip.",
            ImageKind::Product => "Give a quick opinion on the thing they're showing.",
            ImageKind::Medical => "Be supportive and low-key about it. No medical advice.",
            ImageKind::Screenshot => {
                "Respond to what's in the screenshot, not the fact that it is one."
            }
            ImageKind::Photo => "React to the photo casually, like a friend would.",
        }
    };
    format!(
        "[{} posted an image: {}]\n{} Don't describe the image back to them.",
        poster,
        caption_body(description),
        instruction
    )
}

fn context_line(entry: &BufferedEntry) -> ContextMessage {
    if entry.is_agent {
        return ContextMessage {
            role: Role::Assistant,
            text: entry.text.clone(),
        };
    }
    let mut text = format!("{}: {}", entry.author_name, entry.text);
    if let Some(description) = &entry.image_description {
        text.push_str(&format!(" [attached image: {}]", caption_body(description)));
    }
    ContextMessage {
        role: Role::User,
        text,
    }
}

/// The line the model answers: the target message, with reply context when
/// the quoted message has already left the buffer.
pub fn user_message_for(state: &SessionState, target: Option<MessageId>) -> String {
    let Some(entry) = target.and_then(|id| state.entry(id)) else {
        return NO_TARGET_PROMPT.to_string();
    };

    let text = if entry.text.trim().is_empty() && entry.image_description.is_some() {
        "[posted an image with no text]".to_string()
    } else {
        entry.text.clone()
    };

    let quoted_elsewhere = entry
        .reply_to_id
        .map(|id| state.entry(id).is_none())
        .unwrap_or(false);
    match (&entry.reply_context, quoted_elsewhere) {
        (Some(quote), true) => format!(
            "{} (replying to {}: \"{}\"): {}",
            entry.author_name,
            entry.reply_context_author.as_deref().unwrap_or("someone"),
            truncate_chars(quote, REPLY_QUOTE_CHARS),
            text
        ),
        _ => format!("{}: {}", entry.author_name, text),
    }
}

pub fn targeting_prompt(plan: &ActionPlan) -> Option<String> {
    match &plan.targeting {
        Targeting::Multi => Some(
            "Several people are going at it. You can address more than one of them if it fits."
                .to_string(),
        ),
        Targeting::Single { exclude_names } => {
            let target = plan.target_user_name.as_deref()?;
            if exclude_names.is_empty() {
                Some(format!("Respond ONLY to {}.", target))
            } else {
                Some(format!(
                    "Respond ONLY to {}. Do NOT mention or address {}.",
                    target,
                    exclude_names.join(", ")
                ))
            }
        }
    }
}

pub struct ContentCoordinator<'a> {
    pub engine: &'a EngineConfig,
    pub system_prompt: &'a str,
    pub generation: &'a dyn GenerationService,
    pub memory: &'a dyn MemoryRetriever,
}

impl<'a> ContentCoordinator<'a> {
    /// Text for `plan`, or "" when there is nothing worth sending.
    pub async fn generate(&self, state: &mut SessionState, plan: &mut ActionPlan) -> String {
        if plan.is_punitive() {
            return self.generate_punitive(state, plan).await;
        }

        self.attach_pending_image(state, plan).await;

        let context: Vec<ContextMessage> = state.buffer().iter().map(context_line).collect();
        let user_message = user_message_for(state, plan.target_entry);

        let mut system = vec![self.system_prompt.to_string()];
        if !plan.prompt_hints.is_empty() {
            system.push(plan.prompt_hints.join("\n"));
        }
        if let Some(targeting) = targeting_prompt(plan) {
            system.push(targeting);
        }
        let mut mood = mood_prompt(state.mood, plan.source).to_string();
        if let Some(energy) = energy_prompt(state.metrics.energy) {
            mood.push(' ');
            mood.push_str(energy);
        }
        system.push(mood);
        if let Some(memory) = plan.memory_context.as_deref().filter(|m| !m.trim().is_empty()) {
            system.push(memory.to_string());
        }

        let request = GenerationRequest {
            system,
            context,
            user_message,
            max_tokens: max_tokens_for(state.mood),
            temperature: REPLY_TEMPERATURE,
            purpose: GenerationPurpose::Reply,
        };

        match self.generation.generate(request).await {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                tracing::warn!("Generation failed for '{}': {}", plan.reason, e);
                String::new()
            }
        }
    }

    /// Wait for an in-flight description of the target (or the message it
    /// replies to) and fold it into the hints.
    async fn attach_pending_image(&self, state: &mut SessionState, plan: &mut ActionPlan) {
        if plan.has_image_context {
            return;
        }
        let Some(target_id) = plan.target_entry else {
            return;
        };
        let timeout = Duration::from_secs_f64(self.engine.vision_timeout_secs.max(0.0));

        let mut source = None;
        if state.image_tasks.contains(target_id) {
            if let Some(description) = state.image_tasks.take_with_timeout(target_id, timeout).await {
                if let Some(entry) = state.entry_mut(target_id) {
                    entry.image_description = Some(description);
                }
                source = Some(target_id);
            }
        } else if let Some(reply_id) = state.entry(target_id).and_then(|e| e.reply_to_id) {
            let described = state
                .entry(reply_id)
                .map(|e| e.image_description.is_some())
                .unwrap_or(false);
            if described {
                source = Some(reply_id);
            } else if state.image_tasks.contains(reply_id) {
                if let Some(description) =
                    state.image_tasks.take_with_timeout(reply_id, timeout).await
                {
                    if let Some(entry) = state.entry_mut(reply_id) {
                        entry.image_description = Some(description);
                    }
                    source = Some(reply_id);
                }
            }
        }

        let Some(entry) = source.and_then(|id| state.entry(id)) else {
            return;
        };
        if let Some(description) = &entry.image_description {
            plan.prompt_hints.push(image_hint(
                description,
                false,
                &entry.author_name,
                state.classification_of(entry.author_id),
                &entry.text,
            ));
            plan.has_image_context = true;
        }
    }

    async fn generate_punitive(&self, state: &SessionState, plan: &ActionPlan) -> String {
        let target = plan.target_user_name.as_deref().unwrap_or("them");
        let reason = plan
            .punitive_reason
            .map(|r| r.describe())
            .unwrap_or("pushing it too far");

        let mut recent: Vec<&BufferedEntry> = state
            .buffer()
            .iter()
            .rev()
            .filter(|e| !e.is_agent)
            .take(PUNITIVE_CONTEXT_ENTRIES)
            .collect();
        recent.reverse();
        let context = recent.into_iter().map(context_line).collect();

        let mut system = vec![
            self.system_prompt.to_string(),
            format!(
                "{} is being put in a timeout for {}. Write a pointed parting remark, one or two \
                 sentences, that calls back to something they actually said or did. No slurs, \
                 no threats, nothing about who they are as a person.",
                target, reason
            ),
        ];
        let memory = self.memory.retrieve(target, PUNITIVE_MEMORY_TOP_K).await;
        if !memory.trim().is_empty() {
            system.push(memory);
        }

        let request = GenerationRequest {
            system,
            context,
            user_message: format!("See {} out.", target),
            max_tokens: PUNITIVE_MAX_TOKENS,
            temperature: PUNITIVE_TEMPERATURE,
            purpose: GenerationPurpose::Reply,
        };

        match self.generation.generate(request).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => PUNITIVE_FALLBACK.to_string(),
            Err(e) => {
                tracing::warn!("Punitive generation failed, using fallback: {}", e);
                PUNITIVE_FALLBACK.to_string()
            }
        }
    }
}

//! Post-processing, paced sending and state write-back.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use regex_lite::Regex;

use crate::config::EngineConfig;
use crate::database::{EngineDatabase, ModerationRecord};
use crate::transport::{
    schedule_unrestrict, ChannelId, MessageId, OutboundEmbed, Transport, TransportResult, UserId,
};

use super::escalation::{EscalationTracker, OffenseReason};
use super::select::{ActionKind, ActionPlan};
use super::session::{BufferedEntry, Mood, SessionState};

const REPLY_TAG_PREFIX: &str = "[REPLY_TO:";
const RESTRICTION_COLOR: u32 = 0xE6_7E_22;
const MOD_LOG_COLOR: u32 = 0x95_A5_A6;
const MAX_PARAGRAPHS: usize = 2;

const HEDGING_PHRASES: [&str; 6] = [
    "what appears to be ",
    "what looks like ",
    "the image shows ",
    "in the image, ",
    "i can't see the image",
    "i can't view images",
];

/// Energy and temperature vented after speaking.
pub fn steam_release(mood: Mood) -> (f64, f64) {
    match mood {
        Mood::Heated => (0.12, 0.08),
        Mood::Engaged => (0.06, 0.03),
        Mood::Dormant | Mood::Disengaged => (0.0, 0.0),
    }
}

fn mood_typing_factor(mood: Mood) -> f64 {
    match mood {
        Mood::Dormant => 1.2,
        Mood::Engaged => 0.9,
        Mood::Heated => 0.7,
        Mood::Disengaged => 1.1,
    }
}

/// Simulated composition time for `chars` characters.
pub fn typing_delay<R: Rng>(
    engine: &EngineConfig,
    chars: usize,
    mood: Mood,
    energy: f64,
    rng: &mut R,
) -> Duration {
    let min = engine.typing_min_secs.max(0.0);
    let max = engine.typing_max_secs.max(min);
    let base = chars as f64 / engine.typing_chars_per_sec.max(0.1);
    let jittered = (base * rng.gen_range(0.75..1.25)).clamp(min, max);
    let secs = jittered * (1.0 - energy.clamp(0.0, 1.0) * 0.3) * mood_typing_factor(mood);
    Duration::from_secs_f64(secs.clamp(min, max))
}

/// Prefix `text` with a reply-target tag.
pub fn embed_reply_tag(target: MessageId, text: &str) -> String {
    format!("{}{}] {}", REPLY_TAG_PREFIX, target, text)
}

/// Split a leading reply-target tag off generated text.
pub fn strip_reply_tag(text: &str) -> (Option<MessageId>, String) {
    let trimmed = text.trim_start();
    let Some(rest) = trimmed.strip_prefix(REPLY_TAG_PREFIX) else {
        return (None, text.to_string());
    };
    let Some((id, remainder)) = rest.split_once(']') else {
        return (None, text.to_string());
    };
    match id.trim().parse::<MessageId>() {
        Ok(id) => (Some(id), remainder.trim_start().to_string()),
        Err(_) => (None, text.to_string()),
    }
}

fn is_mention_boundary(c: char) -> bool {
    c.is_whitespace() || ",.:;!?'\")]}".contains(c)
}

/// Replace `@name` with platform mentions. Longer names win over their prefixes.
pub fn format_mentions(text: &str, people: &[(String, String)]) -> String {
    let mut people: Vec<&(String, String)> =
        people.iter().filter(|(name, _)| !name.trim().is_empty()).collect();
    people.sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()));

    let mut out = text.to_string();
    for (name, mention) in people {
        let Ok(re) = Regex::new(&format!("(?i)@{}", regex_lite::escape(name))) else {
            continue;
        };
        let mut result = String::with_capacity(out.len());
        let mut last = 0;
        for m in re.find_iter(&out) {
            let bounded = out[m.end()..]
                .chars()
                .next()
                .map(is_mention_boundary)
                .unwrap_or(true);
            if !bounded {
                continue;
            }
            result.push_str(&out[last..m.start()]);
            result.push_str(mention);
            last = m.end();
        }
        result.push_str(&out[last..]);
        out = result;
    }
    out
}

/// Drop a redundant "@name," style opener when already replying to that person.
pub fn strip_target_prefix(text: &str, target_name: &str) -> String {
    let prefixes = [
        format!("@{} ", target_name),
        format!("@{}, ", target_name),
        format!("@{}: ", target_name),
        format!("{}: ", target_name),
        format!("{}, ", target_name),
    ];
    let best = prefixes
        .iter()
        .filter_map(|prefix| caseless_prefix_len(text, prefix))
        .max()
        .unwrap_or(0);
    if best == 0 {
        return text.to_string();
    }
    text[best..].trim_start().to_string()
}

/// Byte length of the leading span of `text` matching `prefix` ignoring case.
fn caseless_prefix_len(text: &str, prefix: &str) -> Option<usize> {
    let mut chars = text.char_indices();
    for expected in prefix.chars() {
        let (_, actual) = chars.next()?;
        if !actual.to_lowercase().eq(expected.to_lowercase()) {
            return None;
        }
    }
    Some(chars.next().map(|(idx, _)| idx).unwrap_or(text.len()))
}

/// Cut replies that drift into speaking for several people.
pub fn truncate_multi_person(text: &str) -> String {
    if let Ok(re) = Regex::new(r"(?m)^@?\w+:") {
        let starts: Vec<usize> = re.find_iter(text).map(|m| m.start()).take(2).collect();
        if starts.len() == 2 {
            return text[..starts[1]].trim_end().to_string();
        }
    }
    let paragraphs: Vec<&str> = text
        .split("\n\n")
        .filter(|p| !p.trim().is_empty())
        .collect();
    if paragraphs.len() > MAX_PARAGRAPHS {
        return paragraphs[..MAX_PARAGRAPHS].join("\n\n");
    }
    text.to_string()
}

/// Remove image tags and hedging the model leaks from its prompt.
pub fn strip_image_artifacts(text: &str) -> String {
    let mut out = text.to_string();
    for pattern in [
        r"\[(?:MEME|GIF|SELFIE|FOOD|FASHION|TRAVEL|SCREENSHOT|PRODUCT|MEDICAL|PHOTO)\]\s*",
        r"\[attached image:[^\]]*\]\s*",
        r"\[posted an image[^\]]*\]\s*",
    ] {
        if let Ok(re) = Regex::new(pattern) {
            out = re.replace_all(&out, "").into_owned();
        }
    }
    for phrase in HEDGING_PHRASES {
        if let Ok(re) = Regex::new(&format!("(?i){}", regex_lite::escape(phrase))) {
            out = re.replace_all(&out, "").into_owned();
        }
    }
    out.trim().to_string()
}

fn restriction_label(secs: u64) -> String {
    match secs {
        0..=59 => format!("{} seconds", secs),
        60..=119 => "1 minute".to_string(),
        _ => format!("{} minutes", secs / 60),
    }
}

/// Result of a punitive action.
#[derive(Debug, Clone, PartialEq)]
pub struct PunitiveOutcome {
    pub user_id: UserId,
    pub user_name: String,
    pub restricted: bool,
    pub delivered: bool,
    pub reasons: Vec<OffenseReason>,
}

pub struct Deliverer<'a> {
    pub engine: &'a EngineConfig,
    pub transport: Arc<dyn Transport>,
    pub agent_name: &'a str,
    pub restriction_exempt: &'a [UserId],
    pub mod_log_channel: Option<ChannelId>,
    pub db: Option<&'a EngineDatabase>,
}

impl<'a> Deliverer<'a> {
    /// Send `text` for `plan` and advance the session. `Ok(None)` means
    /// post-processing left nothing to send. The session advances on send
    /// failure too.
    pub async fn deliver<R: Rng>(
        &self,
        state: &mut SessionState,
        plan: &mut ActionPlan,
        text: &str,
        rng: &mut R,
    ) -> TransportResult<Option<MessageId>> {
        let (retarget, text) = strip_reply_tag(text);
        if let Some(id) = retarget {
            if let Some(entry) = state.entry(id).filter(|e| !e.is_agent) {
                tracing::debug!("Reply retargeted to message {}", id);
                plan.kind = ActionKind::Reply;
                plan.target_entry = Some(id);
                plan.target_user = Some(entry.author_id);
                plan.target_user_name = Some(entry.author_name.clone());
            }
        }

        let mut text = truncate_multi_person(&strip_image_artifacts(&text));
        if plan.kind == ActionKind::Reply {
            if let Some(name) = plan.target_user_name.as_deref() {
                text = strip_target_prefix(&text, name);
            }
        }
        let people: Vec<(String, String)> = state
            .users
            .values()
            .filter(|u| u.user_id != state.agent_id)
            .map(|u| {
                (
                    u.display_name.clone(),
                    self.transport.mention(u.user_id, &u.display_name),
                )
            })
            .collect();
        let text = format_mentions(&text, &people).trim().to_string();
        if text.is_empty() {
            tracing::debug!("Nothing left to send after post-processing");
            return Ok(None);
        }

        let delay = typing_delay(
            self.engine,
            text.chars().count(),
            state.mood,
            state.metrics.energy,
            rng,
        );
        if let Err(e) = self.transport.show_typing(state.channel_id).await {
            tracing::debug!("Typing indicator failed: {}", e);
        }
        tokio::time::sleep(delay).await;

        let sent = match (plan.kind, plan.target_entry) {
            (ActionKind::Reply, Some(entry_id)) if state.entry(entry_id).is_some() => {
                self.transport
                    .reply_to(state.channel_id, entry_id, &text)
                    .await
            }
            _ => self.transport.send_plain(state.channel_id, &text).await,
        };

        let now = Utc::now();
        match sent {
            Ok(id) => {
                tracing::info!(
                    "Sent {} ({} chars, typed {:.1}s): {}",
                    plan.reason,
                    text.chars().count(),
                    delay.as_secs_f64(),
                    text
                );
                self.write_back(state, plan, Some(id), &text, now);
                Ok(Some(id))
            }
            Err(e) => {
                tracing::error!("Failed to send message: {}", e);
                self.write_back(state, plan, None, &text, now);
                Err(e)
            }
        }
    }

    fn write_back(
        &self,
        state: &mut SessionState,
        plan: &ActionPlan,
        message_id: Option<MessageId>,
        text: &str,
        now: DateTime<Utc>,
    ) {
        let mood = state.mood;
        state.metrics.last_speak_time = Some(now);
        state.metrics.speak_count += 1;
        let (energy, temperature) = steam_release(mood);
        state.metrics.apply(-temperature, -energy);

        if let Some(id) = message_id {
            state.push_agent_entry(BufferedEntry {
                id,
                author_id: state.agent_id,
                author_name: self.agent_name.to_string(),
                text: text.to_string(),
                timestamp: now,
                is_agent: true,
                reply_to_id: plan.target_entry,
                image_description: None,
                reply_context: None,
                reply_context_author: None,
            });
        }

        state.set_cooldown(now, self.engine.mood_cooldowns.for_mood(mood));
        state.set_suppression(now, self.engine.post_speak_suppress_secs);
        if let Some(user) = plan.target_user {
            state.set_focus(user, now);
            state.last_response_to_user.insert(user, now);
        }
        if let Some(entry) = plan.target_entry {
            state.responded_to.insert(entry);
        }
        if plan.is_bored_interjection() {
            state.last_bored_interjection = Some(now);
        }
    }

    /// Restrict the target and post the parting message. The message is
    /// delivered even when the restriction fails; tracking is cleared either way.
    pub async fn deliver_punitive(
        &self,
        state: &mut SessionState,
        tracker: &mut EscalationTracker,
        plan: &ActionPlan,
        text: &str,
    ) -> Option<PunitiveOutcome> {
        let user = plan.target_user?;
        let user_name = plan
            .target_user_name
            .clone()
            .unwrap_or_else(|| user.to_string());
        let channel = state.channel_id;

        let privileged = match self.transport.fetch_member(channel, user).await {
            Ok(member) => member.privileged,
            Err(e) => {
                tracing::warn!("Member lookup for {} failed: {}", user, e);
                false
            }
        };
        let exempt = privileged || self.restriction_exempt.contains(&user);

        let mut restricted = false;
        let delivered = if exempt {
            tracing::info!("{} is protected, sending message without restriction", user_name);
            self.transport.send_plain(channel, text).await.is_ok()
        } else {
            let duration = Duration::from_secs(self.engine.restriction_secs);
            match self.transport.restrict_user(channel, user, duration).await {
                Ok(()) => {
                    restricted = true;
                    schedule_unrestrict(self.transport.clone(), channel, user, duration);
                    let embed = OutboundEmbed {
                        title: "Timeout".to_string(),
                        body: format!(
                            "{} has been restricted for {}\n\n{}",
                            self.transport.mention(user, &user_name),
                            restriction_label(self.engine.restriction_secs),
                            text
                        ),
                        color: RESTRICTION_COLOR,
                    };
                    match self.transport.send_embed(channel, &embed).await {
                        Ok(_) => true,
                        Err(e) => {
                            tracing::warn!("Restriction embed failed, sending plain: {}", e);
                            self.transport.send_plain(channel, text).await.is_ok()
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to restrict {} ({}), delivering message only: {}",
                        user_name,
                        user,
                        e
                    );
                    self.transport.send_plain(channel, text).await.is_ok()
                }
            }
        };

        let mut reasons: Vec<OffenseReason> = tracker
            .clear(user)
            .map(|record| record.reasons.into_iter().collect())
            .unwrap_or_default();
        if reasons.is_empty() {
            reasons.extend(plan.punitive_reason);
        }
        let reason_names: Vec<String> = reasons.iter().map(|r| r.as_str().to_string()).collect();

        if let Some(mod_channel) = self.mod_log_channel {
            let embed = OutboundEmbed {
                title: "Punitive action".to_string(),
                body: format!(
                    "User: {} ({})\nReasons: {}\nRestricted: {}\nMessage: {}",
                    user_name,
                    user,
                    reason_names.join(", "),
                    if restricted { "yes" } else { "no" },
                    text
                ),
                color: MOD_LOG_COLOR,
            };
            if let Err(e) = self.transport.send_embed(mod_channel, &embed).await {
                tracing::warn!("Mod log post failed: {}", e);
            }
        }

        let now = Utc::now();
        if let Some(db) = self.db {
            let record = ModerationRecord {
                id: uuid::Uuid::new_v4().to_string(),
                user_id: user,
                user_name: user_name.clone(),
                reasons: reason_names,
                restricted,
                created_at: now,
            };
            if let Err(e) = db.record_moderation(&record) {
                tracing::warn!("Failed to write moderation log: {}", e);
            }
        }

        state.set_cooldown(now, self.engine.mood_cooldowns.for_mood(state.mood));
        state.set_suppression(now, self.engine.post_speak_suppress_secs);
        state.last_response_to_user.insert(user, now);
        if let Some(entry) = plan.target_entry {
            state.responded_to.insert(entry);
        }

        tracing::info!(
            "Punitive action on {} ({}): restricted={} delivered={}",
            user_name,
            user,
            restricted,
            delivered
        );
        Some(PunitiveOutcome {
            user_id: user,
            user_name,
            restricted,
            delivered,
            reasons,
        })
    }
}

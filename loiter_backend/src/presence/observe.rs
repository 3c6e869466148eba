//! Observation stage: drain pending messages into the buffer, detect triggers,
//! move the metrics and re-derive mood.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::config::EngineConfig;
use crate::services::{GenerationPurpose, GenerationRequest, Services};
use crate::transport::{InboundMessage, MessageId};

use super::session::{BufferedEntry, Mood, RaisedTrigger, SessionState};
use super::triggers::{
    continuation_score, contains_user_mention, AddressBook, BehaviorClassifier, NameTier,
    TriggerCategory,
};

const MESSAGE_TEMPERATURE_DELTA: f64 = 0.015;
const HOSTILITY_TEMPERATURE_DELTA: f64 = 0.04;
const REPLY_ENERGY_DELTA: f64 = 0.06;
const ADDRESS_ENERGY_DELTA: f64 = 0.08;

const TRIAGE_CONTEXT_ENTRIES: usize = 4;
const TRIAGE_LINE_CHARS: usize = 120;

/// What a single message contributed to the metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MessageSignals {
    pub addressed: bool,
    pub replied_to_agent: bool,
    pub hostile: bool,
}

/// Summary of one observation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDelta {
    pub new_entries: Vec<MessageId>,
    pub triggers: Vec<RaisedTrigger>,
    pub temperature_delta: f64,
    pub energy_delta: f64,
    pub previous_mood: Mood,
    pub mood: Mood,
    pub images_described: usize,
    pub images_cancelled: usize,
}

impl StateDelta {
    pub fn mood_changed(&self) -> bool {
        self.previous_mood != self.mood
    }
}

/// Per-tick decay plus fixed per-message bumps.
pub fn metric_deltas(engine: &EngineConfig, signals: &[MessageSignals]) -> (f64, f64) {
    let mut temperature = -engine.temperature_decay;
    let mut energy = -engine.energy_decay;
    for s in signals {
        temperature += MESSAGE_TEMPERATURE_DELTA;
        if s.replied_to_agent {
            energy += REPLY_ENERGY_DELTA;
        }
        if s.addressed {
            energy += ADDRESS_ENERGY_DELTA;
        }
        if s.hostile {
            temperature += HOSTILITY_TEMPERATURE_DELTA;
        }
    }
    (temperature, energy)
}

/// Turn an inbound message into a buffer entry, resolving reply context from
/// the buffer first and the embedded reference second.
pub fn build_entry(state: &SessionState, msg: &InboundMessage) -> BufferedEntry {
    let mut entry = BufferedEntry {
        id: msg.id,
        author_id: msg.author.id,
        author_name: msg.author.name.clone(),
        text: msg.text.clone(),
        timestamp: msg.created_at,
        is_agent: msg.author.id == state.agent_id,
        reply_to_id: msg.reply_reference.as_ref().map(|r| r.message_id),
        image_description: None,
        reply_context: None,
        reply_context_author: None,
    };

    if let Some(reference) = &msg.reply_reference {
        if let Some(prev) = state.entry(reference.message_id) {
            entry.reply_context = Some(prev.text.clone());
            entry.reply_context_author = Some(prev.author_name.clone());
        } else if let Some(text) = reference.text.as_deref().filter(|t| !t.is_empty()) {
            entry.reply_context = Some(text.to_string());
            entry.reply_context_author = Some(
                reference
                    .author_name
                    .clone()
                    .unwrap_or_else(|| "someone".to_string()),
            );
        }
    }

    entry
}

pub struct Observer<'a> {
    pub engine: &'a EngineConfig,
    pub agent_name: &'a str,
    pub address: &'a AddressBook,
    pub classifier: &'a dyn BehaviorClassifier,
    pub services: &'a Services,
}

impl<'a> Observer<'a> {
    pub async fn observe<R: Rng>(
        &self,
        state: &mut SessionState,
        rng: &mut R,
        now: DateTime<Utc>,
    ) -> StateDelta {
        let mut delta = StateDelta {
            previous_mood: state.mood,
            ..StateDelta::default()
        };

        let reaped = state
            .image_tasks
            .reap(now, self.engine.image_stale_secs)
            .await;
        delta.images_cancelled = reaped.cancelled.len();
        for (id, description) in reaped.completed {
            if let Some(entry) = state.entry_mut(id) {
                tracing::debug!("Image ready for message {}: {}", id, preview(&description));
                entry.image_description = Some(description);
                delta.images_described += 1;
            }
        }

        let pending = state.take_pending();
        state.messages_since_tick = 0;

        let mut signals = Vec::with_capacity(pending.len());
        for msg in pending {
            self.launch_image_analysis(state, &msg);

            let (trigger, s) = self.classify_message(state, &msg, rng, now).await;
            signals.push(s);

            let entry = build_entry(state, &msg);
            state.clear_typing(entry.author_id, entry.timestamp);
            delta.new_entries.push(entry.id);
            state.ingest(entry, now);

            if let Some(trigger) = trigger {
                tracing::info!(
                    "Trigger '{}' from {} on message {}",
                    trigger.category,
                    trigger.author_name,
                    trigger.entry_id
                );
                state.priority_triggers.push_back(trigger.clone());
                delta.triggers.push(trigger);
            }
        }

        let (temperature_delta, energy_delta) = metric_deltas(self.engine, &signals);
        state.metrics.apply(temperature_delta, energy_delta);
        delta.temperature_delta = temperature_delta;
        delta.energy_delta = energy_delta;

        state.mood = Mood::derive(&state.metrics, now);
        delta.mood = state.mood;
        if delta.mood_changed() {
            tracing::info!("Mood: {} -> {}", delta.previous_mood, delta.mood);
        }

        delta
    }

    /// Start describing the message's own image, and the replied-to image when
    /// nobody has described it yet. Requests over the cap are dropped.
    fn launch_image_analysis(&self, state: &mut SessionState, msg: &InboundMessage) {
        let timeout = Duration::from_secs_f64(self.engine.vision_timeout_secs.max(0.0));

        if let Some(url) = msg.first_image_url() {
            let vision = Arc::clone(&self.services.vision);
            let url = url.to_string();
            if !state.image_tasks.spawn(msg.id, msg.created_at, async move {
                vision.describe(&url, timeout).await
            }) {
                tracing::debug!("Image analysis skipped for message {} (budget)", msg.id);
            }
        }

        let Some(reference) = &msg.reply_reference else {
            return;
        };
        let Some(url) = reference
            .attachments
            .iter()
            .find(|a| a.is_image())
            .map(|a| a.url.clone())
        else {
            return;
        };
        let described = state
            .entry(reference.message_id)
            .map(|e| e.image_description.is_some())
            .unwrap_or(false);
        if described || state.image_tasks.contains(reference.message_id) {
            return;
        }

        let vision = Arc::clone(&self.services.vision);
        if state.image_tasks.spawn(reference.message_id, msg.created_at, async move {
            vision.describe(&url, timeout).await
        }) {
            tracing::debug!(
                "On-demand image analysis for replied-to message {}",
                reference.message_id
            );
        }
    }

    async fn classify_message<R: Rng>(
        &self,
        state: &SessionState,
        msg: &InboundMessage,
        rng: &mut R,
        now: DateTime<Utc>,
    ) -> (Option<RaisedTrigger>, MessageSignals) {
        let engine = self.engine;
        let text = msg.text.as_str();
        let author = msg.author.id;
        let mut signals = MessageSignals::default();

        let replied_to_agent = msg
            .reply_reference
            .as_ref()
            .map(|r| {
                state
                    .entry(r.message_id)
                    .map(|e| e.is_agent)
                    .unwrap_or(false)
                    || r.author_id == Some(state.agent_id)
            })
            .unwrap_or(false);

        let agent_context = replied_to_agent || state.agent_in_buffer();
        let behavior = self.classifier.classify(text, agent_context);
        signals.hostile = matches!(
            behavior,
            Some(TriggerCategory::IdentityDenial | TriggerCategory::Hostility)
        );

        let classification = state.classification_of(author);
        let focus = state.focus(now, engine.focus_window_secs);
        let focused_elsewhere =
            focus.map(|f| f.user_id != author).unwrap_or(false) && state.mood.is_focused_mood();

        let raise = |category: TriggerCategory, sentiment: Option<String>| RaisedTrigger {
            category,
            entry_id: msg.id,
            author_id: author,
            author_name: msg.author.name.clone(),
            raised_at: now,
            sentiment,
        };

        if self.address.is_direct_address(text) {
            signals.addressed = true;
            if focused_elsewhere
                && !classification.is_priority()
                && !rng.gen_bool(engine.focused_mention_chance.clamp(0.0, 1.0))
            {
                tracing::debug!(
                    "Direct address from {} ignored while focused elsewhere",
                    msg.author.name
                );
                return (behavior.map(|c| raise(c, None)), signals);
            }
            let category = behavior.unwrap_or(TriggerCategory::DirectAddress);
            return (Some(raise(category, None)), signals);
        }

        if replied_to_agent {
            signals.replied_to_agent = true;
            let category = behavior.unwrap_or(TriggerCategory::ReplyToAgent);
            return (Some(raise(category, None)), signals);
        }

        if let Some(tier) = self.address.name_tier(text) {
            let mut chance = match tier {
                NameTier::High => engine.name_chance_high,
                NameTier::Low => engine.name_chance_low,
            };
            if focused_elsewhere {
                chance *= engine.focused_name_modifier;
            }
            if rng.gen::<f64>() < chance {
                let category = behavior.unwrap_or(TriggerCategory::NameMention);
                let sentiment = self.services.sentiment.label(text).as_str().to_string();
                return (Some(raise(category, Some(sentiment))), signals);
            }
        }

        if let Some(category) = behavior {
            return (Some(raise(category, None)), signals);
        }

        if self.is_soft_continuation(state, msg, now).await {
            return (
                Some(raise(TriggerCategory::SoftContinuation, None)),
                signals,
            );
        }

        (None, signals)
    }

    async fn is_soft_continuation(
        &self,
        state: &SessionState,
        msg: &InboundMessage,
        now: DateTime<Utc>,
    ) -> bool {
        let author = msg.author.id;
        if !state.is_focus_target(author, now, self.engine.focus_window_secs) {
            return false;
        }
        let recently_answered = state
            .secs_since_response_to(author, now)
            .map(|secs| secs < self.engine.focus_window_secs)
            .unwrap_or(false);
        if !recently_answered {
            return false;
        }

        let score = continuation_score(
            &msg.text,
            contains_user_mention(&msg.text),
            others_spoke_since_agent(state, author),
        );
        if score >= self.engine.continuation_direct_threshold {
            tracing::debug!("Soft continuation from {} (score {:.2})", msg.author.name, score);
            return true;
        }
        if score < self.engine.continuation_triage_threshold {
            return false;
        }
        self.triage_continuation(state, msg).await
    }

    /// Cheap yes/no model call for scores in the ambiguous band.
    async fn triage_continuation(&self, state: &SessionState, msg: &InboundMessage) -> bool {
        let skip = state.buffer().len().saturating_sub(TRIAGE_CONTEXT_ENTRIES);
        let lines: Vec<String> = state
            .buffer()
            .iter()
            .skip(skip)
            .map(|e| {
                let speaker = if e.is_agent {
                    self.agent_name
                } else {
                    e.author_name.as_str()
                };
                format!("[{}]: {}", speaker, truncate_chars(&e.text, TRIAGE_LINE_CHARS))
            })
            .collect();

        let prompt = format!(
            "Recent chat:\n{}\n\nNew message from [{}]: {}\n\n\
             Is this new message continuing a conversation with {}: asking it something, \
             referring to what it just said, or expecting it to respond? Reply YES or NO only.",
            lines.join("\n"),
            msg.author.name,
            msg.text,
            self.agent_name
        );

        let request = GenerationRequest {
            system: Vec::new(),
            context: Vec::new(),
            user_message: prompt,
            max_tokens: 5,
            temperature: 0.0,
            purpose: GenerationPurpose::Triage,
        };
        match self.services.generation.generate(request).await {
            Ok(answer) => {
                let yes = answer.trim().to_uppercase().starts_with("YES");
                tracing::debug!("Continuation triage for {}: {}", msg.author.name, yes);
                yes
            }
            Err(e) => {
                tracing::debug!("Continuation triage failed: {}", e);
                false
            }
        }
    }
}

/// Whether someone other than `author` spoke after the agent's last entry.
/// With no agent entry in the buffer there is nothing to continue.
fn others_spoke_since_agent(state: &SessionState, author: crate::transport::UserId) -> bool {
    let Some(last_agent) = state.buffer().iter().rposition(|e| e.is_agent) else {
        return true;
    };
    state
        .buffer()
        .iter()
        .skip(last_agent + 1)
        .any(|e| !e.is_agent && e.author_id != author)
}

pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

fn preview(text: &str) -> String {
    truncate_chars(text, 80)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PatternConfig, PersonaConfig};
    use crate::presence::session::tests::{entry, session};
    use crate::presence::triggers::PatternClassifier;
    use crate::services::testing::{services, FixedVision, ScriptedGeneration};
    use crate::transport::{Attachment, InboundAuthor, ReplyReference};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct Fixture {
        engine: EngineConfig,
        address: AddressBook,
        classifier: PatternClassifier,
        services: Services,
        generation: Arc<ScriptedGeneration>,
    }

    impl Fixture {
        fn new(replies: Vec<&'static str>) -> Self {
            let persona = PersonaConfig {
                display_name: "Loiter".to_string(),
                agent_user_id: 99,
                names_high: vec!["loiterbot".to_string()],
                ..PersonaConfig::default()
            };
            let generation = Arc::new(ScriptedGeneration::with_replies(replies));
            Self {
                engine: EngineConfig::default(),
                address: AddressBook::from_persona(&persona).expect("address book"),
                classifier: PatternClassifier::from_config(
                    &PatternConfig::default(),
                    &persona.all_names(),
                )
                .expect("patterns"),
                services: services(generation.clone()),
                generation,
            }
        }

        fn observer(&self) -> Observer<'_> {
            Observer {
                engine: &self.engine,
                agent_name: "Loiter",
                address: &self.address,
                classifier: &self.classifier,
                services: &self.services,
            }
        }
    }

    fn message(id: MessageId, author: i64, text: &str, at: DateTime<Utc>) -> InboundMessage {
        InboundMessage {
            id,
            channel_id: 500,
            author: InboundAuthor {
                id: author,
                name: format!("user{}", author),
                is_bot: false,
            },
            text: text.to_string(),
            created_at: at,
            reply_reference: None,
            attachments: Vec::new(),
            embeds: Vec::new(),
        }
    }

    fn agent_entry(id: MessageId, text: &str, at: DateTime<Utc>) -> BufferedEntry {
        let mut e = entry(id, 99, text, at);
        e.is_agent = true;
        e.author_name = "Loiter".to_string();
        e
    }

    #[test]
    fn metric_deltas_sum_fixed_bumps() {
        let engine = EngineConfig::default();
        let (t, e) = metric_deltas(&engine, &[]);
        assert!((t + 0.013).abs() < 1e-9);
        assert!((e + 0.02).abs() < 1e-9);

        let (t, e) = metric_deltas(
            &engine,
            &[
                MessageSignals {
                    addressed: true,
                    replied_to_agent: false,
                    hostile: true,
                },
                MessageSignals {
                    addressed: false,
                    replied_to_agent: true,
                    hostile: false,
                },
            ],
        );
        assert!((t - (-0.013 + 0.015 * 2.0 + 0.04)).abs() < 1e-9);
        assert!((e - (-0.02 + 0.08 + 0.06)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn direct_address_raises_trigger_in_dormant_mood() {
        let fixture = Fixture::new(vec![]);
        let now = Utc::now();
        let mut state = session(now);
        state.ingest(entry(1, 10, "morning all", now), now);
        state.ingest(entry(2, 11, "hey", now), now);
        state.enqueue(message(3, 10, "<@99> what do you think", now));

        let mut rng = StdRng::seed_from_u64(7);
        let delta = fixture.observer().observe(&mut state, &mut rng, now).await;

        assert_eq!(delta.mood, Mood::Dormant);
        assert_eq!(delta.new_entries, vec![3]);
        assert_eq!(delta.triggers.len(), 1);
        assert_eq!(delta.triggers[0].category, TriggerCategory::DirectAddress);
        assert_eq!(state.priority_triggers.len(), 1);
        assert_eq!(state.buffer().len(), 3);
        assert_eq!(state.messages_since_tick, 0);
    }

    #[tokio::test]
    async fn direct_address_with_hostility_is_retagged() {
        let fixture = Fixture::new(vec![]);
        let now = Utc::now();
        let mut state = session(now);
        state.enqueue(message(1, 10, "<@99> shut up", now));

        let mut rng = StdRng::seed_from_u64(1);
        let delta = fixture.observer().observe(&mut state, &mut rng, now).await;
        assert_eq!(delta.triggers[0].category, TriggerCategory::Hostility);
        assert!(delta.temperature_delta > 0.04);
    }

    #[tokio::test]
    async fn identity_denial_counts_as_hostile_content() {
        let fixture = Fixture::new(vec![]);
        let now = Utc::now();
        let mut state = session(now);
        state.ingest(agent_entry(1, "pasta obviously", now), now);
        state.enqueue(message(2, 10, "shut up, you're just a bot", now));

        let mut rng = StdRng::seed_from_u64(4);
        let delta = fixture.observer().observe(&mut state, &mut rng, now).await;
        assert_eq!(delta.triggers[0].category, TriggerCategory::IdentityDenial);
        let expected = -fixture.engine.temperature_decay + 0.015 + 0.04;
        assert!((delta.temperature_delta - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn focus_elsewhere_gates_direct_address() {
        let mut fixture = Fixture::new(vec![]);
        let now = Utc::now();

        fixture.engine.focused_mention_chance = 0.0;
        let mut state = session(now);
        state.mood = Mood::Engaged;
        state.set_focus(11, now);
        state.enqueue(message(1, 10, "<@99> over here", now));
        let mut rng = StdRng::seed_from_u64(21);
        let delta = fixture.observer().observe(&mut state, &mut rng, now).await;
        assert!(delta.triggers.is_empty());
        assert!(delta.energy_delta > 0.0);

        // The focus target itself is never gated.
        let mut state = session(now);
        state.mood = Mood::Engaged;
        state.set_focus(10, now);
        state.enqueue(message(1, 10, "<@99> over here", now));
        let delta = fixture.observer().observe(&mut state, &mut rng, now).await;
        assert_eq!(delta.triggers[0].category, TriggerCategory::DirectAddress);

        fixture.engine.focused_mention_chance = 1.0;
        let mut state = session(now);
        state.mood = Mood::Engaged;
        state.set_focus(11, now);
        state.enqueue(message(1, 10, "<@99> over here", now));
        let delta = fixture.observer().observe(&mut state, &mut rng, now).await;
        assert_eq!(delta.triggers[0].category, TriggerCategory::DirectAddress);
    }

    #[tokio::test]
    async fn focus_elsewhere_scales_name_mention_chance() {
        let mut fixture = Fixture::new(vec![]);
        fixture.engine.name_chance_high = 1.0;
        fixture.engine.focused_name_modifier = 0.0;
        let now = Utc::now();
        let mut rng = StdRng::seed_from_u64(13);

        let mut state = session(now);
        state.mood = Mood::Heated;
        state.set_focus(11, now);
        state.enqueue(message(1, 10, "loiterbot is great", now));
        let delta = fixture.observer().observe(&mut state, &mut rng, now).await;
        assert!(delta.triggers.is_empty());

        // Outside a focused mood the focus pointer does not suppress anything.
        let mut state = session(now);
        state.mood = Mood::Dormant;
        state.set_focus(11, now);
        state.enqueue(message(1, 10, "loiterbot is great", now));
        let delta = fixture.observer().observe(&mut state, &mut rng, now).await;
        assert_eq!(delta.triggers[0].category, TriggerCategory::NameMention);
    }

    #[tokio::test]
    async fn low_tier_name_uses_its_own_chance() {
        let mut fixture = Fixture::new(vec![]);
        let persona = PersonaConfig {
            display_name: "Loiter".to_string(),
            agent_user_id: 99,
            names_high: vec!["loiterbot".to_string()],
            names_low: vec!["lo".to_string()],
            ..PersonaConfig::default()
        };
        fixture.address = AddressBook::from_persona(&persona).expect("address book");
        fixture.engine.name_chance_high = 1.0;
        fixture.engine.name_chance_low = 0.0;
        let now = Utc::now();
        let mut rng = StdRng::seed_from_u64(17);

        let mut state = session(now);
        state.enqueue(message(1, 10, "ask lo about it", now));
        let delta = fixture.observer().observe(&mut state, &mut rng, now).await;
        assert!(delta.triggers.is_empty());

        fixture.engine.name_chance_low = 1.0;
        fixture.engine.focused_name_modifier = 0.3;
        let mut state = session(now);
        state.enqueue(message(1, 10, "ask lo about it", now));
        let delta = fixture.observer().observe(&mut state, &mut rng, now).await;
        assert_eq!(delta.triggers[0].category, TriggerCategory::NameMention);

        // 1.0 * 0.3 with a seeded roll: count hits over many focused messages.
        let mut hits = 0;
        for id in 0..200 {
            let mut state = session(now);
            state.mood = Mood::Engaged;
            state.set_focus(11, now);
            state.enqueue(message(id, 10, "ask lo about it", now));
            let delta = fixture.observer().observe(&mut state, &mut rng, now).await;
            hits += delta.triggers.len();
        }
        assert!((30..=90).contains(&hits), "hits = {}", hits);
    }

    #[tokio::test]
    async fn reply_to_agent_detected_from_buffer_and_reference() {
        let fixture = Fixture::new(vec![]);
        let now = Utc::now();
        let mut state = session(now);
        state.ingest(agent_entry(1, "hot take", now), now);

        let mut reply = message(2, 10, "nah", now);
        reply.reply_reference = Some(ReplyReference {
            message_id: 1,
            author_id: None,
            author_name: None,
            text: None,
            attachments: Vec::new(),
        });
        let mut old_reply = message(3, 11, "still wrong", now);
        old_reply.reply_reference = Some(ReplyReference {
            message_id: 555,
            author_id: Some(99),
            author_name: Some("Loiter".to_string()),
            text: Some("an older take".to_string()),
            attachments: Vec::new(),
        });
        state.enqueue(reply);
        state.enqueue(old_reply);

        let mut rng = StdRng::seed_from_u64(3);
        let delta = fixture.observer().observe(&mut state, &mut rng, now).await;
        let categories: Vec<_> = delta.triggers.iter().map(|t| t.category).collect();
        assert_eq!(
            categories,
            vec![TriggerCategory::ReplyToAgent, TriggerCategory::ReplyToAgent]
        );

        let in_buffer = state.entry(2).expect("entry 2");
        assert_eq!(in_buffer.reply_context.as_deref(), Some("hot take"));
        let outside = state.entry(3).expect("entry 3");
        assert_eq!(outside.reply_context.as_deref(), Some("an older take"));
        assert_eq!(outside.reply_context_author.as_deref(), Some("Loiter"));
    }

    #[tokio::test]
    async fn high_tier_name_mention_carries_sentiment() {
        let mut fixture = Fixture::new(vec![]);
        fixture.engine.name_chance_high = 1.0;
        let now = Utc::now();
        let mut state = session(now);
        state.enqueue(message(1, 10, "loiterbot is great", now));

        let mut rng = StdRng::seed_from_u64(11);
        let delta = fixture.observer().observe(&mut state, &mut rng, now).await;
        assert_eq!(delta.triggers[0].category, TriggerCategory::NameMention);
        assert_eq!(delta.triggers[0].sentiment.as_deref(), Some("positive"));
    }

    #[tokio::test]
    async fn soft_continuation_uses_triage_in_ambiguous_band() {
        let fixture = Fixture::new(vec!["YES"]);
        let now = Utc::now();
        let mut state = session(now);
        state.ingest(entry(1, 10, "what should i cook", now), now);
        state.ingest(agent_entry(2, "pasta obviously", now), now);
        state.ingest(entry(3, 11, "agreed", now), now);
        state.set_focus(10, now);
        state.last_response_to_user.insert(10, now);

        // "hm ok" only earns the no-mention bonus: 0.10 < 0.20, nothing happens.
        state.enqueue(message(4, 10, "hm ok", now));
        // "really?" scores 0.30: into the triage band.
        state.enqueue(message(5, 10, "really?", now));

        let mut rng = StdRng::seed_from_u64(5);
        let delta = fixture.observer().observe(&mut state, &mut rng, now).await;
        assert_eq!(delta.triggers.len(), 1);
        assert_eq!(delta.triggers[0].category, TriggerCategory::SoftContinuation);
        assert_eq!(delta.triggers[0].entry_id, 5);

        let requests = fixture.generation.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].purpose, GenerationPurpose::Triage);
        assert_eq!(requests[0].max_tokens, 5);
    }

    #[tokio::test]
    async fn soft_continuation_requires_focus() {
        let fixture = Fixture::new(vec!["YES"]);
        let now = Utc::now();
        let mut state = session(now);
        state.enqueue(message(1, 10, "can you do that again?", now));

        let mut rng = StdRng::seed_from_u64(5);
        let delta = fixture.observer().observe(&mut state, &mut rng, now).await;
        assert!(delta.triggers.is_empty());
        assert!(fixture.generation.requests().is_empty());
    }

    #[tokio::test]
    async fn image_tasks_launch_and_land_on_entries() {
        let mut fixture = Fixture::new(vec![]);
        fixture.services.vision = Arc::new(FixedVision {
            caption: "[FOOD] a bowl of ramen".to_string(),
            delay: Duration::from_millis(0),
        });
        let now = Utc::now();
        let mut state = session(now);
        let mut msg = message(1, 10, "dinner", now);
        msg.attachments = vec![Attachment {
            url: "https://x/ramen.jpg".to_string(),
            content_type: Some("image/jpeg".to_string()),
        }];
        state.enqueue(msg);

        let mut rng = StdRng::seed_from_u64(2);
        fixture.observer().observe(&mut state, &mut rng, now).await;
        assert!(state.image_tasks.contains(1));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let delta = fixture.observer().observe(&mut state, &mut rng, now).await;
        assert_eq!(delta.images_described, 1);
        assert_eq!(
            state.entry(1).and_then(|e| e.image_description.as_deref()),
            Some("[FOOD] a bowl of ramen")
        );
    }

    #[tokio::test]
    async fn metrics_stay_clamped_through_observation() {
        let fixture = Fixture::new(vec![]);
        let now = Utc::now();
        let mut state = session(now);
        state.metrics.temperature = 0.99;
        state.metrics.energy = 0.99;
        for id in 0..10 {
            state.enqueue(message(id, 10, "<@99> shut up", now));
        }
        let mut rng = StdRng::seed_from_u64(9);
        let delta = fixture.observer().observe(&mut state, &mut rng, now).await;
        assert_eq!(state.metrics.temperature, 1.0);
        assert_eq!(state.metrics.energy, 1.0);
        assert_eq!(delta.mood, Mood::Heated);
    }
}

//! Rolling per-channel session state.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{EngineConfig, MembershipConfig};
use crate::transport::{ChannelId, InboundMessage, MessageId, UserId};

use super::image_tasks::ImageTasks;
use super::triggers::TriggerCategory;

/// Seconds from `earlier` to `later`, negative if they are out of order.
pub fn secs_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    (later - earlier).num_milliseconds() as f64 / 1000.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedEntry {
    pub id: MessageId,
    pub author_id: UserId,
    pub author_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub is_agent: bool,
    pub reply_to_id: Option<MessageId>,
    pub image_description: Option<String>,
    pub reply_context: Option<String>,
    pub reply_context_author: Option<String>,
}

impl BufferedEntry {
    pub fn age_secs(&self, now: DateTime<Utc>) -> f64 {
        secs_between(self.timestamp, now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Primary,
    Ally,
    Adversary,
    Neutral,
}

impl Classification {
    pub fn from_membership(membership: &MembershipConfig, user: UserId) -> Self {
        if membership.primary_user_id == Some(user) {
            Self::Primary
        } else if membership.allies.contains(&user) {
            Self::Ally
        } else if membership.adversaries.contains(&user) {
            Self::Adversary
        } else {
            Self::Neutral
        }
    }

    /// Anyone on a membership list gets past focus filtering.
    pub fn is_priority(self) -> bool {
        !matches!(self, Self::Neutral)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPresence {
    pub user_id: UserId,
    pub display_name: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub message_count: u32,
    pub classification: Classification,
}

impl UserPresence {
    pub fn is_active(&self, now: DateTime<Utc>, window_secs: f64) -> bool {
        secs_between(self.last_seen, now) < window_secs
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub temperature: f64,
    pub energy: f64,
    pub last_speak_time: Option<DateTime<Utc>>,
    pub speak_count: u32,
    pub total_observed: u64,
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self {
            temperature: 0.5,
            energy: 0.5,
            last_speak_time: None,
            speak_count: 0,
            total_observed: 0,
        }
    }
}

impl SessionMetrics {
    /// Apply deltas, keeping both values inside [0, 1].
    pub fn apply(&mut self, temperature_delta: f64, energy_delta: f64) {
        self.temperature = (self.temperature + temperature_delta).clamp(0.0, 1.0);
        self.energy = (self.energy + energy_delta).clamp(0.0, 1.0);
    }

    pub fn secs_since_spoke(&self, now: DateTime<Utc>) -> Option<f64> {
        self.last_speak_time.map(|t| secs_between(t, now))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mood {
    #[default]
    Dormant,
    Engaged,
    Heated,
    Disengaged,
}

impl Mood {
    /// Derive mood from metrics. Recomputed every tick, never stored as a transition.
    pub fn derive(metrics: &SessionMetrics, now: DateTime<Utc>) -> Self {
        if metrics.energy > 0.7 && metrics.temperature > 0.7 {
            return Self::Heated;
        }
        let spoke_recently = metrics
            .secs_since_spoke(now)
            .map(|secs| secs < 120.0)
            .unwrap_or(false);
        if spoke_recently && metrics.energy > 0.4 {
            return Self::Engaged;
        }
        if metrics.energy < 0.3 {
            return Self::Disengaged;
        }
        Self::Dormant
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dormant => "dormant",
            Self::Engaged => "engaged",
            Self::Heated => "heated",
            Self::Disengaged => "disengaged",
        }
    }

    pub fn is_focused_mood(self) -> bool {
        matches!(self, Self::Engaged | Self::Heated)
    }
}

impl std::fmt::Display for Mood {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A priority trigger waiting for the action selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaisedTrigger {
    pub category: TriggerCategory,
    pub entry_id: MessageId,
    pub author_id: UserId,
    pub author_name: String,
    pub raised_at: DateTime<Utc>,
    /// Sentiment label for name mentions.
    pub sentiment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Focus {
    pub user_id: UserId,
    pub since: DateTime<Utc>,
}

pub struct SessionState {
    pub channel_id: ChannelId,
    pub agent_id: UserId,
    capacity: usize,
    buffer: VecDeque<BufferedEntry>,
    membership: MembershipConfig,
    pub users: HashMap<UserId, UserPresence>,
    pub metrics: SessionMetrics,
    pub mood: Mood,

    pending: Vec<InboundMessage>,
    pub priority_triggers: VecDeque<RaisedTrigger>,

    pub cooldown_until: Option<DateTime<Utc>>,
    pub suppress_until: Option<DateTime<Utc>>,
    focus: Option<Focus>,
    pub responded_to: HashSet<MessageId>,
    pub last_response_to_user: HashMap<UserId, DateTime<Utc>>,
    pub last_bored_interjection: Option<DateTime<Utc>>,
    pub typing: HashMap<UserId, DateTime<Utc>>,
    pub image_tasks: ImageTasks,

    pub session_started: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub last_tick: DateTime<Utc>,
    pub messages_since_tick: usize,
    pub tick_count: u64,
}

impl SessionState {
    pub fn new(
        channel_id: ChannelId,
        agent_id: UserId,
        engine: &EngineConfig,
        membership: MembershipConfig,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            channel_id,
            agent_id,
            capacity: engine.buffer_capacity.max(1),
            buffer: VecDeque::with_capacity(engine.buffer_capacity.max(1)),
            membership,
            users: HashMap::new(),
            metrics: SessionMetrics::default(),
            mood: Mood::Dormant,
            pending: Vec::new(),
            priority_triggers: VecDeque::new(),
            cooldown_until: None,
            suppress_until: None,
            focus: None,
            responded_to: HashSet::new(),
            last_response_to_user: HashMap::new(),
            last_bored_interjection: None,
            typing: HashMap::new(),
            image_tasks: ImageTasks::new(engine.image_task_cap),
            session_started: now,
            last_activity: now,
            last_tick: now,
            messages_since_tick: 0,
            tick_count: 0,
        }
    }

    // ----- buffer -----

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn buffer(&self) -> &VecDeque<BufferedEntry> {
        &self.buffer
    }

    pub fn entry(&self, id: MessageId) -> Option<&BufferedEntry> {
        self.buffer.iter().find(|e| e.id == id)
    }

    pub fn entry_mut(&mut self, id: MessageId) -> Option<&mut BufferedEntry> {
        self.buffer.iter_mut().find(|e| e.id == id)
    }

    pub fn agent_in_buffer(&self) -> bool {
        self.buffer.iter().any(|e| e.is_agent)
    }

    /// Distinct non-agent authors currently in the buffer.
    pub fn distinct_speakers(&self) -> usize {
        self.buffer
            .iter()
            .filter(|e| !e.is_agent)
            .map(|e| e.author_id)
            .collect::<HashSet<_>>()
            .len()
    }

    /// Append an entry, evicting the oldest on overflow, and refresh presence.
    pub fn ingest(&mut self, entry: BufferedEntry, now: DateTime<Utc>) {
        let classification = self
            .users
            .get(&entry.author_id)
            .map(|u| u.classification)
            .unwrap_or_else(|| Classification::from_membership(&self.membership, entry.author_id));

        self.users
            .entry(entry.author_id)
            .and_modify(|u| {
                u.last_seen = entry.timestamp;
                u.message_count += 1;
                u.display_name = entry.author_name.clone();
            })
            .or_insert_with(|| UserPresence {
                user_id: entry.author_id,
                display_name: entry.author_name.clone(),
                first_seen: entry.timestamp,
                last_seen: entry.timestamp,
                message_count: 1,
                classification,
            });

        self.metrics.total_observed += 1;
        self.last_activity = now;

        if self.buffer.len() == self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(entry);
    }

    /// Append one of the agent's own messages. Presence and observation counts are untouched.
    pub fn push_agent_entry(&mut self, entry: BufferedEntry) {
        if self.buffer.len() == self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(entry);
    }

    pub fn classification_of(&self, user: UserId) -> Classification {
        self.users
            .get(&user)
            .map(|u| u.classification)
            .unwrap_or_else(|| Classification::from_membership(&self.membership, user))
    }

    pub fn display_name_of(&self, user: UserId) -> Option<&str> {
        self.users.get(&user).map(|u| u.display_name.as_str())
    }

    // ----- inbound queue -----

    pub fn enqueue(&mut self, message: InboundMessage) {
        self.pending.push(message);
        self.messages_since_tick += 1;
    }

    pub fn take_pending(&mut self) -> Vec<InboundMessage> {
        std::mem::take(&mut self.pending)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    // ----- lifecycle -----

    pub fn active_users(&self, now: DateTime<Utc>, window_secs: f64) -> usize {
        self.users
            .values()
            .filter(|u| u.is_active(now, window_secs))
            .count()
    }

    /// Long silence, or nobody left talking after something was observed.
    pub fn should_reset(&self, now: DateTime<Utc>, engine: &EngineConfig) -> bool {
        if secs_between(self.last_activity, now) > engine.inactivity_reset_secs {
            return true;
        }
        self.active_users(now, engine.active_user_window_secs) == 0
            && self.metrics.total_observed > 0
    }

    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.buffer.clear();
        self.users.clear();
        self.metrics = SessionMetrics::default();
        self.mood = Mood::Dormant;
        self.pending.clear();
        self.priority_triggers.clear();
        self.cooldown_until = None;
        self.suppress_until = None;
        self.focus = None;
        self.responded_to.clear();
        self.last_response_to_user.clear();
        self.typing.clear();
        self.image_tasks.cancel_all();
        self.session_started = now;
        self.last_activity = now;
        self.messages_since_tick = 0;
        self.tick_count = 0;
        tracing::info!("Session reset for channel {}", self.channel_id);
    }

    // ----- cooldowns -----

    pub fn on_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.map(|until| now < until).unwrap_or(false)
    }

    pub fn set_cooldown(&mut self, now: DateTime<Utc>, secs: f64) {
        self.cooldown_until = Some(now + millis(secs));
    }

    pub fn is_suppressed(&self, now: DateTime<Utc>) -> bool {
        self.suppress_until.map(|until| now < until).unwrap_or(false)
    }

    pub fn set_suppression(&mut self, now: DateTime<Utc>, secs: f64) {
        self.suppress_until = Some(now + millis(secs));
    }

    /// Seconds since the agent last answered `user`.
    pub fn secs_since_response_to(&self, user: UserId, now: DateTime<Utc>) -> Option<f64> {
        self.last_response_to_user
            .get(&user)
            .map(|t| secs_between(*t, now))
    }

    pub fn user_on_cooldown(&self, user: UserId, now: DateTime<Utc>, window_secs: f64) -> bool {
        self.secs_since_response_to(user, now)
            .map(|secs| secs < window_secs)
            .unwrap_or(false)
    }

    // ----- focus -----

    pub fn set_focus(&mut self, user: UserId, now: DateTime<Utc>) {
        if self.focus.map(|f| f.user_id) != Some(user) {
            self.focus = Some(Focus {
                user_id: user,
                since: now,
            });
            tracing::info!(
                "Engagement focus set: {} ({})",
                self.display_name_of(user).unwrap_or("unknown"),
                user
            );
        }
    }

    /// Current focus, if it hasn't expired.
    pub fn focus(&self, now: DateTime<Utc>, window_secs: f64) -> Option<Focus> {
        self.focus
            .filter(|f| secs_between(f.since, now) <= window_secs)
    }

    pub fn is_focus_target(&self, user: UserId, now: DateTime<Utc>, window_secs: f64) -> bool {
        self.focus(now, window_secs)
            .map(|f| f.user_id == user)
            .unwrap_or(false)
    }

    // ----- typing -----

    pub fn note_typing(&mut self, user: UserId, at: DateTime<Utc>) {
        self.typing.insert(user, at);
    }

    /// A message posted at `posted_at` ends any typing noted before it.
    pub fn clear_typing(&mut self, user: UserId, posted_at: DateTime<Utc>) {
        if self.typing.get(&user).is_some_and(|at| *at <= posted_at) {
            self.typing.remove(&user);
        }
    }

    pub fn is_typing(&self, user: UserId, now: DateTime<Utc>, stale_secs: f64) -> bool {
        self.typing
            .get(&user)
            .map(|at| secs_between(*at, now) < stale_secs)
            .unwrap_or(false)
    }
}

fn millis(secs: f64) -> chrono::Duration {
    chrono::Duration::milliseconds((secs * 1000.0).round() as i64)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn entry(id: MessageId, author: UserId, text: &str, at: DateTime<Utc>) -> BufferedEntry {
        BufferedEntry {
            id,
            author_id: author,
            author_name: format!("user{}", author),
            text: text.to_string(),
            timestamp: at,
            is_agent: false,
            reply_to_id: None,
            image_description: None,
            reply_context: None,
            reply_context_author: None,
        }
    }

    pub(crate) fn session(now: DateTime<Utc>) -> SessionState {
        let membership = MembershipConfig {
            primary_user_id: Some(1),
            allies: vec![2],
            adversaries: vec![3],
            restriction_exempt: vec![],
        };
        SessionState::new(500, 99, &EngineConfig::default(), membership, now)
    }

    #[test]
    fn buffer_evicts_exactly_the_oldest_entry() {
        let now = Utc::now();
        let mut state = session(now);
        for id in 0..12 {
            state.ingest(entry(id, 10, "hi", now), now);
        }
        assert_eq!(state.buffer().len(), 12);

        state.ingest(entry(12, 10, "one more", now), now);
        assert_eq!(state.buffer().len(), state.capacity());
        assert_eq!(state.buffer().front().map(|e| e.id), Some(1));
        assert_eq!(state.buffer().back().map(|e| e.id), Some(12));
    }

    #[test]
    fn ingest_tracks_presence_and_caches_classification() {
        let now = Utc::now();
        let mut state = session(now);
        state.ingest(entry(1, 3, "first", now), now);
        let mut renamed = entry(2, 3, "second", now);
        renamed.author_name = "newname".to_string();
        state.ingest(renamed, now);

        let user = state.users.get(&3).expect("presence created");
        assert_eq!(user.message_count, 2);
        assert_eq!(user.display_name, "newname");
        assert_eq!(user.classification, Classification::Adversary);
        assert_eq!(state.classification_of(1), Classification::Primary);
        assert_eq!(state.classification_of(2), Classification::Ally);
        assert_eq!(state.classification_of(4), Classification::Neutral);
        assert_eq!(state.metrics.total_observed, 2);
    }

    #[test]
    fn metrics_stay_clamped_under_any_deltas() {
        let mut metrics = SessionMetrics::default();
        for delta in [0.9, 0.9, -3.0, 0.25, 5.0, -0.01, -7.5] {
            metrics.apply(delta, -delta);
            assert!((0.0..=1.0).contains(&metrics.temperature));
            assert!((0.0..=1.0).contains(&metrics.energy));
        }
    }

    #[test]
    fn mood_derivation_thresholds() {
        let now = Utc::now();
        let mut metrics = SessionMetrics::default();
        assert_eq!(Mood::derive(&metrics, now), Mood::Dormant);

        metrics.energy = 0.8;
        metrics.temperature = 0.8;
        assert_eq!(Mood::derive(&metrics, now), Mood::Heated);

        metrics.temperature = 0.5;
        metrics.last_speak_time = Some(now - chrono::Duration::seconds(30));
        assert_eq!(Mood::derive(&metrics, now), Mood::Engaged);

        metrics.last_speak_time = Some(now - chrono::Duration::seconds(300));
        metrics.energy = 0.2;
        assert_eq!(Mood::derive(&metrics, now), Mood::Disengaged);
    }

    #[test]
    fn should_reset_when_nobody_active_after_activity() {
        let now = Utc::now();
        let mut state = session(now);
        assert!(!state.should_reset(now, &EngineConfig::default()));

        let earlier = now - chrono::Duration::seconds(200);
        state.ingest(entry(1, 10, "hello", earlier), earlier);
        state.ingest(entry(2, 11, "hey", earlier), earlier);
        state.set_cooldown(now, 12.0);
        state.set_suppression(now, 10.0);
        state.last_response_to_user.insert(10, now);
        assert!(state.should_reset(now, &EngineConfig::default()));

        state.reset(now);
        assert!(state.buffer().is_empty());
        assert!(state.users.is_empty());
        assert!(!state.on_cooldown(now));
        assert!(!state.is_suppressed(now));
        assert!(state.last_response_to_user.is_empty());
        assert_eq!(state.mood, Mood::Dormant);
        assert!(!state.should_reset(now, &EngineConfig::default()));
    }

    #[test]
    fn should_reset_after_long_silence() {
        let now = Utc::now();
        let mut state = session(now - chrono::Duration::seconds(700));
        state.last_activity = now - chrono::Duration::seconds(601);
        assert!(state.should_reset(now, &EngineConfig::default()));
    }

    #[test]
    fn focus_expires_after_window() {
        let now = Utc::now();
        let mut state = session(now);
        state.set_focus(10, now);
        assert!(state.is_focus_target(10, now + chrono::Duration::seconds(60), 90.0));
        assert!(!state.is_focus_target(11, now, 90.0));
        assert!(state.focus(now + chrono::Duration::seconds(91), 90.0).is_none());
    }

    #[test]
    fn typing_goes_stale() {
        let now = Utc::now();
        let mut state = session(now);
        state.note_typing(10, now);
        assert!(state.is_typing(10, now + chrono::Duration::seconds(5), 8.0));
        assert!(!state.is_typing(10, now + chrono::Duration::seconds(9), 8.0));
        state.clear_typing(10, now - chrono::Duration::seconds(1));
        assert!(state.is_typing(10, now, 8.0));
        state.clear_typing(10, now);
        assert!(!state.is_typing(10, now, 8.0));
    }
}

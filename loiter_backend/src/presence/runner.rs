//! The presence loop: decides when a tick is due and drives one pipeline pass.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use flume::{Receiver, Sender};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, Semaphore};

use crate::config::PresenceConfig;
use crate::database::{ArchivedMessage, EngineDatabase};
use crate::services::Services;
use crate::transport::{ChannelId, InboundEvent, InboundMessage, Transport, UserId};

use super::content::ContentCoordinator;
use super::delivery::Deliverer;
use super::escalation::{EscalationTracker, OffenseReason};
use super::observe::{build_entry, Observer};
use super::opportunity::OpportunityScanner;
use super::select::{ActionKind, ActionSelector};
use super::session::{Mood, SessionState};
use super::triggers::{AddressBook, BehaviorClassifier, PatternClassifier};

/// Engine events streamed to admin clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresenceEvent {
    MoodChanged {
        from: Mood,
        to: Mood,
    },
    ActionTaken {
        kind: ActionKind,
        reason: String,
        target: Option<String>,
        text: String,
    },
    RestrictionApplied {
        user_id: UserId,
        user_name: String,
        restricted: bool,
        reasons: Vec<OffenseReason>,
    },
    SessionReset {
        channel_id: ChannelId,
    },
    Error {
        message: String,
    },
}

/// Admin commands delivered to the running engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    SetEnabled(bool),
    ClearEscalation(UserId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationSummary {
    pub user_id: UserId,
    pub count: u32,
    pub warned: bool,
    pub reasons: Vec<OffenseReason>,
    pub last_time: DateTime<Utc>,
}

/// Point-in-time view of the engine for the admin API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceStatus {
    pub enabled: bool,
    pub channel_id: ChannelId,
    pub mood: Mood,
    pub temperature: f64,
    pub energy: f64,
    pub buffer_len: usize,
    pub active_users: usize,
    pub focus_user: Option<UserId>,
    pub on_cooldown: bool,
    pub speak_count: u32,
    pub tick_count: u64,
    pub total_observed: u64,
    pub images_in_flight: usize,
    pub escalations: Vec<EscalationSummary>,
    pub last_action: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl PresenceStatus {
    pub fn initial(enabled: bool, channel_id: ChannelId) -> Self {
        Self {
            enabled,
            channel_id,
            mood: Mood::Dormant,
            temperature: 0.5,
            energy: 0.5,
            buffer_len: 0,
            active_users: 0,
            focus_user: None,
            on_cooldown: false,
            speak_count: 0,
            tick_count: 0,
            total_observed: 0,
            images_in_flight: 0,
            escalations: Vec::new(),
            last_action: None,
            updated_at: Utc::now(),
        }
    }
}

struct EngineInner {
    state: SessionState,
    tracker: EscalationTracker,
    rng: StdRng,
}

pub struct PresenceEngine {
    config: PresenceConfig,
    system_prompt: String,
    address: AddressBook,
    classifier: Box<dyn BehaviorClassifier>,
    services: Services,
    transport: Arc<dyn Transport>,
    db: Option<Arc<EngineDatabase>>,
    inner: Mutex<EngineInner>,
    /// Events received while a tick holds the session.
    staged: std::sync::Mutex<Vec<InboundEvent>>,
    processing: Arc<Semaphore>,
    enabled: AtomicBool,
    event_tx: Sender<PresenceEvent>,
    status: Arc<RwLock<PresenceStatus>>,
}

impl PresenceEngine {
    pub fn new(
        config: PresenceConfig,
        services: Services,
        transport: Arc<dyn Transport>,
        db: Option<Arc<EngineDatabase>>,
        enabled: bool,
        event_tx: Sender<PresenceEvent>,
    ) -> Result<Self> {
        let address = AddressBook::from_persona(&config.persona)?;
        let classifier =
            PatternClassifier::from_config(&config.patterns, &config.persona.all_names())?;
        let now = Utc::now();
        let state = SessionState::new(
            config.channel_id,
            config.persona.agent_user_id,
            &config.engine,
            config.membership.clone(),
            now,
        );
        let tracker = EscalationTracker::from_config(&config.engine);
        let status = PresenceStatus::initial(enabled, config.channel_id);

        Ok(Self {
            system_prompt: config.persona.resolved_system_prompt(),
            address,
            classifier: Box::new(classifier),
            services,
            transport,
            db,
            inner: Mutex::new(EngineInner {
                state,
                tracker,
                rng: StdRng::from_entropy(),
            }),
            staged: std::sync::Mutex::new(Vec::new()),
            processing: Arc::new(Semaphore::new(1)),
            enabled: AtomicBool::new(enabled),
            event_tx,
            status: Arc::new(RwLock::new(status)),
            config,
        })
    }

    /// Replace the random source, for reproducible runs.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.inner.get_mut().rng = rng;
        self
    }

    pub fn status_handle(&self) -> Arc<RwLock<PresenceStatus>> {
        self.status.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    async fn emit(&self, event: PresenceEvent) {
        let _ = self.event_tx.send(event);
    }

    pub async fn run_loop(
        self: Arc<Self>,
        inbound_rx: Receiver<InboundEvent>,
        control_rx: Receiver<ControlCommand>,
    ) -> Result<()> {
        tracing::info!(
            "Presence loop starting for channel {} (enabled: {})",
            self.config.channel_id,
            self.is_enabled()
        );

        let engine = &self.config.engine;
        let poll = Duration::from_millis(engine.tick_poll_ms.max(10));
        let interval = Duration::from_secs_f64(engine.tick_interval_secs.max(0.1));
        let mut last_tick = tokio::time::Instant::now();
        let mut messages_since_tick = 0usize;

        loop {
            while let Ok(command) = control_rx.try_recv() {
                self.apply_control(command).await;
            }

            if !self.is_enabled() {
                let dropped = inbound_rx.drain().count();
                if dropped > 0 {
                    tracing::debug!("Presence disabled, dropped {} inbound events", dropped);
                }
                tokio::time::sleep(poll).await;
                last_tick = tokio::time::Instant::now();
                messages_since_tick = 0;
                continue;
            }

            match tokio::time::timeout(poll, inbound_rx.recv_async()).await {
                Ok(Ok(event)) => {
                    if self.stage(event) {
                        messages_since_tick += 1;
                    }
                }
                Ok(Err(_)) => {
                    tracing::warn!("Inbound channel closed, presence loop stopping");
                    return Ok(());
                }
                Err(_) => {}
            }

            let due = messages_since_tick >= engine.tick_message_threshold
                || last_tick.elapsed() >= interval;
            if !due {
                continue;
            }
            last_tick = tokio::time::Instant::now();
            messages_since_tick = 0;
            self.try_begin_tick();
        }
    }

    /// Start a tick unless one is still in flight. Busy ticks are dropped, not queued.
    pub fn try_begin_tick(self: &Arc<Self>) -> bool {
        let permit = match self.processing.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::debug!("Tick skipped: previous action still in flight");
                return false;
            }
        };
        let engine = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            engine.run_tick().await;
        });
        true
    }

    /// Queue an inbound event for the next tick. Returns true for accepted messages.
    pub fn stage(&self, event: InboundEvent) -> bool {
        if !self.is_enabled() || !self.accepts(&event) {
            return false;
        }
        let is_message = matches!(event, InboundEvent::Message(_));
        match self.staged.lock() {
            Ok(mut staged) => staged.push(event),
            Err(e) => {
                tracing::error!("Inbound staging lock poisoned: {}", e);
                return false;
            }
        }
        is_message
    }

    fn accepts(&self, event: &InboundEvent) -> bool {
        if event.channel_id() != self.config.channel_id {
            return false;
        }
        let agent = self.config.persona.agent_user_id;
        match event {
            InboundEvent::Message(msg) => !msg.author.is_bot && msg.author.id != agent,
            InboundEvent::TypingStarted(typing) => typing.author_id != agent,
        }
    }

    fn take_staged(&self) -> Vec<InboundEvent> {
        match self.staged.lock() {
            Ok(mut staged) => std::mem::take(&mut *staged),
            Err(e) => {
                tracing::error!("Inbound staging lock poisoned: {}", e);
                Vec::new()
            }
        }
    }

    fn archive(&self, msg: &InboundMessage) {
        let Some(db) = self.db.as_deref() else {
            return;
        };
        if msg.text.trim().is_empty() {
            return;
        }
        let archived = ArchivedMessage {
            id: msg.id,
            channel_id: msg.channel_id,
            author_id: msg.author.id,
            author_name: msg.author.name.clone(),
            text: msg.text.clone(),
            created_at: msg.created_at,
        };
        if let Err(e) = db.archive_message(&archived) {
            tracing::warn!("Failed to archive message {}: {}", msg.id, e);
        }
    }

    /// Move staged events into the session's pending queue.
    fn flush_staged(&self, state: &mut SessionState) {
        for event in self.take_staged() {
            match event {
                InboundEvent::Message(msg) => {
                    self.archive(&msg);
                    state.enqueue(msg);
                }
                InboundEvent::TypingStarted(typing) => state.note_typing(typing.author_id, typing.at),
            }
        }
    }

    /// Messages that land while waiting on a typist go straight into the
    /// buffer, unclassified.
    fn flush_staged_into_buffer(&self, state: &mut SessionState) {
        let now = Utc::now();
        for event in self.take_staged() {
            match event {
                InboundEvent::Message(msg) => {
                    self.archive(&msg);
                    let entry = build_entry(state, &msg);
                    state.clear_typing(entry.author_id, entry.timestamp);
                    state.ingest(entry, now);
                }
                InboundEvent::TypingStarted(typing) => state.note_typing(typing.author_id, typing.at),
            }
        }
    }

    async fn wait_for_typing(&self, state: &mut SessionState, target: Option<UserId>) {
        let Some(user) = target else {
            return;
        };
        let engine = &self.config.engine;
        if !state.is_typing(user, Utc::now(), engine.typing_stale_secs) {
            return;
        }

        tracing::debug!("Waiting for {} to finish typing", user);
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs_f64(engine.typing_wait_secs.max(0.0));
        let poll = Duration::from_millis(engine.tick_poll_ms.max(10));
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(poll).await;
            self.flush_staged_into_buffer(state);
            if !state.is_typing(user, Utc::now(), engine.typing_stale_secs) {
                break;
            }
        }
    }

    /// One pipeline pass: observe, select, generate, deliver.
    pub async fn run_tick(&self) {
        let mut guard = self.inner.lock().await;
        let EngineInner {
            state,
            tracker,
            rng,
        } = &mut *guard;
        let engine = &self.config.engine;
        let now = Utc::now();

        if state.should_reset(now, engine) {
            state.reset(now);
            self.emit(PresenceEvent::SessionReset {
                channel_id: state.channel_id,
            })
            .await;
        }

        self.flush_staged(state);
        if state.pending_len() == 0
            && state.priority_triggers.is_empty()
            && state.image_tasks.is_empty()
        {
            self.publish_status(state, tracker, None).await;
            return;
        }

        state.tick_count += 1;
        state.last_tick = now;
        tracing::debug!(
            "Tick {} | pending={} | mood={}",
            state.tick_count,
            state.pending_len(),
            state.mood
        );

        let observer = Observer {
            engine,
            agent_name: &self.config.persona.display_name,
            address: &self.address,
            classifier: self.classifier.as_ref(),
            services: &self.services,
        };
        let delta = observer.observe(state, rng, now).await;
        if delta.mood_changed() {
            self.emit(PresenceEvent::MoodChanged {
                from: delta.previous_mood,
                to: delta.mood,
            })
            .await;
        }

        let selector = ActionSelector {
            engine,
            scanner: OpportunityScanner {
                engine,
                interesting_keywords: &self.config.patterns.interesting_keywords,
                memory: self.services.memory.as_ref(),
                vision_enabled: self.config.vision_model.is_some(),
            },
        };
        let mut plan = selector.select(state, tracker, &delta, rng, now).await;
        if !plan.should_act {
            tracing::debug!("No action: {}", plan.reason);
            self.publish_status(state, tracker, None).await;
            return;
        }

        if !plan.is_punitive() {
            self.wait_for_typing(state, plan.target_user).await;
        }

        let coordinator = ContentCoordinator {
            engine,
            system_prompt: &self.system_prompt,
            generation: self.services.generation.as_ref(),
            memory: self.services.memory.as_ref(),
        };
        let text = coordinator.generate(state, &mut plan).await;
        if text.is_empty() {
            tracing::debug!("Generation produced nothing for '{}'", plan.reason);
            self.publish_status(state, tracker, None).await;
            return;
        }

        let deliverer = Deliverer {
            engine,
            transport: self.transport.clone(),
            agent_name: &self.config.persona.display_name,
            restriction_exempt: &self.config.membership.restriction_exempt,
            mod_log_channel: self.config.mod_log_channel_id,
            db: self.db.as_deref(),
        };

        let last_action = if plan.is_punitive() {
            match deliverer.deliver_punitive(state, tracker, &plan, &text).await {
                Some(outcome) => {
                    let summary = format!("punitive:{}", outcome.user_name);
                    self.emit(PresenceEvent::RestrictionApplied {
                        user_id: outcome.user_id,
                        user_name: outcome.user_name,
                        restricted: outcome.restricted,
                        reasons: outcome.reasons,
                    })
                    .await;
                    Some(summary)
                }
                None => None,
            }
        } else {
            match deliverer.deliver(state, &mut plan, &text, rng).await {
                Ok(Some(_)) => {
                    self.emit(PresenceEvent::ActionTaken {
                        kind: plan.kind,
                        reason: plan.reason.clone(),
                        target: plan.target_user_name.clone(),
                        text: state
                            .buffer()
                            .back()
                            .filter(|e| e.is_agent)
                            .map(|e| e.text.clone())
                            .unwrap_or_default(),
                    })
                    .await;
                    Some(plan.reason.clone())
                }
                Ok(None) => None,
                Err(e) => {
                    self.emit(PresenceEvent::Error {
                        message: format!("Failed to deliver '{}': {}", plan.reason, e),
                    })
                    .await;
                    None
                }
            }
        };

        self.publish_status(state, tracker, last_action).await;
    }

    async fn apply_control(self: &Arc<Self>, command: ControlCommand) {
        match command {
            ControlCommand::SetEnabled(enabled) => {
                self.enabled.store(enabled, Ordering::SeqCst);
                if !enabled {
                    self.take_staged();
                }
                if let Some(db) = self.db.as_deref() {
                    if let Err(e) = db.set_presence_enabled(enabled) {
                        tracing::warn!("Failed to persist presence toggle: {}", e);
                        self.emit(PresenceEvent::Error {
                            message: format!("Failed to persist presence toggle: {}", e),
                        })
                        .await;
                    }
                }
                tracing::info!("Presence {}", if enabled { "enabled" } else { "disabled" });
                self.status.write().await.enabled = enabled;
            }
            ControlCommand::ClearEscalation(user) => {
                // A running tick holds the session; intake must not wait on it.
                let engine = Arc::clone(self);
                tokio::spawn(async move { engine.clear_escalation(user).await });
            }
        }
    }

    pub async fn clear_escalation(&self, user: UserId) -> bool {
        let mut guard = self.inner.lock().await;
        let cleared = guard.tracker.clear(user).is_some();
        tracing::info!("Escalation clear for {} (had record: {})", user, cleared);
        let EngineInner { state, tracker, .. } = &mut *guard;
        self.publish_status(state, tracker, None).await;
        cleared
    }

    async fn publish_status(
        &self,
        state: &SessionState,
        tracker: &EscalationTracker,
        last_action: Option<String>,
    ) {
        let engine = &self.config.engine;
        let now = Utc::now();
        let escalations = tracker
            .active(now)
            .into_iter()
            .map(|(user_id, record)| EscalationSummary {
                user_id,
                count: record.count,
                warned: record.warned,
                reasons: record.reasons.into_iter().collect(),
                last_time: record.last_time,
            })
            .collect();

        let mut status = self.status.write().await;
        let last_action = last_action.or_else(|| status.last_action.take());
        *status = PresenceStatus {
            enabled: self.is_enabled(),
            channel_id: state.channel_id,
            mood: state.mood,
            temperature: state.metrics.temperature,
            energy: state.metrics.energy,
            buffer_len: state.buffer().len(),
            active_users: state.active_users(now, engine.active_user_window_secs),
            focus_user: state
                .focus(now, engine.focus_window_secs)
                .map(|f| f.user_id),
            on_cooldown: state.on_cooldown(now),
            speak_count: state.metrics.speak_count,
            tick_count: state.tick_count,
            total_observed: state.metrics.total_observed,
            images_in_flight: state.image_tasks.len(),
            escalations,
            last_action,
            updated_at: now,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MembershipConfig;
    use crate::services::testing::{services, ScriptedGeneration};
    use crate::transport::testing::{RecordingTransport, Sent};
    use crate::transport::{InboundAuthor, TypingStarted};

    fn config() -> PresenceConfig {
        let mut config = PresenceConfig::default();
        config.channel_id = 500;
        config.persona.agent_user_id = 99;
        config.membership = MembershipConfig {
            primary_user_id: Some(1),
            allies: vec![2],
            adversaries: vec![3],
            restriction_exempt: vec![],
        };
        config.engine.typing_min_secs = 0.0;
        config.engine.typing_max_secs = 0.0;
        config.engine.random_engagement_chance = 0.0;
        config
    }

    fn message(id: i64, author: i64, text: &str) -> InboundMessage {
        InboundMessage {
            id,
            channel_id: 500,
            author: InboundAuthor {
                id: author,
                name: format!("user{}", author),
                is_bot: false,
            },
            text: text.to_string(),
            created_at: Utc::now(),
            reply_reference: None,
            attachments: Vec::new(),
            embeds: Vec::new(),
        }
    }

    type Harness = (
        Arc<PresenceEngine>,
        Arc<RecordingTransport>,
        Receiver<PresenceEvent>,
    );

    fn engine(replies: &[&'static str], db: Option<Arc<EngineDatabase>>) -> Harness {
        engine_with(config(), replies, db)
    }

    fn engine_with(
        config: PresenceConfig,
        replies: &[&'static str],
        db: Option<Arc<EngineDatabase>>,
    ) -> Harness {
        let (event_tx, event_rx) = flume::unbounded();
        let transport = Arc::new(RecordingTransport::new());
        let generation = Arc::new(ScriptedGeneration::with_replies(replies.iter().copied()));
        let engine = PresenceEngine::new(
            config,
            services(generation),
            transport.clone(),
            db,
            true,
            event_tx,
        )
        .expect("engine")
        .with_rng(StdRng::seed_from_u64(7));
        (Arc::new(engine), transport, event_rx)
    }

    #[tokio::test]
    async fn direct_address_is_answered_in_one_tick() {
        let (engine, transport, events) = engine(&["hey, what's up"], None);
        assert!(engine.stage(InboundEvent::Message(message(1, 10, "morning all"))));
        assert!(engine.stage(InboundEvent::Message(message(2, 10, "<@99> you around?"))));

        engine.run_tick().await;

        let sent = transport.sent();
        assert!(sent.contains(&Sent::Reply {
            channel: 500,
            entry: 2,
            text: "hey, what's up".to_string()
        }));
        let events: Vec<PresenceEvent> = events.drain().collect();
        assert!(events.iter().any(|e| matches!(
            e,
            PresenceEvent::ActionTaken { kind: ActionKind::Reply, reason, .. } if reason == "direct_address"
        )));

        let status = engine.status_handle().read().await.clone();
        assert_eq!(status.speak_count, 1);
        assert_eq!(status.focus_user, Some(10));
        assert_eq!(status.last_action.as_deref(), Some("direct_address"));
    }

    #[tokio::test]
    async fn foreign_bot_and_own_events_are_ignored() {
        let (engine, _, _) = engine(&[], None);
        let mut other_channel = message(1, 10, "hi");
        other_channel.channel_id = 501;
        let mut bot = message(2, 11, "beep");
        bot.author.is_bot = true;
        let own = message(3, 99, "me");

        assert!(!engine.stage(InboundEvent::Message(other_channel)));
        assert!(!engine.stage(InboundEvent::Message(bot)));
        assert!(!engine.stage(InboundEvent::Message(own)));
        assert!(!engine.stage(InboundEvent::TypingStarted(TypingStarted {
            channel_id: 500,
            author_id: 10,
            at: Utc::now(),
        })));
        assert!(engine.stage(InboundEvent::Message(message(4, 10, "hello"))));
    }

    #[tokio::test]
    async fn tick_is_dropped_while_another_is_in_flight() {
        let (engine, _, _) = engine(&[], None);
        let held = engine
            .processing
            .clone()
            .try_acquire_owned()
            .expect("permit");
        assert!(!engine.try_begin_tick());
        drop(held);
        assert!(engine.try_begin_tick());
    }

    #[tokio::test]
    async fn disabling_persists_the_toggle_and_drops_events() {
        let path = std::env::temp_dir().join(format!("loiter_runner_{}.db", uuid::Uuid::new_v4()));
        let db = Arc::new(EngineDatabase::new(&path).expect("db"));
        db.set_presence_enabled(true).expect("enable");
        let (engine, _, _) = engine(&[], Some(db.clone()));

        engine.apply_control(ControlCommand::SetEnabled(false)).await;
        assert!(!engine.is_enabled());
        assert!(!db.presence_enabled().expect("toggle"));
        assert!(!engine.status_handle().read().await.enabled);
        assert!(!engine.stage(InboundEvent::Message(message(1, 10, "hello"))));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn manual_clear_removes_escalation_from_status() {
        let (engine, _, _) = engine(&["back off"], None);
        engine.stage(InboundEvent::Message(message(1, 10, "shut up")));
        engine.run_tick().await;
        let status = engine.status_handle().read().await.clone();
        assert_eq!(status.escalations.len(), 1);
        assert_eq!(status.escalations[0].reasons, vec![OffenseReason::Hostility]);

        assert!(engine.clear_escalation(10).await);
        assert!(engine.status_handle().read().await.escalations.is_empty());
        assert!(!engine.clear_escalation(10).await);
    }

    #[tokio::test]
    async fn escalation_clear_does_not_block_intake_behind_a_tick() {
        let (engine, _, _) = engine(&[], None);
        let (inbound_tx, inbound_rx) = flume::unbounded();
        let (control_tx, control_rx) = flume::unbounded();

        // Stand in for a tick that holds the session through a long wait.
        let held = engine.inner.lock().await;
        control_tx
            .send(ControlCommand::ClearEscalation(10))
            .expect("send control");
        let presence_loop = tokio::spawn(engine.clone().run_loop(inbound_rx, control_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        inbound_tx
            .send(InboundEvent::Message(message(1, 10, "still here")))
            .expect("send inbound");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.staged.lock().expect("staged").len(), 1);

        drop(held);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.status_handle().read().await.escalations.is_empty());

        drop(inbound_tx);
        presence_loop
            .await
            .expect("join presence loop")
            .expect("presence loop");
    }

    #[tokio::test]
    async fn reply_waits_for_the_target_to_finish_typing() {
        let mut config = config();
        config.engine.typing_wait_secs = 5.0;
        config.engine.tick_poll_ms = 20;
        let (engine, transport, _) = engine_with(config, &["go on then"], None);

        let mut address = message(1, 10, "<@99> wait, question");
        address.created_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(engine.stage(InboundEvent::Message(address)));
        engine.stage(InboundEvent::TypingStarted(TypingStarted {
            channel_id: 500,
            author_id: 10,
            at: Utc::now(),
        }));

        let started = tokio::time::Instant::now();
        let tick = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run_tick().await }
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!tick.is_finished());
        engine.stage(InboundEvent::Message(message(2, 11, "lol same")));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!tick.is_finished());
        assert!(!transport
            .sent()
            .iter()
            .any(|s| matches!(s, Sent::Reply { .. })));

        engine.stage(InboundEvent::Message(message(3, 10, "how do you pick a roast")));
        tick.await.expect("tick");
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(transport.sent().contains(&Sent::Reply {
            channel: 500,
            entry: 1,
            text: "go on then".to_string()
        }));

        let inner = engine.inner.lock().await;
        let ids: Vec<_> = inner.state.buffer().iter().map(|e| e.id).collect();
        assert!(ids.contains(&2));
        assert!(ids.contains(&3));
        assert!(inner.state.typing.is_empty());
    }

    #[tokio::test]
    async fn stale_session_resets_before_observing() {
        let (engine, _, events) = engine(&[], None);
        {
            let mut inner = engine.inner.lock().await;
            let earlier = Utc::now() - chrono::Duration::seconds(700);
            inner.state.last_activity = earlier;
            inner.state.metrics.total_observed = 3;
        }
        engine.run_tick().await;
        let events: Vec<PresenceEvent> = events.drain().collect();
        assert_eq!(
            events,
            vec![PresenceEvent::SessionReset { channel_id: 500 }]
        );
    }
}

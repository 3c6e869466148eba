//! Action selection: priority triggers first, scored opportunities second.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::transport::{MessageId, UserId};

use super::content::image_hint;
use super::escalation::{EscalationTracker, EscalationVerdict, OffenseReason};
use super::observe::StateDelta;
use super::opportunity::{best_opportunity, ActionOpportunity, OpportunityKind, OpportunityScanner};
use super::session::{Classification, Mood, RaisedTrigger, SessionState};
use super::triggers::TriggerCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Reply,
    NewMessage,
    Punitive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Treatment {
    #[default]
    Default,
    Warm,
    Friendly,
    Cold,
    Curt,
    Contradictory,
}

impl Treatment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Warm => "warm",
            Self::Friendly => "friendly",
            Self::Cold => "cold",
            Self::Curt => "curt",
            Self::Contradictory => "contradictory",
        }
    }
}

/// Whether generation may address more than one person.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targeting {
    /// Address only the target; `exclude_names` are other active people not to name.
    Single { exclude_names: Vec<String> },
    Multi,
}

/// What produced the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanSource {
    Trigger(TriggerCategory),
    Opportunity(OpportunityKind),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionPlan {
    pub should_act: bool,
    pub kind: ActionKind,
    pub target_user: Option<UserId>,
    pub target_user_name: Option<String>,
    pub target_entry: Option<MessageId>,
    pub prompt_hints: Vec<String>,
    pub treatment: Treatment,
    pub punitive_reason: Option<OffenseReason>,
    pub escalation: Option<EscalationVerdict>,
    pub source: Option<PlanSource>,
    pub reason: String,
    pub targeting: Targeting,
    pub memory_context: Option<String>,
    /// Image context is already among the hints.
    pub has_image_context: bool,
}

impl ActionPlan {
    pub fn idle(reason: impl Into<String>) -> Self {
        Self {
            should_act: false,
            kind: ActionKind::Reply,
            target_user: None,
            target_user_name: None,
            target_entry: None,
            prompt_hints: Vec::new(),
            treatment: Treatment::Default,
            punitive_reason: None,
            escalation: None,
            source: None,
            reason: reason.into(),
            targeting: Targeting::Single {
                exclude_names: Vec::new(),
            },
            memory_context: None,
            has_image_context: false,
        }
    }

    pub fn is_punitive(&self) -> bool {
        self.should_act && self.kind == ActionKind::Punitive
    }

    pub fn is_bored_interjection(&self) -> bool {
        self.source == Some(PlanSource::Opportunity(OpportunityKind::BoredInterjection))
    }
}

pub struct ActionSelector<'a> {
    pub engine: &'a EngineConfig,
    pub scanner: OpportunityScanner<'a>,
}

impl<'a> ActionSelector<'a> {
    pub async fn select<R: Rng>(
        &self,
        state: &mut SessionState,
        tracker: &mut EscalationTracker,
        delta: &StateDelta,
        rng: &mut R,
        now: DateTime<Utc>,
    ) -> ActionPlan {
        let on_cooldown = state.on_cooldown(now);
        if on_cooldown
            && !state
                .priority_triggers
                .iter()
                .any(|t| t.category.bypasses_cooldown())
        {
            tracing::debug!("Selection: on cooldown");
            return ActionPlan::idle("on_cooldown");
        }

        if state.is_suppressed(now) && state.priority_triggers.is_empty() {
            tracing::debug!("Selection: post-speak suppression");
            return ActionPlan::idle("post_speak_suppressed");
        }

        while let Some(trigger) = next_trigger(state, on_cooldown) {
            if let Some(plan) = self.plan_for_trigger(state, tracker, trigger, rng, now) {
                tracing::info!(
                    "Selection: trigger '{}' -> {} | target={} | treatment={}",
                    plan.reason,
                    if plan.should_act { "act" } else { "hold" },
                    plan.target_user_name.as_deref().unwrap_or("-"),
                    plan.treatment.as_str()
                );
                return plan;
            }
        }

        if on_cooldown {
            return ActionPlan::idle("on_cooldown");
        }

        let opportunities = self.scanner.scan(state, rng, now).await;
        tracing::debug!(
            "Selection: {} new entries, {} opportunities",
            delta.new_entries.len(),
            opportunities.len()
        );
        match best_opportunity(opportunities, self.engine.opportunity_threshold) {
            Ok(best) => {
                let plan = self.plan_for_opportunity(state, best, rng, now);
                tracing::info!(
                    "Selection: opportunity '{}' | target={}",
                    plan.reason,
                    plan.target_user_name.as_deref().unwrap_or("channel")
                );
                plan
            }
            Err(Some(best)) => {
                tracing::debug!(
                    "Selection: best opportunity '{}' below threshold ({:.2})",
                    best.kind,
                    best.total_score()
                );
                ActionPlan::idle(format!("below_threshold ({:.2})", best.total_score()))
            }
            Err(None) => ActionPlan::idle("no_opportunities"),
        }
    }

    /// `None` means the trigger was consumed without producing a plan.
    fn plan_for_trigger<R: Rng>(
        &self,
        state: &mut SessionState,
        tracker: &mut EscalationTracker,
        trigger: RaisedTrigger,
        rng: &mut R,
        now: DateTime<Utc>,
    ) -> Option<ActionPlan> {
        if state.responded_to.contains(&trigger.entry_id) {
            tracing::debug!(
                "Skipping trigger '{}': message {} already answered",
                trigger.category,
                trigger.entry_id
            );
            return None;
        }

        let verdict = match trigger.category {
            TriggerCategory::EscalationRequest => Some(tracker.request(trigger.author_id, now)),
            category => OffenseReason::from_trigger(category)
                .map(|reason| tracker.record_offense(trigger.author_id, reason, now)),
        };
        let executes = verdict == Some(EscalationVerdict::Execute);

        let classification = state.classification_of(trigger.author_id);
        if classification != Classification::Adversary
            && !executes
            && state.user_on_cooldown(
                trigger.author_id,
                now,
                self.engine.user_priority_cooldown_secs,
            )
        {
            tracing::debug!(
                "Skipping trigger '{}': {} answered recently",
                trigger.category,
                trigger.author_name
            );
            return None;
        }

        let mut plan = ActionPlan::idle(trigger.category.as_str());
        plan.should_act = true;
        plan.source = Some(PlanSource::Trigger(trigger.category));
        plan.target_user = Some(trigger.author_id);
        plan.target_user_name = Some(trigger.author_name.clone());
        plan.target_entry = Some(trigger.entry_id);
        plan.escalation = verdict;
        plan.targeting = targeting(state, Some(trigger.author_id), now, self.engine);

        if executes {
            plan.kind = ActionKind::Punitive;
            plan.punitive_reason = OffenseReason::from_trigger(trigger.category);
            return Some(plan);
        }

        apply_treatment(&mut plan, classification, rng);

        match trigger.category {
            TriggerCategory::DirectAddress => plan
                .prompt_hints
                .push("Someone addressed you directly. Respond to what they said.".to_string()),
            TriggerCategory::ReplyToAgent => plan.prompt_hints.push(
                "Someone replied to your message. Continue the conversation naturally.".to_string(),
            ),
            TriggerCategory::NameMention => {
                plan.prompt_hints.push(
                    "Someone mentioned your name. Respond if it's relevant, brush it off if \
                     they're just fishing for attention."
                        .to_string(),
                );
                if let Some(sentiment) = &trigger.sentiment {
                    plan.prompt_hints
                        .push(format!("Their tone toward you reads {}.", sentiment));
                }
            }
            TriggerCategory::IdentityDenial => match verdict {
                Some(EscalationVerdict::Warn(_)) => plan.prompt_hints.push(
                    "They keep insisting you aren't real. Tell them to drop it, you're over it."
                        .to_string(),
                ),
                _ => {
                    if rng.gen_bool(self.engine.first_offense_ignore_chance.clamp(0.0, 1.0)) {
                        plan.should_act = false;
                        plan.reason = "ignoring_first_denial".to_string();
                        return Some(plan);
                    }
                    plan.prompt_hints
                        .push("Deflect and dismiss the accusation casually.".to_string());
                }
            },
            TriggerCategory::Hostility => match verdict {
                Some(EscalationVerdict::Warn(_)) => plan.prompt_hints.push(
                    "This person keeps being hostile. Warn them they're on thin ice.".to_string(),
                ),
                _ => plan
                    .prompt_hints
                    .push("This person is being hostile. Push back, don't fold.".to_string()),
            },
            TriggerCategory::EscalationRequest => {}
            TriggerCategory::SoftContinuation => plan.prompt_hints.push(
                "They're continuing their conversation with you without tagging you. \
                 Respond naturally."
                    .to_string(),
            ),
        }

        if let Some(entry) = state.entry(trigger.entry_id) {
            if let Some(description) = &entry.image_description {
                plan.prompt_hints.push(image_hint(
                    description,
                    false,
                    &entry.author_name,
                    classification,
                    &entry.text,
                ));
                plan.has_image_context = true;
            }
        }

        Some(plan)
    }

    fn plan_for_opportunity<R: Rng>(
        &self,
        state: &SessionState,
        best: ActionOpportunity,
        rng: &mut R,
        now: DateTime<Utc>,
    ) -> ActionPlan {
        let mut plan = ActionPlan::idle(best.kind.as_str());
        plan.should_act = true;
        plan.source = Some(PlanSource::Opportunity(best.kind));
        plan.kind = if best.target_entry.is_some() {
            ActionKind::Reply
        } else {
            ActionKind::NewMessage
        };
        plan.target_user = best.target_user;
        plan.target_user_name = best
            .target_user
            .and_then(|u| state.display_name_of(u))
            .map(str::to_string);
        plan.target_entry = best.target_entry;
        plan.targeting = targeting(state, best.target_user, now, self.engine);

        if best.kind == OpportunityKind::BoredInterjection && best.memory_context.is_some() {
            plan.prompt_hints.push(
                "Something from a past conversation just clicked. Drop one sharp take that \
                 connects to it. One sentence, in your voice. Don't announce you're remembering."
                    .to_string(),
            );
        }

        if best.kind.is_image() {
            if let Some(entry) = best.target_entry.and_then(|id| state.entry(id)) {
                if let Some(description) = &entry.image_description {
                    plan.prompt_hints.push(image_hint(
                        description,
                        best.kind == OpportunityKind::ImageRoast,
                        &entry.author_name,
                        state.classification_of(entry.author_id),
                        &entry.text,
                    ));
                    plan.has_image_context = true;
                }
            }
        }
        plan.memory_context = best.memory_context;

        if let Some(user) = plan.target_user {
            apply_treatment(&mut plan, state.classification_of(user), rng);
        }
        plan
    }
}

/// Pop the next trigger to consider. While the global cooldown runs only
/// bypass categories are taken; the rest stay queued.
fn next_trigger(state: &mut SessionState, on_cooldown: bool) -> Option<RaisedTrigger> {
    if !on_cooldown {
        return state.priority_triggers.pop_front();
    }
    let position = state
        .priority_triggers
        .iter()
        .position(|t| t.category.bypasses_cooldown())?;
    state.priority_triggers.remove(position)
}

/// Per-classification tone for the reply.
pub fn apply_treatment<R: Rng>(plan: &mut ActionPlan, classification: Classification, rng: &mut R) {
    match classification {
        Classification::Primary => {
            plan.treatment = Treatment::Warm;
            plan.prompt_hints.push(
                "This is someone you really like. Be warm, supportive and generous.".to_string(),
            );
        }
        Classification::Ally => {
            plan.treatment = Treatment::Friendly;
            plan.prompt_hints
                .push("This person is a friend. Be positive or at least easygoing.".to_string());
        }
        Classification::Adversary => {
            let choice = [Treatment::Cold, Treatment::Curt, Treatment::Contradictory]
                .choose(rng)
                .copied()
                .unwrap_or(Treatment::Cold);
            plan.treatment = choice;
            let hint = match choice {
                Treatment::Curt => "Keep it short and a little cutting.",
                Treatment::Contradictory => "Disagree with or contradict what they said.",
                _ => "Respond with cold neutrality.",
            };
            plan.prompt_hints.push(hint.to_string());
        }
        Classification::Neutral => {}
    }
}

/// Single-target unless the room is heated with more than one speaker.
pub fn targeting(
    state: &SessionState,
    target: Option<UserId>,
    now: DateTime<Utc>,
    engine: &EngineConfig,
) -> Targeting {
    if state.mood == Mood::Heated && state.distinct_speakers() > 1 {
        return Targeting::Multi;
    }
    let target_name = target.and_then(|t| state.display_name_of(t));
    let mut exclude_names: Vec<String> = state
        .users
        .values()
        .filter(|u| Some(u.user_id) != target)
        .filter(|u| u.is_active(now, engine.active_user_window_secs))
        .filter(|u| Some(u.display_name.as_str()) != target_name)
        .map(|u| u.display_name.clone())
        .collect();
    exclude_names.sort();
    Targeting::Single { exclude_names }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::session::tests::{entry, session};
    use crate::services::NullMemory;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn trigger(category: TriggerCategory, entry_id: MessageId, author: UserId, now: DateTime<Utc>) -> RaisedTrigger {
        RaisedTrigger {
            category,
            entry_id,
            author_id: author,
            author_name: format!("user{}", author),
            raised_at: now,
            sentiment: None,
        }
    }

    struct Harness {
        engine: EngineConfig,
        keywords: Vec<String>,
        memory: NullMemory,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                engine: EngineConfig {
                    random_engagement_chance: 0.0,
                    first_offense_ignore_chance: 0.0,
                    ..EngineConfig::default()
                },
                keywords: vec!["coffee".to_string()],
                memory: NullMemory,
            }
        }

        fn selector(&self) -> ActionSelector<'_> {
            ActionSelector {
                engine: &self.engine,
                scanner: OpportunityScanner {
                    engine: &self.engine,
                    interesting_keywords: &self.keywords,
                    memory: &self.memory,
                    vision_enabled: true,
                },
            }
        }
    }

    #[tokio::test]
    async fn direct_address_without_cooldown_replies() {
        let h = Harness::new();
        let now = Utc::now();
        let mut state = session(now);
        state.ingest(entry(1, 10, "morning", now), now);
        state.ingest(entry(2, 11, "hey", now), now);
        state.ingest(entry(3, 10, "<@99> you up?", now), now);
        state
            .priority_triggers
            .push_back(trigger(TriggerCategory::DirectAddress, 3, 10, now));
        let mut tracker = EscalationTracker::from_config(&h.engine);

        let mut rng = StdRng::seed_from_u64(1);
        let plan = h
            .selector()
            .select(&mut state, &mut tracker, &StateDelta::default(), &mut rng, now)
            .await;
        assert!(plan.should_act);
        assert_eq!(plan.kind, ActionKind::Reply);
        assert_eq!(plan.target_entry, Some(3));
        assert_eq!(
            plan.targeting,
            Targeting::Single {
                exclude_names: vec!["user11".to_string()]
            }
        );
        assert!(state.priority_triggers.is_empty());
    }

    #[tokio::test]
    async fn hostility_bypasses_cooldown_but_topical_chatter_does_not() {
        let h = Harness::new();
        let now = Utc::now();
        let mut state = session(now);
        state.ingest(entry(1, 10, "coffee is overrated", now), now);
        state.set_cooldown(now, 12.0);
        let mut tracker = EscalationTracker::from_config(&h.engine);
        let mut rng = StdRng::seed_from_u64(1);

        state.mood = Mood::Engaged;
        let plan = h
            .selector()
            .select(&mut state, &mut tracker, &StateDelta::default(), &mut rng, now)
            .await;
        assert!(!plan.should_act);
        assert_eq!(plan.reason, "on_cooldown");

        state.ingest(entry(2, 10, "shut up", now), now);
        state
            .priority_triggers
            .push_back(trigger(TriggerCategory::DirectAddress, 1, 10, now));
        state
            .priority_triggers
            .push_back(trigger(TriggerCategory::Hostility, 2, 10, now));
        let plan = h
            .selector()
            .select(&mut state, &mut tracker, &StateDelta::default(), &mut rng, now)
            .await;
        assert!(plan.should_act);
        assert_eq!(plan.source, Some(PlanSource::Trigger(TriggerCategory::Hostility)));
        // The non-bypass trigger waits for the cooldown to end.
        assert_eq!(state.priority_triggers.len(), 1);
        assert_eq!(
            state.priority_triggers[0].category,
            TriggerCategory::DirectAddress
        );
    }

    #[tokio::test]
    async fn third_hostile_message_warns_fourth_executes() {
        let h = Harness::new();
        let start = Utc::now();
        let mut state = session(start);
        let mut tracker = EscalationTracker::from_config(&h.engine);
        let mut rng = StdRng::seed_from_u64(2);

        let mut plans = Vec::new();
        for i in 0..4 {
            let at = start + chrono::Duration::seconds(i * 20);
            let id = 100 + i;
            state.ingest(entry(id, 10, "shut up", at), at);
            state
                .priority_triggers
                .push_back(trigger(TriggerCategory::Hostility, id, 10, at));
            let plan = h
                .selector()
                .select(&mut state, &mut tracker, &StateDelta::default(), &mut rng, at)
                .await;
            plans.push(plan);
        }

        assert_eq!(plans[0].escalation, Some(EscalationVerdict::Counting(1)));
        assert_eq!(plans[2].escalation, Some(EscalationVerdict::Warn(3)));
        assert_eq!(plans[2].kind, ActionKind::Reply);
        assert!(plans[2]
            .prompt_hints
            .iter()
            .any(|h| h.contains("thin ice")));
        assert_eq!(tracker.get(10).map(|r| r.count), Some(4));
        assert!(plans[3].is_punitive());
        assert_eq!(plans[3].punitive_reason, Some(OffenseReason::Hostility));
    }

    #[tokio::test]
    async fn priority_cooldown_skips_non_adversaries_only() {
        let h = Harness::new();
        let now = Utc::now();
        let mut state = session(now);
        state.ingest(entry(1, 10, "<@99> hey", now), now);
        state.ingest(entry(2, 3, "<@99> hey", now), now);
        state.last_response_to_user.insert(10, now - chrono::Duration::seconds(5));
        state.last_response_to_user.insert(3, now - chrono::Duration::seconds(5));
        state
            .priority_triggers
            .push_back(trigger(TriggerCategory::DirectAddress, 1, 10, now));
        state
            .priority_triggers
            .push_back(trigger(TriggerCategory::DirectAddress, 2, 3, now));
        let mut tracker = EscalationTracker::from_config(&h.engine);

        let mut rng = StdRng::seed_from_u64(3);
        let plan = h
            .selector()
            .select(&mut state, &mut tracker, &StateDelta::default(), &mut rng, now)
            .await;
        assert_eq!(plan.target_user, Some(3));
        assert!(matches!(
            plan.treatment,
            Treatment::Cold | Treatment::Curt | Treatment::Contradictory
        ));
    }

    #[tokio::test]
    async fn escalation_request_executes_even_inside_user_cooldown() {
        let h = Harness::new();
        let now = Utc::now();
        let mut state = session(now);
        state.ingest(entry(1, 10, "mute me", now), now);
        state.last_response_to_user.insert(10, now);
        state
            .priority_triggers
            .push_back(trigger(TriggerCategory::EscalationRequest, 1, 10, now));
        let mut tracker = EscalationTracker::from_config(&h.engine);

        let mut rng = StdRng::seed_from_u64(3);
        let plan = h
            .selector()
            .select(&mut state, &mut tracker, &StateDelta::default(), &mut rng, now)
            .await;
        assert!(plan.is_punitive());
        assert_eq!(plan.punitive_reason, Some(OffenseReason::Requested));
    }

    #[tokio::test]
    async fn answered_triggers_are_dropped() {
        let h = Harness::new();
        let now = Utc::now();
        let mut state = session(now);
        state.ingest(entry(1, 10, "<@99> hi", now), now);
        state.responded_to.insert(1);
        state
            .priority_triggers
            .push_back(trigger(TriggerCategory::DirectAddress, 1, 10, now));
        let mut tracker = EscalationTracker::from_config(&h.engine);

        let mut rng = StdRng::seed_from_u64(3);
        let plan = h
            .selector()
            .select(&mut state, &mut tracker, &StateDelta::default(), &mut rng, now)
            .await;
        assert!(!plan.should_act);
        assert_eq!(plan.reason, "no_opportunities");
    }

    #[tokio::test]
    async fn suppression_blocks_opportunities() {
        let h = Harness::new();
        let now = Utc::now();
        let mut state = session(now);
        state.ingest(entry(1, 3, "whatever", now), now);
        state.set_suppression(now, 10.0);
        let mut tracker = EscalationTracker::from_config(&h.engine);

        let mut rng = StdRng::seed_from_u64(3);
        let plan = h
            .selector()
            .select(&mut state, &mut tracker, &StateDelta::default(), &mut rng, now)
            .await;
        assert_eq!(plan.reason, "post_speak_suppressed");
    }

    #[test]
    fn heated_room_with_several_speakers_allows_multi_target() {
        let now = Utc::now();
        let mut state = session(now);
        state.ingest(entry(1, 10, "a", now), now);
        state.ingest(entry(2, 11, "b", now), now);
        state.mood = Mood::Heated;
        assert_eq!(
            targeting(&state, Some(10), now, &EngineConfig::default()),
            Targeting::Multi
        );
        state.mood = Mood::Engaged;
        assert!(matches!(
            targeting(&state, Some(10), now, &EngineConfig::default()),
            Targeting::Single { .. }
        ));
    }
}

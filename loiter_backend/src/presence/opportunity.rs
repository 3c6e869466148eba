//! Organic reasons to speak when no priority trigger is pending.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::services::memory::{extract_keywords, MIN_QUERY_KEYWORDS};
use crate::services::MemoryRetriever;
use crate::transport::{MessageId, UserId};

use super::session::{secs_between, BufferedEntry, Classification, Mood, SessionState};

/// Freshness for opportunities that aren't tied to a message.
pub const UNTARGETED_FRESHNESS: f64 = 0.8;
const FRESHNESS_FLOOR: f64 = 0.1;

const MIN_BORED_ENERGY: f64 = 0.2;
const MIN_BORED_BUFFER: usize = 3;
const BORED_TARGET_MAX_AGE_SECS: f64 = 90.0;
const BORED_KEYWORD_ENTRIES: usize = 6;
const MEMORY_TOP_K: usize = 3;
const MEMORY_QUERY_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityKind {
    AdversaryEngagement,
    InterestingTopic,
    RandomEngagement,
    BoredInterjection,
    ImageReaction,
    ImageRoast,
    MemeReaction,
}

impl OpportunityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AdversaryEngagement => "adversary_engagement",
            Self::InterestingTopic => "interesting_topic",
            Self::RandomEngagement => "random_engagement",
            Self::BoredInterjection => "bored_interjection",
            Self::ImageReaction => "image_reaction",
            Self::ImageRoast => "image_roast",
            Self::MemeReaction => "meme_reaction",
        }
    }

    pub fn relevance(self) -> f64 {
        match self {
            Self::AdversaryEngagement => 0.7,
            Self::InterestingTopic => 0.5,
            Self::RandomEngagement => 0.3,
            Self::BoredInterjection => 0.7,
            Self::ImageReaction => 0.65,
            Self::ImageRoast => 0.8,
            Self::MemeReaction => 0.7,
        }
    }

    pub fn mood_fit(self, mood: Mood) -> f64 {
        // (dormant, engaged, heated, disengaged)
        let row = match self {
            Self::AdversaryEngagement => [0.4, 0.8, 0.9, 0.5],
            Self::InterestingTopic => [0.5, 0.8, 0.5, 0.6],
            Self::RandomEngagement => [0.3, 0.5, 0.3, 0.4],
            Self::BoredInterjection => [0.3, 0.5, 0.3, 0.9],
            Self::ImageReaction => [0.7, 0.85, 0.5, 0.65],
            Self::ImageRoast => [0.4, 0.8, 0.95, 0.5],
            Self::MemeReaction => [0.5, 0.7, 0.7, 0.6],
        };
        match mood {
            Mood::Dormant => row[0],
            Mood::Engaged => row[1],
            Mood::Heated => row[2],
            Mood::Disengaged => row[3],
        }
    }

    pub fn is_image(self) -> bool {
        matches!(self, Self::ImageReaction | Self::ImageRoast | Self::MemeReaction)
    }
}

impl std::fmt::Display for OpportunityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionOpportunity {
    pub kind: OpportunityKind,
    pub target_user: Option<UserId>,
    pub target_entry: Option<MessageId>,
    pub relevance: f64,
    pub mood_fit: f64,
    pub freshness: f64,
    pub memory_context: Option<String>,
}

impl ActionOpportunity {
    pub fn total_score(&self) -> f64 {
        self.relevance * self.mood_fit * self.freshness
    }
}

/// Exponential decay by entry age, floored so old entries never score zero.
pub fn freshness(age_secs: f64, half_life_secs: f64) -> f64 {
    if half_life_secs <= 0.0 {
        return FRESHNESS_FLOOR;
    }
    0.5f64
        .powf(age_secs.max(0.0) / half_life_secs)
        .max(FRESHNESS_FLOOR)
}

/// Scores exactly at the threshold are accepted.
pub fn accept(score: f64, threshold: f64) -> bool {
    score >= threshold
}

/// Highest-scoring candidate, if it clears `threshold`.
pub fn best_opportunity(
    opportunities: Vec<ActionOpportunity>,
    threshold: f64,
) -> Result<ActionOpportunity, Option<ActionOpportunity>> {
    let best = opportunities
        .into_iter()
        .max_by(|a, b| a.total_score().total_cmp(&b.total_score()));
    match best {
        Some(best) if accept(best.total_score(), threshold) => Ok(best),
        other => Err(other),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    Meme,
    Selfie,
    Food,
    Fashion,
    Travel,
    Product,
    Medical,
    Screenshot,
    Photo,
}

impl ImageKind {
    /// Read the leading `[TYPE]` tag of a description; untagged means photo.
    pub fn from_description(description: &str) -> Self {
        let tag = description
            .trim_start()
            .strip_prefix('[')
            .and_then(|rest| rest.split_once(']'))
            .map(|(tag, _)| tag.trim().to_ascii_lowercase());
        match tag.as_deref() {
            Some("meme") | Some("gif") => Self::Meme,
            Some("selfie") => Self::Selfie,
            Some("food") => Self::Food,
            Some("fashion") => Self::Fashion,
            Some("travel") => Self::Travel,
            Some("product") => Self::Product,
            Some("medical") => Self::Medical,
            Some("screenshot") => Self::Screenshot,
            _ => Self::Photo,
        }
    }

    /// Kinds worth pulling memory context for.
    pub fn is_topical(self) -> bool {
        matches!(
            self,
            Self::Selfie | Self::Food | Self::Fashion | Self::Travel | Self::Medical
        )
    }
}

/// Mood gate for reacting to someone's image.
pub fn image_mood_allows(mood: Mood, classification: Classification, is_focus_target: bool) -> bool {
    match mood {
        Mood::Dormant => true,
        Mood::Engaged | Mood::Disengaged => classification.is_priority() || is_focus_target,
        Mood::Heated => classification == Classification::Adversary,
    }
}

pub fn is_interesting(text: &str, keywords: &[String]) -> bool {
    let lower = text.to_lowercase();
    keywords
        .iter()
        .any(|k| !k.is_empty() && lower.contains(&k.to_lowercase()))
}

pub struct OpportunityScanner<'a> {
    pub engine: &'a EngineConfig,
    pub interesting_keywords: &'a [String],
    pub memory: &'a dyn MemoryRetriever,
    pub vision_enabled: bool,
}

impl<'a> OpportunityScanner<'a> {
    pub async fn scan<R: Rng>(
        &self,
        state: &SessionState,
        rng: &mut R,
        now: DateTime<Utc>,
    ) -> Vec<ActionOpportunity> {
        let engine = self.engine;
        let mood = state.mood;
        let focus_active =
            state.focus(now, engine.focus_window_secs).is_some() && mood.is_focused_mood();

        let mut opportunities = Vec::new();
        let skip = state.buffer().len().saturating_sub(engine.scan_window);

        for entry in state.buffer().iter().skip(skip) {
            if entry.is_agent
                || entry.age_secs(now) > engine.scan_max_age_secs
                || state.responded_to.contains(&entry.id)
            {
                continue;
            }

            let classification = state.classification_of(entry.author_id);
            let is_adversary = classification == Classification::Adversary;
            if !is_adversary
                && state.user_on_cooldown(entry.author_id, now, engine.user_cooldown_secs)
            {
                continue;
            }
            let is_focus_target =
                state.is_focus_target(entry.author_id, now, engine.focus_window_secs);
            if focus_active && classification == Classification::Neutral && !is_focus_target {
                continue;
            }

            if is_adversary {
                opportunities.push(self.targeted(OpportunityKind::AdversaryEngagement, entry, mood, now));
            }
            if is_interesting(&entry.text, self.interesting_keywords) {
                opportunities.push(self.targeted(OpportunityKind::InterestingTopic, entry, mood, now));
            }
            if !focus_active && rng.gen_bool(engine.random_engagement_chance.clamp(0.0, 1.0)) {
                opportunities.push(self.targeted(OpportunityKind::RandomEngagement, entry, mood, now));
            }

            if let Some(opp) = self
                .image_opportunity(entry, classification, is_focus_target, mood, now)
                .await
            {
                opportunities.push(opp);
            }
        }

        if let Some(opp) = self.bored_interjection(state, focus_active, now).await {
            opportunities.push(opp);
        }

        opportunities
    }

    fn targeted(
        &self,
        kind: OpportunityKind,
        entry: &BufferedEntry,
        mood: Mood,
        now: DateTime<Utc>,
    ) -> ActionOpportunity {
        ActionOpportunity {
            kind,
            target_user: Some(entry.author_id),
            target_entry: Some(entry.id),
            relevance: kind.relevance(),
            mood_fit: kind.mood_fit(mood),
            freshness: freshness(entry.age_secs(now), self.engine.freshness_half_life_secs),
            memory_context: None,
        }
    }

    async fn image_opportunity(
        &self,
        entry: &BufferedEntry,
        classification: Classification,
        is_focus_target: bool,
        mood: Mood,
        now: DateTime<Utc>,
    ) -> Option<ActionOpportunity> {
        if !self.vision_enabled {
            return None;
        }
        let description = entry.image_description.as_deref()?;
        if !image_mood_allows(mood, classification, is_focus_target) {
            return None;
        }

        let kind = ImageKind::from_description(description);
        if kind == ImageKind::Screenshot {
            return None;
        }

        let interesting = is_interesting(description, self.interesting_keywords);
        let opportunity_kind = if mood == Mood::Heated && classification == Classification::Adversary
        {
            OpportunityKind::ImageRoast
        } else if kind == ImageKind::Meme {
            OpportunityKind::MemeReaction
        } else if kind.is_topical() || classification.is_priority() || interesting {
            OpportunityKind::ImageReaction
        } else {
            return None;
        };

        let mut opp = self.targeted(opportunity_kind, entry, mood, now);
        if opportunity_kind == OpportunityKind::ImageReaction && (kind.is_topical() || interesting) {
            let query: String = description.chars().take(MEMORY_QUERY_CHARS).collect();
            let context = self.memory.retrieve(&query, MEMORY_TOP_K).await;
            if !context.is_empty() {
                opp.memory_context = Some(context);
            }
        }
        Some(opp)
    }

    /// At most one per interval, only while disengaged and unfocused.
    async fn bored_interjection(
        &self,
        state: &SessionState,
        focus_active: bool,
        now: DateTime<Utc>,
    ) -> Option<ActionOpportunity> {
        let engine = self.engine;
        let interval_elapsed = state
            .last_bored_interjection
            .map(|t| secs_between(t, now) > engine.bored_interjection_secs)
            .unwrap_or(true);
        if focus_active
            || state.mood != Mood::Disengaged
            || state.metrics.energy <= MIN_BORED_ENERGY
            || state.buffer().len() <= MIN_BORED_BUFFER
            || !interval_elapsed
        {
            return None;
        }

        let memory_context = self.buffer_memory(state).await;
        let target = memory_context.as_ref().and_then(|_| {
            state.buffer().iter().rev().find(|e| {
                !e.is_agent
                    && e.age_secs(now) < BORED_TARGET_MAX_AGE_SECS
                    && !state.responded_to.contains(&e.id)
            })
        });

        let kind = OpportunityKind::BoredInterjection;
        Some(ActionOpportunity {
            kind,
            target_user: target.map(|e| e.author_id),
            target_entry: target.map(|e| e.id),
            relevance: kind.relevance(),
            mood_fit: kind.mood_fit(state.mood),
            freshness: match target {
                Some(e) => freshness(e.age_secs(now), engine.freshness_half_life_secs),
                None => UNTARGETED_FRESHNESS,
            },
            memory_context,
        })
    }

    /// Memory lookup keyed on what the buffer has been talking about.
    async fn buffer_memory(&self, state: &SessionState) -> Option<String> {
        let skip = state.buffer().len().saturating_sub(BORED_KEYWORD_ENTRIES);
        let text = state
            .buffer()
            .iter()
            .skip(skip)
            .filter(|e| !e.is_agent)
            .map(|e| e.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let keywords = extract_keywords(&text, crate::services::memory::MAX_QUERY_KEYWORDS);
        if keywords.len() < MIN_QUERY_KEYWORDS {
            return None;
        }
        let context = self.memory.retrieve(&keywords.join(" "), MEMORY_TOP_K).await;
        (!context.is_empty()).then_some(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::session::tests::{entry, session};
    use crate::services::testing::FixedMemory;
    use crate::services::NullMemory;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn keywords() -> Vec<String> {
        vec!["coffee".to_string(), "album".to_string()]
    }

    fn scanner<'a>(
        engine: &'a EngineConfig,
        keywords: &'a [String],
        memory: &'a dyn MemoryRetriever,
    ) -> OpportunityScanner<'a> {
        OpportunityScanner {
            engine,
            interesting_keywords: keywords,
            memory,
            vision_enabled: true,
        }
    }

    fn opportunity(relevance: f64, mood_fit: f64, freshness: f64) -> ActionOpportunity {
        ActionOpportunity {
            kind: OpportunityKind::InterestingTopic,
            target_user: None,
            target_entry: None,
            relevance,
            mood_fit,
            freshness,
            memory_context: None,
        }
    }

    #[test]
    fn score_exactly_at_threshold_is_accepted() {
        let at = opportunity(0.9, 0.5, 1.0);
        assert!((at.total_score() - 0.45).abs() < 1e-12);
        assert!(accept(0.45, 0.45));
        assert!(!accept(0.45 - f64::EPSILON, 0.45));
        assert!(best_opportunity(vec![opportunity(1.0, 0.45, 1.0)], 0.45).is_ok());

        let below = opportunity(1.0, 0.45 - 1e-9, 1.0);
        match best_opportunity(vec![below], 0.45) {
            Err(Some(best)) => assert!(best.total_score() < 0.45),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn best_opportunity_picks_highest_score() {
        let picked = best_opportunity(
            vec![
                opportunity(0.5, 0.5, 1.0),
                opportunity(0.8, 0.95, 1.0),
                opportunity(0.7, 0.9, 0.9),
            ],
            0.45,
        )
        .expect("best accepted");
        assert!((picked.total_score() - 0.76).abs() < 1e-9);
        assert_eq!(best_opportunity(Vec::new(), 0.45), Err(None));
    }

    #[test]
    fn freshness_halves_every_half_life_with_floor() {
        assert!((freshness(0.0, 30.0) - 1.0).abs() < 1e-12);
        assert!((freshness(30.0, 30.0) - 0.5).abs() < 1e-12);
        assert!((freshness(60.0, 30.0) - 0.25).abs() < 1e-12);
        assert_eq!(freshness(600.0, 30.0), 0.1);
    }

    #[test]
    fn image_kind_parses_leading_tag() {
        assert_eq!(ImageKind::from_description("[MEME] cat"), ImageKind::Meme);
        assert_eq!(ImageKind::from_description("[Selfie] mirror"), ImageKind::Selfie);
        assert_eq!(ImageKind::from_description("a dog on a beach"), ImageKind::Photo);
        assert_eq!(ImageKind::from_description("[weird tag] x"), ImageKind::Photo);
        assert_eq!(ImageKind::from_description("[MEDICAL] pill box"), ImageKind::Medical);
        assert!(ImageKind::Medical.is_topical());
        assert!(!ImageKind::Product.is_topical());
    }

    #[test]
    fn image_mood_gate() {
        use Classification::*;
        assert!(image_mood_allows(Mood::Dormant, Neutral, false));
        assert!(!image_mood_allows(Mood::Engaged, Neutral, false));
        assert!(image_mood_allows(Mood::Engaged, Neutral, true));
        assert!(image_mood_allows(Mood::Disengaged, Ally, false));
        assert!(!image_mood_allows(Mood::Heated, Primary, false));
        assert!(image_mood_allows(Mood::Heated, Adversary, false));
    }

    #[tokio::test]
    async fn scan_skips_stale_answered_and_cooling_entries() {
        let engine = EngineConfig::default();
        let kw = keywords();
        let memory = NullMemory;
        let now = Utc::now();
        let mut state = session(now);

        state.ingest(entry(1, 10, "coffee is life", now - chrono::Duration::seconds(90)), now);
        state.ingest(entry(2, 11, "new album dropped", now), now);
        state.ingest(entry(3, 12, "coffee again", now), now);
        state.ingest(entry(4, 3, "whatever", now), now);
        state.responded_to.insert(2);
        state.last_response_to_user.insert(12, now - chrono::Duration::seconds(10));
        state.last_response_to_user.insert(3, now - chrono::Duration::seconds(10));

        let mut engine_no_random = engine.clone();
        engine_no_random.random_engagement_chance = 0.0;
        let mut rng = StdRng::seed_from_u64(4);
        let opps = scanner(&engine_no_random, &kw, &memory)
            .scan(&state, &mut rng, now)
            .await;

        // Only the adversary survives: it bypasses the per-user cooldown.
        assert_eq!(opps.len(), 1);
        assert_eq!(opps[0].kind, OpportunityKind::AdversaryEngagement);
        assert_eq!(opps[0].target_entry, Some(4));
    }

    #[tokio::test]
    async fn focused_scan_ignores_neutral_bystanders() {
        let mut engine = EngineConfig::default();
        engine.random_engagement_chance = 1.0;
        let kw = keywords();
        let memory = NullMemory;
        let now = Utc::now();
        let mut state = session(now);
        state.ingest(entry(1, 10, "coffee time", now), now);
        state.ingest(entry(2, 11, "coffee for me too", now), now);
        state.set_focus(10, now);
        state.mood = Mood::Engaged;

        let mut rng = StdRng::seed_from_u64(4);
        let opps = scanner(&engine, &kw, &memory).scan(&state, &mut rng, now).await;
        assert!(opps.iter().all(|o| o.target_user == Some(10)));
        assert!(opps.iter().all(|o| o.kind != OpportunityKind::RandomEngagement));
        assert_eq!(opps.len(), 1);
    }

    #[tokio::test]
    async fn image_opportunities_follow_kind_and_mood() {
        let engine = EngineConfig {
            random_engagement_chance: 0.0,
            ..EngineConfig::default()
        };
        let kw = keywords();
        let memory = FixedMemory("Relevant past messages from this chat:\n1. x\n".to_string());
        let now = Utc::now();
        let mut state = session(now);

        let mut meme = entry(1, 10, "", now);
        meme.image_description = Some("[MEME] dog in a hat".to_string());
        let mut shot = entry(2, 11, "", now);
        shot.image_description = Some("[SCREENSHOT] settings page".to_string());
        let mut food = entry(3, 12, "", now);
        food.image_description = Some("[FOOD] noodles".to_string());
        let mut plain = entry(4, 13, "", now);
        plain.image_description = Some("[PHOTO] a fence".to_string());
        for e in [meme, shot, food, plain] {
            state.ingest(e, now);
        }

        let mut rng = StdRng::seed_from_u64(4);
        let opps = scanner(&engine, &kw, &memory).scan(&state, &mut rng, now).await;
        let kinds: Vec<_> = opps.iter().map(|o| (o.target_entry, o.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (Some(1), OpportunityKind::MemeReaction),
                (Some(3), OpportunityKind::ImageReaction),
            ]
        );
        assert!(opps[1].memory_context.is_some());
    }

    #[tokio::test]
    async fn heated_adversary_image_becomes_roast() {
        let engine = EngineConfig {
            random_engagement_chance: 0.0,
            ..EngineConfig::default()
        };
        let kw = keywords();
        let memory = NullMemory;
        let now = Utc::now();
        let mut state = session(now);
        let mut pic = entry(1, 3, "", now);
        pic.image_description = Some("[MEME] something".to_string());
        state.ingest(pic, now);
        state.mood = Mood::Heated;

        let mut rng = StdRng::seed_from_u64(4);
        let opps = scanner(&engine, &kw, &memory).scan(&state, &mut rng, now).await;
        assert!(opps
            .iter()
            .any(|o| o.kind == OpportunityKind::ImageRoast && o.target_entry == Some(1)));
    }

    #[tokio::test]
    async fn bored_interjection_needs_disengaged_mood_and_interval() {
        let engine = EngineConfig {
            random_engagement_chance: 0.0,
            ..EngineConfig::default()
        };
        let kw = keywords();
        let memory = FixedMemory("Relevant past messages from this chat:\n1. x\n".to_string());
        let now = Utc::now();
        let mut state = session(now);
        for id in 0..4 {
            state.ingest(entry(id, 10, "weekend hiking trail plans", now), now);
        }
        state.mood = Mood::Disengaged;
        state.metrics.energy = 0.25;

        let mut rng = StdRng::seed_from_u64(4);
        let opps = scanner(&engine, &kw, &memory).scan(&state, &mut rng, now).await;
        let bored = opps
            .iter()
            .find(|o| o.kind == OpportunityKind::BoredInterjection)
            .expect("bored interjection offered");
        assert_eq!(bored.target_entry, Some(3));
        assert!(bored.memory_context.is_some());

        state.last_bored_interjection = Some(now - chrono::Duration::seconds(60));
        let opps = scanner(&engine, &kw, &memory).scan(&state, &mut rng, now).await;
        assert!(opps.iter().all(|o| o.kind != OpportunityKind::BoredInterjection));
    }
}

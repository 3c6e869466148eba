use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::SentimentScorer;

const NORMALIZATION_ALPHA: f64 = 15.0;
const NEGATION_SCALAR: f64 = -0.74;
const BOOSTER_INCREMENT: f64 = 0.293;

const POSITIVE: [(&str, f64); 24] = [
    ("love", 3.2),
    ("loved", 2.9),
    ("great", 3.1),
    ("good", 1.9),
    ("nice", 1.8),
    ("cool", 1.3),
    ("awesome", 3.1),
    ("amazing", 2.8),
    ("best", 3.2),
    ("fun", 2.3),
    ("funny", 1.9),
    ("cute", 2.0),
    ("happy", 2.7),
    ("thanks", 1.9),
    ("thank", 1.5),
    ("lol", 1.8),
    ("haha", 1.6),
    ("like", 1.5),
    ("beautiful", 2.9),
    ("smart", 1.7),
    ("sweet", 2.0),
    ("yay", 2.4),
    ("glad", 2.0),
    ("miss", 0.9),
];

const NEGATIVE: [(&str, f64); 22] = [
    ("hate", -2.7),
    ("bad", -2.5),
    ("awful", -2.0),
    ("terrible", -2.1),
    ("worst", -3.1),
    ("stupid", -2.4),
    ("dumb", -2.3),
    ("annoying", -1.7),
    ("boring", -1.3),
    ("ugly", -2.3),
    ("sad", -2.1),
    ("angry", -2.3),
    ("gross", -2.1),
    ("cringe", -1.8),
    ("useless", -1.8),
    ("pathetic", -2.6),
    ("lame", -1.8),
    ("trash", -1.5),
    ("weird", -0.7),
    ("sucks", -1.5),
    ("wrong", -2.1),
    ("fake", -2.1),
];

const BOOSTERS: [&str; 8] = [
    "very", "so", "really", "extremely", "super", "totally", "absolutely", "incredibly",
];
const NEGATIONS: [&str; 8] = [
    "not", "no", "never", "dont", "don't", "isnt", "isn't", "aint",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentimentLabel {
    Positive,
    Neutral,
    Negative,
}

impl SentimentLabel {
    pub fn from_compound(compound: f64) -> Self {
        if compound >= 0.05 {
            Self::Positive
        } else if compound <= -0.05 {
            Self::Negative
        } else {
            Self::Neutral
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Neutral => "neutral",
            Self::Negative => "negative",
        }
    }
}

/// Small valence lexicon with booster and negation handling.
pub struct LexiconSentiment {
    lexicon: HashMap<&'static str, f64>,
}

impl Default for LexiconSentiment {
    fn default() -> Self {
        Self {
            lexicon: POSITIVE.iter().chain(NEGATIVE.iter()).copied().collect(),
        }
    }
}

impl SentimentScorer for LexiconSentiment {
    fn score(&self, text: &str) -> f64 {
        let tokens: Vec<String> = text
            .split_whitespace()
            .map(|t| {
                t.trim_matches(|c: char| !c.is_alphanumeric() && c != '\'')
                    .to_lowercase()
            })
            .filter(|t| !t.is_empty())
            .collect();

        let mut sum = 0.0;
        for (i, token) in tokens.iter().enumerate() {
            let Some(&valence) = self.lexicon.get(token.as_str()) else {
                continue;
            };
            let mut value = valence;

            let window = &tokens[i.saturating_sub(3)..i];
            if window
                .last()
                .map(|prev| BOOSTERS.contains(&prev.as_str()))
                .unwrap_or(false)
            {
                value += BOOSTER_INCREMENT * valence.signum();
            }
            if window.iter().any(|prev| NEGATIONS.contains(&prev.as_str())) {
                value *= NEGATION_SCALAR;
            }
            sum += value;
        }

        let exclamations = text.matches('!').count().min(4) as f64;
        if sum != 0.0 {
            sum += exclamations * 0.292 * sum.signum();
        }

        if sum == 0.0 {
            0.0
        } else {
            (sum / (sum * sum + NORMALIZATION_ALPHA).sqrt()).clamp(-1.0, 1.0)
        }
    }
}

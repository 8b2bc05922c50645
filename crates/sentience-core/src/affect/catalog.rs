//! The fixed catalog of 35 emotions.
//!
//! Baselines and decay rates here are placeholder defaults; deployments replace them
//! through [`AffectTuning`](super::AffectTuning).

use serde::{Deserialize, Serialize};

/// Emotion family. Determines default decay and groups emotions in summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmotionCategory {
    Primary,
    Social,
    SelfReflective,
    Cognitive,
    Complex,
}

impl EmotionCategory {
    /// Default linear decay toward baseline, in intensity units per second.
    pub fn default_decay_rate(self) -> f32 {
        match self {
            EmotionCategory::Primary => 0.05,
            EmotionCategory::Social => 0.01,
            EmotionCategory::SelfReflective => 0.008,
            EmotionCategory::Cognitive => 0.02,
            EmotionCategory::Complex => 0.015,
        }
    }
}

/// Sign an emotion contributes to overall valence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    Positive,
    Negative,
    Neutral,
}

impl Polarity {
    pub fn sign(self) -> f32 {
        match self {
            Polarity::Positive => 1.0,
            Polarity::Negative => -1.0,
            Polarity::Neutral => 0.0,
        }
    }
}

/// Static description of one catalog entry.
#[derive(Debug, Clone, Copy)]
pub struct CatalogEntry {
    pub name: &'static str,
    pub category: EmotionCategory,
    pub polarity: Polarity,
    pub baseline: f32,
}

impl CatalogEntry {
    pub fn default_decay_rate(&self) -> f32 {
        self.category.default_decay_rate()
    }
}

const fn entry(name: &'static str, category: EmotionCategory, polarity: Polarity, baseline: f32) -> CatalogEntry {
    CatalogEntry {
        name,
        category,
        polarity,
        baseline,
    }
}

use EmotionCategory::*;
use Polarity::*;

/// Number of emotions in the catalog.
pub const EMOTION_COUNT: usize = 35;

/// Catalog order is stable; blend weights and snapshots follow it.
pub static CATALOG: [CatalogEntry; EMOTION_COUNT] = [
    // primary
    entry("joy", Primary, Positive, 0.1),
    entry("sadness", Primary, Negative, 0.0),
    entry("anger", Primary, Negative, 0.0),
    entry("fear", Primary, Negative, 0.0),
    entry("surprise", Primary, Neutral, 0.0),
    entry("disgust", Primary, Negative, 0.0),
    // social
    entry("gratitude", Social, Positive, 0.0),
    entry("affection", Social, Positive, 0.1),
    entry("loneliness", Social, Negative, 0.0),
    entry("empathy", Social, Positive, 0.2),
    entry("protective", Social, Neutral, 0.0),
    // self-reflective
    entry("pride", SelfReflective, Positive, 0.0),
    entry("shame", SelfReflective, Negative, 0.0),
    entry("guilt", SelfReflective, Negative, 0.0),
    entry("confidence", SelfReflective, Positive, 0.2),
    entry("doubt", SelfReflective, Negative, 0.0),
    entry("nostalgia", SelfReflective, Neutral, 0.0),
    entry("melancholy", SelfReflective, Negative, 0.0),
    // cognitive
    entry("curiosity", Cognitive, Positive, 0.2),
    entry("confusion", Cognitive, Negative, 0.0),
    entry("awe", Cognitive, Positive, 0.0),
    entry("inspiration", Cognitive, Positive, 0.0),
    entry("contemplative", Cognitive, Neutral, 0.1),
    entry("determination", Cognitive, Positive, 0.0),
    // complex
    entry("hope", Complex, Positive, 0.1),
    entry("disappointment", Complex, Negative, 0.0),
    entry("frustration", Complex, Negative, 0.0),
    entry("excitement", Complex, Positive, 0.0),
    entry("contentment", Complex, Positive, 0.3),
    entry("anxiety", Complex, Negative, 0.0),
    entry("satisfaction", Complex, Positive, 0.0),
    entry("overwhelmed", Complex, Negative, 0.0),
    entry("peaceful", Complex, Positive, 0.1),
    entry("playful", Complex, Positive, 0.0),
    entry("enthusiasm", Complex, Positive, 0.0),
];

/// Catalog position of `name`, or `None` when it is not a known emotion.
pub fn index_of(name: &str) -> Option<usize> {
    CATALOG.iter().position(|e| e.name == name)
}

pub fn lookup(name: &str) -> Option<&'static CatalogEntry> {
    CATALOG.iter().find(|e| e.name == name)
}

#[cfg(test)]
mod tests {
    use super::EmotionCategory::*;
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn catalog_names_are_unique() {
        let names: HashSet<_> = CATALOG.iter().map(|e| e.name).collect();
        assert_eq!(names.len(), EMOTION_COUNT);
    }

    #[test]
    fn defaults_respect_record_invariants() {
        for e in CATALOG.iter() {
            assert!((0.0..=1.0).contains(&e.baseline), "{} baseline", e.name);
            assert!(e.default_decay_rate() > 0.0, "{} decay", e.name);
        }
    }

    #[test]
    fn every_category_is_populated() {
        for cat in [Primary, Social, SelfReflective, Cognitive, Complex] {
            assert!(CATALOG.iter().any(|e| e.category == cat), "{:?} empty", cat);
        }
        assert_eq!(CATALOG.iter().filter(|e| e.category == Primary).count(), 6);
    }

    #[test]
    fn lookup_by_name() {
        assert_eq!(index_of("joy"), Some(0));
        assert!(lookup("contentment").is_some());
        assert!(lookup("ennui").is_none());
    }
}

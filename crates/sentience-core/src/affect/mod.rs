//! Affective state engine and its supporting tables.

mod catalog;
mod engine;
mod interaction;
mod timeline;
pub mod triggers;

pub use catalog::{index_of, lookup, CatalogEntry, EmotionCategory, Polarity, CATALOG, EMOTION_COUNT};
pub use engine::{
    ActiveEmotion, AffectiveEngine, AffectiveSnapshot, AffectiveSummary, BlendComponent, BlendedAffect,
    EmotionRecord, DEFAULT_ACTIVITY_EPSILON,
};
pub use interaction::{default_rules, AffectTuning, EmotionTuning, InteractionRule};
pub use timeline::{EmotionTimeline, TimelineEntry, DEFAULT_TIMELINE_CAPACITY};
pub use triggers::{Situation, Trigger};

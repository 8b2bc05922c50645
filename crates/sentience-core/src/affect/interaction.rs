//! Cross-emotion interaction rules and the tuning file that can replace them.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::catalog;
use crate::error::{SentienceError, SentienceResult};

fn default_threshold() -> f32 {
    0.2
}

/// Directed effect: when `source` sits above `threshold` after a trigger on it,
/// `target` receives `effect * raw_delta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRule {
    pub source: String,
    pub target: String,
    pub effect: f32,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
}

impl InteractionRule {
    pub fn new(source: &str, target: &str, effect: f32) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            effect,
            threshold: default_threshold(),
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }
}

/// Rule resolved to catalog indices. Built once when the engine is constructed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CompiledRule {
    pub source: usize,
    pub target: usize,
    pub effect: f32,
    pub threshold: f32,
}

pub(crate) fn compile(rules: &[InteractionRule]) -> SentienceResult<Vec<CompiledRule>> {
    rules
        .iter()
        .map(|r| {
            let source = catalog::index_of(&r.source).ok_or_else(|| SentienceError::UnknownEmotion(r.source.clone()))?;
            let target = catalog::index_of(&r.target).ok_or_else(|| SentienceError::UnknownEmotion(r.target.clone()))?;
            if source == target {
                return Err(SentienceError::Config(format!("interaction rule on {} targets itself", r.source)));
            }
            if !r.effect.is_finite() || !r.threshold.is_finite() {
                return Err(SentienceError::Config(format!(
                    "interaction rule {} -> {} has a non-finite parameter",
                    r.source, r.target
                )));
            }
            Ok(CompiledRule {
                source,
                target,
                effect: r.effect,
                threshold: r.threshold.clamp(0.0, 1.0),
            })
        })
        .collect()
}

/// Placeholder interaction table used when no tuning file supplies one.
pub fn default_rules() -> Vec<InteractionRule> {
    vec![
        InteractionRule::new("joy", "sadness", -0.5),
        InteractionRule::new("sadness", "joy", -0.5),
        InteractionRule::new("fear", "confidence", -0.4),
        InteractionRule::new("anger", "peaceful", -0.6),
        InteractionRule::new("anxiety", "peaceful", -0.5),
        InteractionRule::new("curiosity", "excitement", 0.3),
        InteractionRule::new("gratitude", "affection", 0.3),
        InteractionRule::new("frustration", "overwhelmed", 0.3).with_threshold(0.4),
        InteractionRule::new("confidence", "doubt", -0.5),
        InteractionRule::new("doubt", "confidence", -0.4),
        InteractionRule::new("awe", "inspiration", 0.4),
        InteractionRule::new("loneliness", "melancholy", 0.3),
        InteractionRule::new("pride", "shame", -0.5),
        InteractionRule::new("shame", "pride", -0.5),
        InteractionRule::new("hope", "disappointment", -0.3),
        InteractionRule::new("excitement", "enthusiasm", 0.3),
        InteractionRule::new("empathy", "protective", 0.2).with_threshold(0.5),
    ]
}

/// Per-emotion override of the catalog defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmotionTuning {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decay_rate: Option<f32>,
}

/// Domain tuning values: per-emotion baselines/decay and the interaction table.
///
/// Stored as TOML so an external tuner can rewrite it between runs:
///
/// ```toml
/// [emotions.joy]
/// baseline = 0.1
/// decay_rate = 0.05
///
/// [[interactions]]
/// source = "joy"
/// target = "sadness"
/// effect = -0.5
/// threshold = 0.2
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AffectTuning {
    #[serde(default)]
    pub emotions: HashMap<String, EmotionTuning>,
    /// Replaces the default rule table when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interactions: Option<Vec<InteractionRule>>,
}

impl AffectTuning {
    pub fn with_emotion(mut self, name: &str, baseline: f32, decay_rate: f32) -> Self {
        self.emotions.insert(
            name.to_string(),
            EmotionTuning {
                baseline: Some(baseline),
                decay_rate: Some(decay_rate),
            },
        );
        self
    }

    pub fn with_interactions(mut self, rules: Vec<InteractionRule>) -> Self {
        self.interactions = Some(rules);
        self
    }

    /// Effective rule table.
    pub fn rules(&self) -> Vec<InteractionRule> {
        self.interactions.clone().unwrap_or_else(default_rules)
    }

    pub fn from_toml_str(content: &str) -> SentienceResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Loads a tuning file. A missing file yields the defaults.
    pub fn load_from_path(path: &Path) -> SentienceResult<Self> {
        if !path.exists() {
            tracing::debug!(target: "sentience::affect", path = %path.display(), "no tuning file; using catalog defaults");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|e| SentienceError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    pub fn save_to_path(&self, path: &Path) -> SentienceResult<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| SentienceError::Config(e.to_string()))?;
        }
        fs::write(path, content).map_err(|e| SentienceError::Config(e.to_string()))?;
        Ok(())
    }
}

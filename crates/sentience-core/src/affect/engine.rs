//! Affective state engine: the 35-dimension emotion vector with decay, triggers and blending.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::catalog::{self, EmotionCategory, CATALOG, EMOTION_COUNT};
use super::interaction::{self, AffectTuning, CompiledRule};
use crate::clock::elapsed_between;
use crate::error::{invariant_violation, SentienceError, SentienceResult};

/// Intensities at or below this are treated as inactive.
pub const DEFAULT_ACTIVITY_EPSILON: f32 = 0.01;

/// How many active emotions a summary lists.
const SUMMARY_TOP_N: usize = 5;

// ---------------------------------------------------------------------------
// Records and snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionRecord {
    pub name: String,
    pub category: EmotionCategory,
    /// Always within [0, 1].
    pub intensity: f32,
    /// Resting intensity, within [0, 1].
    pub baseline: f32,
    /// Linear decay toward baseline per second. Strictly positive.
    pub decay_rate: f32,
    pub last_updated: DateTime<Utc>,
}

/// Full affective vector at a point in time; the unit of persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffectiveSnapshot {
    pub emotions: Vec<EmotionRecord>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveEmotion {
    pub name: String,
    pub category: EmotionCategory,
    pub intensity: f32,
}

/// Compact view of the vector handed to callers and prompts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffectiveSummary {
    pub dominant: Option<ActiveEmotion>,
    /// Intensity-weighted polarity in [-1, 1].
    pub valence: f32,
    pub active_count: usize,
    pub top: Vec<ActiveEmotion>,
}

impl AffectiveSummary {
    /// One-line description used in prompts and logs.
    pub fn describe(&self) -> String {
        match &self.dominant {
            Some(d) => {
                let others: Vec<String> = self
                    .top
                    .iter()
                    .skip(1)
                    .map(|e| format!("{} {:.2}", e.name, e.intensity))
                    .collect();
                if others.is_empty() {
                    format!("feeling {} ({:.2}), valence {:+.2}", d.name, d.intensity, self.valence)
                } else {
                    format!(
                        "feeling {} ({:.2}) with {}, valence {:+.2}",
                        d.name,
                        d.intensity,
                        others.join(", "),
                        self.valence
                    )
                }
            }
            None => "emotionally neutral".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlendComponent {
    pub name: String,
    pub weight: f32,
}

/// Normalized blend over the active emotions. Components sum to 1 when non-empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlendedAffect {
    pub components: Vec<BlendComponent>,
    /// True when the supplied weights were degenerate and equal weights were used.
    pub used_fallback: bool,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Exclusive owner of the emotion records and the interaction table.
///
/// Not internally synchronized: the orchestrator keeps it behind a single mutex so
/// triggers and decay ticks never interleave on a record.
#[derive(Debug, Clone)]
pub struct AffectiveEngine {
    records: Vec<EmotionRecord>,
    rules: Vec<CompiledRule>,
    strict: bool,
    epsilon: f32,
    /// Logical time the vector has been decayed up to.
    ticked_at: DateTime<Utc>,
}

impl AffectiveEngine {
    /// Builds the full catalog at baseline, applying `tuning` overrides.
    pub fn new(tuning: &AffectTuning, now: DateTime<Utc>) -> SentienceResult<Self> {
        let mut records: Vec<EmotionRecord> = CATALOG
            .iter()
            .map(|e| EmotionRecord {
                name: e.name.to_string(),
                category: e.category,
                intensity: e.baseline,
                baseline: e.baseline,
                decay_rate: e.default_decay_rate(),
                last_updated: now,
            })
            .collect();

        for (name, t) in &tuning.emotions {
            let idx = catalog::index_of(name).ok_or_else(|| SentienceError::UnknownEmotion(name.clone()))?;
            let record = &mut records[idx];
            if let Some(baseline) = t.baseline {
                if !(0.0..=1.0).contains(&baseline) {
                    invariant_violation(format!("baseline {} for {} outside [0,1]", baseline, name))?;
                }
                let baseline = if baseline.is_finite() { baseline.clamp(0.0, 1.0) } else { record.baseline };
                record.baseline = baseline;
                record.intensity = baseline;
            }
            if let Some(rate) = t.decay_rate {
                if rate > 0.0 && rate.is_finite() {
                    record.decay_rate = rate;
                } else {
                    invariant_violation(format!("decay rate {} for {} must be positive", rate, name))?;
                }
            }
        }

        let rules = interaction::compile(&tuning.rules())?;
        debug!(
            target: "sentience::affect",
            emotions = records.len(),
            rules = rules.len(),
            "affective engine initialized"
        );

        Ok(Self {
            records,
            rules,
            strict: false,
            epsilon: DEFAULT_ACTIVITY_EPSILON,
            ticked_at: now,
        })
    }

    /// Strict mode rejects unknown emotion names with `UnknownEmotion` instead of ignoring them.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_activity_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon.clamp(0.0, 1.0);
        self
    }

    pub fn records(&self) -> &[EmotionRecord] {
        &self.records
    }

    pub fn record(&self, name: &str) -> Option<&EmotionRecord> {
        catalog::index_of(name).map(|i| &self.records[i])
    }

    pub fn intensity(&self, name: &str) -> Option<f32> {
        self.record(name).map(|r| r.intensity)
    }

    pub fn ticked_at(&self) -> DateTime<Utc> {
        self.ticked_at
    }

    /// Adds `raw_delta` to `name`, resolves interactions in one summed pass, then clamps.
    ///
    /// Each rule whose source is the triggered emotion and whose source intensity after the
    /// delta exceeds the rule threshold contributes `effect * raw_delta` to its target.
    /// Contributions to the same target are summed before being applied.
    pub fn apply_trigger(&mut self, name: &str, raw_delta: f32) -> SentienceResult<()> {
        let Some(idx) = catalog::index_of(name) else {
            if self.strict {
                return Err(SentienceError::UnknownEmotion(name.to_string()));
            }
            debug!(target: "sentience::affect", emotion = name, "ignoring trigger for unknown emotion");
            return Ok(());
        };
        if !raw_delta.is_finite() {
            invariant_violation(format!("non-finite delta for {}", name))?;
            return Ok(());
        }

        let mut deltas = [0.0_f32; EMOTION_COUNT];
        deltas[idx] = raw_delta;

        let source_after = (self.records[idx].intensity + raw_delta).clamp(0.0, 1.0);
        for rule in self.rules.iter().filter(|r| r.source == idx) {
            if source_after > rule.threshold {
                deltas[rule.target] += rule.effect * raw_delta;
            }
        }

        let at = self.ticked_at;
        for (record, delta) in self.records.iter_mut().zip(deltas.iter()) {
            if *delta != 0.0 {
                record.intensity = (record.intensity + delta).clamp(0.0, 1.0);
                record.last_updated = at;
            }
        }
        Ok(())
    }

    /// Applies a batch of `(emotion, delta)` triggers in order.
    pub fn apply_triggers<'a, I>(&mut self, triggers: I) -> SentienceResult<()>
    where
        I: IntoIterator<Item = (&'a str, f32)>,
    {
        for (name, delta) in triggers {
            self.apply_trigger(name, delta)?;
        }
        Ok(())
    }

    /// Moves every record toward its baseline by `decay_rate * elapsed`, never past it.
    pub fn tick(&mut self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        self.ticked_at += chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        let at = self.ticked_at;
        for record in &mut self.records {
            let step = (f64::from(record.decay_rate) * secs) as f32;
            record.intensity = if record.intensity > record.baseline {
                (record.intensity - step).max(record.baseline)
            } else {
                (record.intensity + step).min(record.baseline)
            };
            record.last_updated = at;
        }
    }

    /// Decays up to `now`. No-op when `now` is not after the last tick.
    pub fn advance_to(&mut self, now: DateTime<Utc>) {
        let elapsed = elapsed_between(self.ticked_at, now);
        if !elapsed.is_zero() {
            self.tick(elapsed);
        }
    }

    fn active_indices(&self) -> Vec<usize> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.intensity > self.epsilon)
            .map(|(i, _)| i)
            .collect()
    }

    /// Active emotions, strongest first. Ties keep catalog order.
    pub fn active_emotions(&self) -> Vec<ActiveEmotion> {
        let mut active: Vec<ActiveEmotion> = self
            .active_indices()
            .into_iter()
            .map(|i| {
                let r = &self.records[i];
                ActiveEmotion {
                    name: r.name.clone(),
                    category: r.category,
                    intensity: r.intensity,
                }
            })
            .collect();
        active.sort_by(|a, b| b.intensity.total_cmp(&a.intensity));
        active
    }

    /// Blends the active emotions (catalog order) with externally supplied `weights`.
    ///
    /// Weights must match the active count and be finite, non-negative and not all zero;
    /// otherwise an equal-weight blend is returned.
    pub fn blend(&self, weights: &[f32]) -> BlendedAffect {
        let active = self.active_indices();
        if active.is_empty() {
            return BlendedAffect {
                components: Vec::new(),
                used_fallback: false,
            };
        }

        let usable = weights.len() == active.len()
            && weights.iter().all(|w| w.is_finite() && *w >= 0.0)
            && weights.iter().any(|w| *w > 0.0);
        if !usable {
            debug!(
                target: "sentience::affect",
                supplied = weights.len(),
                active = active.len(),
                "degenerate blend weights; using equal weights"
            );
        }

        let raw: Vec<f32> = active
            .iter()
            .enumerate()
            .map(|(k, &i)| {
                let w = if usable { weights[k] } else { 1.0 };
                w * self.records[i].intensity
            })
            .collect();
        let total: f32 = raw.iter().sum();

        let components = active
            .iter()
            .zip(raw.iter())
            .map(|(&i, v)| BlendComponent {
                name: self.records[i].name.clone(),
                weight: if total > 0.0 { v / total } else { 0.0 },
            })
            .collect();

        BlendedAffect {
            components,
            used_fallback: !usable,
        }
    }

    pub fn summary(&self) -> AffectiveSummary {
        let active = self.active_emotions();
        let (signed, total) = active.iter().fold((0.0_f32, 0.0_f32), |(s, t), e| {
            let polarity = catalog::lookup(&e.name).map(|c| c.polarity.sign()).unwrap_or(0.0);
            (s + polarity * e.intensity, t + e.intensity)
        });
        let valence = if total > 0.0 { (signed / total).clamp(-1.0, 1.0) } else { 0.0 };
        AffectiveSummary {
            dominant: active.first().cloned(),
            valence,
            active_count: active.len(),
            top: active.into_iter().take(SUMMARY_TOP_N).collect(),
        }
    }

    pub fn snapshot(&self) -> AffectiveSnapshot {
        AffectiveSnapshot {
            emotions: self.records.clone(),
            captured_at: self.ticked_at,
        }
    }

    /// Loads intensities from `snapshot`, then decays once across the gap to `now`.
    ///
    /// Baselines and decay rates stay as configured; the snapshot only supplies intensities.
    /// Records missing from the snapshot keep their current value. The restore is all or
    /// nothing: a rejected snapshot leaves the engine untouched.
    pub fn restore(&mut self, snapshot: &AffectiveSnapshot, now: DateTime<Utc>) -> SentienceResult<()> {
        let mut intensities: Vec<f32> = self.records.iter().map(|r| r.intensity).collect();
        for saved in &snapshot.emotions {
            let Some(idx) = catalog::index_of(&saved.name) else {
                if self.strict {
                    return Err(SentienceError::UnknownEmotion(saved.name.clone()));
                }
                warn!(target: "sentience::affect", emotion = %saved.name, "snapshot holds unknown emotion; skipped");
                continue;
            };
            let mut value = saved.intensity;
            if !(0.0..=1.0).contains(&value) {
                invariant_violation(format!("snapshot intensity {} for {} outside [0,1]", value, saved.name))?;
                value = if value.is_finite() { value.clamp(0.0, 1.0) } else { self.records[idx].baseline };
            }
            intensities[idx] = value;
        }

        for (record, value) in self.records.iter_mut().zip(intensities) {
            record.intensity = value;
            record.last_updated = snapshot.captured_at;
        }
        self.ticked_at = snapshot.captured_at;
        if now < snapshot.captured_at {
            warn!(
                target: "sentience::affect",
                captured_at = %snapshot.captured_at,
                now = %now,
                "snapshot is from the future; skipping catch-up decay"
            );
        }
        self.advance_to(now);
        debug!(
            target: "sentience::affect",
            captured_at = %snapshot.captured_at,
            catch_up_secs = elapsed_between(snapshot.captured_at, now).as_secs(),
            "affective snapshot restored"
        );
        Ok(())
    }

    /// Returns every record to its baseline.
    pub fn reset(&mut self) {
        let at = self.ticked_at;
        for record in &mut self.records {
            record.intensity = record.baseline;
            record.last_updated = at;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affect::InteractionRule;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn engine() -> AffectiveEngine {
        AffectiveEngine::new(&AffectTuning::default(), t0()).unwrap()
    }

    #[test]
    fn starts_at_baseline() {
        let e = engine();
        assert_eq!(e.records().len(), EMOTION_COUNT);
        for r in e.records() {
            assert_eq!(r.intensity, r.baseline);
        }
    }

    #[test]
    fn trigger_spreads_to_interaction_targets() {
        let mut e = engine();
        e.apply_trigger("sadness", 0.4).unwrap();
        e.apply_trigger("joy", 0.5).unwrap();
        // joy -> sadness -0.5 * 0.5
        assert!((e.intensity("sadness").unwrap() - 0.15).abs() < 1e-6);
        assert!((e.intensity("joy").unwrap() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn interaction_needs_source_above_threshold() {
        let tuning = AffectTuning::default()
            .with_emotion("joy", 0.0, 0.05)
            .with_interactions(vec![InteractionRule::new("joy", "sadness", -1.0).with_threshold(0.5)]);
        let mut e = AffectiveEngine::new(&tuning, t0()).unwrap();
        e.apply_trigger("sadness", 0.5).unwrap();
        e.apply_trigger("joy", 0.3).unwrap();
        assert_eq!(e.intensity("sadness"), Some(0.5));
    }

    #[test]
    fn summed_effects_do_not_depend_on_rule_order() {
        let rules = vec![
            InteractionRule::new("curiosity", "excitement", 0.5),
            InteractionRule::new("curiosity", "excitement", -0.2),
            InteractionRule::new("curiosity", "confusion", 0.1),
        ];
        let mut reversed = rules.clone();
        reversed.reverse();
        let mut a = AffectiveEngine::new(&AffectTuning::default().with_interactions(rules), t0()).unwrap();
        let mut b = AffectiveEngine::new(&AffectTuning::default().with_interactions(reversed), t0()).unwrap();
        a.apply_trigger("curiosity", 0.6).unwrap();
        b.apply_trigger("curiosity", 0.6).unwrap();
        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn unknown_emotion_is_ignored_unless_strict() {
        let mut e = engine();
        let before = e.snapshot();
        e.apply_trigger("ennui", 0.5).unwrap();
        assert_eq!(e.snapshot(), before);

        let mut strict = engine().with_strict(true);
        let err = strict.apply_trigger("ennui", 0.5).unwrap_err();
        assert!(matches!(err, SentienceError::UnknownEmotion(_)));
    }

    #[test]
    fn tick_moves_below_baseline_records_up() {
        let mut e = engine();
        e.apply_trigger("contentment", -0.3).unwrap();
        assert_eq!(e.intensity("contentment"), Some(0.0));
        e.tick(Duration::from_secs(10));
        let c = e.intensity("contentment").unwrap();
        assert!((c - 0.15).abs() < 1e-5);
        e.tick(Duration::from_secs(1000));
        assert_eq!(e.intensity("contentment"), Some(0.3));
    }

    #[test]
    fn advance_to_ignores_past_instants() {
        let mut e = engine();
        e.apply_trigger("anger", 0.5).unwrap();
        e.advance_to(t0() - chrono::Duration::seconds(30));
        assert_eq!(e.intensity("anger"), Some(0.5));
        assert_eq!(e.ticked_at(), t0());
    }

    #[test]
    fn blend_with_weights_is_normalized() {
        let mut e = engine();
        e.apply_trigger("awe", 0.5).unwrap();
        let active = e.active_emotions().len();
        let weights: Vec<f32> = (1..=active).map(|w| w as f32).collect();
        let blended = e.blend(&weights);
        let sum: f32 = blended.components.iter().map(|c| c.weight).sum();
        assert_eq!(blended.components.len(), active);
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(!blended.used_fallback);
    }

    #[test]
    fn degenerate_blend_weights_fall_back_to_equal() {
        let e = engine();
        let active = e.active_emotions().len();
        assert!(active > 0);
        let zeros = e.blend(&vec![0.0; active]);
        let wrong_len = e.blend(&[1.0]);
        assert!(zeros.used_fallback);
        assert!(wrong_len.used_fallback);
        assert_eq!(zeros, wrong_len);
    }

    #[test]
    fn blend_of_neutral_vector_is_empty() {
        let tuning = AffectTuning {
            emotions: CATALOG
                .iter()
                .map(|c| {
                    (
                        c.name.to_string(),
                        crate::affect::EmotionTuning {
                            baseline: Some(0.0),
                            decay_rate: None,
                        },
                    )
                })
                .collect(),
            interactions: None,
        };
        let e = AffectiveEngine::new(&tuning, t0()).unwrap();
        assert!(e.blend(&[]).components.is_empty());
        assert!(e.summary().dominant.is_none());
        assert_eq!(e.summary().valence, 0.0);
    }

    #[test]
    fn summary_reports_dominant_and_valence() {
        let mut e = engine();
        e.apply_trigger("frustration", 0.9).unwrap();
        let s = e.summary();
        assert_eq!(s.dominant.as_ref().map(|d| d.name.as_str()), Some("frustration"));
        assert!(s.top.len() <= SUMMARY_TOP_N);
        assert!(s.describe().starts_with("feeling frustration"));
    }

    #[test]
    fn restore_rejects_out_of_range_snapshot_in_debug() {
        let mut e = engine();
        let mut snap = e.snapshot();
        snap.emotions[0].intensity = 1.7;
        let before = e.snapshot();
        let result = e.restore(&snap, t0());
        if cfg!(debug_assertions) {
            assert!(matches!(result, Err(SentienceError::InvariantViolation(_))));
            assert_eq!(e.snapshot(), before);
        } else {
            assert!(result.is_ok());
            assert_eq!(e.intensity("joy"), Some(1.0));
        }
    }

    #[test]
    fn non_positive_decay_rate_is_an_invariant_violation() {
        let tuning = AffectTuning::default().with_emotion("joy", 0.1, 0.0);
        let result = AffectiveEngine::new(&tuning, t0());
        if cfg!(debug_assertions) {
            assert!(matches!(result, Err(SentienceError::InvariantViolation(_))));
        } else {
            assert!(result.unwrap().record("joy").unwrap().decay_rate > 0.0);
        }
    }

    #[test]
    fn reset_returns_to_baseline() {
        let mut e = engine();
        e.apply_trigger("fear", 0.8).unwrap();
        e.reset();
        assert_eq!(e.intensity("fear"), Some(0.0));
    }
}

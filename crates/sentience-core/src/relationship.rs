//! Relationship metrics with the user, and the proactive outreach rules built on them.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{elapsed_between, fixed_offset};

const STREAK_WINDOW_SECS: u64 = 24 * 3600;
const COMMITMENT_KEPT_TRUST: f32 = 0.2;
const COMMITMENT_BROKEN_TRUST: f32 = 0.4;

const MILESTONES: &[(u64, &str)] = &[
    (10, "First 10 conversations"),
    (50, "50 conversations"),
    (100, "100 conversations"),
    (250, "250 conversations - strong bond"),
    (500, "500 conversations - deep connection"),
    (1000, "1000 conversations - unbreakable bond"),
];

fn default_level() -> f32 {
    5.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub label: String,
    pub reached_at: DateTime<Utc>,
    pub interaction_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipDepth {
    Stranger,
    Acquaintance,
    Friend,
    CloseFriend,
    Companion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipMetrics {
    #[serde(default)]
    pub total_interactions: u64,
    /// 1..=10
    #[serde(default = "default_level")]
    pub rapport: f32,
    /// 1..=10
    #[serde(default = "default_level")]
    pub trust: f32,
    #[serde(default)]
    pub conversation_streak: u32,
    #[serde(default)]
    pub last_interaction: Option<DateTime<Utc>>,
    #[serde(default)]
    pub milestones: Vec<Milestone>,
}

impl Default for RelationshipMetrics {
    fn default() -> Self {
        Self {
            total_interactions: 0,
            rapport: default_level(),
            trust: default_level(),
            conversation_streak: 0,
            last_interaction: None,
            milestones: Vec::new(),
        }
    }
}

impl RelationshipMetrics {
    /// Records one completed turn. `valence` is the turn's affective valence in [-1, 1].
    /// Returns the label of a milestone reached by this interaction, if any.
    pub fn record_interaction(&mut self, valence: f32, at: DateTime<Utc>) -> Option<String> {
        self.total_interactions += 1;

        if valence > 0.3 {
            self.rapport = (self.rapport + 0.1).min(10.0);
            self.trust = (self.trust + 0.05).min(10.0);
        } else if valence < -0.3 {
            self.rapport = (self.rapport - 0.05).max(1.0);
            self.trust = (self.trust - 0.05).max(1.0);
        }

        self.conversation_streak = match self.last_interaction {
            Some(last) if elapsed_between(last, at).as_secs() < STREAK_WINDOW_SECS => self.conversation_streak + 1,
            _ => 1,
        };
        self.last_interaction = Some(at);

        let reached = MILESTONES
            .iter()
            .find(|(n, label)| self.total_interactions >= *n && !self.milestones.iter().any(|m| m.label == *label))
            .map(|(_, label)| label.to_string());
        if let Some(label) = &reached {
            self.milestones.push(Milestone {
                label: label.clone(),
                reached_at: at,
                interaction_count: self.total_interactions,
            });
        }
        reached
    }

    /// Keeping a commitment builds trust; breaking one costs more than keeping one earns.
    pub fn record_commitment(&mut self, kept: bool) {
        self.trust = if kept {
            (self.trust + COMMITMENT_KEPT_TRUST).min(10.0)
        } else {
            (self.trust - COMMITMENT_BROKEN_TRUST).max(1.0)
        };
    }

    pub fn depth(&self) -> RelationshipDepth {
        match self.total_interactions {
            0..=4 => RelationshipDepth::Stranger,
            5..=24 => RelationshipDepth::Acquaintance,
            25..=99 => RelationshipDepth::Friend,
            100..=299 => RelationshipDepth::CloseFriend,
            _ => RelationshipDepth::Companion,
        }
    }

    pub fn hours_since_last(&self, now: DateTime<Utc>) -> Option<f64> {
        self.last_interaction.map(|last| elapsed_between(last, now).as_secs_f64() / 3600.0)
    }
}

// ---------------------------------------------------------------------------
// Proactive outreach
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProactiveConfig {
    pub greeting_start_hour: u32,
    pub greeting_end_hour: u32,
    pub check_in_after_hours: f64,
    pub utc_offset_hours: i32,
}

impl Default for ProactiveConfig {
    fn default() -> Self {
        Self {
            greeting_start_hour: 6,
            greeting_end_hour: 11,
            check_in_after_hours: 6.0,
            utc_offset_hours: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutreachKind {
    Greeting,
    CheckIn,
}

/// When the agent last reached out unprompted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProactiveState {
    pub last_greeting: Option<DateTime<Utc>>,
    pub last_check_in: Option<DateTime<Utc>>,
}

impl ProactiveState {
    /// Decides whether to reach out now. Greetings win over check-ins.
    ///
    /// Greeting: once per local day, inside the morning window, and only for someone the
    /// agent has talked to before. Check-in: both the last interaction and the last
    /// check-in are at least `check_in_after_hours` old.
    pub fn due(&self, metrics: &RelationshipMetrics, config: &ProactiveConfig, now: DateTime<Utc>) -> Option<OutreachKind> {
        let offset = fixed_offset(config.utc_offset_hours);
        let local = now.with_timezone(&offset);
        let hour = local.hour();

        if metrics.total_interactions > 0 && (config.greeting_start_hour..config.greeting_end_hour).contains(&hour) {
            let greeted_today = self
                .last_greeting
                .map(|g| g.with_timezone(&offset).date_naive() == local.date_naive())
                .unwrap_or(false);
            if !greeted_today {
                return Some(OutreachKind::Greeting);
            }
        }

        let quiet_long_enough = metrics
            .hours_since_last(now)
            .map(|h| h >= config.check_in_after_hours)
            .unwrap_or(false);
        let not_recently_checked = self
            .last_check_in
            .map(|c| elapsed_between(c, now).as_secs_f64() / 3600.0 >= config.check_in_after_hours)
            .unwrap_or(true);
        if quiet_long_enough && not_recently_checked {
            return Some(OutreachKind::CheckIn);
        }
        None
    }

    pub fn mark(&mut self, kind: OutreachKind, at: DateTime<Utc>) {
        match kind {
            OutreachKind::Greeting => self.last_greeting = Some(at),
            OutreachKind::CheckIn => self.last_check_in = Some(at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 10, h, 0, 0).unwrap()
    }

    #[test]
    fn positive_turns_build_rapport_and_streak() {
        let mut m = RelationshipMetrics::default();
        m.record_interaction(0.8, at(9));
        m.record_interaction(0.8, at(10));
        assert_eq!(m.conversation_streak, 2);
        assert!(m.rapport > 5.0);
        assert_eq!(m.total_interactions, 2);
    }

    #[test]
    fn long_gap_resets_streak() {
        let mut m = RelationshipMetrics::default();
        m.record_interaction(0.0, at(9));
        m.record_interaction(0.0, at(9) + chrono::Duration::days(2));
        assert_eq!(m.conversation_streak, 1);
    }

    #[test]
    fn levels_stay_in_range() {
        let mut m = RelationshipMetrics::default();
        for i in 0..500 {
            m.record_interaction(-1.0, at(0) + chrono::Duration::minutes(i));
        }
        assert_eq!(m.rapport, 1.0);
        assert_eq!(m.trust, 1.0);
    }

    #[test]
    fn milestone_reported_once() {
        let mut m = RelationshipMetrics::default();
        let mut hits = Vec::new();
        for i in 0..12 {
            if let Some(label) = m.record_interaction(0.0, at(0) + chrono::Duration::minutes(i)) {
                hits.push(label);
            }
        }
        assert_eq!(hits, vec!["First 10 conversations".to_string()]);
        assert_eq!(m.depth(), RelationshipDepth::Acquaintance);
    }

    #[test]
    fn commitments_move_trust_within_range() {
        let mut m = RelationshipMetrics::default();
        m.record_commitment(true);
        assert!((m.trust - 5.2).abs() < 1e-5);
        m.record_commitment(false);
        assert!((m.trust - 4.8).abs() < 1e-5);
        for _ in 0..50 {
            m.record_commitment(false);
        }
        assert_eq!(m.trust, 1.0);
    }

    #[test]
    fn greeting_once_per_morning() {
        let mut m = RelationshipMetrics::default();
        m.record_interaction(0.5, at(7) - chrono::Duration::days(1));
        let cfg = ProactiveConfig::default();
        let mut state = ProactiveState::default();
        assert_eq!(state.due(&m, &cfg, at(7)), Some(OutreachKind::Greeting));
        state.mark(OutreachKind::Greeting, at(7));
        // greeting done; a day of silence now calls for a check-in instead
        assert_eq!(state.due(&m, &cfg, at(8)), Some(OutreachKind::CheckIn));
        state.mark(OutreachKind::CheckIn, at(8));
        assert_eq!(state.due(&m, &cfg, at(9)), None);
    }

    #[test]
    fn no_outreach_to_strangers() {
        let m = RelationshipMetrics::default();
        assert_eq!(ProactiveState::default().due(&m, &ProactiveConfig::default(), at(8)), None);
    }
}

//! Commitments the agent made: promises, follow-ups and its own goals.
//!
//! The ledger is persisted under its own session key. Keeping or breaking a commitment
//! moves trust; overdue ones are swept by the proactive cycle.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Resolved commitments kept for context; unresolved ones are never dropped.
const RESOLVED_KEPT: usize = 50;
const MAX_CONTENT_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitmentKind {
    /// "I'll help you with X"
    Explicit,
    /// "Let's talk about Y later"
    Implicit,
    SelfCommitment,
    /// "I should check on Z"
    FollowUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitmentStatus {
    Pending,
    Overdue,
    Fulfilled,
    Broken,
}

impl CommitmentStatus {
    pub fn is_open(self) -> bool {
        matches!(self, CommitmentStatus::Pending | CommitmentStatus::Overdue)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commitment {
    pub id: Uuid,
    pub content: String,
    pub kind: CommitmentKind,
    pub status: CommitmentStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub due_by: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    /// 1..=10
    pub priority: u8,
}

/// A commitment found in free text, not yet recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedCommitment {
    pub content: String,
    pub kind: CommitmentKind,
    pub priority: u8,
    /// The text names "tomorrow".
    pub due_tomorrow: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitmentLedger {
    #[serde(default)]
    pub commitments: Vec<Commitment>,
    #[serde(default)]
    pub kept: u64,
    #[serde(default)]
    pub broken: u64,
}

impl CommitmentLedger {
    pub fn make(
        &mut self,
        content: &str,
        kind: CommitmentKind,
        due_by: Option<DateTime<Utc>>,
        priority: u8,
        now: DateTime<Utc>,
    ) -> Commitment {
        let commitment = Commitment {
            id: Uuid::new_v4(),
            content: content.trim().chars().take(MAX_CONTENT_CHARS).collect(),
            kind,
            status: CommitmentStatus::Pending,
            created_at: now,
            due_by,
            resolved_at: None,
            priority: priority.clamp(1, 10),
        };
        self.commitments.push(commitment.clone());
        commitment
    }

    /// Marks the first open commitment whose content contains `needle` as kept.
    pub fn fulfil(&mut self, needle: &str, now: DateTime<Utc>) -> Option<Commitment> {
        let resolved = self.resolve(needle, CommitmentStatus::Fulfilled, now)?;
        self.kept += 1;
        Some(resolved)
    }

    /// Marks the first open commitment whose content contains `needle` as broken.
    pub fn break_commitment(&mut self, needle: &str, now: DateTime<Utc>) -> Option<Commitment> {
        let resolved = self.resolve(needle, CommitmentStatus::Broken, now)?;
        self.broken += 1;
        Some(resolved)
    }

    fn resolve(&mut self, needle: &str, status: CommitmentStatus, now: DateTime<Utc>) -> Option<Commitment> {
        let needle = needle.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }
        let found = self
            .commitments
            .iter_mut()
            .find(|c| c.status.is_open() && c.content.to_lowercase().contains(&needle))?;
        found.status = status;
        found.resolved_at = Some(now);
        let resolved = found.clone();
        self.prune();
        Some(resolved)
    }

    /// Open commitments, highest priority first, oldest first within a priority.
    pub fn open(&self) -> Vec<&Commitment> {
        let mut open: Vec<&Commitment> = self.commitments.iter().filter(|c| c.status.is_open()).collect();
        open.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        open
    }

    /// Flags pending commitments past their due time as overdue and returns the newly flagged.
    pub fn sweep_overdue(&mut self, now: DateTime<Utc>) -> Vec<Commitment> {
        self.commitments
            .iter_mut()
            .filter(|c| c.status == CommitmentStatus::Pending && c.due_by.is_some_and(|due| now > due))
            .map(|c| {
                c.status = CommitmentStatus::Overdue;
                c.clone()
            })
            .collect()
    }

    /// Share of resolved commitments that were kept; `None` before any resolved.
    pub fn reliability(&self) -> Option<f32> {
        let resolved = self.kept + self.broken;
        (resolved > 0).then(|| self.kept as f32 / resolved as f32)
    }

    fn prune(&mut self) {
        let resolved = self.commitments.iter().filter(|c| !c.status.is_open()).count();
        let mut excess = resolved.saturating_sub(RESOLVED_KEPT);
        self.commitments.retain(|c| {
            if excess > 0 && !c.status.is_open() {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

static EXPLICIT: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)\b(i'll|i will|i promise)\b[^.!?\n]*").ok());
static IMPLICIT: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)\b(let's talk about|we should discuss|remind me|we'll come back to)\b[^.!?\n]*").ok());
static TOMORROW: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?i)\btomorrow\b").ok());

/// Finds the first commitment phrase in `text`. Explicit phrasing wins over implicit.
pub fn detect(text: &str) -> Option<DetectedCommitment> {
    let (found, kind, priority) = [(&EXPLICIT, CommitmentKind::Explicit, 7), (&IMPLICIT, CommitmentKind::Implicit, 5)]
        .into_iter()
        .find_map(|(re, kind, priority)| {
            re.iter()
                .find_map(|re| re.find(text))
                .map(|m| (m.as_str(), kind, priority))
        })?;
    Some(DetectedCommitment {
        content: found.trim().to_string(),
        kind,
        priority,
        due_tomorrow: TOMORROW.iter().any(|re| re.is_match(found)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, h, 0, 0).unwrap()
    }

    #[test]
    fn fulfil_and_break_update_counts() {
        let mut ledger = CommitmentLedger::default();
        ledger.make("help you debug the parser", CommitmentKind::Explicit, None, 8, at(9));
        ledger.make("ask about the interview", CommitmentKind::FollowUp, None, 5, at(9));

        let kept = ledger.fulfil("Debug the parser", at(10)).unwrap();
        assert_eq!(kept.status, CommitmentStatus::Fulfilled);
        assert_eq!(kept.resolved_at, Some(at(10)));
        // already resolved: not matched twice
        assert!(ledger.fulfil("debug the parser", at(11)).is_none());

        ledger.break_commitment("interview", at(12)).unwrap();
        assert_eq!((ledger.kept, ledger.broken), (1, 1));
        assert_eq!(ledger.reliability(), Some(0.5));
        assert!(ledger.open().is_empty());
    }

    #[test]
    fn sweep_flags_each_overdue_commitment_once() {
        let mut ledger = CommitmentLedger::default();
        ledger.make("send the summary", CommitmentKind::Explicit, Some(at(12)), 5, at(9));
        ledger.make("someday", CommitmentKind::SelfCommitment, None, 5, at(9));

        assert!(ledger.sweep_overdue(at(11)).is_empty());
        let overdue = ledger.sweep_overdue(at(13));
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].content, "send the summary");
        assert!(ledger.sweep_overdue(at(14)).is_empty());
        // overdue stays open and can still be kept
        assert!(ledger.fulfil("summary", at(15)).is_some());
    }

    #[test]
    fn open_orders_by_priority() {
        let mut ledger = CommitmentLedger::default();
        ledger.make("low", CommitmentKind::Implicit, None, 2, at(8));
        ledger.make("high", CommitmentKind::Explicit, None, 9, at(9));
        let order: Vec<_> = ledger.open().iter().map(|c| c.content.as_str()).collect();
        assert_eq!(order, vec!["high", "low"]);
    }

    #[test]
    fn resolved_history_is_bounded() {
        let mut ledger = CommitmentLedger::default();
        ledger.make("still open", CommitmentKind::Explicit, None, 5, at(0));
        for i in 0..(RESOLVED_KEPT + 10) {
            let content = format!("task {}", i);
            ledger.make(&content, CommitmentKind::Explicit, None, 5, at(1));
            ledger.fulfil(&content, at(2));
        }
        assert_eq!(ledger.commitments.len(), RESOLVED_KEPT + 1);
        assert_eq!(ledger.open().len(), 1);
        assert_eq!(ledger.kept, (RESOLVED_KEPT + 10) as u64);
    }

    #[test]
    fn detects_promises_in_text() {
        let found = detect("Sure. I'll remind you about the meeting tomorrow. Anything else?").unwrap();
        assert_eq!(found.content, "I'll remind you about the meeting tomorrow");
        assert_eq!(found.kind, CommitmentKind::Explicit);
        assert!(found.due_tomorrow);

        let implicit = detect("ok, let's talk about your trip later").unwrap();
        assert_eq!(implicit.kind, CommitmentKind::Implicit);
        assert!(!implicit.due_tomorrow);

        assert!(detect("nothing promised here").is_none());
    }
}

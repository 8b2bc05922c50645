//! Bounded history of how the affective vector evolved.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::engine::AffectiveSummary;

pub const DEFAULT_TIMELINE_CAPACITY: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub at: DateTime<Utc>,
    pub dominant: Option<String>,
    pub intensity: f32,
    pub valence: f32,
}

/// Ring of summary samples; oldest entries drop once `capacity` is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionTimeline {
    capacity: usize,
    entries: VecDeque<TimelineEntry>,
}

impl Default for EmotionTimeline {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TIMELINE_CAPACITY)
    }
}

impl EmotionTimeline {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn record(&mut self, at: DateTime<Utc>, summary: &AffectiveSummary) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(TimelineEntry {
            at,
            dominant: summary.dominant.as_ref().map(|d| d.name.clone()),
            intensity: summary.dominant.as_ref().map(|d| d.intensity).unwrap_or(0.0),
            valence: summary.valence,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<&TimelineEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).collect()
    }

    /// Mean valence over the most recent `n` entries; 0 when empty.
    pub fn mean_valence(&self, n: usize) -> f32 {
        let recent = self.recent(n);
        if recent.is_empty() {
            return 0.0;
        }
        recent.iter().map(|e| e.valence).sum::<f32>() / recent.len() as f32
    }

    /// Keeps the stored entries but adopts a new capacity, trimming the oldest if needed.
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }
}

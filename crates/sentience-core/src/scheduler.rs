//! Background scheduler: decay ticks, reflection, dream and proactive-check cycles.
//!
//! On every wake tick the scheduler works out which cycles are due and spawns each one on
//! the runtime. A cycle whose previous run is still in flight is skipped and logged, never
//! stacked. The stop signal is checked before each cycle starts; cycles already running are
//! left to finish and are drained before the loop exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::{elapsed_between, fixed_offset, Clock};
use crate::error::SentienceResult;

// ---------------------------------------------------------------------------
// Cycles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleKind {
    DecayTick,
    Reflection,
    Dream,
    ProactiveCheck,
}

impl CycleKind {
    pub const ALL: [CycleKind; 4] = [
        CycleKind::DecayTick,
        CycleKind::Reflection,
        CycleKind::Dream,
        CycleKind::ProactiveCheck,
    ];

    fn slot(self) -> usize {
        match self {
            CycleKind::DecayTick => 0,
            CycleKind::Reflection => 1,
            CycleKind::Dream => 2,
            CycleKind::ProactiveCheck => 3,
        }
    }
}

/// Local-hour window `[start_hour, end_hour)`. Wraps midnight when `start_hour > end_hour`;
/// equal bounds mean the whole day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourWindow {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl HourWindow {
    pub fn new(start_hour: u32, end_hour: u32) -> Self {
        Self {
            start_hour: start_hour % 24,
            end_hour: end_hour % 24,
        }
    }

    pub fn contains(&self, hour: u32) -> bool {
        match self.start_hour.cmp(&self.end_hour) {
            std::cmp::Ordering::Equal => true,
            std::cmp::Ordering::Less => (self.start_hour..self.end_hour).contains(&hour),
            std::cmp::Ordering::Greater => hour >= self.start_hour || hour < self.end_hour,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledCycle {
    pub kind: CycleKind,
    pub interval: Duration,
    pub window: Option<HourWindow>,
    pub last_run_at: DateTime<Utc>,
}

impl ScheduledCycle {
    pub fn is_due(&self, now: DateTime<Utc>, offset: &FixedOffset) -> bool {
        if elapsed_between(self.last_run_at, now) < self.interval {
            return false;
        }
        match self.window {
            Some(w) => w.contains(now.with_timezone(offset).hour()),
            None => true,
        }
    }
}

fn default_tick_secs() -> u64 {
    10
}
fn default_decay_interval_secs() -> u64 {
    180
}
fn default_reflection_interval_secs() -> u64 {
    900
}
fn default_dream_interval_secs() -> u64 {
    3600
}
fn default_proactive_interval_secs() -> u64 {
    300
}
fn default_dream_window() -> HourWindow {
    HourWindow::new(2, 5)
}

/// Static cycle configuration read at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_decay_interval_secs")]
    pub decay_interval_secs: u64,
    #[serde(default = "default_reflection_interval_secs")]
    pub reflection_interval_secs: u64,
    #[serde(default = "default_dream_interval_secs")]
    pub dream_interval_secs: u64,
    #[serde(default = "default_proactive_interval_secs")]
    pub proactive_interval_secs: u64,
    #[serde(default = "default_dream_window")]
    pub dream_window: HourWindow,
    #[serde(default)]
    pub utc_offset_hours: i32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            decay_interval_secs: default_decay_interval_secs(),
            reflection_interval_secs: default_reflection_interval_secs(),
            dream_interval_secs: default_dream_interval_secs(),
            proactive_interval_secs: default_proactive_interval_secs(),
            dream_window: default_dream_window(),
            utc_offset_hours: 0,
        }
    }
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }

    /// One entry per kind; the first run of each comes one interval after `start`.
    pub fn cycles(&self, start: DateTime<Utc>) -> Vec<ScheduledCycle> {
        CycleKind::ALL
            .iter()
            .map(|&kind| {
                let (secs, window) = match kind {
                    CycleKind::DecayTick => (self.decay_interval_secs, None),
                    CycleKind::Reflection => (self.reflection_interval_secs, None),
                    CycleKind::Dream => (self.dream_interval_secs, Some(self.dream_window)),
                    CycleKind::ProactiveCheck => (self.proactive_interval_secs, None),
                };
                ScheduledCycle {
                    kind,
                    interval: Duration::from_secs(secs),
                    window,
                    last_run_at: start,
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Runner contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Completed,
    /// Preconditions not met (agent busy, gateway rejecting); try again next interval.
    Deferred,
    /// Ran on the fallback path because the gateway was unavailable.
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub kind: CycleKind,
    pub status: CycleStatus,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Executes one cycle against the agent. Implemented by the orchestrator.
#[async_trait::async_trait]
pub trait CycleRunner: Send + Sync {
    async fn run_cycle(&self, kind: CycleKind) -> SentienceResult<CycleReport>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Started(CycleKind),
    Skipped(CycleKind),
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct BackgroundScheduler {
    cycles: Mutex<Vec<ScheduledCycle>>,
    in_flight: [AtomicBool; 4],
    runner: Arc<dyn CycleRunner>,
    clock: Arc<dyn Clock>,
    offset: FixedOffset,
    tick: Duration,
    stop_tx: watch::Sender<bool>,
}

impl BackgroundScheduler {
    pub fn new(config: &SchedulerConfig, runner: Arc<dyn CycleRunner>, clock: Arc<dyn Clock>) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        let cycles = config.cycles(clock.now());
        Arc::new(Self {
            cycles: Mutex::new(cycles),
            in_flight: Default::default(),
            runner,
            clock,
            offset: fixed_offset(config.utc_offset_hours),
            tick: config.tick(),
            stop_tx,
        })
    }

    fn cycles(&self) -> MutexGuard<'_, Vec<ScheduledCycle>> {
        self.cycles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn schedule(&self) -> Vec<ScheduledCycle> {
        self.cycles().clone()
    }

    pub fn due_cycles(&self, now: DateTime<Utc>) -> Vec<CycleKind> {
        self.cycles()
            .iter()
            .filter(|c| c.is_due(now, &self.offset))
            .map(|c| c.kind)
            .collect()
    }

    pub fn is_in_flight(&self, kind: CycleKind) -> bool {
        self.in_flight[kind.slot()].load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Starts every due cycle that is not already running, spawning into `tasks`.
    pub fn dispatch_due(self: &Arc<Self>, tasks: &mut JoinSet<()>) -> Vec<Dispatch> {
        let now = self.clock.now();
        let mut dispatched = Vec::new();
        for kind in self.due_cycles(now) {
            if self.is_stopped() {
                debug!(target: "sentience::scheduler", "stop requested; not starting further cycles");
                break;
            }
            let flag = &self.in_flight[kind.slot()];
            if flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
                warn!(target: "sentience::scheduler", cycle = ?kind, "previous run still in flight; cycle skipped");
                dispatched.push(Dispatch::Skipped(kind));
                continue;
            }

            let guard = InFlightGuard {
                scheduler: Arc::clone(self),
                kind,
            };
            let runner = Arc::clone(&self.runner);
            tasks.spawn(async move {
                let _guard = guard;
                match runner.run_cycle(kind).await {
                    Ok(report) => debug!(
                        target: "sentience::scheduler",
                        cycle = ?kind,
                        status = ?report.status,
                        "cycle finished"
                    ),
                    Err(e) => warn!(target: "sentience::scheduler", cycle = ?kind, error = %e, "cycle failed"),
                }
            });
            dispatched.push(Dispatch::Started(kind));
        }
        dispatched
    }

    /// Runs the wake-tick loop on the current runtime until [`stop`](Self::stop) is called.
    pub fn spawn(self: &Arc<Self>) -> SchedulerHandle {
        let scheduler = Arc::clone(self);
        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // first tick fires immediately; nothing is due yet at startup
            interval.tick().await;
            let mut stop_rx = scheduler.stop_tx.subscribe();
            let mut tasks = JoinSet::new();
            info!(target: "sentience::scheduler", tick_secs = scheduler.tick.as_secs(), "scheduler started");

            loop {
                let wake = tokio::select! {
                    _ = interval.tick() => Wake::Tick,
                    changed = stop_rx.changed() => Wake::Stop(changed.is_err()),
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => Wake::Joined(joined.err()),
                };
                match wake {
                    Wake::Tick => {
                        scheduler.dispatch_due(&mut tasks);
                    }
                    Wake::Stop(closed) => {
                        if closed || *stop_rx.borrow() {
                            break;
                        }
                    }
                    Wake::Joined(Some(e)) => {
                        warn!(target: "sentience::scheduler", error = %e, "cycle task aborted");
                    }
                    Wake::Joined(None) => {}
                }
            }

            let draining = tasks.len();
            if draining > 0 {
                info!(target: "sentience::scheduler", in_flight = draining, "waiting for in-flight cycles");
            }
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    warn!(target: "sentience::scheduler", error = %e, "cycle task aborted");
                }
            }
            info!(target: "sentience::scheduler", "scheduler stopped");
        });
        SchedulerHandle {
            scheduler: Arc::clone(self),
            join,
        }
    }
}

enum Wake {
    Tick,
    Stop(bool),
    Joined(Option<tokio::task::JoinError>),
}

/// Clears the in-flight flag and stamps `last_run_at` when a cycle finishes, even on panic.
struct InFlightGuard {
    scheduler: Arc<BackgroundScheduler>,
    kind: CycleKind,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let now = self.scheduler.clock.now();
        if let Some(c) = self.scheduler.cycles().iter_mut().find(|c| c.kind == self.kind) {
            c.last_run_at = now;
        }
        self.scheduler.in_flight[self.kind.slot()].store(false, Ordering::SeqCst);
    }
}

/// Owner of the running loop.
pub struct SchedulerHandle {
    scheduler: Arc<BackgroundScheduler>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn scheduler(&self) -> &Arc<BackgroundScheduler> {
        &self.scheduler
    }

    /// Signals stop and waits for the loop and any in-flight cycles to finish.
    pub async fn shutdown(self) {
        self.scheduler.stop();
        if let Err(e) = self.join.await {
            warn!(target: "sentience::scheduler", error = %e, "scheduler loop ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn window_wraps_midnight() {
        let w = HourWindow::new(23, 4);
        assert!(w.contains(23));
        assert!(w.contains(0));
        assert!(w.contains(3));
        assert!(!w.contains(4));
        assert!(!w.contains(12));
        assert!(HourWindow::new(5, 5).contains(17));
    }

    #[test]
    fn due_after_interval_only() {
        let start = Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap();
        let cycle = ScheduledCycle {
            kind: CycleKind::Reflection,
            interval: Duration::from_secs(900),
            window: None,
            last_run_at: start,
        };
        let utc = fixed_offset(0);
        assert!(!cycle.is_due(start + chrono::Duration::seconds(899), &utc));
        assert!(cycle.is_due(start + chrono::Duration::seconds(900), &utc));
    }

    #[test]
    fn dream_needs_window() {
        let start = Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap();
        let cycles = SchedulerConfig::default().cycles(start);
        let dream = cycles.iter().find(|c| c.kind == CycleKind::Dream).unwrap();
        let utc = fixed_offset(0);
        // 13:00 is past the interval but outside 02..05
        assert!(!dream.is_due(start + chrono::Duration::hours(1), &utc));
        assert!(dream.is_due(start + chrono::Duration::hours(15), &utc));
        // same instant is 03:00 at UTC-10
        assert!(dream.is_due(start + chrono::Duration::hours(1), &fixed_offset(-10)));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let cfg: SchedulerConfig = serde_json::from_str(r#"{"reflection_interval_secs": 60}"#).unwrap();
        assert_eq!(cfg.reflection_interval_secs, 60);
        assert_eq!(cfg.decay_interval_secs, 180);
        assert_eq!(cfg.dream_window, HourWindow::new(2, 5));
    }
}

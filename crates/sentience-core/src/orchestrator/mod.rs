//! Orchestration facade: the single entry point CLIs, GUIs and APIs talk to.
//!
//! The core owns three state blocks (affective vector, breaker counters, agent state
//! machine), each behind its own lock. Cross-block work takes them in the order
//! Affective → Gateway → StateMachine and releases them before any inference call.
//! User turns and scheduled cycles are serialized by a pipeline lock: a turn waits for a
//! running cycle, a cycle that finds a turn in progress is deferred.

mod cycles;
mod persistence;

pub use cycles::Insight;
pub use persistence::BACKFILL_LIMIT;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::affect::{
    triggers, ActiveEmotion, AffectiveEngine, AffectiveSnapshot, AffectiveSummary, EmotionTimeline, Situation,
    TimelineEntry,
};
use crate::clock::{elapsed_between, Clock};
use crate::commitments::{self, Commitment, CommitmentKind, CommitmentLedger};
use crate::config::SentienceConfig;
use crate::error::{SentienceError, SentienceResult};
use crate::gateway::{CircuitBreaker, CircuitBreakerState, CircuitStatus, GatewayError, InferenceService, ResilienceGateway};
use crate::relationship::{ProactiveState, RelationshipDepth, RelationshipMetrics};
use crate::scheduler::{BackgroundScheduler, CycleReport, CycleRunner, SchedulerHandle};
use crate::state_machine::{AgentEvent, AgentState, AgentStateMachine, StateMachineSnapshot, TransitionRecord};
use crate::store::{load_json, load_json_opt, PersistenceStore, StoreKeys};

use persistence::Backfill;

const REPORT_CHANNEL_CAPACITY: usize = 64;
/// A turn after this much silence counts as a return from a long absence.
const LONG_ABSENCE: Duration = Duration::from_secs(24 * 3600);

struct AffectBlock {
    engine: AffectiveEngine,
    timeline: EmotionTimeline,
}

struct Bond {
    metrics: RelationshipMetrics,
    proactive: ProactiveState,
    commitments: CommitmentLedger,
    /// Last user turn, or boot when there has been none. Idle sleep counts from here.
    last_activity: DateTime<Utc>,
    last_turn: Option<DateTime<Utc>>,
    /// When the most recent reflection was produced.
    reflected_at: Option<DateTime<Utc>>,
}

impl Bond {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            metrics: RelationshipMetrics::default(),
            proactive: ProactiveState::default(),
            commitments: CommitmentLedger::default(),
            last_activity: now,
            last_turn: None,
            reflected_at: None,
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
        self.last_turn = Some(now);
    }

    /// A turn happened since the last produced reflection.
    fn has_unreflected_turns(&self) -> bool {
        match (self.last_turn, self.reflected_at) {
            (Some(turn), Some(reflected)) => turn > reflected,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// Result of one `submit_input` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub agent_state: AgentState,
    pub affective_summary: AffectiveSummary,
    pub response_text: String,
    /// The gateway rejected the call; `response_text` is the configured fallback.
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_state: AgentState,
    pub gateway_status: CircuitStatus,
    pub consecutive_failures: u32,
    pub active_emotions: Vec<ActiveEmotion>,
    pub time_in_state: Duration,
    pub relationship: RelationshipDepth,
    pub open_commitments: usize,
    /// Records waiting for the store to come back.
    pub pending_backfill: usize,
}

pub struct SentienceCore {
    config: SentienceConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn PersistenceStore>,
    keys: StoreKeys,
    affect: Mutex<AffectBlock>,
    gateway: ResilienceGateway,
    machine: Mutex<AgentStateMachine>,
    bond: Mutex<Bond>,
    backfill: Mutex<Backfill>,
    pipeline: tokio::sync::Mutex<()>,
    reports: broadcast::Sender<CycleReport>,
    scheduler: Mutex<Option<SchedulerHandle>>,
    shutting_down: AtomicBool,
}

impl SentienceCore {
    /// Builds the core in `Initializing`. Call [`boot`](Self::boot) before submitting input.
    pub fn new(
        config: SentienceConfig,
        store: Arc<dyn PersistenceStore>,
        service: Arc<dyn InferenceService>,
        clock: Arc<dyn Clock>,
    ) -> SentienceResult<Arc<Self>> {
        config.validate()?;
        let tuning = config.affect.load_tuning()?;
        let engine = AffectiveEngine::new(&tuning, clock.now())?
            .with_strict(config.affect.strict)
            .with_activity_epsilon(config.affect.activity_epsilon);
        let timeline = EmotionTimeline::with_capacity(config.affect.timeline_capacity);
        let breaker = CircuitBreaker::new(config.gateway.breaker(), Arc::clone(&clock));
        let gateway = ResilienceGateway::new(breaker, service).with_call_timeout(config.gateway.call_timeout());
        let machine = AgentStateMachine::new(Arc::clone(&clock));
        let keys = StoreKeys::new(&config.session_id);
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        let bond = Bond::new(clock.now());

        Ok(Arc::new(Self {
            config,
            clock,
            store,
            keys,
            affect: Mutex::new(AffectBlock { engine, timeline }),
            gateway,
            machine: Mutex::new(machine),
            bond: Mutex::new(bond),
            backfill: Mutex::new(Backfill::default()),
            pipeline: tokio::sync::Mutex::new(()),
            reports,
            scheduler: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        }))
    }

    // -----------------------------------------------------------------------
    // Lock helpers
    // -----------------------------------------------------------------------

    fn affect(&self) -> MutexGuard<'_, AffectBlock> {
        self.affect.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn machine(&self) -> MutexGuard<'_, AgentStateMachine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bond(&self) -> MutexGuard<'_, Bond> {
        self.bond.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn backfill(&self) -> MutexGuard<'_, Backfill> {
        self.backfill.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn scheduler_slot(&self) -> MutexGuard<'_, Option<SchedulerHandle>> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Loads persisted blocks, decays across the downtime and emits `Ready`.
    ///
    /// Absent records mean a fresh session. An unreachable store also starts fresh and parks
    /// the new state for backfill. Anything else (a corrupt record, a rejected snapshot)
    /// faults the machine into `Failed`.
    pub fn boot(&self) -> SentienceResult<()> {
        let store_reachable = match self.load_blocks() {
            Ok(reachable) => reachable,
            Err(e) => {
                error!(target: "sentience::core", error = %e, "boot failed");
                if let Err(fault) = self.machine().transition(AgentEvent::Fault) {
                    debug!(target: "sentience::core", error = %fault, "fault not accepted");
                }
                return Err(e);
            }
        };
        self.machine().transition(AgentEvent::Ready)?;
        info!(
            target: "sentience::core",
            session = self.keys.session(),
            store_reachable,
            inference = self.gateway.service_name(),
            "core ready"
        );
        if let Err(e) = self.persist_all() {
            debug!(target: "sentience::core", error = %e, "boot state parked for backfill");
        }
        Ok(())
    }

    /// Returns false when the store could not be reached.
    fn load_blocks(&self) -> SentienceResult<bool> {
        let now = self.clock.now();
        let mut reachable = true;

        let snapshot: Option<AffectiveSnapshot> = self.load_block(&self.keys.affect(), &mut reachable)?;
        let timeline: Option<EmotionTimeline> = self.load_block(&self.keys.timeline(), &mut reachable)?;
        {
            let mut affect = self.affect();
            if let Some(snapshot) = snapshot {
                affect.engine.restore(&snapshot, now)?;
            }
            affect.engine.advance_to(now);
            if let Some(mut timeline) = timeline {
                timeline.resize(self.config.affect.timeline_capacity);
                affect.timeline = timeline;
            }
        }

        if let Some(saved) = self.load_block::<CircuitBreakerState>(&self.keys.breaker(), &mut reachable)? {
            self.gateway.breaker().restore(&saved);
        }
        if let Some(saved) = self.load_block::<StateMachineSnapshot>(&self.keys.agent_state(), &mut reachable)? {
            self.machine().restore_history(&saved);
        }

        let metrics: Option<RelationshipMetrics> = self.load_block(&self.keys.relationship(), &mut reachable)?;
        let proactive: Option<ProactiveState> = self.load_block(&self.keys.proactive(), &mut reachable)?;
        let commitments: Option<CommitmentLedger> = self.load_block(&self.keys.commitments(), &mut reachable)?;
        let mut bond = self.bond();
        if let Some(metrics) = metrics {
            bond.metrics = metrics;
        }
        if let Some(proactive) = proactive {
            bond.proactive = proactive;
        }
        if let Some(commitments) = commitments {
            bond.commitments = commitments;
        }
        bond.last_activity = now;
        Ok(reachable)
    }

    fn load_block<T: DeserializeOwned>(&self, key: &str, reachable: &mut bool) -> SentienceResult<Option<T>> {
        match load_json_opt(&*self.store, key) {
            Err(SentienceError::PersistenceUnavailable(reason)) => {
                warn!(target: "sentience::store", key, reason = %reason, "store unavailable at boot; starting fresh");
                *reachable = false;
                Ok(None)
            }
            other => other,
        }
    }

    /// Spawns the background scheduler on the current runtime. No-op if already running.
    pub fn start_scheduler(self: &Arc<Self>) -> SentienceResult<()> {
        if self.is_shutting_down() {
            return Err(SentienceError::ShuttingDown);
        }
        let mut slot = self.scheduler_slot();
        if slot.is_none() {
            let runner: Arc<dyn CycleRunner> = Arc::clone(self) as Arc<dyn CycleRunner>;
            let scheduler = BackgroundScheduler::new(&self.config.scheduler_config(), runner, Arc::clone(&self.clock));
            *slot = Some(scheduler.spawn());
        }
        Ok(())
    }

    /// Stops the scheduler, lets in-flight work finish, then persists and flushes every block.
    /// Later calls are no-ops.
    pub async fn shutdown(&self) -> SentienceResult<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(target: "sentience::core", "shutdown requested");

        let handle = self.scheduler_slot().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }

        let _pipeline = self.pipeline.lock().await;
        let persisted = self.persist_all();
        let flushed = self.store.flush();
        match &persisted {
            Ok(()) => info!(target: "sentience::core", "final snapshot persisted"),
            Err(e) => error!(
                target: "sentience::core",
                error = %e,
                pending = self.pending_backfill(),
                "final snapshot not persisted"
            ),
        }
        persisted.and(flushed)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Turns
    // -----------------------------------------------------------------------

    /// Runs one user turn through the pipeline.
    ///
    /// A rejected gateway call (circuit open or half-open busy) is answered with the
    /// configured fallback and `degraded: true`. Timeouts and inference errors fault the
    /// agent back to `Idle` and are returned as errors.
    pub async fn submit_input(&self, text: &str) -> SentienceResult<TurnOutcome> {
        if self.is_shutting_down() {
            return Err(SentienceError::ShuttingDown);
        }
        let _turn = self.pipeline.lock().await;
        let result = self.run_turn(text).await;
        if let Err(e) = &result {
            self.fault_to_idle(e);
        }
        if let Err(e) = self.persist_all() {
            debug!(target: "sentience::core", error = %e, "turn state parked for backfill");
        }
        result
    }

    async fn run_turn(&self, text: &str) -> SentienceResult<TurnOutcome> {
        let input = text.trim();
        let now = self.clock.now();
        let returning = {
            let mut bond = self.bond();
            let returning = bond
                .metrics
                .last_interaction
                .is_some_and(|last| elapsed_between(last, now) >= LONG_ABSENCE);
            bond.touch(now);
            returning
        };
        let mut situations = Situation::detect(input);
        if returning && !input.is_empty() {
            situations.push(Situation::LongAbsenceReturn);
        }
        let mood = {
            let mut affect = self.affect();
            affect.engine.advance_to(now);
            let mut machine = self.machine();
            if machine.state() == AgentState::Sleeping {
                machine.transition(AgentEvent::Wake)?;
            }
            machine.transition(AgentEvent::InputReceived)?;
            let detected = triggers::detect(input);
            affect.engine.apply_triggers(detected.iter().map(|t| (t.emotion, t.delta)))?;
            for situation in &situations {
                affect
                    .engine
                    .apply_triggers(situation.triggers().iter().map(|t| (t.emotion, t.delta)))?;
            }
            machine.transition(AgentEvent::InputResolved)?;

            if input.is_empty() {
                let to = machine.transition(AgentEvent::NoActionNeeded)?.to;
                return Ok(TurnOutcome {
                    agent_state: to,
                    affective_summary: affect.engine.summary(),
                    response_text: String::new(),
                    degraded: false,
                });
            }
            affect.engine.summary()
        };

        let request = self
            .gateway
            .request(self.turn_prompt(&mood, input))
            .with_system(self.config.agent.persona.clone())
            .with_options(self.config.inference.options());
        let generated = self.gateway.generate(request).await;
        let now = self.clock.now();

        match generated {
            Ok(response) => {
                let (summary, state) = {
                    let mut affect = self.affect();
                    affect.engine.advance_to(now);
                    let weight = self.config.affect.response_trigger_weight;
                    let detected = triggers::detect(&response.text);
                    affect
                        .engine
                        .apply_triggers(detected.iter().map(|t| t.scaled(weight)).map(|t| (t.emotion, t.delta)))?;
                    let summary = affect.engine.summary();
                    affect.timeline.record(now, &summary);
                    let state = self.machine().transition_all(&[
                        AgentEvent::PlanReady,
                        AgentEvent::Done,
                        AgentEvent::Complete,
                    ])?;
                    (summary, state)
                };
                let mut bond = self.bond();
                if let Some(label) = bond.metrics.record_interaction(summary.valence, now) {
                    info!(target: "sentience::core", milestone = %label, "relationship milestone reached");
                }
                if let Some(found) = commitments::detect(&response.text) {
                    let due_by = found.due_tomorrow.then(|| now + chrono::Duration::hours(24));
                    let made = bond.commitments.make(&found.content, found.kind, due_by, found.priority, now);
                    debug!(target: "sentience::core", commitment = %made.content, due_by = ?made.due_by, "commitment recorded");
                }
                drop(bond);
                Ok(TurnOutcome {
                    agent_state: state,
                    affective_summary: summary,
                    response_text: response.text,
                    degraded: false,
                })
            }
            Err(e) => {
                let (summary, state) = {
                    let mut affect = self.affect();
                    affect.engine.advance_to(now);
                    let setback = Situation::ServiceDegraded.triggers();
                    affect.engine.apply_triggers(setback.iter().map(|t| (t.emotion, t.delta)))?;
                    let summary = affect.engine.summary();
                    affect.timeline.record(now, &summary);
                    let state = self.machine().transition(AgentEvent::Fault)?.to;
                    (summary, state)
                };
                if matches!(e, GatewayError::CircuitOpen | GatewayError::HalfOpenBusy) {
                    warn!(target: "sentience::core", reason = %e, "gateway rejected turn; answering degraded");
                    Ok(TurnOutcome {
                        agent_state: state,
                        affective_summary: summary,
                        response_text: self.config.agent.degraded_response.clone(),
                        degraded: true,
                    })
                } else {
                    warn!(target: "sentience::core", error = %e, "inference failed");
                    Err(e.into())
                }
            }
        }
    }

    fn turn_prompt(&self, mood: &AffectiveSummary, input: &str) -> String {
        let (depth, streak) = {
            let bond = self.bond();
            (bond.metrics.depth(), bond.metrics.conversation_streak)
        };
        format!(
            "[mood] {}\n[relationship] {:?}, streak {}\n\n{}",
            mood.describe(),
            depth,
            streak,
            input
        )
    }

    /// Returns a mid-pipeline agent to `Idle` after `reason` aborted the work.
    fn fault_to_idle(&self, reason: &SentienceError) {
        let mut machine = self.machine();
        match machine.state() {
            AgentState::Listening | AgentState::Processing | AgentState::Executing | AgentState::Reflecting => {
                match machine.transition(AgentEvent::Fault) {
                    Ok(t) => warn!(target: "sentience::core", from = ?t.from, reason = %reason, "pipeline aborted"),
                    Err(e) => error!(target: "sentience::core", error = %e, "fault not accepted"),
                }
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // Status and views
    // -----------------------------------------------------------------------

    pub fn get_status(&self) -> AgentStatus {
        let now = self.clock.now();
        let active_emotions = {
            let mut view = self.affect().engine.clone();
            view.advance_to(now);
            view.active_emotions()
        };
        let breaker = self.gateway.breaker().state();
        let (relationship, open_commitments) = {
            let bond = self.bond();
            (bond.metrics.depth(), bond.commitments.open().len())
        };
        let (agent_state, time_in_state) = {
            let machine = self.machine();
            (machine.state(), machine.time_in_state())
        };
        AgentStatus {
            agent_state,
            gateway_status: breaker.status,
            consecutive_failures: breaker.consecutive_failures,
            active_emotions,
            time_in_state,
            relationship,
            open_commitments,
            pending_backfill: self.pending_backfill(),
        }
    }

    pub fn state(&self) -> AgentState {
        self.machine().state()
    }

    pub fn affective_summary(&self) -> AffectiveSummary {
        self.affect().engine.summary()
    }

    pub fn affective_snapshot(&self) -> AffectiveSnapshot {
        self.affect().engine.snapshot()
    }

    /// Most recent `n` timeline samples, oldest first.
    pub fn timeline(&self, n: usize) -> Vec<TimelineEntry> {
        self.affect().timeline.recent(n).into_iter().cloned().collect()
    }

    pub fn relationship(&self) -> RelationshipMetrics {
        self.bond().metrics.clone()
    }

    pub fn commitments(&self) -> CommitmentLedger {
        self.bond().commitments.clone()
    }

    /// Records a commitment the agent made outside of conversation text.
    pub fn make_commitment(
        &self,
        content: &str,
        kind: CommitmentKind,
        due_by: Option<DateTime<Utc>>,
        priority: u8,
    ) -> SentienceResult<Commitment> {
        if self.is_shutting_down() {
            return Err(SentienceError::ShuttingDown);
        }
        let made = self.bond().commitments.make(content, kind, due_by, priority, self.clock.now());
        self.persist_logged("commitment");
        Ok(made)
    }

    /// Marks the first open commitment containing `needle` as kept and raises trust.
    pub fn fulfil_commitment(&self, needle: &str) -> SentienceResult<Option<Commitment>> {
        self.resolve_commitment(needle, true)
    }

    /// Marks the first open commitment containing `needle` as broken and lowers trust.
    pub fn break_commitment(&self, needle: &str) -> SentienceResult<Option<Commitment>> {
        self.resolve_commitment(needle, false)
    }

    fn resolve_commitment(&self, needle: &str, kept: bool) -> SentienceResult<Option<Commitment>> {
        if self.is_shutting_down() {
            return Err(SentienceError::ShuttingDown);
        }
        let now = self.clock.now();
        let resolved = {
            let mut bond = self.bond();
            let resolved = if kept {
                bond.commitments.fulfil(needle, now)
            } else {
                bond.commitments.break_commitment(needle, now)
            };
            if resolved.is_some() {
                bond.metrics.record_commitment(kept);
            }
            resolved
        };
        if let Some(c) = &resolved {
            info!(target: "sentience::core", commitment = %c.content, kept, "commitment resolved");
            self.persist_logged("commitment");
        }
        Ok(resolved)
    }

    pub fn history(&self) -> Vec<TransitionRecord> {
        self.machine().history().cloned().collect()
    }

    pub fn config(&self) -> &SentienceConfig {
        &self.config
    }

    pub fn keys(&self) -> &StoreKeys {
        &self.keys
    }

    /// Cycle reports as they complete. Lagging receivers lose the oldest reports.
    pub fn subscribe(&self) -> broadcast::Receiver<CycleReport> {
        self.reports.subscribe()
    }

    /// Stored insights, oldest first.
    pub fn insights(&self) -> SentienceResult<Vec<Insight>> {
        let mut insights = Vec::new();
        for key in self.store.scan_prefix(&self.keys.insights_prefix())? {
            insights.push(load_json::<Insight>(&*self.store, &key)?);
        }
        insights.sort_by_key(|i| i.created_at);
        Ok(insights)
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn persist_logged(&self, after: &str) {
        if let Err(e) = self.persist_all() {
            debug!(target: "sentience::core", after, error = %e, "state parked for backfill");
        }
    }

    pub fn pending_backfill(&self) -> usize {
        self.backfill().len()
    }

    /// Snapshots every block and writes it, replaying parked records first.
    ///
    /// Fails with `PersistenceUnavailable` when the store is down; the records stay parked
    /// and go out with the next successful write.
    pub fn persist_all(&self) -> SentienceResult<()> {
        let records = self.collect_records()?;
        let written = self.backfill().write_through(&*self.store, records)?;
        debug!(target: "sentience::store", written, "state persisted");
        Ok(())
    }

    fn collect_records(&self) -> SentienceResult<Vec<(String, Vec<u8>)>> {
        let (affect, timeline) = {
            let block = self.affect();
            (
                serde_json::to_vec(&block.engine.snapshot())?,
                serde_json::to_vec(&block.timeline)?,
            )
        };
        let breaker = serde_json::to_vec(&self.gateway.breaker().state())?;
        let machine = serde_json::to_vec(&self.machine().snapshot())?;
        let (relationship, proactive, commitments) = {
            let bond = self.bond();
            (
                serde_json::to_vec(&bond.metrics)?,
                serde_json::to_vec(&bond.proactive)?,
                serde_json::to_vec(&bond.commitments)?,
            )
        };
        Ok(vec![
            (self.keys.affect(), affect),
            (self.keys.timeline(), timeline),
            (self.keys.breaker(), breaker),
            (self.keys.agent_state(), machine),
            (self.keys.relationship(), relationship),
            (self.keys.proactive(), proactive),
            (self.keys.commitments(), commitments),
        ])
    }
}

impl std::fmt::Debug for SentienceCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SentienceCore")
            .field("session", &self.keys.session())
            .field("gateway", &self.gateway)
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

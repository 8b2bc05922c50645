//! Scheduled work run against the core: decay ticks, reflection, dreams and outreach.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::SentienceCore;
use crate::affect::triggers;
use crate::clock::elapsed_between;
use crate::error::SentienceResult;
use crate::gateway::GatewayError;
use crate::relationship::OutreachKind;
use crate::scheduler::{CycleKind, CycleReport, CycleRunner, CycleStatus};
use crate::state_machine::{AgentEvent, AgentState, SubsystemAction};

/// Timeline samples a reflection looks back over.
const REFLECTION_WINDOW: usize = 20;
const DREAM_WINDOW: usize = 100;

/// Text produced by a reflection, dream or outreach cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub id: Uuid,
    pub kind: CycleKind,
    pub text: String,
    #[serde(default)]
    pub dominant: Option<String>,
    pub created_at: DateTime<Utc>,
}

enum PipelineRun {
    /// Agent not idle.
    Busy,
    /// Breaker would reject the call; nothing was attempted.
    Rejected,
    /// The call failed; the agent faulted back to Idle.
    Degraded(String),
    Produced(String),
}

fn fallback_outreach(kind: OutreachKind) -> &'static str {
    match kind {
        OutreachKind::Greeting => "Good morning! I'm here whenever you feel like talking.",
        OutreachKind::CheckIn => "Hey, it's been a while. Just checking in: how are you doing?",
    }
}

#[async_trait::async_trait]
impl CycleRunner for SentienceCore {
    async fn run_cycle(&self, kind: CycleKind) -> SentienceResult<CycleReport> {
        if self.is_shutting_down() {
            return Ok(self.report(kind, CycleStatus::Deferred, Some("shutting down".to_string())));
        }
        let Ok(_pipeline) = self.pipeline.try_lock() else {
            debug!(target: "sentience::core", cycle = ?kind, "turn in progress; cycle deferred");
            return Ok(self.report(kind, CycleStatus::Deferred, Some("turn in progress".to_string())));
        };

        let outcome = match kind {
            CycleKind::DecayTick => self.decay_cycle(),
            CycleKind::Reflection => self.reflection_cycle().await,
            CycleKind::Dream => self.dream_cycle().await,
            CycleKind::ProactiveCheck => self.proactive_cycle().await,
        };
        let report = match outcome {
            Ok(report) => report,
            Err(e) => {
                self.fault_to_idle(&e);
                return Err(e);
            }
        };

        if let Err(e) = self.persist_all() {
            debug!(target: "sentience::core", cycle = ?kind, error = %e, "cycle state parked for backfill");
        }
        // no subscribers is not an error
        self.reports.send(report.clone()).ok();
        Ok(report)
    }
}

impl SentienceCore {
    fn report(&self, kind: CycleKind, status: CycleStatus, message: Option<String>) -> CycleReport {
        CycleReport {
            kind,
            status,
            finished_at: self.clock.now(),
            message,
        }
    }

    /// Decays the vector up to now, samples the timeline and puts a long-idle agent to sleep.
    ///
    /// Idleness counts from the last user turn; background cycles passing through `Idle`
    /// do not restart it.
    fn decay_cycle(&self) -> SentienceResult<CycleReport> {
        let now = self.clock.now();
        let quiet_for = elapsed_between(self.bond().last_activity, now);
        let mut affect = self.affect();
        let mut machine = self.machine();
        let state = machine.state();
        if !state.allows(SubsystemAction::DecayTick) {
            return Ok(self.report(
                CycleKind::DecayTick,
                CycleStatus::Deferred,
                Some(format!("decay not allowed while {:?}", state)),
            ));
        }

        affect.engine.advance_to(now);
        let summary = affect.engine.summary();
        affect.timeline.record(now, &summary);

        if state == AgentState::Idle && quiet_for >= self.config.agent.sleep_after_idle() {
            machine.transition(AgentEvent::IdleTimeoutLong)?;
            info!(target: "sentience::core", quiet_secs = quiet_for.as_secs(), "agent went to sleep");
        }
        Ok(self.report(CycleKind::DecayTick, CycleStatus::Completed, None))
    }

    async fn reflection_cycle(&self) -> SentienceResult<CycleReport> {
        if !self.state().allows(SubsystemAction::Reflect) {
            return Ok(self.report(CycleKind::Reflection, CycleStatus::Deferred, Some("agent busy".to_string())));
        }
        if !self.bond().has_unreflected_turns() {
            return Ok(self.report(
                CycleKind::Reflection,
                CycleStatus::Completed,
                Some("nothing new to reflect on".to_string()),
            ));
        }
        let prompt = {
            let affect = self.affect();
            let recent: Vec<String> = affect
                .timeline
                .recent(REFLECTION_WINDOW)
                .iter()
                .map(|e| {
                    format!(
                        "{} {} {:+.2}",
                        e.at.format("%H:%M"),
                        e.dominant.as_deref().unwrap_or("neutral"),
                        e.valence
                    )
                })
                .collect();
            if recent.is_empty() {
                return Ok(self.report(
                    CycleKind::Reflection,
                    CycleStatus::Completed,
                    Some("nothing to reflect on".to_string()),
                ));
            }
            format!(
                "Reflect in two sentences on how recent conversations have felt.\n[mood] {}\n[recent]\n{}",
                affect.engine.summary().describe(),
                recent.join("\n")
            )
        };
        let run = self.run_pipeline(prompt).await?;
        if matches!(run, PipelineRun::Produced(_)) {
            self.bond().reflected_at = Some(self.clock.now());
        }
        self.settle(CycleKind::Reflection, run)
    }

    /// Wakes a sleeping agent, dreams through the pipeline, and puts it back to sleep.
    async fn dream_cycle(&self) -> SentienceResult<CycleReport> {
        if !self.gateway.breaker().is_accepting() {
            return Ok(self.report(
                CycleKind::Dream,
                CycleStatus::Deferred,
                Some("gateway rejecting calls".to_string()),
            ));
        }
        let was_sleeping = {
            let mut machine = self.machine();
            match machine.state() {
                AgentState::Sleeping => {
                    machine.transition(AgentEvent::Wake)?;
                    true
                }
                AgentState::Idle => false,
                other => {
                    return Ok(self.report(CycleKind::Dream, CycleStatus::Deferred, Some(format!("agent {:?}", other))));
                }
            }
        };

        let prompt = {
            let affect = self.affect();
            let summary = affect.engine.summary();
            let feelings: Vec<String> = summary
                .top
                .iter()
                .map(|e| format!("{} {:.2}", e.name, e.intensity))
                .collect();
            format!(
                "Dream freely about the day, weaving its feelings into a short image.\n[valence] {:+.2}\n{}",
                affect.timeline.mean_valence(DREAM_WINDOW),
                if feelings.is_empty() { "stillness".to_string() } else { feelings.join(", ") }
            )
        };
        let run = self.run_pipeline(prompt).await;

        if was_sleeping {
            let mut machine = self.machine();
            if machine.state() == AgentState::Idle {
                machine.transition(AgentEvent::IdleTimeoutLong)?;
            }
        }
        self.settle(CycleKind::Dream, run?)
    }

    /// Flags overdue commitments, then greets or checks in when due. Falls back to canned
    /// text when the gateway is down.
    async fn proactive_cycle(&self) -> SentienceResult<CycleReport> {
        let now = self.clock.now();
        let config = self.config.proactive_config();
        let (due, depth, hours_quiet, overdue, pending) = {
            let mut bond = self.bond();
            let overdue = bond.commitments.sweep_overdue(now);
            let pending = bond.commitments.open().first().map(|c| c.content.clone());
            (
                bond.proactive.due(&bond.metrics, &config, now),
                bond.metrics.depth(),
                bond.metrics.hours_since_last(now).unwrap_or_default(),
                overdue,
                pending,
            )
        };
        for c in &overdue {
            warn!(target: "sentience::core", commitment = %c.content, due_by = ?c.due_by, "commitment overdue");
        }
        let Some(outreach) = due else {
            let message = (!overdue.is_empty()).then(|| format!("{} commitment(s) overdue", overdue.len()));
            return Ok(self.report(CycleKind::ProactiveCheck, CycleStatus::Completed, message));
        };
        if !self.state().allows(SubsystemAction::ProactiveCheck) {
            return Ok(self.report(
                CycleKind::ProactiveCheck,
                CycleStatus::Deferred,
                Some("agent busy".to_string()),
            ));
        }

        let prompt = match outreach {
            OutreachKind::Greeting => format!(
                "Send a warm one-sentence good-morning message. Relationship: {:?}.\nGood morning",
                depth
            ),
            OutreachKind::CheckIn => match &pending {
                Some(promise) => format!(
                    "It has been {:.0} hours since you last talked. Check in gently in one sentence, \
                     and follow up on what you said: \"{}\".",
                    hours_quiet, promise
                ),
                None => format!(
                    "It has been {:.0} hours since you last talked. Check in gently in one sentence.",
                    hours_quiet
                ),
            },
        };
        let (text, status) = match self.run_pipeline(prompt).await? {
            PipelineRun::Produced(text) => (text, CycleStatus::Completed),
            PipelineRun::Busy => {
                return Ok(self.report(
                    CycleKind::ProactiveCheck,
                    CycleStatus::Deferred,
                    Some("agent busy".to_string()),
                ));
            }
            PipelineRun::Rejected | PipelineRun::Degraded(_) => {
                (fallback_outreach(outreach).to_string(), CycleStatus::Degraded)
            }
        };

        self.bond().proactive.mark(outreach, now);
        self.store_insight(CycleKind::ProactiveCheck, &text)?;
        info!(target: "sentience::core", outreach = ?outreach, status = ?status, "reached out");
        Ok(self.report(CycleKind::ProactiveCheck, status, Some(text)))
    }

    /// Input-less pass Idle → Processing → Executing → Reflecting → Idle around one call.
    async fn run_pipeline(&self, prompt: String) -> SentienceResult<PipelineRun> {
        if !self.gateway.breaker().is_accepting() {
            return Ok(PipelineRun::Rejected);
        }
        {
            let mut machine = self.machine();
            if machine.state() != AgentState::Idle {
                return Ok(PipelineRun::Busy);
            }
            machine.transition(AgentEvent::CycleStarted)?;
        }

        let request = self
            .gateway
            .request(prompt)
            .with_system(self.config.agent.persona.clone())
            .with_options(self.config.inference.options());
        let generated = self.gateway.generate(request).await;

        let now = self.clock.now();
        let mut affect = self.affect();
        affect.engine.advance_to(now);
        let mut machine = self.machine();
        match generated {
            Ok(response) => {
                let weight = self.config.affect.response_trigger_weight;
                let detected = triggers::detect(&response.text);
                affect
                    .engine
                    .apply_triggers(detected.iter().map(|t| t.scaled(weight)).map(|t| (t.emotion, t.delta)))?;
                machine.transition_all(&[AgentEvent::PlanReady, AgentEvent::Done, AgentEvent::Complete])?;
                Ok(PipelineRun::Produced(response.text))
            }
            Err(e) => {
                machine.transition(AgentEvent::Fault)?;
                if !matches!(e, GatewayError::CircuitOpen | GatewayError::HalfOpenBusy) {
                    warn!(target: "sentience::core", error = %e, "cycle inference failed");
                }
                Ok(PipelineRun::Degraded(e.to_string()))
            }
        }
    }

    fn settle(&self, kind: CycleKind, run: PipelineRun) -> SentienceResult<CycleReport> {
        Ok(match run {
            PipelineRun::Busy => self.report(kind, CycleStatus::Deferred, Some("agent busy".to_string())),
            PipelineRun::Rejected => {
                self.report(kind, CycleStatus::Deferred, Some("gateway rejecting calls".to_string()))
            }
            PipelineRun::Degraded(reason) => self.report(kind, CycleStatus::Degraded, Some(reason)),
            PipelineRun::Produced(text) => {
                self.store_insight(kind, &text)?;
                self.report(kind, CycleStatus::Completed, Some(text))
            }
        })
    }

    fn store_insight(&self, kind: CycleKind, text: &str) -> SentienceResult<Insight> {
        let dominant = self.affect().engine.summary().dominant.map(|d| d.name);
        let insight = Insight {
            id: Uuid::new_v4(),
            kind,
            text: text.to_string(),
            dominant,
            created_at: self.clock.now(),
        };
        let record = (self.keys.insight(insight.created_at, insight.id), serde_json::to_vec(&insight)?);
        match self.backfill().write_through(&*self.store, vec![record]) {
            Ok(_) => self.prune_insights(),
            Err(e) => debug!(target: "sentience::core", error = %e, "insight parked for backfill"),
        }
        Ok(insight)
    }

    /// Drops the oldest stored insights beyond `agent.insight_limit`.
    fn prune_insights(&self) {
        let mut keys = match self.store.scan_prefix(&self.keys.insights_prefix()) {
            Ok(keys) => keys,
            Err(e) => {
                debug!(target: "sentience::store", error = %e, "insight prune skipped");
                return;
            }
        };
        let excess = keys.len().saturating_sub(self.config.agent.insight_limit);
        if excess == 0 {
            return;
        }
        keys.sort();
        for key in &keys[..excess] {
            if let Err(e) = self.store.remove(key) {
                debug!(target: "sentience::store", key = %key, error = %e, "insight prune stopped");
                return;
            }
        }
        debug!(target: "sentience::store", pruned = excess, "old insights pruned");
    }
}

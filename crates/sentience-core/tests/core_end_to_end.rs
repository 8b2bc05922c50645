//! Facade end-to-end: turns, degraded answers, cycles, backfill and restart recovery.
//!
//! Uses the deterministic `MockInference` and a manual clock; persistence runs against a
//! sled database in a temp dir or the in-memory store.
//!
//! Run with: `cargo test --test core_end_to_end`

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use sentience_core::{
    AffectTuning, AffectiveEngine, AgentEvent, AgentState, CircuitStatus, Clock, CommitmentKind, CommitmentStatus,
    CycleKind, CycleRunner, CycleStatus, ManualClock, MemoryStore, MockBehavior, MockInference, PersistenceStore, SentienceConfig, SentienceCore,
    SentienceError, SledStore, StoreKeys,
};

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 5, hour, 0, 0).unwrap()
}

fn test_config() -> SentienceConfig {
    let mut config = SentienceConfig::default();
    config.session_id = "tester".to_string();
    config.gateway.call_timeout_secs = 1;
    config
}

struct Harness {
    core: Arc<SentienceCore>,
    clock: Arc<ManualClock>,
    mock: Arc<MockInference>,
    store: Arc<MemoryStore>,
}

fn harness(config: SentienceConfig, start: DateTime<Utc>) -> Harness {
    let clock = Arc::new(ManualClock::new(start));
    let mock = Arc::new(MockInference::echo());
    let store = Arc::new(MemoryStore::new());
    let core = SentienceCore::new(config, store.clone(), mock.clone(), clock.clone()).expect("build core");
    Harness { core, clock, mock, store }
}

fn booted(config: SentienceConfig, start: DateTime<Utc>) -> Harness {
    let h = harness(config, start);
    h.core.boot().expect("boot");
    h
}

#[tokio::test]
async fn turn_runs_the_full_pipeline_and_persists() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let db_path = dir.path().join("sentience_store");
    let clock = Arc::new(ManualClock::new(at(14)));
    let before_restart;
    {
        let store = Arc::new(SledStore::open_path(&db_path).expect("open store"));
        let mock = Arc::new(MockInference::echo());
        let core = SentienceCore::new(test_config(), store.clone(), mock, clock.clone()).expect("build core");
        assert_eq!(core.state(), AgentState::Initializing);
        core.boot().expect("boot");
        assert_eq!(core.state(), AgentState::Idle);

        let outcome = core
            .submit_input("I finally achieved my goal and learned so much")
            .await
            .expect("turn");
        assert_eq!(outcome.agent_state, AgentState::Idle);
        assert!(!outcome.degraded);
        assert_eq!(outcome.response_text, "I hear you: I finally achieved my goal and learned so much");
        assert!(outcome.affective_summary.valence > 0.0);

        let status = core.get_status();
        assert!(status.active_emotions.iter().any(|e| e.name == "pride"));
        assert_eq!(status.gateway_status, CircuitStatus::Closed);
        assert_eq!(core.relationship().total_interactions, 1);
        assert_eq!(core.timeline(10).len(), 1);

        let events: Vec<AgentEvent> = core.history().iter().map(|r| r.event).collect();
        assert_eq!(
            events,
            vec![
                AgentEvent::Ready,
                AgentEvent::InputReceived,
                AgentEvent::InputResolved,
                AgentEvent::PlanReady,
                AgentEvent::Done,
                AgentEvent::Complete,
            ]
        );

        before_restart = core.affective_snapshot();
        core.shutdown().await.expect("final persist");
        assert!(store.load(&StoreKeys::new("tester").affect()).is_ok());
    }

    // restart a minute later: state comes back and decays across the gap
    clock.advance(Duration::from_secs(60));
    // sled releases its file lock when the last handle drops; open_path waits for it
    let store = Arc::new(SledStore::open_path(&db_path).expect("reopen store"));
    let core = SentienceCore::new(test_config(), store, Arc::new(MockInference::echo()), clock.clone())
        .expect("build core");
    core.boot().expect("boot after restart");

    let mut expected = AffectiveEngine::new(&AffectTuning::default(), before_restart.captured_at).expect("engine");
    expected.restore(&before_restart, clock.now()).expect("restore");
    for (got, want) in core.affective_snapshot().emotions.iter().zip(expected.records()) {
        assert!((got.intensity - want.intensity).abs() < 1e-4, "{}", got.name);
    }
    assert_eq!(core.relationship().total_interactions, 1);
    assert_eq!(core.timeline(10).len(), 1);
    // history survives, the live state does not: boot always goes through Initializing
    assert!(core.history().len() > 6);
    assert_eq!(core.state(), AgentState::Idle);
}

#[tokio::test]
async fn open_circuit_answers_degraded_without_calling_inference() {
    let mut config = test_config();
    config.gateway.failure_threshold = 2;
    let h = booted(config, at(14));
    h.mock.set_behavior(MockBehavior::Fail);

    for _ in 0..2 {
        let err = h.core.submit_input("hello there").await.unwrap_err();
        assert!(matches!(err, SentienceError::Inference(_)));
        assert_eq!(h.core.state(), AgentState::Idle);
    }
    assert_eq!(h.core.get_status().gateway_status, CircuitStatus::Open);

    let outcome = h.core.submit_input("are you there?").await.expect("degraded turn");
    assert!(outcome.degraded);
    assert_eq!(outcome.response_text, h.core.config().agent.degraded_response);
    assert_eq!(outcome.agent_state, AgentState::Idle);
    assert_eq!(h.mock.calls(), 2);
    assert!(h.core.get_status().active_emotions.iter().any(|e| e.name == "frustration"));
    // degraded turns do not count as interactions
    assert_eq!(h.core.relationship().total_interactions, 0);
}

#[tokio::test(start_paused = true)]
async fn hung_inference_times_out_and_recovers_to_idle() {
    let h = booted(test_config(), at(14));
    h.mock.set_behavior(MockBehavior::Hang);

    let err = h.core.submit_input("tell me something").await.unwrap_err();
    assert!(matches!(err, SentienceError::GatewayTimeout(d) if d == Duration::from_secs(1)));
    assert_eq!(h.core.state(), AgentState::Idle);
    assert_eq!(h.core.get_status().consecutive_failures, 1);

    h.mock.set_behavior(MockBehavior::Echo);
    assert!(h.core.submit_input("tell me something").await.is_ok());
    assert_eq!(h.core.get_status().consecutive_failures, 0);
}

#[tokio::test]
async fn blank_input_needs_no_action() {
    let h = booted(test_config(), at(14));
    let outcome = h.core.submit_input("   ").await.expect("blank turn");
    assert_eq!(outcome.agent_state, AgentState::Idle);
    assert!(outcome.response_text.is_empty());
    assert_eq!(h.mock.calls(), 0);
    assert!(h.core.history().iter().any(|r| r.event == AgentEvent::NoActionNeeded));
}

#[tokio::test]
async fn long_idle_sleeps_and_input_wakes() {
    let mut config = test_config();
    config.agent.sleep_after_idle_secs = 60;
    let h = booted(config, at(14));

    h.clock.advance(Duration::from_secs(61));
    let report = h.core.run_cycle(CycleKind::DecayTick).await.expect("decay");
    assert_eq!(report.status, CycleStatus::Completed);
    assert_eq!(h.core.state(), AgentState::Sleeping);

    let outcome = h.core.submit_input("good morning").await.expect("turn");
    assert_eq!(outcome.agent_state, AgentState::Idle);
    assert!(h.core.history().iter().any(|r| r.event == AgentEvent::Wake));
}

#[tokio::test]
async fn default_cadence_sleeps_after_a_quiet_stretch() {
    let h = booted(test_config(), at(14));
    h.core.submit_input("hello").await.expect("turn");

    // decay every 3 minutes, reflection every 15, for two hours
    for i in 1..=40 {
        h.clock.advance(Duration::from_secs(180));
        h.core.run_cycle(CycleKind::DecayTick).await.expect("decay");
        if i % 5 == 0 {
            h.core.run_cycle(CycleKind::Reflection).await.expect("reflection");
        }
    }
    assert_eq!(h.core.state(), AgentState::Sleeping);
    // one turn, one reflection
    assert_eq!(h.core.insights().expect("insights").len(), 1);
}

#[tokio::test]
async fn reflection_needs_a_new_turn() {
    let h = booted(test_config(), at(16));
    h.core.submit_input("it was a long day").await.expect("turn");
    h.core.run_cycle(CycleKind::Reflection).await.expect("reflection");
    assert_eq!(h.mock.calls(), 2);

    let idle = h.core.run_cycle(CycleKind::Reflection).await.expect("reflection");
    assert_eq!(idle.status, CycleStatus::Completed);
    assert_eq!(idle.message.as_deref(), Some("nothing new to reflect on"));
    assert_eq!(h.mock.calls(), 2);

    h.clock.advance(Duration::from_secs(60));
    h.core.submit_input("still thinking about it").await.expect("turn");
    h.core.run_cycle(CycleKind::Reflection).await.expect("reflection");
    assert_eq!(h.core.insights().expect("insights").len(), 2);
}

#[tokio::test]
async fn stored_insights_are_capped_oldest_first() {
    let mut config = test_config();
    config.agent.insight_limit = 3;
    let h = booted(config, at(16));
    for i in 0..5 {
        h.clock.advance(Duration::from_secs(60));
        h.core.submit_input(&format!("turn number {}", i)).await.expect("turn");
        h.core.run_cycle(CycleKind::Reflection).await.expect("reflection");
    }

    let insights = h.core.insights().expect("insights");
    assert_eq!(insights.len(), 3);
    assert_eq!(insights[0].created_at, at(16) + chrono::Duration::minutes(3));
    assert_eq!(insights[2].created_at, at(16) + chrono::Duration::minutes(5));
}

#[tokio::test]
async fn gratitude_and_long_absence_shift_the_mood() {
    let h = booted(test_config(), at(14));
    h.core.submit_input("thank you so much").await.expect("turn");
    let names: Vec<String> = h.core.get_status().active_emotions.into_iter().map(|e| e.name).collect();
    assert!(names.iter().any(|n| n == "gratitude"));
    assert!(names.iter().any(|n| n == "affection"));

    // joy after a day and more of silence, decayed to now
    h.clock.advance(Duration::from_secs(30 * 3600));
    let joy = |core: &SentienceCore| {
        core.get_status()
            .active_emotions
            .iter()
            .find(|e| e.name == "joy")
            .map_or(0.0, |e| e.intensity)
    };
    let joy_before = joy(&h.core);
    h.core.submit_input("hi again").await.expect("turn");
    assert!(joy(&h.core) > joy_before + 0.2);
}

#[tokio::test]
async fn promises_in_replies_become_commitments() {
    let h = booted(test_config(), at(20));
    h.core
        .submit_input("I'll remind you about the meeting tomorrow")
        .await
        .expect("turn");

    let ledger = h.core.commitments();
    assert_eq!(ledger.commitments.len(), 1);
    let made = &ledger.commitments[0];
    assert_eq!(made.content, "I'll remind you about the meeting tomorrow");
    assert_eq!(made.kind, CommitmentKind::Explicit);
    assert_eq!(made.due_by, Some(at(20) + chrono::Duration::hours(24)));
    assert_eq!(h.core.get_status().open_commitments, 1);

    // a day later the check-in flags it
    h.clock.advance(Duration::from_secs(25 * 3600));
    let report = h.core.run_cycle(CycleKind::ProactiveCheck).await.expect("proactive");
    assert_eq!(report.status, CycleStatus::Completed);
    assert_eq!(h.core.commitments().commitments[0].status, CommitmentStatus::Overdue);

    let trust = h.core.relationship().trust;
    h.core.fulfil_commitment("the meeting").expect("fulfil").expect("open commitment");
    assert!(h.core.relationship().trust > trust);
    assert_eq!(h.core.get_status().open_commitments, 0);
    assert_eq!(h.core.commitments().kept, 1);
}

#[tokio::test]
async fn overdue_commitments_are_reported_when_no_outreach_is_due() {
    let h = booted(test_config(), at(14));
    h.core
        .make_commitment("send the reading list", CommitmentKind::SelfCommitment, Some(at(15)), 6)
        .expect("make");

    h.clock.advance(Duration::from_secs(2 * 3600));
    let report = h.core.run_cycle(CycleKind::ProactiveCheck).await.expect("proactive");
    assert_eq!(report.status, CycleStatus::Completed);
    assert_eq!(report.message.as_deref(), Some("1 commitment(s) overdue"));

    // flagged once
    let again = h.core.run_cycle(CycleKind::ProactiveCheck).await.expect("proactive");
    assert_eq!(again.message, None);

    let trust = h.core.relationship().trust;
    h.core.break_commitment("reading list").expect("break").expect("open commitment");
    assert!(h.core.relationship().trust < trust);
    assert!(h.core.break_commitment("reading list").expect("break").is_none());
}

#[tokio::test]
async fn commitments_survive_a_restart() {
    let clock = Arc::new(ManualClock::new(at(10)));
    let store = Arc::new(MemoryStore::new());
    {
        let core = SentienceCore::new(test_config(), store.clone(), Arc::new(MockInference::echo()), clock.clone())
            .expect("build core");
        core.boot().expect("boot");
        core.make_commitment("ask how the interview went", CommitmentKind::FollowUp, None, 8)
            .expect("make");
        core.shutdown().await.expect("shutdown");
        assert!(matches!(
            core.make_commitment("too late", CommitmentKind::Explicit, None, 5),
            Err(SentienceError::ShuttingDown)
        ));
    }

    let core = SentienceCore::new(test_config(), store, Arc::new(MockInference::echo()), clock).expect("build core");
    core.boot().expect("boot after restart");
    let ledger = core.commitments();
    assert_eq!(ledger.commitments.len(), 1);
    assert_eq!(ledger.commitments[0].kind, CommitmentKind::FollowUp);
    assert_eq!(core.get_status().open_commitments, 1);
}

#[tokio::test]
async fn dream_wakes_then_returns_to_sleep() {
    let mut config = test_config();
    config.agent.sleep_after_idle_secs = 60;
    let h = booted(config, at(3));
    h.core.submit_input("I remember the sea").await.expect("turn");

    h.clock.advance(Duration::from_secs(61));
    h.core.run_cycle(CycleKind::DecayTick).await.expect("decay");
    assert_eq!(h.core.state(), AgentState::Sleeping);

    let report = h.core.run_cycle(CycleKind::Dream).await.expect("dream");
    assert_eq!(report.status, CycleStatus::Completed);
    assert_eq!(h.core.state(), AgentState::Sleeping);
    assert!(h.core.history().iter().any(|r| r.event == AgentEvent::CycleStarted));

    let insights = h.core.insights().expect("insights");
    assert_eq!(insights.len(), 1);
    assert_eq!(insights[0].kind, CycleKind::Dream);
}

#[tokio::test]
async fn reflection_stores_an_insight_and_broadcasts_its_report() {
    let h = booted(test_config(), at(16));
    let mut reports = h.core.subscribe();
    h.core.submit_input("thank you for helping me").await.expect("turn");

    let report = h.core.run_cycle(CycleKind::Reflection).await.expect("reflection");
    assert_eq!(report.status, CycleStatus::Completed);
    assert!(report.message.as_deref().unwrap_or_default().starts_with("I hear you:"));
    assert_eq!(h.core.state(), AgentState::Idle);

    let published = reports.try_recv().expect("report broadcast");
    assert_eq!(published, report);
    assert_eq!(h.core.insights().expect("insights")[0].kind, CycleKind::Reflection);
}

#[tokio::test]
async fn cycles_wait_while_the_circuit_rejects() {
    let mut config = test_config();
    config.gateway.failure_threshold = 1;
    let h = booted(config, at(16));
    h.mock.set_behavior(MockBehavior::Fail);
    assert!(h.core.submit_input("hello").await.is_err());

    let report = h.core.run_cycle(CycleKind::Reflection).await.expect("reflection");
    assert_eq!(report.status, CycleStatus::Deferred);
    assert_eq!(h.mock.calls(), 1);
}

#[tokio::test]
async fn check_in_falls_back_to_canned_text_when_inference_fails() {
    let mut config = test_config();
    config.gateway.failure_threshold = 1;
    let h = booted(config, at(20));
    h.core.submit_input("see you later").await.expect("turn");

    h.mock.set_behavior(MockBehavior::Fail);
    h.clock.advance(Duration::from_secs(7 * 3600));
    let report = h.core.run_cycle(CycleKind::ProactiveCheck).await.expect("proactive");
    assert_eq!(report.status, CycleStatus::Degraded);
    assert!(report.message.as_deref().unwrap_or_default().starts_with("Hey"));
    assert_eq!(h.core.state(), AgentState::Idle);

    // just checked in: nothing further is due
    let again = h.core.run_cycle(CycleKind::ProactiveCheck).await.expect("proactive");
    assert_eq!(again.status, CycleStatus::Completed);
    assert_eq!(again.message, None);
}

#[tokio::test]
async fn unavailable_store_is_backfilled_on_recovery() {
    let h = harness(test_config(), at(14));
    h.store.set_available(false);
    h.core.boot().expect("boot proceeds in memory");
    assert_eq!(h.core.state(), AgentState::Idle);
    let parked = h.core.get_status().pending_backfill;
    assert!(parked > 0);

    h.core.submit_input("still here").await.expect("turn proceeds in memory");
    assert_eq!(h.core.get_status().pending_backfill, parked);
    assert!(h.store.is_empty());

    h.store.set_available(true);
    h.core.submit_input("back again").await.expect("turn");
    assert_eq!(h.core.get_status().pending_backfill, 0);
    assert_eq!(h.store.len(), parked);
}

#[tokio::test]
async fn corrupt_snapshot_fails_boot() {
    let h = harness(test_config(), at(14));
    h.store
        .save(&StoreKeys::new("tester").affect(), b"{ not json")
        .expect("seed corrupt record");

    let err = h.core.boot().unwrap_err();
    assert!(matches!(err, SentienceError::Serialization(_)));
    assert_eq!(h.core.state(), AgentState::Failed);

    let rejected = h.core.submit_input("hello").await.unwrap_err();
    assert!(matches!(rejected, SentienceError::InvalidTransition { from: AgentState::Failed, .. }));
    assert_eq!(h.core.state(), AgentState::Failed);
}

#[tokio::test]
async fn shutdown_is_final_and_idempotent() {
    let h = booted(test_config(), at(14));
    h.core.submit_input("bye").await.expect("turn");
    h.core.shutdown().await.expect("shutdown");
    h.core.shutdown().await.expect("second shutdown");
    assert!(matches!(
        h.core.submit_input("hello?").await,
        Err(SentienceError::ShuttingDown)
    ));
    assert!(matches!(h.core.start_scheduler(), Err(SentienceError::ShuttingDown)));
}

#[tokio::test(start_paused = true)]
async fn scheduler_runs_decay_in_the_background() {
    let h = booted(test_config(), at(14));
    let mut reports = h.core.subscribe();
    h.core.start_scheduler().expect("start");

    h.clock.advance(Duration::from_secs(181));
    tokio::time::sleep(Duration::from_secs(11)).await;
    h.core.shutdown().await.expect("shutdown");

    let report = reports.try_recv().expect("decay report");
    assert_eq!(report.kind, CycleKind::DecayTick);
    assert_eq!(report.status, CycleStatus::Completed);
}

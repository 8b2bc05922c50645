//! sentience-core: affective state, agent lifecycle and resilient inference for a companion agent.
//!
//! The orchestration facade ([`SentienceCore`]) owns the affective vector, the agent state
//! machine and the circuit-breaker counters, drives them from user turns and background
//! cycles, and persists them through a [`PersistenceStore`].

pub mod affect;
pub mod clock;
pub mod commitments;
mod config;
mod error;
pub mod gateway;
mod orchestrator;
pub mod relationship;
pub mod scheduler;
pub mod state_machine;
pub mod store;

// Configuration
pub use config::{AffectSettings, AgentSettings, GatewaySettings, InferenceSettings, SentienceConfig};

// Errors
pub use error::{SentienceError, SentienceResult};

// Affect
pub use affect::{AffectTuning, AffectiveEngine, AffectiveSnapshot, AffectiveSummary, ActiveEmotion, Situation};

// Time
pub use clock::{Clock, ManualClock, SystemClock};

// Gateway
pub use gateway::{
    ChatCompletionsClient, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitStatus, GatewayError,
    InferenceService, MockBehavior, MockInference, ResilienceGateway,
};

// Lifecycle
pub use state_machine::{AgentEvent, AgentState, AgentStateMachine, SubsystemAction};
pub use scheduler::{BackgroundScheduler, CycleKind, CycleReport, CycleRunner, CycleStatus, SchedulerConfig};

// Persistence
pub use store::{MemoryStore, PersistenceStore, SledStore, StoreKeys};

// Commitments
pub use commitments::{Commitment, CommitmentKind, CommitmentLedger, CommitmentStatus};

// Facade
pub use orchestrator::{AgentStatus, Insight, SentienceCore, TurnOutcome, BACKFILL_LIMIT};
pub use relationship::{RelationshipDepth, RelationshipMetrics};

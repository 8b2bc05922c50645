//! Static configuration: file, environment and defaults.
//!
//! Precedence: env `SENTIENCE__SECTION__KEY` > file (`SENTIENCE_CONFIG`, default
//! `config/sentience.toml`) > built-in defaults.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | SENTIENCE_CONFIG | config/sentience | Config file path (extension optional). |
//! | SENTIENCE__SESSION_ID | default | Store key namespace. |
//! | SENTIENCE__LLM_MODE | mock | `mock` or `openai` (any OpenAI-compatible endpoint). |
//! | SENTIENCE__GATEWAY__CALL_TIMEOUT_SECS | 30 | Deadline for each inference call. |
//! | SENTIENCE_API_KEY | (none) | Bearer token when `inference.api_key` is unset. |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::affect::{AffectTuning, DEFAULT_ACTIVITY_EPSILON, DEFAULT_TIMELINE_CAPACITY};
use crate::error::{SentienceError, SentienceResult};
use crate::gateway::{CircuitBreakerConfig, InferenceOptions, DEFAULT_BASE_URL, DEFAULT_MODEL};
use crate::relationship::ProactiveConfig;
use crate::scheduler::SchedulerConfig;

const DEFAULT_CONFIG_PATH: &str = "config/sentience";

fn default_epsilon() -> f32 {
    DEFAULT_ACTIVITY_EPSILON
}
fn default_response_weight() -> f32 {
    0.5
}
fn default_timeline_capacity() -> usize {
    DEFAULT_TIMELINE_CAPACITY
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_cooldown_secs() -> u64 {
    30
}
fn default_call_timeout_secs() -> u64 {
    30
}
fn default_sleep_after_idle_secs() -> u64 {
    1800
}
fn default_insight_limit() -> usize {
    200
}
fn default_degraded_response() -> String {
    "I'm having trouble reaching my thoughts right now. Give me a moment and try again.".to_string()
}
fn default_persona() -> String {
    "You are a warm, attentive companion. Answer briefly and naturally.".to_string()
}
fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}
fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    512
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffectSettings {
    /// Reject unknown emotion names instead of ignoring them.
    #[serde(default)]
    pub strict: bool,
    #[serde(default = "default_epsilon")]
    pub activity_epsilon: f32,
    /// Scale applied to triggers detected in generated responses.
    #[serde(default = "default_response_weight")]
    pub response_trigger_weight: f32,
    #[serde(default = "default_timeline_capacity")]
    pub timeline_capacity: usize,
    /// TOML file with baseline/decay overrides and the interaction table.
    #[serde(default)]
    pub tuning_path: Option<PathBuf>,
}

impl Default for AffectSettings {
    fn default() -> Self {
        Self {
            strict: false,
            activity_epsilon: default_epsilon(),
            response_trigger_weight: default_response_weight(),
            timeline_capacity: default_timeline_capacity(),
            tuning_path: None,
        }
    }
}

impl AffectSettings {
    pub fn load_tuning(&self) -> SentienceResult<AffectTuning> {
        match &self.tuning_path {
            Some(path) => AffectTuning::load_from_path(path),
            None => Ok(AffectTuning::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

impl GatewaySettings {
    pub fn breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_secs(self.cooldown_secs),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_sleep_after_idle_secs")]
    pub sleep_after_idle_secs: u64,
    /// Returned to the caller when the gateway rejects a call.
    #[serde(default = "default_degraded_response")]
    pub degraded_response: String,
    /// System prompt for every inference call.
    #[serde(default = "default_persona")]
    pub persona: String,
    #[serde(default)]
    pub proactive: ProactiveConfig,
    /// Stored insights kept per session; older ones are pruned.
    #[serde(default = "default_insight_limit")]
    pub insight_limit: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            sleep_after_idle_secs: default_sleep_after_idle_secs(),
            degraded_response: default_degraded_response(),
            persona: default_persona(),
            proactive: ProactiveConfig::default(),
            insight_limit: default_insight_limit(),
        }
    }
}

impl AgentSettings {
    pub fn sleep_after_idle(&self) -> Duration {
        Duration::from_secs(self.sleep_after_idle_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl InferenceSettings {
    /// Configured key, else `SENTIENCE_API_KEY`. Blank values count as unset.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("SENTIENCE_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
    }

    pub fn options(&self) -> InferenceOptions {
        InferenceOptions {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentienceConfig {
    pub app_name: String,
    /// Store key namespace for this agent/user.
    pub session_id: String,
    /// Base directory for the sled database.
    pub storage_path: String,
    /// `mock` or `openai`.
    pub llm_mode: String,
    /// Offset applied to every local-hour window (dream, greeting).
    #[serde(default)]
    pub utc_offset_hours: i32,
    #[serde(default)]
    pub affect: AffectSettings,
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub inference: InferenceSettings,
}

impl Default for SentienceConfig {
    fn default() -> Self {
        Self {
            app_name: "Sentience".to_string(),
            session_id: "default".to_string(),
            storage_path: "./data".to_string(),
            llm_mode: "mock".to_string(),
            utc_offset_hours: 0,
            affect: AffectSettings::default(),
            gateway: GatewaySettings::default(),
            scheduler: SchedulerConfig::default(),
            agent: AgentSettings::default(),
            inference: InferenceSettings::default(),
        }
    }
}

impl SentienceConfig {
    /// Load config from file and environment. Precedence: env `SENTIENCE_CONFIG` path > `config/sentience.toml` > defaults.
    pub fn load() -> SentienceResult<Self> {
        let config_path = std::env::var("SENTIENCE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&config_path))
    }

    pub fn load_from(path: &Path) -> SentienceResult<Self> {
        let builder = Self::defaults()?;
        let with_ext = path.with_extension("toml");
        let builder = if path.is_file() {
            builder.add_source(config::File::from(path))
        } else if with_ext.is_file() {
            builder.add_source(config::File::from(with_ext.as_path()))
        } else {
            tracing::debug!(target: "sentience::config", path = %path.display(), "no config file; using defaults and environment");
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("SENTIENCE").separator("__"))
            .build()?;
        let cfg: Self = built.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parses a TOML document over the defaults, without reading the environment.
    pub fn from_toml_str(content: &str) -> SentienceResult<Self> {
        let built = Self::defaults()?
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .build()?;
        let cfg: Self = built.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn defaults() -> SentienceResult<config::ConfigBuilder<config::builder::DefaultState>> {
        let d = Self::default();
        Ok(config::Config::builder()
            .set_default("app_name", d.app_name)?
            .set_default("session_id", d.session_id)?
            .set_default("storage_path", d.storage_path)?
            .set_default("llm_mode", d.llm_mode)?)
    }

    pub fn validate(&self) -> SentienceResult<()> {
        if self.gateway.failure_threshold == 0 {
            return Err(SentienceError::Config("gateway.failure_threshold must be at least 1".into()));
        }
        if self.gateway.call_timeout_secs == 0 {
            return Err(SentienceError::Config("gateway.call_timeout_secs must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.affect.activity_epsilon) {
            return Err(SentienceError::Config("affect.activity_epsilon must be in [0, 1)".into()));
        }
        if !(0.0..=1.0).contains(&self.affect.response_trigger_weight) {
            return Err(SentienceError::Config("affect.response_trigger_weight must be in [0, 1]".into()));
        }
        if self.agent.insight_limit == 0 {
            return Err(SentienceError::Config("agent.insight_limit must be at least 1".into()));
        }
        if self.scheduler.dream_window.start_hour > 23 || self.scheduler.dream_window.end_hour > 23 {
            return Err(SentienceError::Config("scheduler.dream_window hours must be 0-23".into()));
        }
        match self.llm_mode.as_str() {
            "mock" | "openai" => Ok(()),
            other => Err(SentienceError::Config(format!("unknown llm_mode {:?}", other))),
        }
    }

    /// Scheduler settings with the shared local-hour offset applied.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            utc_offset_hours: self.utc_offset_hours,
            ..self.scheduler.clone()
        }
    }

    pub fn proactive_config(&self) -> ProactiveConfig {
        ProactiveConfig {
            utc_offset_hours: self.utc_offset_hours,
            ..self.agent.proactive.clone()
        }
    }

    pub fn sled_path(&self) -> PathBuf {
        Path::new(&self.storage_path).join("sentience_store")
    }
}

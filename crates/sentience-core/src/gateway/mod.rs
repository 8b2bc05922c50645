//! Resilience gateway: every inference call goes through the circuit breaker.

mod breaker;
mod inference;

use std::sync::Arc;
use std::time::Duration;

pub use breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitStatus, GatewayError, DEFAULT_CALL_TIMEOUT,
    DEFAULT_COOLDOWN, DEFAULT_FAILURE_THRESHOLD,
};
pub use inference::{
    ChatCompletionsClient, InferenceError, InferenceOptions, InferenceRequest, InferenceResponse, InferenceService,
    MockBehavior, MockInference, DEFAULT_BASE_URL, DEFAULT_MODEL,
};

/// Inference service behind a circuit breaker with a default per-call deadline.
pub struct ResilienceGateway {
    breaker: CircuitBreaker,
    service: Arc<dyn InferenceService>,
    call_timeout: Duration,
}

impl ResilienceGateway {
    pub fn new(breaker: CircuitBreaker, service: Arc<dyn InferenceService>) -> Self {
        Self {
            breaker,
            service,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn service_name(&self) -> &str {
        self.service.name()
    }

    /// Generates under the request's own deadline.
    pub async fn generate(&self, request: InferenceRequest) -> Result<InferenceResponse, GatewayError<InferenceError>> {
        let deadline = request.deadline;
        let service = Arc::clone(&self.service);
        self.breaker
            .call(deadline, move || async move { service.generate(request).await })
            .await
    }

    /// Builds a request carrying the gateway's default deadline.
    pub fn request(&self, prompt: impl Into<String>) -> InferenceRequest {
        InferenceRequest::new(prompt, self.call_timeout)
    }
}

impl std::fmt::Debug for ResilienceGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceGateway")
            .field("breaker", &self.breaker)
            .field("service", &self.service.name())
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

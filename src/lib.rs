//! Multi-provider LLM relay: accepts chat requests in the Anthropic Messages or OpenAI
//! Chat Completions protocol, routes them across configured upstreams with per-provider
//! circuit breakers and ordered fallback, and answers in the caller's own protocol.

pub mod app;
pub mod circuit_breaker;
pub mod config;
pub mod format;
pub mod gateway;
pub mod provider_client;
pub mod providers;
pub mod request_logs;
pub mod router;
mod shared;

#[cfg(test)]
mod test_support;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::{ConfigError, GatewayConfig, ProviderConfig, RouteCandidate};
pub use format::WireFormat;
pub use gateway::{build_router, GatewayAppState, GatewayManager, GatewayStartError, GatewayStatus};
pub use provider_client::{HttpProviderClient, ProviderClient, ProviderReply, UpstreamError};
pub use providers::ProviderRegistry;
pub use request_logs::{AttemptOutcome, OutcomeSink, TracingOutcomeSink};
pub use router::{ModelRouter, RoutingError};

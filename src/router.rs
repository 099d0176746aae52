//! Usage: Ordered fallback routing of one canonical request across provider candidates.
//!
//! Each candidate is tried in configured order through its provider's breaker. The first
//! success wins; otherwise the caller gets every candidate's failure, in order.

use crate::circuit_breaker::BreakerError;
use crate::config::{ConfigError, GatewayConfig, RouteCandidate};
use crate::format::canonical::CanonicalRequest;
use crate::format::{self, TranslationError};
use crate::provider_client::{ProviderReply, UpstreamRequest};
use crate::providers::{ceil_secs, ProviderRegistry};
use axum::body::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Breaker was open; the call was never made.
    ProviderUnavailable,
    /// Call made and failed (transport, status, timeout, undecodable reply).
    Upstream,
    /// Request has no representation in this provider's format; never sent.
    Translation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateFailure {
    pub provider: String,
    pub backend_model: String,
    pub kind: FailureKind,
    pub error_code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RoutingError {
    #[error("model `{0}` has no route")]
    UnknownModel(String),
    #[error("request cannot be translated for any candidate: {error}")]
    Translation {
        error: TranslationError,
        failures: Vec<CandidateFailure>,
    },
    #[error("all {} candidates failed", .failures.len())]
    ExhaustedFallbacks { failures: Vec<CandidateFailure> },
}

impl RoutingError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownModel(_) => "GW_UNKNOWN_MODEL",
            Self::Translation { error, .. } => error.error_code(),
            Self::ExhaustedFallbacks { .. } => "GW_ALL_PROVIDERS_UNAVAILABLE",
        }
    }

    pub fn failures(&self) -> &[CandidateFailure] {
        match self {
            Self::UnknownModel(_) => &[],
            Self::Translation { failures, .. } | Self::ExhaustedFallbacks { failures } => failures,
        }
    }

    /// Earliest breaker expiry, only when every candidate was circuit-rejected.
    pub fn retry_after_secs(&self) -> Option<u64> {
        let Self::ExhaustedFallbacks { failures } = self else {
            return None;
        };
        if failures.is_empty()
            || failures
                .iter()
                .any(|f| f.kind != FailureKind::ProviderUnavailable)
        {
            return None;
        }
        failures
            .iter()
            .filter_map(|f| f.retry_after_secs)
            .min()
            .map(|secs| secs.max(1))
    }
}

/// Successful routing result: the reply plus who served it and who failed before.
#[derive(Debug)]
pub struct RoutedReply {
    pub provider: String,
    pub backend_model: String,
    pub reply: ProviderReply,
    pub failures: Vec<CandidateFailure>,
    pub latency: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelListing {
    pub id: String,
    pub owned_by: String,
}

pub struct ModelRouter {
    routes: BTreeMap<String, Vec<RouteCandidate>>,
    registry: Arc<ProviderRegistry>,
}

impl ModelRouter {
    /// Every candidate must name a registered provider and no route may be empty.
    pub fn new(
        routes: BTreeMap<String, Vec<RouteCandidate>>,
        registry: Arc<ProviderRegistry>,
    ) -> Result<Self, ConfigError> {
        if registry.is_empty() {
            return Err(ConfigError::NoProviders);
        }
        if routes.is_empty() {
            return Err(ConfigError::NoRoutes);
        }
        for (model, candidates) in &routes {
            if candidates.is_empty() {
                return Err(ConfigError::EmptyRoute {
                    model: model.clone(),
                });
            }
            if let Some(candidate) = candidates.iter().find(|c| !registry.contains(&c.provider)) {
                return Err(ConfigError::UnknownProvider {
                    model: model.clone(),
                    provider: candidate.provider.clone(),
                });
            }
        }
        Ok(Self { routes, registry })
    }

    /// Validates `config` and drops candidates whose provider is disabled.
    pub fn from_config(
        config: &GatewayConfig,
        registry: Arc<ProviderRegistry>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let routes = config
            .routes
            .iter()
            .map(|(model, candidates)| {
                let enabled = candidates
                    .iter()
                    .filter(|c| config.providers.get(&c.provider).is_some_and(|p| p.enabled))
                    .cloned()
                    .collect();
                (model.clone(), enabled)
            })
            .collect();
        Self::new(routes, registry)
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn candidates(&self, model: &str) -> Option<&[RouteCandidate]> {
        self.routes.get(model).map(Vec::as_slice)
    }

    pub async fn route(
        &self,
        model: &str,
        request: &CanonicalRequest,
    ) -> Result<RoutedReply, RoutingError> {
        let candidates = self
            .routes
            .get(model)
            .ok_or_else(|| RoutingError::UnknownModel(model.to_string()))?;

        let mut failures: Vec<CandidateFailure> = Vec::with_capacity(candidates.len());
        let mut first_translation_error: Option<TranslationError> = None;

        for (position, candidate) in candidates.iter().enumerate() {
            let started = Instant::now();
            let failure = |kind, error_code, message: String, retry_after_secs| CandidateFailure {
                provider: candidate.provider.clone(),
                backend_model: candidate.model.clone(),
                kind,
                error_code,
                message,
                retry_after_secs,
                latency_ms: started.elapsed().as_millis() as u64,
            };

            let Some(entry) = self.registry.get(&candidate.provider) else {
                failures.push(failure(
                    FailureKind::ProviderUnavailable,
                    "GW_PROVIDER_CIRCUIT_OPEN",
                    "provider is not registered".to_string(),
                    None,
                ));
                continue;
            };

            let body = match format::encode_request(entry.config().format, request, &candidate.model)
            {
                Ok(body) => body,
                Err(err) => {
                    tracing::warn!(
                        model = %model,
                        provider = %candidate.provider,
                        error = %err,
                        "candidate skipped: request not translatable"
                    );
                    failures.push(failure(
                        FailureKind::Translation,
                        err.error_code(),
                        err.to_string(),
                        None,
                    ));
                    first_translation_error.get_or_insert(err);
                    continue;
                }
            };

            let upstream = UpstreamRequest {
                backend_model: candidate.model.clone(),
                body: Bytes::from(body),
                stream: request.stream,
            };
            let client = entry.client();
            match entry.breaker().execute(|| client.send(upstream)).await {
                Ok(reply) => {
                    if position > 0 {
                        tracing::info!(
                            model = %model,
                            provider = %candidate.provider,
                            backend_model = %candidate.model,
                            skipped = failures.len(),
                            "request served by fallback candidate"
                        );
                    }
                    return Ok(RoutedReply {
                        provider: candidate.provider.clone(),
                        backend_model: candidate.model.clone(),
                        reply,
                        failures,
                        latency: started.elapsed(),
                    });
                }
                Err(BreakerError::Rejected(snapshot)) => {
                    let retry_after = snapshot.open_remaining(Instant::now()).map(ceil_secs);
                    failures.push(failure(
                        FailureKind::ProviderUnavailable,
                        "GW_PROVIDER_CIRCUIT_OPEN",
                        format!("circuit {}", snapshot.state.as_str()),
                        retry_after,
                    ));
                }
                Err(BreakerError::Failed(err)) => {
                    tracing::warn!(
                        model = %model,
                        provider = %candidate.provider,
                        backend_model = %candidate.model,
                        error_code = err.error_code(),
                        error = %err,
                        "candidate failed"
                    );
                    failures.push(failure(
                        FailureKind::Upstream,
                        err.error_code(),
                        err.to_string(),
                        None,
                    ));
                }
            }
        }

        let all_untranslatable = failures.iter().all(|f| f.kind == FailureKind::Translation);
        match first_translation_error {
            Some(error) if all_untranslatable => Err(RoutingError::Translation { error, failures }),
            _ => Err(RoutingError::ExhaustedFallbacks { failures }),
        }
    }

    /// Deduplicated backend models reachable through a registered provider, sorted by id.
    pub fn list_models(&self) -> Vec<ModelListing> {
        let mut models: BTreeMap<&str, &str> = BTreeMap::new();
        for candidate in self.routes.values().flatten() {
            if self.registry.contains(&candidate.provider) {
                models
                    .entry(candidate.model.as_str())
                    .or_insert(candidate.provider.as_str());
            }
        }
        models
            .into_iter()
            .map(|(id, owned_by)| ModelListing {
                id: id.to_string(),
                owned_by: owned_by.to_string(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests;

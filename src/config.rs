//! Usage: Gateway configuration contract (providers + model routes) and startup validation.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::format::WireFormat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration JSON: {0}")]
    Parse(String),
    #[error("no providers configured")]
    NoProviders,
    #[error("no model routes configured")]
    NoRoutes,
    #[error("route `{model}` has an empty candidate list")]
    EmptyRoute { model: String },
    #[error("route `{model}` references undefined provider `{provider}`")]
    UnknownProvider { model: String, provider: String },
    #[error("route `{model}` has no enabled candidate")]
    NoEnabledCandidate { model: String },
    #[error("provider `{provider}`: {reason}")]
    InvalidProvider { provider: String, reason: String },
}

#[derive(Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    /// Filled from the map key by [`GatewayConfig::normalize`].
    #[serde(default, skip_serializing)]
    pub name: String,
    pub format: WireFormat,
    pub base_url: String,
    /// Overrides the protocol's default path (`/v1/messages`, `/v1/chat/completions`).
    #[serde(default)]
    pub request_path: Option<String>,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_enabled() -> bool {
    true
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("format", &self.format)
            .field("base_url", &self.base_url)
            .field("request_path", &self.request_path)
            .field("api_key", &"<redacted>")
            .field("timeout_secs", &self.timeout_secs)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl ProviderConfig {
    pub fn new(
        name: impl Into<String>,
        format: WireFormat,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            format,
            base_url: base_url.into(),
            request_path: None,
            api_key: api_key.into(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            circuit_breaker: CircuitBreakerConfig::default(),
            enabled: true,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Full upstream URL for this provider's chat endpoint.
    pub fn endpoint_url(&self) -> String {
        let path = self
            .request_path
            .as_deref()
            .unwrap_or_else(|| self.format.request_path());
        let base = self.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidProvider {
            provider: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("provider name is empty".into()));
        }
        let url = reqwest::Url::parse(self.base_url.trim())
            .map_err(|e| invalid(format!("invalid base_url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!(
                "unsupported base_url scheme `{}`",
                url.scheme()
            )));
        }
        if self.timeout_secs == 0 {
            return Err(invalid("timeout_secs must be greater than 0".into()));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(invalid(
                "circuit_breaker.failure_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RouteCandidate {
    pub provider: String,
    pub model: String,
}

impl RouteCandidate {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GatewayConfig {
    pub providers: BTreeMap<String, ProviderConfig>,
    /// Public model name -> ordered fallback chain.
    pub routes: BTreeMap<String, Vec<RouteCandidate>>,
}

impl GatewayConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Copies each provider's map key into its `name`.
    pub fn normalize(&mut self) {
        for (name, provider) in self.providers.iter_mut() {
            provider.name = name.clone();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            return Err(ConfigError::NoProviders);
        }
        if self.routes.is_empty() {
            return Err(ConfigError::NoRoutes);
        }

        for (name, provider) in &self.providers {
            if provider.name != *name {
                return Err(ConfigError::InvalidProvider {
                    provider: name.clone(),
                    reason: format!("name `{}` does not match its key", provider.name),
                });
            }
            provider.validate()?;
        }

        for (model, candidates) in &self.routes {
            if candidates.is_empty() {
                return Err(ConfigError::EmptyRoute {
                    model: model.clone(),
                });
            }
            let mut enabled = 0usize;
            for candidate in candidates {
                let provider = self.providers.get(&candidate.provider).ok_or_else(|| {
                    ConfigError::UnknownProvider {
                        model: model.clone(),
                        provider: candidate.provider.clone(),
                    }
                })?;
                if provider.enabled {
                    enabled += 1;
                }
            }
            if enabled == 0 {
                return Err(ConfigError::NoEnabledCandidate {
                    model: model.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.values().filter(|p| p.enabled)
    }
}

#[cfg(test)]
mod tests;

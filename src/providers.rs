//! Usage: Read-only registry of enabled providers, each owning its breaker and transport.

use crate::circuit_breaker::{CircuitBreaker, CircuitChange, CircuitSnapshot, CircuitState};
use crate::config::{GatewayConfig, ProviderConfig};
use crate::provider_client::{HttpProviderClient, ProviderClient};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub struct ProviderEntry {
    config: ProviderConfig,
    breaker: CircuitBreaker,
    client: Arc<dyn ProviderClient>,
}

impl ProviderEntry {
    pub fn new(config: ProviderConfig, client: Arc<dyn ProviderClient>) -> Self {
        let breaker = CircuitBreaker::new(config.name.clone(), config.circuit_breaker.clone());
        Self {
            config,
            breaker,
            client,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn client(&self) -> &Arc<dyn ProviderClient> {
        &self.client
    }
}

/// Breaker view served by the admin endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderCircuitStatus {
    pub provider: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub open_remaining_secs: Option<u64>,
    pub trial_in_flight: bool,
}

impl ProviderCircuitStatus {
    fn from_snapshot(provider: &str, snapshot: &CircuitSnapshot, now: Instant) -> Self {
        Self {
            provider: provider.to_string(),
            state: snapshot.state,
            failure_count: snapshot.failure_count,
            failure_threshold: snapshot.failure_threshold,
            open_remaining_secs: snapshot.open_remaining(now).map(ceil_secs),
            trial_in_flight: snapshot.trial_in_flight,
        }
    }
}

pub(crate) fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

#[derive(Default)]
pub struct ProviderRegistry {
    entries: BTreeMap<String, Arc<ProviderEntry>>,
}

impl ProviderRegistry {
    /// Builds HTTP-backed clients for every enabled provider, sharing one connection pool.
    pub fn from_config(config: &GatewayConfig, http: reqwest::Client) -> Self {
        Self::with_clients(config, |provider| {
            Arc::new(HttpProviderClient::new(http.clone(), provider.clone()))
        })
    }

    pub fn with_clients<F>(config: &GatewayConfig, mut make_client: F) -> Self
    where
        F: FnMut(&ProviderConfig) -> Arc<dyn ProviderClient>,
    {
        let mut entries = BTreeMap::new();
        for provider in config.enabled_providers() {
            let client = make_client(provider);
            entries.insert(
                provider.name.clone(),
                Arc::new(ProviderEntry::new(provider.clone(), client)),
            );
        }
        let disabled = config.providers.len() - entries.len();
        tracing::info!(
            providers = entries.len(),
            disabled,
            "provider registry built"
        );
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ProviderEntry>> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn circuit_statuses(&self) -> Vec<ProviderCircuitStatus> {
        let now = Instant::now();
        self.entries
            .values()
            .map(|entry| {
                ProviderCircuitStatus::from_snapshot(entry.name(), &entry.breaker.snapshot(), now)
            })
            .collect()
    }

    /// Administrative override; `None` when the provider is not registered.
    pub fn reset_circuit(&self, name: &str) -> Option<ProviderCircuitStatus> {
        let entry = self.entries.get(name)?;
        let now = Instant::now();
        let CircuitChange { after, .. } = entry.breaker.reset(now);
        tracing::debug!(provider = %name, "circuit reset requested");
        Some(ProviderCircuitStatus::from_snapshot(name, &after, now))
    }
}

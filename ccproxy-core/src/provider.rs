//! Provider registry: lifecycle, health tracking, statistics and selection.
//!
//! A `Provider` is plain declarative data (name, base URL, key, model list);
//! all vendor-specific wire knowledge lives in `crate::transformer` instead.
//! Grounded on the teacher's provider health/metrics bookkeeping, reshaped
//! to a consecutive-failure model instead of an EMA-based health check.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

/// A declared upstream LLM endpoint, addressable by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub name: String,
    pub api_base_url: String,
    pub api_key: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub models: Vec<String>,
    #[serde(with = "crate::common::duration_serde", default = "default_timeout")]
    pub timeout: Duration,
    #[serde(default)]
    pub max_tokens_limit: Option<u32>,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            last_checked: None,
            last_error: None,
            last_success: None,
        }
    }
}

/// Consecutive failures at which a provider flips to unhealthy. A single
/// success resets the streak and marks it healthy again.
const UNHEALTHY_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct ProviderStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub avg_latency_ms: f64,
}

impl ProviderStats {
    fn record(&mut self, success: bool, latency: Duration) {
        self.total += 1;
        if success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        let sample = latency.as_secs_f64() * 1000.0;
        let alpha = 0.2;
        self.avg_latency_ms = if self.total == 1 {
            sample
        } else {
            alpha * sample + (1.0 - alpha) * self.avg_latency_ms
        };
    }
}

#[derive(Error, Debug)]
pub enum SelectError {
    #[error("no provider declares model {model}")]
    NoProviderForModel { model: String },
    #[error("all providers serving {model} are unhealthy")]
    AllUnhealthy { model: String },
}

struct ProviderEntry {
    provider: Provider,
    health: Mutex<ProviderHealth>,
    stats: Mutex<ProviderStats>,
}

/// Registry of providers: registration, config refresh, health-aware
/// selection, and outcome recording. One mutex guards each entry's mutable
/// fields; reads return copies so callers never hold a lock across `.await`.
#[derive(Default)]
pub struct ProviderService {
    entries: DashMap<String, Arc<ProviderEntry>>,
    order: Mutex<Vec<String>>,
}

impl ProviderService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent by name: re-registering an existing provider is a no-op
    /// for its runtime counters, use `refresh` to update attributes.
    pub async fn register(&self, provider: Provider) {
        if self.entries.contains_key(&provider.name) {
            return;
        }
        let name = provider.name.clone();
        self.entries.insert(
            name.clone(),
            Arc::new(ProviderEntry {
                provider,
                health: Mutex::new(ProviderHealth::default()),
                stats: Mutex::new(ProviderStats::default()),
            }),
        );
        self.order.lock().await.push(name);
    }

    /// Reconcile the registry with a fresh provider list: update attributes
    /// of providers that persist, drop ones that are gone, register new
    /// ones. Health and stats survive for providers that persist.
    pub async fn refresh(&self, providers: Vec<Provider>) {
        let mut seen = std::collections::HashSet::new();
        for provider in providers {
            seen.insert(provider.name.clone());
            if let Some(entry) = self.entries.get(&provider.name) {
                let health = Mutex::new(
                    entry
                        .health
                        .try_lock()
                        .map(|h| h.clone())
                        .unwrap_or_default(),
                );
                let stats = Mutex::new(
                    entry
                        .stats
                        .try_lock()
                        .map(|s| *s)
                        .unwrap_or_default(),
                );
                drop(entry);
                let name = provider.name.clone();
                self.entries
                    .insert(name, Arc::new(ProviderEntry { provider, health, stats }));
            } else {
                self.register(provider).await;
            }
        }

        self.entries.retain(|name, _| seen.contains(name));
        let mut order = self.order.lock().await;
        order.retain(|name| seen.contains(name));
    }

    /// First enabled, healthy provider declaring `model`, in declaration
    /// order. Falls back to the least-unhealthy enabled match if none are
    /// healthy.
    pub async fn select(&self, model: &str) -> Result<Provider, SelectError> {
        let order = self.order.lock().await.clone();
        let mut candidates = Vec::new();

        for name in &order {
            let Some(entry) = self.entries.get(name) else {
                continue;
            };
            if !entry.provider.enabled || !entry.provider.models.iter().any(|m| m == model) {
                continue;
            }
            candidates.push(entry.clone());
        }

        if candidates.is_empty() {
            return Err(SelectError::NoProviderForModel {
                model: model.to_string(),
            });
        }

        for entry in &candidates {
            if entry.health.lock().await.healthy {
                return Ok(entry.provider.clone());
            }
        }

        let mut least_unhealthy: Option<(u32, Provider)> = None;
        for name in &order {
            let Some(entry) = self.entries.get(name) else {
                continue;
            };
            if !entry.provider.enabled || !entry.provider.models.iter().any(|m| m == model) {
                continue;
            }
            let failures = entry.health.lock().await.consecutive_failures;
            if least_unhealthy
                .as_ref()
                .map(|(best, _)| failures < *best)
                .unwrap_or(true)
            {
                least_unhealthy = Some((failures, entry.provider.clone()));
            }
        }

        least_unhealthy
            .map(|(_, provider)| provider)
            .ok_or(SelectError::AllUnhealthy {
                model: model.to_string(),
            })
    }

    pub async fn record(&self, name: &str, success: bool, latency: Duration) {
        let Some(entry) = self.entries.get(name) else {
            return;
        };
        entry.stats.lock().await.record(success, latency);

        let mut health = entry.health.lock().await;
        let now = Utc::now();
        health.last_checked = Some(now);
        if success {
            health.consecutive_failures = 0;
            health.healthy = true;
            health.last_success = Some(now);
            health.last_error = None;
        } else {
            health.consecutive_failures += 1;
            if health.consecutive_failures >= UNHEALTHY_THRESHOLD {
                health.healthy = false;
            }
        }
    }

    pub async fn record_error(&self, name: &str, success: bool, latency: Duration, error: String) {
        self.record(name, success, latency).await;
        if let Some(entry) = self.entries.get(name) {
            entry.health.lock().await.last_error = Some(error);
        }
    }

    pub async fn health(&self, name: &str) -> Option<ProviderHealth> {
        let entry = self.entries.get(name)?;
        Some(entry.health.lock().await.clone())
    }

    pub async fn stats(&self, name: &str) -> Option<ProviderStats> {
        let entry = self.entries.get(name)?;
        Some(*entry.stats.lock().await)
    }

    pub async fn healthy_providers(&self) -> Vec<Provider> {
        let order = self.order.lock().await.clone();
        let mut result = Vec::new();
        for name in order {
            if let Some(entry) = self.entries.get(&name) {
                if entry.provider.enabled && entry.health.lock().await.healthy {
                    result.push(entry.provider.clone());
                }
            }
        }
        result
    }

    /// Look up a provider by name regardless of health or model match —
    /// used once the router has already picked a provider by name.
    pub async fn get(&self, name: &str) -> Option<Provider> {
        Some(self.entries.get(name)?.provider.clone())
    }

    pub async fn all(&self) -> Vec<Provider> {
        let order = self.order.lock().await.clone();
        order
            .into_iter()
            .filter_map(|name| self.entries.get(&name).map(|e| e.provider.clone()))
            .collect()
    }

    /// Probe every enabled provider once, concurrently, and feed the outcome
    /// through `record`/`record_error` — the same bookkeeping the request
    /// path uses. Meant to be driven by a periodic ticker.
    pub async fn probe_all(&self, http_client: &reqwest::Client) {
        let providers: Vec<Provider> = self.all().await.into_iter().filter(|p| p.enabled).collect();
        let checks = providers
            .iter()
            .map(|provider| self.probe_one(http_client, provider));
        futures::future::join_all(checks).await;
    }

    async fn probe_one(&self, http_client: &reqwest::Client, provider: &Provider) {
        let url = format!("{}/models", provider.api_base_url.trim_end_matches('/'));
        let started = std::time::Instant::now();
        let result = http_client
            .get(&url)
            .bearer_auth(&provider.api_key)
            .timeout(provider.timeout)
            .send()
            .await;
        let latency = started.elapsed();

        match result {
            Ok(resp) if resp.status().is_success() => {
                self.record(&provider.name, true, latency).await;
            }
            Ok(resp) => {
                self.record_error(
                    &provider.name,
                    false,
                    latency,
                    format!("health probe returned {}", resp.status()),
                )
                .await;
            }
            Err(err) => {
                self.record_error(&provider.name, false, latency, err.to_string())
                    .await;
            }
        }

        tracing::debug!(provider = %provider.name, "health probe completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(name: &str, models: &[&str]) -> Provider {
        Provider {
            name: name.to_string(),
            api_base_url: "https://example.invalid".to_string(),
            api_key: "key".to_string(),
            enabled: true,
            models: models.iter().map(|s| s.to_string()).collect(),
            timeout: Duration::from_secs(30),
            max_tokens_limit: None,
        }
    }

    #[tokio::test]
    async fn selects_first_healthy_declaration_order() {
        let service = ProviderService::new();
        service.register(provider("a", &["gpt-4"])).await;
        service.register(provider("b", &["gpt-4"])).await;

        let selected = service.select("gpt-4").await.unwrap();
        assert_eq!(selected.name, "a");
    }

    #[tokio::test]
    async fn no_provider_for_model() {
        let service = ProviderService::new();
        service.register(provider("a", &["gpt-4"])).await;
        let err = service.select("claude").await.unwrap_err();
        assert!(matches!(err, SelectError::NoProviderForModel { .. }));
    }

    #[tokio::test]
    async fn marks_unhealthy_after_three_consecutive_failures() {
        let service = ProviderService::new();
        service.register(provider("a", &["gpt-4"])).await;

        for _ in 0..3 {
            service.record("a", false, Duration::from_millis(5)).await;
        }
        let health = service.health("a").await.unwrap();
        assert!(!health.healthy);
        assert_eq!(health.consecutive_failures, 3);

        service.record("a", true, Duration::from_millis(5)).await;
        let health = service.health("a").await.unwrap();
        assert!(health.healthy);
        assert_eq!(health.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn falls_back_to_least_unhealthy_when_all_unhealthy() {
        let service = ProviderService::new();
        service.register(provider("a", &["gpt-4"])).await;
        service.register(provider("b", &["gpt-4"])).await;

        for _ in 0..5 {
            service.record("a", false, Duration::from_millis(1)).await;
        }
        for _ in 0..3 {
            service.record("b", false, Duration::from_millis(1)).await;
        }

        let selected = service.select("gpt-4").await.unwrap();
        assert_eq!(selected.name, "b");
    }

    #[tokio::test]
    async fn refresh_preserves_runtime_counters() {
        let service = ProviderService::new();
        service.register(provider("a", &["gpt-4"])).await;
        service.record("a", false, Duration::from_millis(1)).await;

        let mut updated = provider("a", &["gpt-4", "gpt-4-turbo"]);
        updated.api_key = "new-key".to_string();
        service.refresh(vec![updated]).await;

        let health = service.health("a").await.unwrap();
        assert_eq!(health.consecutive_failures, 1);
        let all = service.all().await;
        assert_eq!(all[0].api_key, "new-key");
        assert_eq!(all[0].models.len(), 2);
    }
}

//! Service state manager: aggregates per-component readiness into a
//! single service-level state, per §4.8.
//!
//! Structurally grounded on the teacher's `AppState`-as-shared-context
//! pattern for how state threads cloneably through the app; the
//! register/set_state/snapshot API shape follows the small health-state
//! aggregators seen elsewhere in the pack.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentState {
    Starting,
    Ready,
    Degraded,
    Stopping,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub component: String,
    pub from: Option<ComponentState>,
    pub to: ComponentState,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub state: ComponentState,
    pub uptime_secs: u64,
    pub components: Vec<(String, ComponentState)>,
    pub error_count: u64,
}

struct Inner {
    started: Instant,
    ready_time: Option<DateTime<Utc>>,
    error_count: u64,
}

/// Shared, cloneable handle onto the service's aggregate readiness state.
#[derive(Clone)]
pub struct StateManager {
    components: Arc<DashMap<String, ComponentState>>,
    inner: Arc<tokio::sync::Mutex<Inner>>,
    transitions: broadcast::Sender<StateTransition>,
}

impl StateManager {
    pub fn new() -> Self {
        let (transitions, _) = broadcast::channel(64);
        Self {
            components: Arc::new(DashMap::new()),
            inner: Arc::new(tokio::sync::Mutex::new(Inner {
                started: Instant::now(),
                ready_time: None,
                error_count: 0,
            })),
            transitions,
        }
    }

    /// Register a component with its initial state, `starting`.
    pub fn register(&self, component: impl Into<String>) {
        self.components.insert(component.into(), ComponentState::Starting);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    pub async fn set_state(&self, component: &str, state: ComponentState) {
        let previous = self
            .components
            .insert(component.to_string(), state)
            .filter(|p| *p != state);

        if state == ComponentState::Error {
            self.inner.lock().await.error_count += 1;
        }

        let _ = self.transitions.send(StateTransition {
            component: component.to_string(),
            from: previous,
            to: state,
        });

        if self.service_state() == ComponentState::Ready {
            let mut inner = self.inner.lock().await;
            if inner.ready_time.is_none() {
                inner.ready_time = Some(Utc::now());
            }
        }
    }

    /// Derive the service-level state from all registered components.
    pub fn service_state(&self) -> ComponentState {
        if self.components.is_empty() {
            return ComponentState::Starting;
        }

        let states: Vec<ComponentState> = self.components.iter().map(|e| *e.value()).collect();

        if states.iter().any(|s| *s == ComponentState::Stopping) {
            return ComponentState::Stopping;
        }
        if states.iter().all(|s| *s == ComponentState::Error) {
            return ComponentState::Error;
        }
        let has_error = states.iter().any(|s| *s == ComponentState::Error);
        let has_ready = states.iter().any(|s| *s == ComponentState::Ready);
        if has_error && has_ready {
            return ComponentState::Degraded;
        }
        if states.iter().all(|s| *s == ComponentState::Ready) {
            return ComponentState::Ready;
        }
        ComponentState::Starting
    }

    pub fn is_healthy(&self) -> bool {
        matches!(
            self.service_state(),
            ComponentState::Ready | ComponentState::Degraded
        )
    }

    pub async fn snapshot(&self) -> ServiceStatus {
        let inner = self.inner.lock().await;
        ServiceStatus {
            state: self.service_state(),
            uptime_secs: inner.started.elapsed().as_secs(),
            components: self
                .components
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            error_count: inner.error_count,
        }
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn all_ready_is_service_ready() {
        let manager = StateManager::new();
        manager.register("router");
        manager.register("providers");
        manager.set_state("router", ComponentState::Ready).await;
        manager.set_state("providers", ComponentState::Ready).await;
        assert_eq!(manager.service_state(), ComponentState::Ready);
        assert!(manager.is_healthy());
    }

    #[tokio::test]
    async fn error_with_some_ready_is_degraded() {
        let manager = StateManager::new();
        manager.register("router");
        manager.register("providers");
        manager.set_state("router", ComponentState::Ready).await;
        manager.set_state("providers", ComponentState::Error).await;
        assert_eq!(manager.service_state(), ComponentState::Degraded);
        assert!(manager.is_healthy());
    }

    #[tokio::test]
    async fn all_error_is_service_error() {
        let manager = StateManager::new();
        manager.register("router");
        manager.set_state("router", ComponentState::Error).await;
        assert_eq!(manager.service_state(), ComponentState::Error);
        assert!(!manager.is_healthy());
    }

    #[tokio::test]
    async fn any_stopping_dominates() {
        let manager = StateManager::new();
        manager.register("router");
        manager.register("providers");
        manager.set_state("router", ComponentState::Ready).await;
        manager.set_state("providers", ComponentState::Stopping).await;
        assert_eq!(manager.service_state(), ComponentState::Stopping);
        assert!(!manager.is_healthy());
    }

    #[tokio::test]
    async fn partial_starting_keeps_service_starting() {
        let manager = StateManager::new();
        manager.register("router");
        manager.register("providers");
        manager.set_state("router", ComponentState::Ready).await;
        assert_eq!(manager.service_state(), ComponentState::Starting);
    }

    #[tokio::test]
    async fn error_count_increments_and_transition_broadcasts() {
        let manager = StateManager::new();
        manager.register("router");
        let mut rx = manager.subscribe();
        manager.set_state("router", ComponentState::Error).await;
        let transition = rx.recv().await.unwrap();
        assert_eq!(transition.component, "router");
        assert_eq!(transition.to, ComponentState::Error);
        assert_eq!(manager.snapshot().await.error_count, 1);
    }
}

//! Declarative router: picks `(provider, model, parameters)` for a request.
//!
//! Pure and deterministic for a fixed config — no I/O, no shared state.
//! Grounded on the `Condition`/`matches` matching idiom in the teacher's
//! routing module, collapsed from a multi-strategy enum to the single
//! first-match-wins order this crate specifies.

use crate::config::RouteConfig;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

const LONG_CONTEXT_THRESHOLD: u64 = 60_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("no route matched the request")]
    RouteUnmatched,
    #[error("route references a provider that is not configured")]
    ProviderMissing,
    #[error("route's provider is disabled")]
    ProviderDisabled,
}

/// Request shape derived for a single routing decision.
#[derive(Debug, Clone)]
pub struct RoutingRequest {
    pub model: String,
    pub token_count: u64,
    pub thinking: bool,
    pub background: bool,
}

#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub provider_name: String,
    pub model: String,
    pub parameters: HashMap<String, Value>,
}

/// Providers that are configured and whether each is enabled, keyed by
/// name — enough for the router to classify `provider-missing` versus
/// `provider-disabled` without depending on the full provider registry.
pub struct ProviderAvailability<'a>(pub &'a HashMap<String, bool>);

pub fn route(
    request: &RoutingRequest,
    routes: &HashMap<String, RouteConfig>,
    providers: &ProviderAvailability,
) -> Result<RouteDecision, RouteError> {
    let selected = if request.token_count > LONG_CONTEXT_THRESHOLD && routes.contains_key("longContext") {
        routes.get("longContext")
    } else if request.background && routes.contains_key("background") {
        routes.get("background")
    } else if request.thinking && routes.contains_key("think") {
        routes.get("think")
    } else if routes.contains_key(&request.model) {
        routes.get(&request.model)
    } else {
        routes.get("default")
    };

    let route = selected.ok_or(RouteError::RouteUnmatched)?;

    match providers.0.get(&route.provider) {
        None => Err(RouteError::ProviderMissing),
        Some(false) => Err(RouteError::ProviderDisabled),
        Some(true) => Ok(RouteDecision {
            provider_name: route.provider.clone(),
            model: route.model.clone(),
            parameters: route.parameters.clone(),
        }),
    }
}

/// Merge route parameters onto a caller-declared overlay: caller values win
/// for keys the caller explicitly set, route defaults fill the rest.
/// `max_tokens` is then clamped to the provider's declared maximum.
pub fn merge_parameters(
    route_parameters: &HashMap<String, Value>,
    caller_overrides: &HashMap<String, Value>,
    provider_max_tokens: Option<u32>,
) -> HashMap<String, Value> {
    let mut merged = route_parameters.clone();
    for (key, value) in caller_overrides {
        merged.insert(key.clone(), value.clone());
    }

    if let Some(max) = provider_max_tokens {
        if let Some(requested) = merged.get("max_tokens").and_then(|v| v.as_u64()) {
            if requested > max as u64 {
                merged.insert("max_tokens".to_string(), Value::from(max));
            }
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routes() -> HashMap<String, RouteConfig> {
        let mut routes = HashMap::new();
        routes.insert(
            "default".to_string(),
            RouteConfig {
                provider: "a".to_string(),
                model: "model-a".to_string(),
                parameters: HashMap::new(),
            },
        );
        routes.insert(
            "longContext".to_string(),
            RouteConfig {
                provider: "b".to_string(),
                model: "model-b".to_string(),
                parameters: HashMap::new(),
            },
        );
        routes.insert(
            "background".to_string(),
            RouteConfig {
                provider: "c".to_string(),
                model: "small".to_string(),
                parameters: HashMap::new(),
            },
        );
        routes
    }

    fn availability() -> HashMap<String, bool> {
        [("a", true), ("b", true), ("c", true)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn routes_long_context_first() {
        let request = RoutingRequest {
            model: "claude-3-5-sonnet-20241022".to_string(),
            token_count: 65_000,
            thinking: false,
            background: false,
        };
        let availability = availability();
        let decision = route(&request, &routes(), &ProviderAvailability(&availability)).unwrap();
        assert_eq!(decision.provider_name, "b");
        assert_eq!(decision.model, "model-b");
    }

    #[test]
    fn routes_background_by_heuristic() {
        let request = RoutingRequest {
            model: "claude-3-5-haiku-20241022".to_string(),
            token_count: 100,
            thinking: false,
            background: true,
        };
        let availability = availability();
        let decision = route(&request, &routes(), &ProviderAvailability(&availability)).unwrap();
        assert_eq!(decision.provider_name, "c");
    }

    #[test]
    fn falls_back_to_default() {
        let request = RoutingRequest {
            model: "gpt-4".to_string(),
            token_count: 10,
            thinking: false,
            background: false,
        };
        let availability = availability();
        let decision = route(&request, &routes(), &ProviderAvailability(&availability)).unwrap();
        assert_eq!(decision.provider_name, "a");
    }

    #[test]
    fn unmatched_without_default() {
        let request = RoutingRequest {
            model: "gpt-4".to_string(),
            token_count: 10,
            thinking: false,
            background: false,
        };
        let empty = HashMap::new();
        let availability = availability();
        let err = route(&request, &empty, &ProviderAvailability(&availability)).unwrap_err();
        assert_eq!(err, RouteError::RouteUnmatched);
    }

    #[test]
    fn provider_disabled_is_distinguished_from_missing() {
        let request = RoutingRequest {
            model: "gpt-4".to_string(),
            token_count: 10,
            thinking: false,
            background: false,
        };
        let mut availability = availability();
        availability.insert("a".to_string(), false);
        let err = route(&request, &routes(), &ProviderAvailability(&availability)).unwrap_err();
        assert_eq!(err, RouteError::ProviderDisabled);
    }

    #[test]
    fn clamps_max_tokens_to_provider_limit() {
        let mut overrides = HashMap::new();
        overrides.insert("max_tokens".to_string(), Value::from(100_000));
        let merged = merge_parameters(&HashMap::new(), &overrides, Some(4096));
        assert_eq!(merged["max_tokens"], Value::from(4096));
    }
}

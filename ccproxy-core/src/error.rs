//! Error types shared between the provider wire glue and the gateway crate.

use thiserror::Error;

/// Errors that occur while calling a provider or transforming its wire data.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {code} - {message}")]
    Api { code: u16, message: String },

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("Model not found: {model}")]
    ModelNotFound { model: String },

    #[error("Rate limit exceeded")]
    RateLimit,

    #[error("Service unavailable")]
    ServiceUnavailable,

    #[error("Timeout")]
    Timeout,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid response format")]
    InvalidResponse,

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Transformer missing for provider: {provider}")]
    TransformerMissing { provider: String },
}

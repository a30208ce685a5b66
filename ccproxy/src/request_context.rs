//! # Request Context Module
//!
//! Per-request bookkeeping attached to the axum request extensions: a
//! unique request ID for log correlation and the API key that
//! authenticated the request, if any.
//!
//! ## Usage
//!
//! ```rust
//! use ccproxy::request_context::RequestContext;
//!
//! let context = RequestContext::with_auth(Some("sk-...".to_string()));
//! println!("Request ID: {}", context.request_id);
//! ```

use std::time::Instant;
use uuid::Uuid;

/// Request context for tracking individual requests throughout their lifecycle.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Unique request ID for tracing
    pub request_id: String,
    /// API key used for authentication
    pub api_key: Option<String>,
    /// Request start time for latency tracking
    pub start_time: Instant,
}

impl RequestContext {
    /// Create a request context carrying the API key that authenticated it.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use ccproxy::request_context::RequestContext;
    ///
    /// let context = RequestContext::with_auth(Some("sk-abc123".to_string()));
    /// ```
    pub fn with_auth(api_key: Option<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            api_key,
            start_time: Instant::now(),
        }
    }
}

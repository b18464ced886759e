//! Ingress pipeline building blocks.
//!
//! The ordered stages: correlation id + security headers and the panic
//! boundary are generic tower layers applied around the whole router; size
//! gate, rate limiting, and token verification are route-dependent and live
//! in [`crate::gateway::gateway_handler`] where the route table has already
//! resolved the match.

pub mod rate_limit;
pub mod security_headers;

pub use rate_limit::{RateLimitConfig, RateLimitOutcome, RateLimiter};
pub use security_headers::{correlation_and_security_headers, CorrelationId, CORRELATION_HEADER};

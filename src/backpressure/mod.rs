//! Backpressure envelope
//!
//! Token-bucket rate limiting, bulkhead pools, and API admission control.
//! Consumer-lag pause/resume lives with the consumer manager.

mod admission;
mod bulkhead;
mod token_bucket;

pub use admission::{AdmissionStatus, AdmissionTicket, ApiAdmission};
pub use bulkhead::Bulkhead;
pub use token_bucket::{RateDecision, RateLimitStatus, RateLimiter, TokenBucket};

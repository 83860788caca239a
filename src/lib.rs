//! Token Gate - sealed API tokens with per-principal admission control
//!
//! Principals are sealed into self-contained AES-256-GCM tokens, so no
//! session store is needed. Requests of a throttled principal are released
//! one at a time through a FIFO queue spaced by the principal's rate.

pub mod config;
pub mod error;
pub mod gate;
pub mod ratelimit;
pub mod token;

pub use config::GuardConfig;
pub use error::GuardError;
pub use gate::{Gate, GateRequest, Rejection};
pub use ratelimit::{parse_rate, AdmissionLimiter, RateSpec};
pub use token::{Expiration, PathPattern, Principal, TokenCodec};

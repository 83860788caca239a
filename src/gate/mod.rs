//! Host-facing adaptor: finds the token on a request, decodes it, enforces
//! path and expiry restrictions, and waits for rate-limit admission.

mod request;
mod service;

pub use request::GateRequest;
pub use service::{Gate, Rejection};

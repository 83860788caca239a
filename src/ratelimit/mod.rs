//! Rate parsing and per-principal admission.

mod limiter;
mod rate;
mod scheduler;

pub use limiter::AdmissionLimiter;
pub use rate::{parse_rate, RateSpec, RateUnit};
pub use scheduler::{Scheduler, Task, TokioScheduler};

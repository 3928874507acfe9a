//! Failsafe mechanisms: circuit breakers, breaker registry, backoff schedules

mod backoff;
mod circuit_breaker;
mod registry;

pub use backoff::{BackoffPolicy, BackoffStrategy};
pub use circuit_breaker::{Admission, BreakerSettings, CircuitBreaker, CircuitState, CircuitStatus};
pub use registry::{CircuitBreakerRegistry, GLOBAL_RESOURCE, circuit_key};

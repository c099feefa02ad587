pub mod batch;
pub mod circuit_breaker;
pub mod message;
pub mod metrics;
pub mod retry;
pub mod snapshot;
pub mod status;

pub mod broker;
pub mod circuit_breaker;
pub mod delivery;
pub mod health;
pub mod memory;
pub mod metrics;
pub mod rbmq;
pub mod redis;

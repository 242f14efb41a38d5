// Shared runtime counters
pub mod metrics;

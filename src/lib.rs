//! Configuration rollout and drift reconciliation for a simulated server
//! fleet: validated candidates, staged canary deploys with automatic
//! rollback, GitOps polling, and continuous drift repair.

pub mod config;
pub mod domain;

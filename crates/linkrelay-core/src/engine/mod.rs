//! Transfer Engine - the bounded-concurrency pipeline
//!
//! This module implements:
//! - Per-user admission control and equal rate shares
//! - Leaky-bucket rate shaping against an injectable clock
//! - Streaming fetch to a local artifact
//! - A bounded worker pool
//! - The per-task download-then-upload lifecycle
//! - Transfer history (SQLite)

mod fetcher;
mod orchestrator;
mod persistence;
mod pool;
mod rate_governor;
mod rate_limiter;
mod registry;
mod task;
mod transfer;

pub use fetcher::*;
pub use orchestrator::*;
pub use persistence::*;
pub use pool::*;
pub use rate_governor::*;
pub use rate_limiter::*;
pub use registry::*;
pub use task::*;
pub use transfer::*;

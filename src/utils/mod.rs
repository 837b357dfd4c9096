//! Utility modules for the logo-proxy application
//!
//! This module contains reusable utilities that can be used
//! across different parts of the system.

pub mod jitter;
pub mod memory_monitor;
pub mod operation_tracker;
pub mod rate_limiter;

// Re-export commonly used types for convenience
pub use memory_monitor::{MemoryMonitor, MemorySnapshot, MemoryStats, MemoryStatus};
pub use rate_limiter::{RateLimiter, WindowedCircuitBreaker};

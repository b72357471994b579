use thiserror::Error;

/// Rejected scheduler configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("target heap utilization must be in (0, 1], got {0}")]
    InvalidUtilization(f64),
    #[error("min heap bytes ({min}) exceeds max heap bytes ({max})")]
    HeapBoundsInverted { min: u64, max: u64 },
    #[error("regular GC interval must be non-zero")]
    ZeroInterval,
    #[error("scheduler config cannot be changed at runtime while auto-tuning is enabled")]
    AutoTuneEnabled,
}

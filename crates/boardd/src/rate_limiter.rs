use std::fmt;

use board_core::config::LimitsConfig;
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxWindowConfig {
    pub max_creations: u32,
    pub window: Duration,
}

impl SandboxWindowConfig {
    pub fn from_limits(limits: &LimitsConfig) -> Self {
        let window_secs = i64::try_from(limits.sandbox_window_secs).unwrap_or(i64::MAX);
        Self {
            max_creations: limits.sandbox_creations_per_window.max(1),
            window: Duration::seconds(window_secs.max(1)),
        }
    }
}

impl Default for SandboxWindowConfig {
    fn default() -> Self {
        Self::from_limits(&LimitsConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitResult {
    Allowed { remaining: u32 },
    Limited { retry_at: DateTime<Utc> },
}

impl fmt::Display for RateLimitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allowed { remaining } => write!(f, "allowed ({remaining} remaining)"),
            Self::Limited { retry_at } => write!(f, "limited (retry at {})", retry_at.to_rfc3339()),
        }
    }
}

/// Sliding window over sandbox creation instants.
///
/// The instants come from the store, so every process sharing the database
/// sees the same window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxRateLimiter {
    pub config: SandboxWindowConfig,
}

impl SandboxRateLimiter {
    pub fn new(config: SandboxWindowConfig) -> Self {
        Self { config }
    }

    /// Creations at or before this instant no longer count at `now`.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.config.window
    }

    /// `creations` must be sorted oldest first. Entries outside the window are ignored.
    pub fn check(&self, creations: &[DateTime<Utc>], now: DateTime<Utc>) -> RateLimitResult {
        let cutoff = self.window_start(now);
        let live = &creations[creations.partition_point(|at| *at <= cutoff)..];
        let max = self.config.max_creations as usize;

        if live.len() < max {
            let remaining = u32::try_from(max - live.len()).unwrap_or(u32::MAX);
            return RateLimitResult::Allowed { remaining };
        }
        // The window reopens when the oldest creation that keeps it full expires.
        let retry_at = live
            .get(live.len() - max)
            .map(|oldest| *oldest + self.config.window)
            .unwrap_or(now);
        RateLimitResult::Limited { retry_at }
    }

    pub fn is_limited(&self, creations: &[DateTime<Utc>], now: DateTime<Utc>) -> bool {
        matches!(self.check(creations, now), RateLimitResult::Limited { .. })
    }
}

//! Validation for board configuration.

use serde::{Deserialize, Serialize};

use crate::config::BoardConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub level: ValidationLevel,
    pub code: &'static str,
    pub message: String,
}

pub trait Validate {
    fn validate(&self) -> Vec<ValidationIssue>;
}

impl Validate for BoardConfig {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.limits.max_concurrent_tasks == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "limits.max_concurrent_tasks.zero",
                message: "max_concurrent_tasks is 0, nothing can ever leave the queue".to_string(),
            });
        }

        if self.limits.sandbox_creations_per_window == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "limits.sandbox_creations.zero",
                message: "sandbox_creations_per_window must be greater than zero".to_string(),
            });
        }

        if self.limits.sandbox_window_secs == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "limits.sandbox_window.zero",
                message: "sandbox_window_secs must be greater than zero".to_string(),
            });
        }

        if self.daemon.tick_interval_secs == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "daemon.tick_interval.zero",
                message: "tick interval cannot be 0".to_string(),
            });
        }

        if self.notify.channel_capacity == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "notify.channel_capacity.zero",
                message: "broadcast channel capacity must be greater than zero".to_string(),
            });
        }

        if self.notify.enabled_sinks.is_empty() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Warning,
                code: "notify.enabled_sinks.empty",
                message: "no change publishers enabled; views will never refetch".to_string(),
            });
        }

        if self.storage.busy_timeout_ms == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Warning,
                code: "storage.busy_timeout.zero",
                message: "busy timeout is 0; concurrent workers will fail on lock contention"
                    .to_string(),
            });
        }

        issues
    }
}

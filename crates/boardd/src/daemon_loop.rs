//! Daemon loop: a testable `daemon_tick()` plus the sleep/shutdown driver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use board_core::types::UserId;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::queue::DequeuedAttempt;
use crate::service::{BoardService, ServiceError};

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub users_scanned: usize,
    pub promoted: Vec<(UserId, DequeuedAttempt)>,
    pub errors: usize,
    pub pruned_sandbox_creations: usize,
}

impl TickSummary {
    pub fn touched(&self) -> bool {
        !self.promoted.is_empty() || self.errors > 0
    }
}

/// Promote waiting attempts for every user, up to each user's free slots.
///
/// A failure for one user is logged and counted so the others still drain.
/// Sandbox creations older than the rate window are pruned first.
pub fn daemon_tick(service: &BoardService, now: DateTime<Utc>) -> Result<TickSummary, ServiceError> {
    let pruned = service.prune_sandbox_history(now)?;
    if pruned > 0 {
        debug!(pruned, "pruned expired sandbox creations");
    }
    let users = service.store.list_users_with_queued_work()?;
    let mut summary = TickSummary {
        users_scanned: users.len(),
        pruned_sandbox_creations: pruned,
        ..TickSummary::default()
    };

    for user_id in users {
        let drained = service
            .free_slots(&user_id)
            .and_then(|slots| service.drain_queue(&user_id, now, slots));
        match drained {
            Ok(promoted) => {
                debug!(user = %user_id, promoted = promoted.len(), "drained user queue");
                summary
                    .promoted
                    .extend(promoted.into_iter().map(|attempt| (user_id.clone(), attempt)));
            }
            Err(err) => {
                warn!(user = %user_id, error = %err, "failed to drain user queue");
                summary.errors += 1;
            }
        }
    }
    Ok(summary)
}

/// Tick every `interval` until `shutdown` is set. Returns the number of ticks.
pub fn run_until_shutdown(
    service: &BoardService,
    interval: Duration,
    shutdown: &AtomicBool,
) -> Result<u64, ServiceError> {
    let mut ticks = 0;
    while !shutdown.load(Ordering::Relaxed) {
        let summary = daemon_tick(service, Utc::now())?;
        ticks += 1;
        if summary.touched() {
            info!(
                users = summary.users_scanned,
                promoted = summary.promoted.len(),
                errors = summary.errors,
                pruned = summary.pruned_sandbox_creations,
                "daemon tick"
            );
        }

        let deadline = Instant::now() + interval;
        while !shutdown.load(Ordering::Relaxed) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(SHUTDOWN_POLL.min(deadline - now));
        }
    }
    info!(ticks, "daemon stopping");
    Ok(ticks)
}

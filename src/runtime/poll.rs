use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::jobs::tracker::JobTracker;
use crate::runtime::session::SessionHandle;
use crate::runtime::{CompletionCheck, FlowContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    pub attempts: u32,
    pub found: usize,
}

/// Drives one job's completion check on a fixed cadence until the expected
/// artifact count is reached or the attempt budget runs out.
///
/// A failed check attempt is logged and counted against the budget, never
/// propagated: vendors flake, the next attempt may succeed. Every attempt
/// touches the job record so updated-at doubles as a liveness signal.
/// Exhaustion with zero artifacts marks the job timed out; exhaustion
/// after a partial merge leaves the completed record as is.
pub async fn poll_until_done(
    tracker: &JobTracker,
    job_id: &str,
    session: &SessionHandle,
    check: &dyn CompletionCheck,
    ctx: &FlowContext,
    expected: usize,
    settings: PollSettings,
) -> PollOutcome {
    let mut seen: HashSet<String> = HashSet::new();
    let mut attempts = 0u32;

    while attempts < settings.max_attempts {
        attempts += 1;
        if let Err(err) = tracker.touch(job_id) {
            warn!(job_id, error = %err, "poll touch failed; stopping");
            break;
        }

        match check.check(session, ctx).await {
            Ok(payloads) => {
                let fresh: Vec<_> = payloads
                    .into_iter()
                    .filter(|payload| seen.insert(payload.key().to_string()))
                    .collect();
                if !fresh.is_empty() {
                    if let Err(err) = tracker.append_results(job_id, fresh).await {
                        warn!(job_id, error = %err, "storing poll results failed");
                        if let Err(err) =
                            tracker.mark_failed(job_id, &format!("storage error: {err}"))
                        {
                            debug!(job_id, error = %err, "job already settled");
                        }
                        return PollOutcome {
                            attempts,
                            found: seen.len(),
                        };
                    }
                }
                if seen.len() >= expected {
                    info!(job_id, attempts, found = seen.len(), "poll complete");
                    return PollOutcome {
                        attempts,
                        found: seen.len(),
                    };
                }
            }
            Err(err) => {
                debug!(job_id, attempt = attempts, error = %err, "poll attempt failed");
            }
        }

        if attempts < settings.max_attempts {
            tokio::time::sleep(settings.interval).await;
        }
    }

    if seen.is_empty() {
        warn!(job_id, attempts, "poll budget exhausted with no artifacts");
        if let Err(err) = tracker.mark_timeout(job_id, "timed out waiting for vendor results") {
            debug!(job_id, error = %err, "job already settled");
        }
    } else {
        info!(
            job_id,
            attempts,
            found = seen.len(),
            expected,
            "poll budget exhausted with partial results"
        );
    }
    PollOutcome {
        attempts,
        found: seen.len(),
    }
}

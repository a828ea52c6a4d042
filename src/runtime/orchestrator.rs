use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::jobs::tracker::JobTracker;
use crate::jobs::JobStatus;
use crate::runtime::limiter::ConcurrencyLimiter;
use crate::runtime::poll::{poll_until_done, PollSettings};
use crate::runtime::session::{SessionHandle, SessionManager};
use crate::runtime::{CompletionCheck, FlowContext, GatewayStats, GenerationPlan, VendorAction};
use crate::vendors::Integration;

/// Accepts validated generation plans and runs them in the background.
///
/// `submit` is synchronous: it mints the job id, creates the PENDING
/// record, and hands the plan to a spawned task gated by the limiter.
/// Everything that can go wrong from there settles the job record;
/// nothing propagates back to the caller.
pub struct RequestOrchestrator {
    integration: Integration,
    tracker: Arc<JobTracker>,
    sessions: Arc<SessionManager>,
    limiter: ConcurrencyLimiter,
    stats: Arc<GatewayStats>,
}

impl RequestOrchestrator {
    pub fn new(
        integration: Integration,
        tracker: Arc<JobTracker>,
        sessions: Arc<SessionManager>,
        limiter: ConcurrencyLimiter,
        stats: Arc<GatewayStats>,
    ) -> Self {
        Self {
            integration,
            tracker,
            sessions,
            limiter,
            stats,
        }
    }

    pub fn integration(&self) -> Integration {
        self.integration
    }

    pub fn active_count(&self) -> usize {
        self.limiter.active_count()
    }

    pub fn submit(&self, plan: GenerationPlan) -> String {
        let job_id = format!("{}-{}", self.integration.as_str(), Uuid::new_v4());
        self.tracker.create(&job_id, self.integration);
        self.stats.record_accepted();
        info!(
            integration = self.integration.as_str(),
            job_id, "generation accepted"
        );

        let tracker = Arc::clone(&self.tracker);
        let sessions = Arc::clone(&self.sessions);
        let stats = Arc::clone(&self.stats);
        let limiter = self.limiter.clone();
        let spawned_id = job_id.clone();
        tokio::spawn(async move {
            limiter
                .schedule(run_plan(tracker, sessions, stats, spawned_id, plan))
                .await;
        });
        job_id
    }
}

async fn run_plan(
    tracker: Arc<JobTracker>,
    sessions: Arc<SessionManager>,
    stats: Arc<GatewayStats>,
    job_id: String,
    plan: GenerationPlan,
) {
    if let Err(err) = tracker.mark_processing(&job_id) {
        warn!(job_id, error = %err, "could not mark job processing");
        stats.record_failure();
        return;
    }

    let GenerationPlan {
        context: mut ctx,
        steps,
        check,
        poll,
    } = plan;
    drive(&tracker, &sessions, &job_id, &mut ctx, &steps, check.as_ref(), poll).await;

    if let Some(page) = ctx.page.take() {
        if let Err(err) = page.close().await {
            debug!(job_id, error = %err, "page close failed");
        }
    }

    match tracker.get(&job_id).map(|record| record.status) {
        Some(JobStatus::Completed) => stats.record_success(),
        _ => stats.record_failure(),
    }
}

async fn drive(
    tracker: &JobTracker,
    sessions: &SessionManager,
    job_id: &str,
    ctx: &mut FlowContext,
    steps: &[Arc<dyn VendorAction>],
    check: &dyn CompletionCheck,
    poll: PollSettings,
) {
    let mut session = match acquire_with_retry(sessions, job_id).await {
        Some(session) => session,
        None => {
            fail(tracker, job_id, "browser session unavailable");
            return;
        }
    };

    for step in steps {
        match run_step(step.as_ref(), &session, ctx).await {
            Ok(()) => continue,
            Err(err) if err.is_session_class() || !session.is_connected() => {
                warn!(
                    job_id,
                    step = step.name(),
                    error = %err,
                    "step lost its session; retrying once with a fresh one"
                );
                session = match sessions.refresh().await {
                    Ok(session) => session,
                    Err(refresh_err) => {
                        fail(
                            tracker,
                            job_id,
                            &format!("session replacement failed: {refresh_err}"),
                        );
                        return;
                    }
                };
                ctx.page = None;
                if let Err(err) = run_step(step.as_ref(), &session, ctx).await {
                    fail(
                        tracker,
                        job_id,
                        &format!("step {} failed after session retry: {err}", step.name()),
                    );
                    return;
                }
            }
            Err(err) => {
                fail(
                    tracker,
                    job_id,
                    &format!("step {} failed: {err}", step.name()),
                );
                return;
            }
        }
    }

    if ctx.request_id.is_none() {
        fail(
            tracker,
            job_id,
            "vendor returned no request identifier; nothing to poll for",
        );
        return;
    }

    let expected = ctx.batch_size.max(1);
    poll_until_done(tracker, job_id, &session, check, ctx, expected, poll).await;
}

async fn run_step(
    step: &dyn VendorAction,
    session: &Arc<SessionHandle>,
    ctx: &mut FlowContext,
) -> Result<(), crate::runtime::VendorError> {
    debug!(step = step.name(), session_id = session.id(), "running step");
    step.perform(session, ctx).await
}

async fn acquire_with_retry(
    sessions: &SessionManager,
    job_id: &str,
) -> Option<Arc<SessionHandle>> {
    match sessions.acquire().await {
        Ok(session) => Some(session),
        Err(err) => {
            warn!(job_id, error = %err, "session acquire failed; retrying once");
            sessions.acquire().await.ok()
        }
    }
}

fn fail(tracker: &JobTracker, job_id: &str, message: &str) {
    warn!(job_id, message, "generation failed");
    if let Err(err) = tracker.mark_failed(job_id, message) {
        debug!(job_id, error = %err, "job already settled");
    }
}

//! One render attempt, from `Queued -> Running` to the next state.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::types::WorkerContext;
use crate::estimator::{HistoricalSample, ShapeSignature};
use crate::job::{CancelFlag, Job, JobState};
use crate::metrics;
use crate::recovery::ErrorContext;
use crate::renderer::{RenderError, RenderOutput, RenderRequest};
use crate::scheduler::{AdmissionPermit, Dispatch};

const PROGRESS_BUFFER: usize = 64;

/// How a render attempt ended.
#[derive(Debug)]
enum Attempt {
    Completed(RenderOutput),
    Failed(RenderError),
    Cancelled,
}

/// Run one admitted job. Permits are released before this returns, or
/// before the retry delay starts.
pub(super) async fn process(ctx: &WorkerContext, worker_id: usize, dispatch: Dispatch) {
    let Dispatch {
        job,
        permit,
        cancel,
    } = dispatch;
    let store = ctx.scheduler.store();

    let job = match store.transition(&job.id, JobState::Queued, JobState::Running) {
        Ok(job) => job,
        Err(e) => {
            // Cancelled between dequeue and start.
            debug!(job_id = %job.id, "Skipping job: {}", e);
            return;
        }
    };

    ctx.stats.active.fetch_add(1, Ordering::Relaxed);
    metrics::RUNNING_JOBS.inc();
    ctx.estimator.track_start(&job.id);
    info!(
        job_id = %job.id,
        worker = worker_id,
        kind = %job.kind,
        attempt = job.attempt_count,
        "Render started"
    );

    let started = Instant::now();
    let attempt = render(ctx, &job, &cancel).await;
    let elapsed = ctx
        .estimator
        .track_end(&job.id)
        .unwrap_or_else(|| started.elapsed());

    ctx.stats.active.fetch_sub(1, Ordering::Relaxed);
    metrics::RUNNING_JOBS.dec();

    match attempt {
        Attempt::Completed(output) => complete(ctx, &job, output, elapsed),
        Attempt::Cancelled => finish_cancelled(ctx, &job.id),
        Attempt::Failed(err) => fail(ctx, &job, err, elapsed, permit, cancel),
    }
}

/// Drive the renderer while draining its progress channel, honoring the
/// hard timeout and the cancel flag.
async fn render(ctx: &WorkerContext, job: &Job, cancel: &CancelFlag) -> Attempt {
    if cancel.is_cancelled() {
        return Attempt::Cancelled;
    }

    let (progress_tx, mut progress_rx) = mpsc::channel::<f32>(PROGRESS_BUFFER);
    let timeout = ctx.config.job_timeout();
    // A panicking renderer fails the attempt instead of taking the worker down.
    let execution = tokio::time::timeout(
        timeout,
        AssertUnwindSafe(ctx.renderer.execute(
            RenderRequest::from_job(job),
            progress_tx,
            cancel.clone(),
        ))
        .catch_unwind()
        .map(|outcome| outcome.unwrap_or_else(|payload| Err(panic_error(payload)))),
    );
    tokio::pin!(execution);
    let mut progress_open = true;

    loop {
        tokio::select! {
            result = &mut execution => {
                while let Ok(percent) = progress_rx.try_recv() {
                    record_progress(ctx, &job.id, percent);
                }
                return match result {
                    Ok(Ok(output)) => Attempt::Completed(output),
                    Ok(Err(RenderError::Cancelled)) => Attempt::Cancelled,
                    Ok(Err(_)) if cancel.is_cancelled() => Attempt::Cancelled,
                    Ok(Err(e)) => Attempt::Failed(e),
                    Err(_) => Attempt::Failed(RenderError::Timeout {
                        timeout_secs: timeout.as_secs(),
                    }),
                };
            }
            message = progress_rx.recv(), if progress_open => {
                match message {
                    Some(percent) => record_progress(ctx, &job.id, percent),
                    None => progress_open = false,
                }
            }
            _ = cancel.cancelled() => {
                info!(job_id = %job.id, "Cancel observed, waiting for renderer");
                let grace = ctx.config.cancel_grace();
                if tokio::time::timeout(grace, &mut execution).await.is_err() {
                    warn!(
                        job_id = %job.id,
                        grace_ms = grace.as_millis() as u64,
                        "Renderer ignored cancel, abandoning render"
                    );
                }
                return Attempt::Cancelled;
            }
        }
    }
}

fn panic_error(payload: Box<dyn Any + Send>) -> RenderError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    RenderError::failed(format!("renderer panicked: {}", message))
}

fn record_progress(ctx: &WorkerContext, job_id: &str, percent: f32) {
    match ctx.scheduler.store().report_progress(job_id, percent) {
        Ok(stored) => ctx.estimator.observe_progress(job_id, stored),
        Err(e) => debug!(job_id = %job_id, "Dropping progress update: {}", e),
    }
}

fn complete(ctx: &WorkerContext, job: &Job, output: RenderOutput, elapsed: Duration) {
    let result_ref = output.result_ref.clone();
    let completed = ctx.scheduler.store().transition_with(
        &job.id,
        JobState::Running,
        JobState::Completed,
        |j| {
            j.result_ref = Some(result_ref);
            j.progress = 100.0;
        },
    );
    if let Err(e) = completed {
        warn!(job_id = %job.id, "Could not mark job completed: {}", e);
        return;
    }

    let secs = elapsed.as_secs_f64();
    ctx.estimator.record(HistoricalSample::new(
        ShapeSignature::of(job.kind, &job.parameters),
        secs,
        true,
    ));
    if let Some(previous) = &job.last_error {
        ctx.strategist.record_outcome(previous.category, true);
    }

    ctx.stats.total_processed.fetch_add(1, Ordering::Relaxed);
    metrics::JOBS_FINISHED
        .with_label_values(&[job.kind.as_str(), "completed"])
        .inc();
    metrics::RENDER_DURATION
        .with_label_values(&[job.kind.as_str(), "success"])
        .observe(secs);
    info!(
        job_id = %job.id,
        result_ref = %output.result_ref,
        elapsed_ms = elapsed.as_millis() as u64,
        "Render completed"
    );
}

fn finish_cancelled(ctx: &WorkerContext, job_id: &str) {
    match ctx
        .scheduler
        .store()
        .transition(job_id, JobState::Running, JobState::Cancelled)
    {
        Ok(job) => {
            ctx.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
            metrics::JOBS_FINISHED
                .with_label_values(&[job.kind.as_str(), "cancelled"])
                .inc();
            info!(job_id = %job_id, "Job cancelled");
        }
        Err(e) => warn!(job_id = %job_id, "Could not mark job cancelled: {}", e),
    }
}

fn fail(
    ctx: &WorkerContext,
    job: &Job,
    err: RenderError,
    elapsed: Duration,
    permit: AdmissionPermit,
    cancel: CancelFlag,
) {
    metrics::RENDER_DURATION
        .with_label_values(&[job.kind.as_str(), "failure"])
        .observe(elapsed.as_secs_f64());
    ctx.estimator.record(HistoricalSample::new(
        ShapeSignature::of(job.kind, &job.parameters),
        elapsed.as_secs_f64(),
        false,
    ));

    let context = ErrorContext::new("render")
        .for_job(&job.id, job.kind)
        .with_attempt_count(job.attempt_count);
    let record = ctx
        .strategist
        .analyze(&err, &context, ctx.config.max_retries);
    let category = record.category;

    if record.retriable {
        let delay = ctx.strategist.backoff(job.attempt_count);
        let next_attempt_at =
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let annotated = ctx.scheduler.store().annotate(&job.id, |j| {
            j.last_error = Some(record);
            j.next_attempt_at = Some(next_attempt_at);
        });
        if let Err(e) = annotated {
            warn!(job_id = %job.id, "Could not record retry: {}", e);
            return;
        }

        // Permits go back before the delay so other jobs can run meanwhile.
        drop(permit);
        ctx.stats.total_retried.fetch_add(1, Ordering::Relaxed);
        metrics::RETRIES.with_label_values(&[category.as_str()]).inc();
        warn!(
            job_id = %job.id,
            attempt = job.attempt_count,
            category = %category,
            delay_ms = delay.as_millis() as u64,
            "Render failed, retry scheduled: {}",
            err
        );
        schedule_retry(ctx, job.id.clone(), delay, cancel);
        return;
    }

    let failed = ctx.scheduler.store().transition_with(
        &job.id,
        JobState::Running,
        JobState::Failed,
        |j| j.last_error = Some(record),
    );
    drop(permit);
    match failed {
        Ok(_) => {
            if let Some(previous) = &job.last_error {
                ctx.strategist.record_outcome(previous.category, false);
            }
            ctx.stats.total_failed.fetch_add(1, Ordering::Relaxed);
            metrics::JOBS_FINISHED
                .with_label_values(&[job.kind.as_str(), "failed"])
                .inc();
            error!(
                job_id = %job.id,
                attempt = job.attempt_count,
                category = %category,
                "Render failed: {}",
                err
            );
        }
        Err(e) => warn!(job_id = %job.id, "Could not mark job failed: {}", e),
    }
}

/// Wait out the backoff on a timer task, then re-queue. A cancel during the
/// wait ends the job instead.
fn schedule_retry(ctx: &WorkerContext, job_id: String, delay: Duration, cancel: CancelFlag) {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {}
        }
        if cancel.is_cancelled() {
            finish_cancelled(&ctx, &job_id);
            return;
        }
        if let Err(e) = ctx.scheduler.requeue(&job_id) {
            warn!(job_id = %job_id, "Could not re-queue job: {}", e);
        }
    });
}

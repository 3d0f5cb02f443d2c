//! Pure functions deriving batch state and progress from child snapshots.

use super::types::{AdmissionState, Batch, BatchCounts, BatchState};
use crate::job::{Job, JobState};

pub fn child_counts(children: &[Job]) -> BatchCounts {
    children.iter().fold(
        BatchCounts {
            total: children.len(),
            ..BatchCounts::default()
        },
        |mut counts, job| {
            match job.state {
                JobState::Queued => counts.queued += 1,
                JobState::Running => counts.running += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Cancelled => counts.cancelled += 1,
            }
            counts
        },
    )
}

/// Rules apply in order:
/// 1. any child Queued or Running: Pending before start, Paused while
///    admission is halted, Running otherwise;
/// 2. every child Completed: Completed;
/// 3. a Failed child under `fail_fast`, or under `best_effort` once all are
///    terminal: Failed;
/// 4. otherwise Cancelled.
pub fn derive_state(batch: &Batch, counts: &BatchCounts) -> BatchState {
    if counts.unfinished() > 0 {
        return match batch.admission {
            AdmissionState::Pending => BatchState::Pending,
            AdmissionState::Paused => BatchState::Paused,
            AdmissionState::Admitting => BatchState::Running,
        };
    }
    if counts.completed == counts.total {
        return BatchState::Completed;
    }
    // Both policies agree once nothing is left to run.
    if counts.failed > 0 {
        return BatchState::Failed;
    }
    BatchState::Cancelled
}

/// Mean child progress. Completed children count as 100; everything else
/// counts its last known progress.
pub fn aggregate_progress(children: &[Job]) -> f32 {
    if children.is_empty() {
        return 0.0;
    }
    let sum: f32 = children
        .iter()
        .map(|job| match job.state {
            JobState::Completed => 100.0,
            _ => job.progress,
        })
        .sum();
    sum / children.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::FailPolicy;
    use crate::job::{Priority, RenderKind, RenderParameters};
    use chrono::Utc;

    fn batch(policy: FailPolicy, admission: AdmissionState) -> Batch {
        Batch {
            id: "b".to_string(),
            name: "batch".to_string(),
            description: None,
            priority: Priority::Normal,
            concurrency_limit: 2,
            job_ids: Vec::new(),
            fail_policy: policy,
            admission,
            created_at: Utc::now(),
            started_at: None,
        }
    }

    fn child(state: JobState, progress: f32) -> Job {
        let mut job = Job::new(
            RenderKind::Matrix,
            RenderParameters::defaults(RenderKind::Matrix),
            Priority::Normal,
        );
        job.state = state;
        job.progress = progress;
        job
    }

    fn state_of(policy: FailPolicy, admission: AdmissionState, states: &[JobState]) -> BatchState {
        let children: Vec<Job> = states.iter().map(|s| child(*s, 0.0)).collect();
        derive_state(&batch(policy, admission), &child_counts(&children))
    }

    #[test]
    fn test_progress_is_mean() {
        let children = vec![
            child(JobState::Running, 50.0),
            child(JobState::Completed, 80.0),
        ];
        assert_eq!(aggregate_progress(&children), 75.0);
        assert_eq!(aggregate_progress(&[]), 0.0);
    }

    #[test]
    fn test_failed_child_keeps_last_progress() {
        let children = vec![
            child(JobState::Failed, 40.0),
            child(JobState::Cancelled, 20.0),
        ];
        assert_eq!(aggregate_progress(&children), 30.0);
    }

    #[test]
    fn test_unfinished_children_follow_admission() {
        use AdmissionState::*;
        let states = [JobState::Queued, JobState::Completed];
        assert_eq!(state_of(FailPolicy::BestEffort, Pending, &states), BatchState::Pending);
        assert_eq!(state_of(FailPolicy::BestEffort, Admitting, &states), BatchState::Running);
        assert_eq!(state_of(FailPolicy::BestEffort, Paused, &states), BatchState::Paused);
        // Still running while a failed sibling's cancellations land.
        assert_eq!(
            state_of(FailPolicy::FailFast, Admitting, &[JobState::Failed, JobState::Running]),
            BatchState::Running
        );
    }

    #[test]
    fn test_terminal_rules() {
        use AdmissionState::Admitting;
        use JobState::*;
        assert_eq!(
            state_of(FailPolicy::BestEffort, Admitting, &[Completed, Completed]),
            BatchState::Completed
        );
        assert_eq!(
            state_of(FailPolicy::BestEffort, Admitting, &[Completed, Failed]),
            BatchState::Failed
        );
        assert_eq!(
            state_of(FailPolicy::FailFast, Admitting, &[Failed, Cancelled]),
            BatchState::Failed
        );
        assert_eq!(
            state_of(FailPolicy::BestEffort, Admitting, &[Cancelled, Cancelled]),
            BatchState::Cancelled
        );
        assert_eq!(
            state_of(FailPolicy::BestEffort, Admitting, &[Completed, Cancelled]),
            BatchState::Cancelled
        );
    }
}

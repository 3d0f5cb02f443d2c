//! The single owned registry of jobs. Every state change goes through
//! [`JobStore::transition`], an atomic compare-and-set on the prior state.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::debug;

use super::cancel::CancelFlag;
use super::types::{Job, JobState};
use crate::error::SchedulerError;
use crate::persistence::PersistenceHandle;

const EVENT_CAPACITY: usize = 1024;

/// Change notifications published by the store.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Created {
        job_id: String,
        batch_id: Option<String>,
    },
    Transitioned {
        job_id: String,
        batch_id: Option<String>,
        from: JobState,
        to: JobState,
    },
    Removed {
        job_id: String,
    },
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub batch_id: Option<String>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        if let Some(state) = self.state {
            if job.state != state {
                return false;
            }
        }
        if let Some(ref batch_id) = self.batch_id {
            if job.batch_id.as_deref() != Some(batch_id.as_str()) {
                return false;
            }
        }
        true
    }
}

struct JobEntry {
    job: Job,
    cancel: CancelFlag,
}

pub struct JobStore {
    jobs: RwLock<HashMap<String, JobEntry>>,
    events: broadcast::Sender<JobEvent>,
    mirror: Option<PersistenceHandle>,
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            jobs: RwLock::new(HashMap::new()),
            events,
            mirror: None,
        }
    }

    /// Mirror every mutation to persistence (write-behind).
    pub fn with_mirror(mut self, mirror: PersistenceHandle) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, JobEntry>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, JobEntry>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn mirror(&self, job: &Job) {
        if let Some(ref mirror) = self.mirror {
            mirror.save_job(job);
        }
    }

    /// Register a job and return its cancel flag. The job keeps whatever state it carries.
    pub fn insert(&self, job: Job) -> CancelFlag {
        let cancel = CancelFlag::new();
        let event = JobEvent::Created {
            job_id: job.id.clone(),
            batch_id: job.batch_id.clone(),
        };
        self.mirror(&job);
        self.write().insert(
            job.id.clone(),
            JobEntry {
                job,
                cancel: cancel.clone(),
            },
        );
        self.publish(event);
        cancel
    }

    pub fn get(&self, job_id: &str) -> Result<Job, SchedulerError> {
        self.read()
            .get(job_id)
            .map(|entry| entry.job.clone())
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.read().contains_key(job_id)
    }

    pub fn cancel_flag(&self, job_id: &str) -> Result<CancelFlag, SchedulerError> {
        self.read()
            .get(job_id)
            .map(|entry| entry.cancel.clone())
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))
    }

    /// Compare-and-set `from -> to`. Fails with `InvalidTransition` when the
    /// edge is illegal or the job is no longer in `from`; the job is untouched.
    pub fn transition(
        &self,
        job_id: &str,
        from: JobState,
        to: JobState,
    ) -> Result<Job, SchedulerError> {
        self.transition_with(job_id, from, to, |_| {})
    }

    /// Like [`transition`](Self::transition), applying `update` to the job
    /// inside the same critical section.
    pub fn transition_with<F>(
        &self,
        job_id: &str,
        from: JobState,
        to: JobState,
        update: F,
    ) -> Result<Job, SchedulerError>
    where
        F: FnOnce(&mut Job),
    {
        let snapshot = {
            let mut jobs = self.write();
            let entry = jobs
                .get_mut(job_id)
                .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
            let job = &mut entry.job;

            if job.state != from || !from.can_transition_to(to) {
                return Err(SchedulerError::InvalidTransition {
                    job_id: job_id.to_string(),
                    from: job.state,
                    to,
                });
            }

            update(job);

            let now = Utc::now();
            match (from, to) {
                (JobState::Queued, JobState::Running) => {
                    job.started_at = Some(now);
                    job.next_attempt_at = None;
                }
                (JobState::Running, JobState::Queued) => {
                    job.attempt_count += 1;
                    job.progress = 0.0;
                    job.next_attempt_at = None;
                }
                _ => {}
            }
            if to.is_terminal() {
                job.finished_at = Some(now);
                job.next_attempt_at = None;
            }
            job.state = to;
            job.updated_at = now;
            job.clone()
        };

        debug!(job_id = %job_id, from = %from, to = %to, "Job transitioned");
        self.mirror(&snapshot);
        self.publish(JobEvent::Transitioned {
            job_id: job_id.to_string(),
            batch_id: snapshot.batch_id.clone(),
            from,
            to,
        });
        Ok(snapshot)
    }

    /// Record renderer progress. Only Running jobs move, and only forward.
    /// Returns the stored value.
    pub fn report_progress(&self, job_id: &str, percent: f32) -> Result<f32, SchedulerError> {
        let mut jobs = self.write();
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        let job = &mut entry.job;
        if job.state == JobState::Running && !job.is_backing_off() && percent.is_finite() {
            let clamped = percent.clamp(0.0, 100.0);
            if clamped > job.progress {
                job.progress = clamped;
                job.updated_at = Utc::now();
            }
        }
        Ok(job.progress)
    }

    /// Change non-state fields (error record, retry time, promotion) without a transition.
    pub fn annotate<F>(&self, job_id: &str, update: F) -> Result<Job, SchedulerError>
    where
        F: FnOnce(&mut Job),
    {
        let snapshot = {
            let mut jobs = self.write();
            let entry = jobs
                .get_mut(job_id)
                .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
            let state = entry.job.state;
            update(&mut entry.job);
            entry.job.state = state;
            entry.job.updated_at = Utc::now();
            entry.job.clone()
        };
        self.mirror(&snapshot);
        Ok(snapshot)
    }

    /// Drop a job from the registry. Callers only remove terminal jobs.
    pub fn remove(&self, job_id: &str) -> Result<Job, SchedulerError> {
        let job = self
            .write()
            .remove(job_id)
            .map(|entry| entry.job)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        self.publish(JobEvent::Removed {
            job_id: job_id.to_string(),
        });
        Ok(job)
    }

    /// Jobs matching `filter`, oldest first.
    pub fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .read()
            .values()
            .filter(|entry| filter.matches(&entry.job))
            .map(|entry| entry.job.clone())
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        jobs
    }

    /// Job count per state.
    pub fn counts(&self) -> HashMap<JobState, usize> {
        let mut counts = HashMap::new();
        for entry in self.read().values() {
            *counts.entry(entry.job.state).or_insert(0) += 1;
        }
        counts
    }

    pub fn count(&self, state: JobState) -> usize {
        self.read()
            .values()
            .filter(|entry| entry.job.state == state)
            .count()
    }

    /// Jobs that are Queued or Running.
    pub fn active_count(&self) -> usize {
        self.read()
            .values()
            .filter(|entry| !entry.job.state.is_terminal())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Priority, RenderKind, RenderParameters};

    fn job() -> Job {
        Job::new(
            RenderKind::Matrix,
            RenderParameters::defaults(RenderKind::Matrix),
            Priority::Normal,
        )
    }

    fn store_with_job() -> (JobStore, String) {
        let store = JobStore::new();
        let job = job();
        let id = job.id.clone();
        store.insert(job);
        (store, id)
    }

    #[test]
    fn test_transition_sets_timestamps() {
        let (store, id) = store_with_job();
        let running = store
            .transition(&id, JobState::Queued, JobState::Running)
            .unwrap();
        assert!(running.started_at.is_some());
        assert!(running.finished_at.is_none());

        let done = store
            .transition_with(&id, JobState::Running, JobState::Completed, |job| {
                job.result_ref = Some("out.mp4".to_string());
            })
            .unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.result_ref.as_deref(), Some("out.mp4"));
        assert!(done.finished_at.is_some());
    }

    #[test]
    fn test_cas_rejects_stale_expected_state() {
        let (store, id) = store_with_job();
        store
            .transition(&id, JobState::Queued, JobState::Cancelled)
            .unwrap();

        let err = store
            .transition(&id, JobState::Queued, JobState::Running)
            .unwrap_err();
        assert_eq!(
            err,
            SchedulerError::InvalidTransition {
                job_id: id.clone(),
                from: JobState::Cancelled,
                to: JobState::Running,
            }
        );
        assert_eq!(store.get(&id).unwrap().state, JobState::Cancelled);
    }

    #[test]
    fn test_illegal_edge_leaves_state_unchanged() {
        let (store, id) = store_with_job();
        let err = store
            .transition(&id, JobState::Queued, JobState::Completed)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTransition { .. }));
        assert_eq!(store.get(&id).unwrap().state, JobState::Queued);
    }

    #[test]
    fn test_retry_edge_resets_progress_and_counts_attempt() {
        let (store, id) = store_with_job();
        store
            .transition(&id, JobState::Queued, JobState::Running)
            .unwrap();
        store.report_progress(&id, 40.0).unwrap();

        let requeued = store
            .transition(&id, JobState::Running, JobState::Queued)
            .unwrap();
        assert_eq!(requeued.attempt_count, 1);
        assert_eq!(requeued.progress, 0.0);
    }

    #[test]
    fn test_progress_is_monotonic_and_clamped() {
        let (store, id) = store_with_job();
        assert_eq!(store.report_progress(&id, 50.0).unwrap(), 0.0);

        store
            .transition(&id, JobState::Queued, JobState::Running)
            .unwrap();
        assert_eq!(store.report_progress(&id, 50.0).unwrap(), 50.0);
        assert_eq!(store.report_progress(&id, 20.0).unwrap(), 50.0);
        assert_eq!(store.report_progress(&id, 150.0).unwrap(), 100.0);
        assert_eq!(store.report_progress(&id, f32::NAN).unwrap(), 100.0);
    }

    #[test]
    fn test_concurrent_cas_has_single_winner() {
        let (store, id) = store_with_job();
        store
            .transition(&id, JobState::Queued, JobState::Running)
            .unwrap();
        let store = std::sync::Arc::new(store);

        let handles: Vec<_> = [JobState::Completed, JobState::Cancelled, JobState::Failed]
            .into_iter()
            .map(|to| {
                let store = store.clone();
                let id = id.clone();
                std::thread::spawn(move || store.transition(&id, JobState::Running, to).is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_events_are_published() {
        let store = JobStore::new();
        let mut rx = store.subscribe();
        let job = job().with_batch("b1");
        let id = job.id.clone();
        store.insert(job);
        store
            .transition(&id, JobState::Queued, JobState::Cancelled)
            .unwrap();

        assert!(matches!(rx.try_recv().unwrap(), JobEvent::Created { .. }));
        assert_eq!(
            rx.try_recv().unwrap(),
            JobEvent::Transitioned {
                job_id: id,
                batch_id: Some("b1".to_string()),
                from: JobState::Queued,
                to: JobState::Cancelled,
            }
        );
    }

    #[test]
    fn test_remove_unknown_job() {
        let (store, id) = store_with_job();
        assert!(store.remove(&id).is_ok());
        assert!(!store.contains(&id));
        assert_eq!(
            store.remove(&id).unwrap_err(),
            SchedulerError::JobNotFound(id)
        );
    }

    #[test]
    fn test_list_filters_by_batch_and_state() {
        let store = JobStore::new();
        store.insert(job().with_batch("b1"));
        store.insert(job().with_batch("b1"));
        store.insert(job());

        assert_eq!(store.list(&JobFilter::new().with_batch("b1")).len(), 2);
        assert_eq!(
            store
                .list(&JobFilter::new().with_state(JobState::Queued).with_limit(1))
                .len(),
            1
        );
        assert_eq!(store.count(JobState::Queued), 3);
        assert_eq!(store.active_count(), 3);
    }
}

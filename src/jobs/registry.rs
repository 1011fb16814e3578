//! In-memory job registry
//!
//! Holds at most one job per correlation key. The map is guarded by a plain
//! mutex that is never held across an await point, so every operation is
//! atomic with respect to poll tasks and cancellation requests.
//!
//! Each job has a single owner at any time: the poll task while it downloads,
//! the upload task while it uploads. Owners hand over through
//! [`JobRegistry::transition`], which is a compare-and-set on the job state.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{Job, JobKey, JobState};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("a job is already active for {0}")]
    DuplicateKey(JobKey),
    #[error("no job found for {0}")]
    NotFound(JobKey),
    #[error("job {key} is {actual}, expected {expected}")]
    WrongState {
        key: JobKey,
        expected: JobState,
        actual: JobState,
    },
}

#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<Mutex<HashMap<JobKey, Job>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<JobKey, Job>> {
        // A panic while holding the lock cannot leave a half-written entry
        // behind, so the map is still consistent.
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a job under its key
    ///
    /// Fails with [`JobError::DuplicateKey`] if a non-terminal job already
    /// exists for the key. A terminal leftover is replaced.
    pub fn register(&self, job: Job) -> Result<(), JobError> {
        let mut jobs = self.jobs();
        if let Some(existing) = jobs.get(&job.key) {
            if !existing.state.is_terminal() {
                warn!(key = %job.key, state = %existing.state, "Rejecting duplicate job");
                return Err(JobError::DuplicateKey(job.key));
            }
        }
        info!(key = %job.key, kind = ?job.kind, "Registering job");
        jobs.insert(job.key, job);
        Ok(())
    }

    /// Snapshot of the job for `key`
    pub fn get(&self, key: &JobKey) -> Option<Job> {
        self.jobs().get(key).cloned()
    }

    /// Remove the job for `key`, returning it if it existed
    pub fn remove(&self, key: &JobKey) -> Option<Job> {
        let removed = self.jobs().remove(key);
        if removed.is_some() {
            debug!(key = %key, "Job removed from registry");
        }
        removed
    }

    /// Set the cancellation flag of the job for `key`
    ///
    /// Returns whether a job existed. Calling this repeatedly is harmless.
    pub fn request_cancel(&self, key: &JobKey) -> bool {
        match self.jobs().get(key) {
            Some(job) => {
                info!(key = %key, state = %job.state, "Cancellation requested");
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Apply `f` to the job for `key` under the registry lock
    pub fn update<R>(&self, key: &JobKey, f: impl FnOnce(&mut Job) -> R) -> Option<R> {
        self.jobs().get_mut(key).map(f)
    }

    /// Move the job from `expected` to `next`, returning the updated job
    pub fn transition(
        &self,
        key: &JobKey,
        expected: JobState,
        next: JobState,
    ) -> Result<Job, JobError> {
        let mut jobs = self.jobs();
        let job = jobs.get_mut(key).ok_or(JobError::NotFound(*key))?;
        if job.state != expected {
            return Err(JobError::WrongState {
                key: *key,
                expected,
                actual: job.state,
            });
        }
        debug!(key = %key, from = %expected, to = %next, "Job state transition");
        job.state = next;
        Ok(job.clone())
    }

    /// Keys of all jobs that have not reached a terminal state
    pub fn active(&self) -> Vec<JobKey> {
        let mut keys: Vec<JobKey> = self
            .jobs()
            .values()
            .filter(|job| !job.state.is_terminal())
            .map(|job| job.key)
            .collect();
        keys.sort();
        keys
    }

    /// Flag every job for cancellation, returning how many were flagged
    pub fn cancel_all(&self) -> usize {
        let jobs = self.jobs();
        for job in jobs.values() {
            job.cancel.cancel();
        }
        jobs.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.jobs().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobKind;

    fn job(message: i32) -> Job {
        Job::new(JobKey::new(1, message), JobKind::Download, 7)
    }

    #[test]
    fn test_duplicate_active_key_rejected() {
        let registry = JobRegistry::new();
        registry.register(job(1)).unwrap();
        assert_eq!(
            registry.register(job(1)),
            Err(JobError::DuplicateKey(JobKey::new(1, 1)))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_terminal_leftover_is_replaced() {
        let registry = JobRegistry::new();
        let mut old = job(1);
        old.state = JobState::Failed;
        registry.register(old).unwrap();
        registry.register(job(1)).unwrap();
        assert_eq!(
            registry.get(&JobKey::new(1, 1)).unwrap().state,
            JobState::Pending
        );
    }

    #[test]
    fn test_remove_and_cancel_are_idempotent() {
        let registry = JobRegistry::new();
        let key = JobKey::new(1, 1);
        registry.register(job(1)).unwrap();
        let token = registry.get(&key).unwrap().cancel;

        assert!(registry.request_cancel(&key));
        assert!(registry.request_cancel(&key));
        assert!(token.is_cancelled());

        assert!(registry.remove(&key).is_some());
        assert!(registry.remove(&key).is_none());
        assert!(!registry.request_cancel(&key));
    }

    #[test]
    fn test_transition_is_compare_and_set() {
        let registry = JobRegistry::new();
        let key = JobKey::new(1, 1);
        registry.register(job(1)).unwrap();
        registry.update(&key, |job| job.state = JobState::AwaitingUpload);

        let claimed = registry
            .transition(&key, JobState::AwaitingUpload, JobState::Uploading)
            .unwrap();
        assert_eq!(claimed.state, JobState::Uploading);

        // A second claim loses
        assert_eq!(
            registry
                .transition(&key, JobState::AwaitingUpload, JobState::Uploading)
                .unwrap_err(),
            JobError::WrongState {
                key,
                expected: JobState::AwaitingUpload,
                actual: JobState::Uploading,
            }
        );
        assert_eq!(
            registry
                .transition(&JobKey::new(9, 9), JobState::Pending, JobState::Running)
                .unwrap_err(),
            JobError::NotFound(JobKey::new(9, 9))
        );
    }

    #[test]
    fn test_concurrent_register_admits_one() {
        let registry = JobRegistry::new();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.register(job(5)).is_ok())
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(registry.active(), vec![JobKey::new(1, 5)]);
    }

    #[test]
    fn test_cancel_all_flags_every_job() {
        let registry = JobRegistry::new();
        registry.register(job(1)).unwrap();
        registry.register(job(2)).unwrap();
        assert_eq!(registry.cancel_all(), 2);
        assert!(registry.get(&JobKey::new(1, 2)).unwrap().is_cancelled());
    }
}

//! In-memory job catalog.
//!
//! The store is the single owner of [`Job`] records. Readers get immutable
//! snapshots; every mutation goes through [`JobStore::transition`], which is
//! where the state-machine invariants live: no way out of a terminal state,
//! and the exit code is set exactly once, on the terminal transition.
//!
//! Jobs are keyed by the hyphenated UUID in a sorted map so prefix lookup is
//! a range bracket: take the first key at or after the prefix, and if the
//! following key shares the prefix the reference is ambiguous.

pub mod stream;

use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::Utc;
use tracing::debug;

use joblet_core::{Error, Job, JobId, JobState, Result};

pub use stream::{UpdateSink, stream_job_updates};

/// Mutation payload for [`JobStore::transition`].
#[derive(Debug, Default, Clone)]
pub struct Transition {
    pub to: JobState,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub pid: Option<i32>,
}

impl Transition {
    pub fn to(state: JobState) -> Self {
        Self {
            to: state,
            ..Self::default()
        }
    }

    pub fn with_exit(state: JobState, exit_code: i32) -> Self {
        Self {
            to: state,
            exit_code: Some(exit_code),
            ..Self::default()
        }
    }
}

#[derive(Default)]
pub struct JobStore {
    jobs: RwLock<BTreeMap<String, Job>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly accepted job. UUIDs never collide in practice; a
    /// duplicate means a bug upstream.
    pub fn register(&self, job: Job) -> Result<()> {
        let key = job.id.to_string();
        let mut jobs = self.jobs.write().unwrap();
        if jobs.contains_key(&key) {
            return Err(Error::Internal(format!("job {key} already registered")));
        }
        debug!(job_id = %key, state = %job.state, "Registered job");
        jobs.insert(key, job);
        Ok(())
    }

    /// Atomically advance a job's state. Rejects transitions the state
    /// machine forbids and exit codes on non-terminal transitions.
    pub fn transition(&self, id: &JobId, transition: Transition) -> Result<Job> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs
            .get_mut(&id.to_string())
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;

        if !job.state.can_transition_to(transition.to) {
            return Err(Error::Precondition(format!(
                "job {id} cannot go from {} to {}",
                job.state, transition.to
            )));
        }
        if transition.exit_code.is_some() && !transition.to.is_terminal() {
            return Err(Error::Precondition(format!(
                "exit code is only set on terminal transitions, not {}",
                transition.to
            )));
        }

        job.state = transition.to;
        if let Some(pid) = transition.pid {
            job.pid = Some(pid);
        }
        match transition.to {
            JobState::Running => {
                job.started_at.get_or_insert_with(Utc::now);
            }
            state if state.is_terminal() => {
                job.ended_at = Some(Utc::now());
                job.exit_code = transition.exit_code;
                job.error = transition.error.clone();
                job.pid = None;
            }
            _ => {}
        }
        debug!(job_id = %id, state = %job.state, "Job transitioned");
        Ok(job.clone())
    }

    /// Record the init PID of a live job.
    pub fn set_pid(&self, id: &JobId, pid: i32) -> Result<()> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs
            .get_mut(&id.to_string())
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        if job.state.is_terminal() {
            return Err(Error::Precondition(format!(
                "job {id} already reached {}",
                job.state
            )));
        }
        job.pid = Some(pid);
        Ok(())
    }

    /// Snapshot by exact UUID.
    pub fn job(&self, id: &JobId) -> Result<Job> {
        self.jobs
            .read()
            .unwrap()
            .get(&id.to_string())
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("job {id}")))
    }

    /// Resolve a full UUID or any unambiguous prefix of one.
    pub fn job_by_prefix(&self, prefix: &str) -> Result<Job> {
        if prefix.is_empty() {
            return Err(Error::InvalidArgument("empty job reference".into()));
        }
        let jobs = self.jobs.read().unwrap();
        let mut matches = jobs.range(prefix.to_string()..).take(2);
        match matches.next() {
            Some((key, job)) if key.starts_with(prefix) => {
                let ambiguous = matches
                    .next()
                    .is_some_and(|(next_key, _)| next_key.starts_with(prefix));
                if ambiguous {
                    Err(Error::AmbiguousReference(format!(
                        "prefix {prefix} matches multiple jobs"
                    )))
                } else {
                    Ok(job.clone())
                }
            }
            _ => Err(Error::NotFound(format!("job {prefix}"))),
        }
    }

    /// Snapshot of every job, newest first.
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().unwrap().values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Remove one terminal job.
    pub fn delete(&self, id: &JobId) -> Result<Job> {
        let mut jobs = self.jobs.write().unwrap();
        let key = id.to_string();
        let job = jobs
            .get(&key)
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        if !job.state.is_terminal() {
            return Err(Error::Precondition(format!(
                "job {id} is {}; stop it before deleting",
                job.state
            )));
        }
        Ok(jobs.remove(&key).expect("checked above"))
    }

    /// Remove every terminal job; running and scheduled jobs are skipped.
    /// Returns `(deleted, skipped)` along with the deleted records so the
    /// caller can clean up their files.
    pub fn delete_all(&self) -> (Vec<Job>, usize) {
        let mut jobs = self.jobs.write().unwrap();
        let deletable: Vec<String> = jobs
            .iter()
            .filter(|(_, job)| job.state.is_terminal())
            .map(|(key, _)| key.clone())
            .collect();
        let skipped = jobs.len() - deletable.len();
        let deleted = deletable
            .into_iter()
            .filter_map(|key| jobs.remove(&key))
            .collect();
        (deleted, skipped)
    }

    /// Jobs whose scheduled time has arrived.
    pub fn due_scheduled(&self, now: chrono::DateTime<Utc>) -> Vec<Job> {
        self.jobs
            .read()
            .unwrap()
            .values()
            .filter(|job| {
                job.state == JobState::Scheduled
                    && job.scheduled_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use joblet_core::JobSpec;
    use uuid::Uuid;

    fn job_with_id(id: &str) -> Job {
        Job::new(
            JobId::from_uuid(Uuid::parse_str(id).unwrap()),
            JobSpec::new("true"),
        )
    }

    fn register_ids(store: &JobStore, ids: &[&str]) {
        for id in ids {
            store.register(job_with_id(id)).unwrap();
        }
    }

    #[test]
    fn register_rejects_duplicates() {
        let store = JobStore::new();
        let job = Job::new(JobId::new(), JobSpec::new("true"));
        store.register(job.clone()).unwrap();
        assert!(store.register(job).is_err());
    }

    #[test]
    fn prefix_resolution_brackets_the_index() {
        let store = JobStore::new();
        register_ids(
            &store,
            &[
                "aaaa1111-0000-0000-0000-000000000000",
                "aaaa2222-0000-0000-0000-000000000000",
                "bbbb0000-0000-0000-0000-000000000000",
            ],
        );

        // Unique prefix resolves.
        let job = store.job_by_prefix("bbbb").unwrap();
        assert!(job.id.to_string().starts_with("bbbb"));
        let job = store.job_by_prefix("aaaa2").unwrap();
        assert!(job.id.to_string().starts_with("aaaa2"));

        // Shared prefix is ambiguous.
        assert!(matches!(
            store.job_by_prefix("aaaa"),
            Err(Error::AmbiguousReference(_))
        ));

        // No match is not found.
        assert!(matches!(
            store.job_by_prefix("cccc"),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            store.job_by_prefix(""),
            Err(Error::InvalidArgument(_))
        ));

        // The full UUID always resolves.
        let job = store
            .job_by_prefix("aaaa1111-0000-0000-0000-000000000000")
            .unwrap();
        assert!(job.id.to_string().starts_with("aaaa1111"));
    }

    #[test]
    fn terminal_states_are_immutable() {
        let store = JobStore::new();
        let job = Job::new(JobId::new(), JobSpec::new("true"));
        let id = job.id;
        store.register(job).unwrap();

        store
            .transition(&id, Transition::to(JobState::Initializing))
            .unwrap();
        store
            .transition(&id, Transition::to(JobState::Running))
            .unwrap();
        store
            .transition(&id, Transition::with_exit(JobState::Completed, 0))
            .unwrap();

        let err = store
            .transition(&id, Transition::to(JobState::Running))
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        // The record did not change.
        let job = store.job(&id).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.exit_code, Some(0));
    }

    #[test]
    fn exit_code_only_lands_on_terminal_transitions() {
        let store = JobStore::new();
        let job = Job::new(JobId::new(), JobSpec::new("true"));
        let id = job.id;
        store.register(job).unwrap();

        let err = store
            .transition(
                &id,
                Transition {
                    to: JobState::Initializing,
                    exit_code: Some(0),
                    ..Transition::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn running_jobs_cannot_be_deleted() {
        let store = JobStore::new();
        let job = Job::new(JobId::new(), JobSpec::new("sleep"));
        let id = job.id;
        store.register(job).unwrap();
        store
            .transition(&id, Transition::to(JobState::Initializing))
            .unwrap();
        store
            .transition(&id, Transition::to(JobState::Running))
            .unwrap();

        assert!(matches!(store.delete(&id), Err(Error::Precondition(_))));
        store
            .transition(&id, Transition::with_exit(JobState::Failed, 1))
            .unwrap();
        store.delete(&id).unwrap();
        assert!(matches!(store.job(&id), Err(Error::NotFound(_))));
    }

    #[test]
    fn delete_all_reports_counts() {
        let store = JobStore::new();
        let done = Job::new(JobId::new(), JobSpec::new("true"));
        let done_id = done.id;
        store.register(done).unwrap();
        store
            .transition(&done_id, Transition::to(JobState::Initializing))
            .unwrap();
        store
            .transition(&done_id, Transition::to(JobState::Running))
            .unwrap();
        store
            .transition(&done_id, Transition::with_exit(JobState::Completed, 0))
            .unwrap();

        let running = Job::new(JobId::new(), JobSpec::new("sleep"));
        let running_id = running.id;
        store.register(running).unwrap();
        store
            .transition(&running_id, Transition::to(JobState::Initializing))
            .unwrap();
        store
            .transition(&running_id, Transition::to(JobState::Running))
            .unwrap();

        let (deleted, skipped) = store.delete_all();
        assert_eq!(deleted.len(), 1);
        assert_eq!(skipped, 1);
        assert!(store.job(&running_id).is_ok());
    }

    #[test]
    fn due_scheduled_filters_on_wall_clock() {
        let store = JobStore::new();
        let mut early = Job::new(JobId::new(), JobSpec::new("true"));
        early.state = JobState::Scheduled;
        early.scheduled_at = Some(Utc::now() - chrono::Duration::seconds(1));
        let early_id = early.id;
        let mut later = Job::new(JobId::new(), JobSpec::new("true"));
        later.state = JobState::Scheduled;
        later.scheduled_at = Some(Utc::now() + chrono::Duration::hours(1));
        store.register(early).unwrap();
        store.register(later).unwrap();

        let due = store.due_scheduled(Utc::now());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, early_id);
    }
}

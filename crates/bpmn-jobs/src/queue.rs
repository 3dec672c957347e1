use std::collections::HashMap;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use bpmn_incidents::{IncidentSink, NewIncident};
use bpmn_storage::{KvStore, StorageGateway};
use bpmn_types::{
    IncidentType, InstanceId, Job, JobCallback, JobKey, JobStatus, TokenId, VariableMap,
    WorkerId, merge_variables,
};

use crate::error::JobError;

/// Request to create a new PENDING job (§3.5, §4.D `Create`).
pub struct NewJob {
    pub job_type: String,
    pub process_instance_id: InstanceId,
    pub element_id: String,
    pub token_id: TokenId,
    pub variables: VariableMap,
    pub custom_headers: VariableMap,
    pub max_retries: u32,
}

/// Knobs named in §5: activation lease, lease sweep cadence, worker
/// idleness eviction. Builder-style, matching
/// `invariant-engine::engine::EngineConfig`.
#[derive(Clone, Copy, Debug)]
pub struct JobQueueConfig {
    pub lease_sweep_interval: StdDuration,
    pub worker_prune_interval: StdDuration,
    pub worker_idle_timeout: StdDuration,
    pub callback_channel_capacity: usize,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            lease_sweep_interval: StdDuration::from_secs(2),
            worker_prune_interval: StdDuration::from_secs(60),
            worker_idle_timeout: StdDuration::from_secs(5 * 60),
            callback_channel_capacity: 100,
        }
    }
}

impl JobQueueConfig {
    pub fn build<K: KvStore + 'static>(
        &self,
        gateway: StorageGateway<K>,
        incidents: Arc<dyn IncidentSink>,
    ) -> (JobQueue<K>, Receiver<JobCallback>) {
        let (sender, receiver) = sync_channel(self.callback_channel_capacity);
        let inner = Arc::new(JobQueueInner {
            gateway,
            incidents,
            callbacks: sender,
            // Lock Audit: `last_poll` is touched only by `activate` (insert)
            // and the prune thread (remove); never held across storage I/O.
            last_poll: Mutex::new(HashMap::new()),
            activate_lock: Mutex::new(()),
        });

        let sweep_inner = Arc::downgrade(&inner);
        let sweep_interval = self.lease_sweep_interval;
        thread::spawn(move || {
            loop {
                thread::sleep(sweep_interval);
                match sweep_inner.upgrade() {
                    Some(inner) => inner.sweep_leases(Utc::now()),
                    None => break,
                }
            }
        });

        let prune_inner = Arc::downgrade(&inner);
        let prune_interval = self.worker_prune_interval;
        let idle_timeout = chrono::Duration::from_std(self.worker_idle_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        thread::spawn(move || {
            loop {
                thread::sleep(prune_interval);
                match prune_inner.upgrade() {
                    Some(inner) => inner.prune_idle_workers(Utc::now(), idle_timeout),
                    None => break,
                }
            }
        });

        (JobQueue { inner }, receiver)
    }
}

struct JobQueueInner<K: KvStore> {
    gateway: StorageGateway<K>,
    incidents: Arc<dyn IncidentSink>,
    callbacks: SyncSender<JobCallback>,
    last_poll: Mutex<HashMap<WorkerId, DateTime<Utc>>>,
    // Serializes `activate`'s candidate-scan-then-claim critical section.
    // `KvStore` only locks within a single get/put, not across the
    // check-then-act `get_job` + `save_job` pair, so without this two
    // concurrent `activate` calls can both see the same job PENDING and
    // both claim it.
    activate_lock: Mutex<()>,
}

impl<K: KvStore> JobQueueInner<K> {
    fn emit(&self, callback: JobCallback) {
        match self.callbacks.try_send(callback) {
            Ok(()) => {}
            Err(TrySendError::Full(cb)) => {
                warn!(job_key = %cb.job_key, "outbound job callback channel full, dropping");
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("no consumer for job callbacks");
            }
        }
    }

    /// Revert RUNNING jobs whose lease expired and DEFERRED jobs whose
    /// backoff elapsed back to PENDING (§4.D "Lease sweep").
    fn sweep_leases(&self, now: DateTime<Utc>) {
        match self.gateway.list_jobs_by_status(JobStatus::Running) {
            Ok(running) => {
                for mut job in running {
                    if job.lease_expires_at.is_some_and(|expires| expires < now) {
                        job.status = JobStatus::Pending;
                        job.worker_id = None;
                        job.lease_expires_at = None;
                        if let Err(err) = self.gateway.save_job(&job) {
                            warn!(job_key = %job.job_key, error = %err, "failed to revert expired lease");
                        }
                    }
                }
            }
            Err(err) => warn!(error = %err, "lease sweep failed to list running jobs"),
        }

        match self.gateway.list_jobs_by_status(JobStatus::Deferred) {
            Ok(deferred) => {
                for mut job in deferred {
                    if job.scheduled_at.is_some_and(|scheduled| scheduled <= now) {
                        job.status = JobStatus::Pending;
                        job.scheduled_at = None;
                        if let Err(err) = self.gateway.save_job(&job) {
                            warn!(job_key = %job.job_key, error = %err, "failed to return deferred job to pending");
                        }
                    }
                }
            }
            Err(err) => warn!(error = %err, "lease sweep failed to list deferred jobs"),
        }
    }

    fn prune_idle_workers(&self, now: DateTime<Utc>, idle_timeout: chrono::Duration) {
        let mut last_poll = self.last_poll.lock().expect("job queue last_poll lock poisoned");
        last_poll.retain(|_, last| now.signed_duration_since(*last) < idle_timeout);
    }
}

/// Handle to the job queue and lease manager (§4.D). Cloning shares the
/// same storage-backed queue; the lease sweeper and worker pruner threads
/// hold only a `Weak` reference and exit once every clone is dropped.
pub struct JobQueue<K: KvStore> {
    inner: Arc<JobQueueInner<K>>,
}

impl<K: KvStore> Clone for JobQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: KvStore> JobQueue<K> {
    pub fn create(&self, new: NewJob, now: DateTime<Utc>) -> Result<Job, JobError> {
        let job = Job::new_pending(
            new.job_type,
            new.process_instance_id,
            new.element_id,
            new.token_id,
            new.variables,
            new.custom_headers,
            new.max_retries,
            now,
        );
        self.inner.gateway.save_job(&job)?;
        Ok(job)
    }

    pub fn get(&self, job_key: &str) -> Result<Job, JobError> {
        self.inner
            .gateway
            .get_job(job_key)?
            .ok_or_else(|| JobError::NotFound(job_key.to_string()))
    }

    /// Select up to `max_jobs` PENDING jobs of `job_type`, in `created_at`
    /// ascending order, and atomically activate each that is still PENDING
    /// under a re-read (§4.D `Activate`, §5 "optimistic concurrency").
    /// Lost races are silently skipped, per §7's Concurrency error kind —
    /// returning fewer than `max_jobs` is the caller-visible signal, not
    /// an error.
    ///
    /// The whole scan-then-claim pass runs under `activate_lock`: `KvStore`
    /// only locks within a single `get`/`put`, not across the two, so two
    /// concurrent callers re-reading the same candidate would otherwise
    /// both see it PENDING and both claim it.
    pub fn activate(
        &self,
        job_type: &str,
        worker_id: WorkerId,
        max_jobs: usize,
        lease_timeout: StdDuration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobError> {
        {
            let mut last_poll = self.inner.last_poll.lock().expect("job queue last_poll lock poisoned");
            last_poll.insert(worker_id.clone(), now);
        }

        let _guard = self.inner.activate_lock.lock().expect("job queue activate lock poisoned");
        let lease = chrono::Duration::from_std(lease_timeout).unwrap_or_else(|_| chrono::Duration::seconds(30));
        let candidates = self.inner.gateway.list_jobs_by_type_and_status(job_type, JobStatus::Pending)?;

        let mut activated = Vec::with_capacity(max_jobs.min(candidates.len()));
        for candidate in candidates {
            if activated.len() >= max_jobs {
                break;
            }
            // Re-read under `activate_lock`; a job another caller already
            // claimed before this lock was acquired is simply skipped.
            let Some(mut fresh) = self.inner.gateway.get_job(candidate.job_key.as_str())? else {
                continue;
            };
            if fresh.status != JobStatus::Pending {
                continue;
            }
            fresh.status = JobStatus::Running;
            fresh.worker_id = Some(worker_id.clone());
            fresh.lease_expires_at = Some(now + lease);
            self.inner.gateway.save_job(&fresh)?;
            activated.push(fresh);
        }
        Ok(activated)
    }

    /// RUNNING-only; merges `variables` into the job record and emits a
    /// completion callback for the executor (§4.D `Complete`).
    pub fn complete(&self, job_key: &str, variables: VariableMap, now: DateTime<Utc>) -> Result<Job, JobError> {
        let mut job = self.get(job_key)?;
        if job.status != JobStatus::Running {
            return Err(JobError::WrongState {
                job_key: job_key.to_string(),
                actual: job.status,
                expected: "Running",
            });
        }
        merge_variables(&mut job.variables, &variables);
        job.status = JobStatus::Completed;
        job.worker_id = None;
        job.lease_expires_at = None;
        self.inner.gateway.save_job(&job)?;

        self.inner.emit(JobCallback {
            job_key: job.job_key.clone(),
            element_id: job.element_id.clone(),
            token_id: job.token_id.clone(),
            process_instance_id: job.process_instance_id.clone(),
            status: JobStatus::Completed,
            variables: Some(job.variables.clone()),
            error_code: None,
            error_message: None,
            completed_at: now,
        });
        Ok(job)
    }

    /// `remaining_retries > 0` parks the job DEFERRED with a backoff
    /// schedule; `0` fails it terminally and raises a JOB_FAILURE incident
    /// (§4.D `Fail`).
    pub fn fail(
        &self,
        job_key: &str,
        remaining_retries: u32,
        error_message: impl Into<String>,
        backoff: StdDuration,
        now: DateTime<Utc>,
    ) -> Result<Job, JobError> {
        let mut job = self.get(job_key)?;
        if job.status != JobStatus::Running {
            return Err(JobError::WrongState {
                job_key: job_key.to_string(),
                actual: job.status,
                expected: "Running",
            });
        }
        let error_message = error_message.into();
        job.retries = remaining_retries;
        job.error_message = Some(error_message.clone());
        job.worker_id = None;
        job.lease_expires_at = None;

        if remaining_retries > 0 {
            job.status = JobStatus::Deferred;
            let backoff = chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero());
            job.scheduled_at = Some(now + backoff);
            self.inner.gateway.save_job(&job)?;
        } else {
            job.status = JobStatus::Failed;
            job.scheduled_at = None;
            self.inner.gateway.save_job(&job)?;

            self.inner.incidents.raise(
                NewIncident::new(IncidentType::JobFailure, error_message.clone())
                    .instance(job.process_instance_id.clone())
                    .element(job.element_id.clone())
                    .token(job.token_id.clone())
                    .job(job.job_key.clone()),
                now,
            )?;

            self.inner.emit(JobCallback {
                job_key: job.job_key.clone(),
                element_id: job.element_id.clone(),
                token_id: job.token_id.clone(),
                process_instance_id: job.process_instance_id.clone(),
                status: JobStatus::Failed,
                variables: None,
                error_code: None,
                error_message: Some(error_message),
                completed_at: now,
            });
        }
        Ok(job)
    }

    /// Transitions to ERROR_THROWN and emits an error callback carrying
    /// `error_code`; the executor is responsible for locating an attached
    /// boundary error event and raising BPMN_ERROR if none catches it
    /// (§4.D `ThrowError`).
    pub fn throw_error(
        &self,
        job_key: &str,
        error_code: impl Into<String>,
        error_message: impl Into<String>,
        variables: VariableMap,
        now: DateTime<Utc>,
    ) -> Result<Job, JobError> {
        let mut job = self.get(job_key)?;
        if job.status != JobStatus::Running {
            return Err(JobError::WrongState {
                job_key: job_key.to_string(),
                actual: job.status,
                expected: "Running",
            });
        }
        let error_code = error_code.into();
        let error_message = error_message.into();
        merge_variables(&mut job.variables, &variables);
        job.status = JobStatus::ErrorThrown;
        job.worker_id = None;
        job.lease_expires_at = None;
        job.error_code = Some(error_code.clone());
        job.error_message = Some(error_message.clone());
        self.inner.gateway.save_job(&job)?;

        self.inner.emit(JobCallback {
            job_key: job.job_key.clone(),
            element_id: job.element_id.clone(),
            token_id: job.token_id.clone(),
            process_instance_id: job.process_instance_id.clone(),
            status: JobStatus::ErrorThrown,
            variables: Some(job.variables.clone()),
            error_code: Some(error_code),
            error_message: Some(error_message),
            completed_at: now,
        });
        Ok(job)
    }

    /// Resolution action for a `JOB_FAILURE` incident (§4.E "retry (jobs):
    /// set a new retry count and return the job to PENDING"). Valid from
    /// `FAILED` only; `DEFERRED`/`PENDING` jobs never carry an open
    /// incident in the first place.
    pub fn retry(&self, job_key: &str, new_retries: u32, now: DateTime<Utc>) -> Result<Job, JobError> {
        let mut job = self.get(job_key)?;
        if job.status != JobStatus::Failed {
            return Err(JobError::WrongState {
                job_key: job_key.to_string(),
                actual: job.status,
                expected: "Failed",
            });
        }
        job.status = JobStatus::Pending;
        job.retries = new_retries;
        job.error_code = None;
        job.error_message = None;
        job.scheduled_at = None;
        job.lease_expires_at = None;
        let _ = now;
        self.inner.gateway.save_job(&job)?;
        Ok(job)
    }

    /// Any non-terminal job can be CANCELED (§4.D `Cancel`).
    pub fn cancel(&self, job_key: &str) -> Result<Job, JobError> {
        let mut job = self.get(job_key)?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        job.status = JobStatus::Canceled;
        job.worker_id = None;
        job.lease_expires_at = None;
        job.scheduled_at = None;
        self.inner.gateway.save_job(&job)?;
        Ok(job)
    }
}

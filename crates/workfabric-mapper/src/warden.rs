//! Job Warden - In-Flight Request Correlation
//!
//! One job per outgoing request-with-reply, keyed by the envelope's
//! correlation token. The warden demultiplexes incoming replies onto
//! their jobs, collates partial results, and resolves each job exactly
//! once: either `Completed` when every target has answered, or
//! `Cancelled` by the caller (or the optional expiry sweep) with
//! whatever partial results exist.
//!
//! Completion travels over a oneshot channel. The caller's [`JobHandle`]
//! awaits the receiving end; jobs allocated by the offline redeliverer
//! have no handle and resolve silently. Terminal jobs leave the table
//! immediately, so a late reply looks like any other unknown token and
//! is dropped at debug.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use workfabric_core::Envelope;

use crate::error::{MapperError, Result};

/// Terminal disposition of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Completed,
    Cancelled,
}

/// What a resolved job hands back: its disposition and every reply
/// collected before resolution, keyed by agent identity.
#[derive(Debug)]
pub struct JobOutcome {
    pub state: JobState,
    pub results: HashMap<String, Bytes>,
}

/// Caller-side handle for one in-flight request.
pub struct JobHandle {
    token: String,
    targets: BTreeSet<String>,
    rx: oneshot::Receiver<JobOutcome>,
}

impl JobHandle {
    /// Correlation token of the underlying job, for [`cancel`] calls.
    ///
    /// [`cancel`]: JobWarden::cancel
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Identities selected at dispatch time.
    pub fn targets(&self) -> &BTreeSet<String> {
        &self.targets
    }

    /// Wait for the job to resolve.
    pub async fn outcome(self) -> Result<JobOutcome> {
        self.rx.await.map_err(|_| MapperError::JobAbandoned)
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("token", &self.token)
            .field("targets", &self.targets)
            .finish_non_exhaustive()
    }
}

struct Job {
    targets: BTreeSet<String>,
    pending: BTreeSet<String>,
    results: HashMap<String, Bytes>,
    reply: Option<oneshot::Sender<JobOutcome>>,
    created_at: i64,
}

/// Table of in-flight jobs keyed by correlation token.
#[derive(Default)]
pub struct JobWarden {
    jobs: Mutex<HashMap<String, Job>>,
}

impl JobWarden {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job for the envelope's token and hand back the
    /// completion handle.
    pub fn new_job(&self, envelope: &Envelope, targets: &[String]) -> Result<JobHandle> {
        let (tx, rx) = oneshot::channel();
        let targets: BTreeSet<String> = targets.iter().cloned().collect();
        self.insert(envelope, targets.clone(), Some(tx))?;
        Ok(JobHandle {
            token: envelope.token.clone(),
            targets,
            rx,
        })
    }

    /// Register a job with no completion handle. Replies are still
    /// collated and accounted; resolution is silent. Used by the
    /// offline redeliverer, where the original caller is unreachable.
    pub fn new_detached_job(&self, envelope: &Envelope, targets: &[String]) -> Result<()> {
        self.insert(envelope, targets.iter().cloned().collect(), None)
    }

    fn insert(
        &self,
        envelope: &Envelope,
        targets: BTreeSet<String>,
        reply: Option<oneshot::Sender<JobOutcome>>,
    ) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(&envelope.token) {
            return Err(MapperError::DuplicateToken(envelope.token.clone()));
        }
        jobs.insert(
            envelope.token.clone(),
            Job {
                pending: targets.clone(),
                targets,
                results: HashMap::new(),
                reply,
                created_at: now_ms(),
            },
        );
        Ok(())
    }

    /// Record one incoming reply envelope.
    ///
    /// Unknown tokens are dropped - the job completed, was cancelled,
    /// or never existed. Replies from identities outside the job's
    /// target snapshot are dropped too. A duplicate reply from the same
    /// identity overwrites the stored result without touching the
    /// pending count.
    pub fn process(&self, envelope: &Envelope) {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(&envelope.token) else {
            debug!(token = %envelope.token, from = %envelope.from, "dropping reply for unknown token");
            return;
        };
        if !job.targets.contains(&envelope.from) {
            warn!(
                token = %envelope.token,
                from = %envelope.from,
                "dropping reply from identity outside the job's targets"
            );
            return;
        }

        job.results
            .insert(envelope.from.clone(), envelope.payload.clone());
        job.pending.remove(&envelope.from);
        if !job.pending.is_empty() {
            return;
        }
        if let Some(job) = jobs.remove(&envelope.token) {
            debug!(token = %envelope.token, replies = job.results.len(), "job completed");
            resolve(job, JobState::Completed);
        }
    }

    /// Cancel a job, delivering whatever partial results exist.
    /// Returns false when no such job is live.
    pub fn cancel(&self, token: &str) -> bool {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.remove(token) {
            Some(job) => {
                debug!(token, collected = job.results.len(), "job cancelled");
                resolve(job, JobState::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Cancel every job older than `deadline`. Returns the cancelled
    /// tokens. The mapper does not arm this by default; per-job
    /// deadlines belong to the caller.
    pub fn expire(&self, now: i64, deadline: Duration) -> Vec<String> {
        let cutoff = now - deadline.as_millis() as i64;
        let mut jobs = self.jobs.lock().unwrap();
        let stale: Vec<String> = jobs
            .iter()
            .filter(|(_, job)| job.created_at < cutoff)
            .map(|(token, _)| token.clone())
            .collect();
        for token in &stale {
            if let Some(job) = jobs.remove(token) {
                debug!(token = %token, "job expired");
                resolve(job, JobState::Cancelled);
            }
        }
        stale
    }

    /// Number of live jobs.
    pub fn active_jobs(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

/// Deliver the terminal outcome. Detached jobs resolve silently, and a
/// caller that dropped its handle is equally fine - the send result is
/// discarded either way.
fn resolve(job: Job, state: JobState) {
    if let Some(tx) = job.reply {
        let _ = tx.send(JobOutcome {
            state,
            results: job.results,
        });
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time before Unix epoch")
        .as_millis() as i64
}

//! FIFO admission and bookkeeping for generation jobs.
//!
//! [`RequestQueue::new`] returns two halves:
//!
//! - [`RequestQueue`]: a cheap, clonable handle used by submitters and status
//!   readers. It enqueues, cancels and snapshots.
//! - [`JobReceiver`]: the single consumer side. It is not `Clone`, so exactly
//!   one worker can ever claim jobs, and therefore at most one job is active.
//!
//! Ordering is strict FIFO with no priorities. A batch is one entry and holds
//! the accelerator for its whole duration.
//!
//! The queue lock is only held for short bookkeeping sections and never
//! across an `.await`, so status queries cannot stall the worker.

use crate::{
    error::{Error, GenerationError, Result},
    job::{Job, JobId, JobOutput, JobRequest, JobResult},
};
use bytes::Bytes;
use core::time::Duration;
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use std::{collections::VecDeque, sync::Arc};
use tokio::{
    sync::{Notify, oneshot},
    time::Instant,
};

/// Number of recent job durations averaged for the wait estimate.
pub const DEFAULT_WAIT_WINDOW: usize = 20;
/// Largest accepted batch.
pub const DEFAULT_MAX_BATCH_IMAGES: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueConfig {
    /// How many completed job durations feed the rolling average.
    pub wait_window: usize,
    /// Upper bound for `num_images` on batch jobs.
    pub max_batch_images: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            wait_window: DEFAULT_WAIT_WINDOW,
            max_batch_images: DEFAULT_MAX_BATCH_IMAGES,
        }
    }
}

/// Point-in-time view of the queue, recomputed on every query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    /// Jobs waiting to be claimed; the active job is not counted.
    pub length: usize,
    /// `1` while the worker holds a job, `0` otherwise.
    pub active_requests: u32,
    /// `length` times the rolling average of recent job durations.
    #[serde(rename = "estimated_wait_ms", serialize_with = "as_millis")]
    pub estimated_wait: Duration,
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

struct Entry {
    job: Job,
    reply: oneshot::Sender<JobResult>,
}

struct State {
    next_id: u64,
    pending: VecDeque<Entry>,
    active: Option<JobId>,
    recent: VecDeque<Duration>,
    recent_total: Duration,
    closed: bool,
}

impl State {
    fn record_duration(&mut self, elapsed: Duration, window: usize) {
        self.recent.push_back(elapsed);
        self.recent_total += elapsed;
        while self.recent.len() > window {
            if let Some(evicted) = self.recent.pop_front() {
                self.recent_total -= evicted;
            }
        }
    }

    fn average_duration(&self) -> Option<Duration> {
        let samples = u32::try_from(self.recent.len()).ok().filter(|n| *n > 0)?;
        Some(self.recent_total / samples)
    }
}

struct Shared {
    state: Mutex<State>,
    work_available: Notify,
    config: QueueConfig,
}

/// Submission side of the generation queue.
#[derive(Clone)]
pub struct RequestQueue {
    shared: Arc<Shared>,
}

impl RequestQueue {
    /// Creates an empty queue and its one and only consumer.
    pub fn new(config: QueueConfig) -> (Self, JobReceiver) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                next_id: 0,
                pending: VecDeque::new(),
                active: None,
                recent: VecDeque::with_capacity(config.wait_window.max(1)),
                recent_total: Duration::ZERO,
                closed: false,
            }),
            work_available: Notify::new(),
            config: QueueConfig {
                wait_window: config.wait_window.max(1),
                ..config
            },
        });

        (
            Self {
                shared: Arc::clone(&shared),
            },
            JobReceiver { shared },
        )
    }

    /// Validates `request` and appends it to the tail of the queue.
    ///
    /// Never waits: the queue is unbounded and backpressure is expressed
    /// through [`QueueSnapshot::estimated_wait`].
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if a parameter is out of range. The queue is
    ///   left untouched.
    /// - [`Error::ServiceShutdown`] once [`RequestQueue::close`] was called.
    pub fn submit(&self, request: JobRequest) -> Result<JobHandle> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(Error::ServiceShutdown);
        }

        let id = JobId::new(state.next_id);
        let job = Job::validate(id, request, self.shared.config.max_batch_images)?;
        state.next_id += 1;

        let (reply, rx) = oneshot::channel();
        let kind = job.kind();
        state.pending.push_back(Entry { job, reply });
        let queue_length = state.pending.len();
        drop(state);

        self.shared.work_available.notify_one();
        tracing::debug!(job_id = %id, ?kind, queue_length, "Job queued");

        Ok(JobHandle { id, rx })
    }

    /// Removes a job that is still waiting.
    ///
    /// Returns `false` if the job is unknown, already active, or finished; an
    /// active job always runs to completion.
    pub fn cancel(&self, id: JobId) -> bool {
        let mut state = self.shared.state.lock();
        let Some(pos) = state.pending.iter().position(|entry| entry.job.id() == id) else {
            return false;
        };
        let entry = state.pending.remove(pos);
        drop(state);

        if let Some(entry) = entry {
            let _ = entry.reply.send(Err(Error::Cancelled(id)));
            tracing::debug!(job_id = %id, "Job cancelled while queued");
            true
        } else {
            false
        }
    }

    /// Computes the current queue length, active count and wait estimate.
    ///
    /// Jobs whose submitter has gone away would be skipped at claim time, so
    /// they are pruned here instead of inflating the estimate.
    pub fn snapshot(&self) -> QueueSnapshot {
        let mut state = self.shared.state.lock();
        state.pending.retain(|entry| !entry.reply.is_closed());
        let length = state.pending.len();
        let estimated_wait = state.average_duration().map_or(Duration::ZERO, |avg| {
            avg.saturating_mul(u32::try_from(length).unwrap_or(u32::MAX))
        });

        QueueSnapshot {
            length,
            active_requests: u32::from(state.active.is_some()),
            estimated_wait,
        }
    }

    /// Stops admission and fails every job that is still waiting.
    ///
    /// The active job, if any, is unaffected and completes normally. The
    /// worker exits once it is done with it.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let drained: Vec<Entry> = state.pending.drain(..).collect();
        drop(state);

        tracing::info!(dropped = drained.len(), "Request queue closed");
        for entry in drained {
            let _ = entry.reply.send(Err(Error::ServiceShutdown));
        }
        self.shared.work_available.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn config(&self) -> QueueConfig {
        self.shared.config
    }
}

/// The consumer half of a [`RequestQueue`]. Exactly one exists per queue.
pub struct JobReceiver {
    shared: Arc<Shared>,
}

impl JobReceiver {
    /// Waits for the head of the queue and marks it active.
    ///
    /// Jobs whose submitter has already gone away are skipped without ever
    /// reaching the generator. Returns `None` once the queue is closed and
    /// empty.
    pub async fn next(&mut self) -> Option<ClaimedJob> {
        loop {
            let notified = self.shared.work_available.notified();
            {
                let mut state = self.shared.state.lock();
                while let Some(entry) = state.pending.pop_front() {
                    if entry.reply.is_closed() {
                        tracing::debug!(job_id = %entry.job.id(), "Skipping abandoned job");
                        continue;
                    }
                    state.active = Some(entry.job.id());
                    return Some(ClaimedJob {
                        job: entry.job,
                        reply: Some(entry.reply),
                        shared: Arc::clone(&self.shared),
                        started: Instant::now(),
                    });
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }
}

/// A job held by the worker.
///
/// Dropping it without calling [`ClaimedJob::complete`] clears the active
/// flag and fails the submitter with [`GenerationError::Aborted`].
pub struct ClaimedJob {
    job: Job,
    reply: Option<oneshot::Sender<JobResult>>,
    shared: Arc<Shared>,
    started: Instant,
}

impl ClaimedJob {
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Publishes the outcome to the submitter and releases the active slot.
    ///
    /// The elapsed time since the claim feeds the rolling wait estimate
    /// regardless of success, since a failed job occupied the accelerator too.
    pub fn complete(mut self, outcome: Result<Vec<Bytes>, GenerationError>) -> Duration {
        let processing_time = self.started.elapsed();
        let job_id = self.job.id();
        let result = outcome
            .map(|images| JobOutput {
                job_id,
                images,
                processing_time,
            })
            .map_err(|source| Error::Generation { job_id, source });
        self.finish(result, Some(processing_time));
        processing_time
    }

    fn finish(&mut self, result: JobResult, elapsed: Option<Duration>) {
        let Some(reply) = self.reply.take() else {
            return;
        };

        {
            let mut state = self.shared.state.lock();
            state.active = None;
            if let Some(elapsed) = elapsed {
                state.record_duration(elapsed, self.shared.config.wait_window);
            }
        }

        if reply.send(result).is_err() {
            tracing::debug!(job_id = %self.job.id(), "Submitter went away before the result");
        }
    }
}

impl Drop for ClaimedJob {
    fn drop(&mut self) {
        if self.reply.is_some() {
            let job_id = self.job.id();
            tracing::warn!(job_id = %job_id, "Claimed job dropped before completion");
            self.finish(
                Err(Error::Generation {
                    job_id,
                    source: GenerationError::Aborted,
                }),
                None,
            );
        }
    }
}

/// Awaitable handle returned by [`RequestQueue::submit`].
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    rx: oneshot::Receiver<JobResult>,
}

impl JobHandle {
    pub const fn id(&self) -> JobId {
        self.id
    }

    /// Suspends until the worker publishes this job's result.
    ///
    /// No timeout is imposed; wrap the call if one is needed.
    pub async fn wait(self) -> JobResult {
        let id = self.id;
        self.rx.await.unwrap_or_else(|_| {
            Err(Error::ChannelError {
                context: format!("Result channel for job {id} closed"),
            })
        })
    }
}

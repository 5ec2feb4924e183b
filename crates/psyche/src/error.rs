//! Error types for the generation queue and canvas broadcasting.
//!
//! Errors are scoped to the narrowest unit they affect:
//!
//! - [`ValidationError`]: a request was rejected before it reached the queue.
//! - [`GenerationError`]: the generator failed for one claimed job.
//! - [`DeliveryError`]: one sink could not accept a frame.
//! - [`Error::Registration`]: a sink was registered after its viewer left.
//!
//! None of these ever stop the worker loop or a running canvas stream.

use crate::job::JobId;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Unified error type surfaced to submitters and transport layers.
#[derive(Clone, thiserror::Error, Debug, PartialEq)]
pub enum Error {
    /// The request was malformed and never entered the queue.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The generator failed while processing a claimed job.
    #[error("Job {job_id} failed: {source}")]
    Generation {
        job_id: JobId,
        #[source]
        source: GenerationError,
    },

    /// A sink was registered for a viewer that is no longer connected.
    #[error("Sink {sink_id} is no longer connected")]
    Registration { sink_id: u64 },

    /// The job was removed from the queue before it was processed.
    #[error("Job {0} was cancelled")]
    Cancelled(JobId),

    /// The queue no longer accepts work.
    #[error("Service is shutting down")]
    ServiceShutdown,

    /// Internal channel send/receive failure.
    #[error("Channel error: {context}")]
    ChannelError { context: String },
}

/// A request parameter fell outside its documented range.
#[derive(Clone, thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("num_inference_steps must be between {min} and {max}, got {value}")]
    InferenceSteps { value: i64, min: u32, max: u32 },

    #[error("strength must be within [0, 1], got {0}")]
    Strength(f32),

    #[error("guidance_scale must be a finite value >= 0, got {0}")]
    GuidanceScale(f32),

    #[error("num_images must be between 1 and {max}, got {value}")]
    NumImages { value: i64, max: usize },

    #[error("input image must not be empty")]
    EmptyImage,
}

/// The external generator could not produce the requested images.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum GenerationError {
    /// The backend reported a failure.
    #[error("generator backend error: {0}")]
    Backend(String),

    /// The backend returned a different number of images than requested.
    #[error("expected {expected} image(s), generator returned {actual}")]
    ImageCount { expected: usize, actual: usize },

    /// The generation task ended before producing a result.
    #[error("generation aborted before completion")]
    Aborted,
}

/// A single sink failed to accept a frame. Either way the sink is removed
/// from its canvas.
#[derive(Clone, Copy, thiserror::Error, Debug, PartialEq, Eq)]
pub enum DeliveryError {
    /// The viewer's connection is gone.
    #[error("sink {sink_id} is closed")]
    Closed { sink_id: u64 },

    /// The viewer stopped draining and its whole buffer is still pending.
    #[error("sink {sink_id} is lagging with a full buffer")]
    Lagging { sink_id: u64 },
}

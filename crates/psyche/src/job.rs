//! Generation jobs and their parameters.
//!
//! A [`JobRequest`] is what a caller hands to
//! [`RequestQueue::submit`](crate::RequestQueue::submit). Submission resolves
//! unset parameters to their defaults, validates everything, and produces an
//! immutable [`Job`]. Out-of-range values are rejected there, never at
//! processing time.

use crate::error::{Error, ValidationError};
use bytes::Bytes;
use core::fmt;
use core::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Default number of denoising steps for a few-step img2img model.
pub const DEFAULT_INFERENCE_STEPS: u32 = 2;
/// Upper bound accepted for `num_inference_steps`.
pub const MAX_INFERENCE_STEPS: u32 = 50;
/// Default img2img strength.
pub const DEFAULT_STRENGTH: f32 = 0.8;
/// Default classifier-free guidance scale (disabled).
pub const DEFAULT_GUIDANCE_SCALE: f32 = 0.0;

/// Queue-assigned identifier of a job.
///
/// Identifiers increase with submission order and are unique per queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a job produces one image or a batch.
///
/// A batch is a single queue entry: it occupies the accelerator for its full
/// duration and is never split.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    Single,
    Batch { num_images: usize },
}

impl JobKind {
    /// Number of images the job must yield.
    pub const fn result_count(&self) -> usize {
        match self {
            Self::Single => 1,
            Self::Batch { num_images } => *num_images,
        }
    }
}

/// Generation parameters as supplied by a caller; unset fields take defaults.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestedParams {
    pub num_inference_steps: Option<i64>,
    pub strength: Option<f32>,
    pub guidance_scale: Option<f32>,
    pub seed: Option<i64>,
}

impl RequestedParams {
    /// Applies defaults to unset fields and checks every documented range.
    pub fn resolve(self) -> Result<GenerationParams, ValidationError> {
        let steps = self
            .num_inference_steps
            .unwrap_or(i64::from(DEFAULT_INFERENCE_STEPS));
        if steps < 1 || steps > i64::from(MAX_INFERENCE_STEPS) {
            return Err(ValidationError::InferenceSteps {
                value: steps,
                min: 1,
                max: MAX_INFERENCE_STEPS,
            });
        }

        let strength = self.strength.unwrap_or(DEFAULT_STRENGTH);
        if !(0.0..=1.0).contains(&strength) {
            // NaN also lands here.
            return Err(ValidationError::Strength(strength));
        }

        let guidance_scale = self.guidance_scale.unwrap_or(DEFAULT_GUIDANCE_SCALE);
        if !guidance_scale.is_finite() || guidance_scale < 0.0 {
            return Err(ValidationError::GuidanceScale(guidance_scale));
        }

        Ok(GenerationParams {
            num_inference_steps: steps as u32,
            strength,
            guidance_scale,
            seed: self.seed,
        })
    }
}

/// Validated generation parameters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub num_inference_steps: u32,
    pub strength: f32,
    pub guidance_scale: f32,
    pub seed: Option<i64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            num_inference_steps: DEFAULT_INFERENCE_STEPS,
            strength: DEFAULT_STRENGTH,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            seed: None,
        }
    }
}

/// An unvalidated generation request.
#[derive(Clone, Debug, PartialEq)]
pub struct JobRequest {
    pub kind: JobKind,
    pub input_image: Bytes,
    pub prompt: String,
    pub params: RequestedParams,
}

impl JobRequest {
    pub fn single(input_image: impl Into<Bytes>, prompt: impl Into<String>) -> Self {
        Self {
            kind: JobKind::Single,
            input_image: input_image.into(),
            prompt: prompt.into(),
            params: RequestedParams::default(),
        }
    }

    pub fn batch(
        input_image: impl Into<Bytes>,
        prompt: impl Into<String>,
        num_images: usize,
    ) -> Self {
        Self {
            kind: JobKind::Batch { num_images },
            ..Self::single(input_image, prompt)
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: RequestedParams) -> Self {
        self.params = params;
        self
    }
}

/// A validated job, immutable once created.
#[derive(Clone, Debug)]
pub struct Job {
    id: JobId,
    submitted_at: Instant,
    kind: JobKind,
    input_image: Bytes,
    prompt: String,
    params: GenerationParams,
}

impl Job {
    pub(crate) fn validate(
        id: JobId,
        request: JobRequest,
        max_batch_images: usize,
    ) -> Result<Self, ValidationError> {
        if let JobKind::Batch { num_images } = request.kind {
            if num_images == 0 || num_images > max_batch_images {
                return Err(ValidationError::NumImages {
                    value: num_images as i64,
                    max: max_batch_images,
                });
            }
        }
        if request.input_image.is_empty() {
            return Err(ValidationError::EmptyImage);
        }
        let params = request.params.resolve()?;

        Ok(Self {
            id,
            submitted_at: Instant::now(),
            kind: request.kind,
            input_image: request.input_image,
            prompt: request.prompt,
            params,
        })
    }

    pub const fn id(&self) -> JobId {
        self.id
    }

    pub const fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    pub const fn kind(&self) -> JobKind {
        self.kind
    }

    pub const fn input_image(&self) -> &Bytes {
        &self.input_image
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub const fn params(&self) -> &GenerationParams {
        &self.params
    }
}

/// Successful outcome of a job.
#[derive(Clone, Debug, PartialEq)]
pub struct JobOutput {
    pub job_id: JobId,
    /// One entry for a single job, `num_images` for a batch.
    pub images: Vec<Bytes>,
    pub processing_time: Duration,
}

/// Outcome of a job as delivered to its submitter.
pub type JobResult = Result<JobOutput, Error>;

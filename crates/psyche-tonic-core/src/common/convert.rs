//! Conversions between wire messages and queue types.
//!
//! Inbound messages are only reshaped here; range checks on the generation
//! parameters happen when the resulting [`JobRequest`] is submitted, so a
//! malformed request is rejected before it reaches the queue either way.

use super::{
    Error, Result,
    proto::{
        Img2ImgBatchRequest, Img2ImgBatchResponse, Img2ImgRequest, Img2ImgResponse,
        QueueStatusResponse,
    },
};
use psyche::{GenerationError, JobOutput, JobRequest, QueueSnapshot, RequestedParams};

fn requested_params(
    num_inference_steps: Option<i32>,
    strength: Option<f32>,
    guidance_scale: Option<f32>,
    seed: Option<i64>,
) -> RequestedParams {
    RequestedParams {
        num_inference_steps: num_inference_steps.map(i64::from),
        strength,
        guidance_scale,
        seed,
    }
}

fn millis(duration: core::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl From<Img2ImgRequest> for JobRequest {
    fn from(req: Img2ImgRequest) -> Self {
        Self::single(req.image, req.prompt).with_params(requested_params(
            req.num_inference_steps,
            req.strength,
            req.guidance_scale,
            req.seed,
        ))
    }
}

impl TryFrom<Img2ImgBatchRequest> for JobRequest {
    type Error = Error;

    fn try_from(req: Img2ImgBatchRequest) -> Result<Self> {
        let num_images = usize::try_from(req.num_images).map_err(|_| Error::InvalidRequest {
            reason: format!("num_images must be positive, got {}", req.num_images),
        })?;
        Ok(
            Self::batch(req.image, req.prompt, num_images).with_params(requested_params(
                req.num_inference_steps,
                req.strength,
                req.guidance_scale,
                req.seed,
            )),
        )
    }
}

impl TryFrom<JobOutput> for Img2ImgResponse {
    type Error = Error;

    fn try_from(output: JobOutput) -> Result<Self> {
        let actual = output.images.len();
        let generated_image =
            output
                .images
                .into_iter()
                .next()
                .ok_or(psyche::Error::Generation {
                    job_id: output.job_id,
                    source: GenerationError::ImageCount {
                        expected: 1,
                        actual,
                    },
                })?;
        Ok(Self {
            generated_image,
            request_id: output.job_id.get(),
            processing_time_ms: millis(output.processing_time),
        })
    }
}

impl From<JobOutput> for Img2ImgBatchResponse {
    fn from(output: JobOutput) -> Self {
        Self {
            generated_images: output.images,
            request_id: output.job_id.get(),
            processing_time_ms: millis(output.processing_time),
        }
    }
}

impl From<QueueSnapshot> for QueueStatusResponse {
    fn from(snapshot: QueueSnapshot) -> Self {
        Self {
            queue_length: u32::try_from(snapshot.length).unwrap_or(u32::MAX),
            estimated_wait_time_ms: millis(snapshot.estimated_wait),
            active_requests: snapshot.active_requests,
        }
    }
}

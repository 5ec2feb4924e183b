//! gRPC service implementation for queued img2img generation.
//!
//! [`GenerationHandler`] turns each RPC into a [`JobRequest`], submits it to
//! the shared [`RequestQueue`] and waits for the worker to publish the result.
//! The handler never touches the generator itself: the worker is the only
//! consumer of the queue, so concurrent RPCs are served strictly one at a time
//! in arrival order.
//!
//! A client that disconnects while its job is still waiting drops the job's
//! result handle; the worker then skips the job instead of generating images
//! nobody will receive.

use crate::server::telemetry::{
    increment_job_failures, increment_jobs_rejected, increment_jobs_submitted,
    record_job_duration, record_queue_length,
};
use psyche_tonic_core::{
    Error,
    proto::{
        Img2ImgBatchRequest, Img2ImgBatchResponse, Img2ImgRequest, Img2ImgResponse,
        QueueStatusRequest, QueueStatusResponse, generation_service_server::GenerationService,
    },
    psyche::{self, JobOutput, JobRequest, RequestQueue, StatusReporter},
};
use tonic::{Request, Response, Status};

#[derive(Clone)]
pub struct GenerationHandler {
    queue: RequestQueue,
    status: StatusReporter,
}

impl GenerationHandler {
    pub fn new(queue: RequestQueue) -> Self {
        Self {
            status: StatusReporter::new(queue.clone()),
            queue,
        }
    }

    async fn run(&self, request: JobRequest) -> Result<JobOutput, Error> {
        let handle = self.queue.submit(request).inspect_err(|e| {
            if matches!(e, psyche::Error::Validation(_)) {
                increment_jobs_rejected();
            }
            tracing::warn!(error = %e, "Request rejected");
        })?;
        increment_jobs_submitted();
        record_queue_length(self.status.snapshot().length as u64);

        let job_id = handle.id();
        match handle.wait().await {
            Ok(output) => {
                record_job_duration(output.processing_time.as_secs_f64() * 1000.0);
                Ok(output)
            }
            Err(e) => {
                increment_job_failures();
                tracing::warn!(job_id = %job_id, error = %e, "Request failed");
                Err(e.into())
            }
        }
    }
}

#[tonic::async_trait]
impl GenerationService for GenerationHandler {
    #[tracing::instrument(skip_all, fields(prompt = %req.get_ref().prompt))]
    async fn img2_img(
        &self,
        req: Request<Img2ImgRequest>,
    ) -> Result<Response<Img2ImgResponse>, Status> {
        let output = self.run(JobRequest::from(req.into_inner())).await?;
        Ok(Response::new(Img2ImgResponse::try_from(output)?))
    }

    #[tracing::instrument(
        skip_all,
        fields(prompt = %req.get_ref().prompt, num_images = req.get_ref().num_images)
    )]
    async fn img2_img_batch(
        &self,
        req: Request<Img2ImgBatchRequest>,
    ) -> Result<Response<Img2ImgBatchResponse>, Status> {
        let request = JobRequest::try_from(req.into_inner()).inspect_err(|_| {
            increment_jobs_rejected();
        })?;
        let output = self.run(request).await?;
        Ok(Response::new(Img2ImgBatchResponse::from(output)))
    }

    async fn get_queue_status(
        &self,
        _req: Request<QueueStatusRequest>,
    ) -> Result<Response<QueueStatusResponse>, Status> {
        let snapshot = self.status.snapshot();
        record_queue_length(snapshot.length as u64);
        Ok(Response::new(QueueStatusResponse::from(snapshot)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::generator::EchoGenerator;
    use bytes::Bytes;
    use psyche_tonic_core::psyche::{QueueConfig, spawn_worker};
    use tokio_util::sync::CancellationToken;
    use tonic::Code;

    fn handler_with_worker() -> (GenerationHandler, CancellationToken) {
        let (queue, jobs) = RequestQueue::new(QueueConfig::default());
        let shutdown = CancellationToken::new();
        spawn_worker(jobs, EchoGenerator, shutdown.clone());
        (GenerationHandler::new(queue), shutdown)
    }

    fn single(image: &'static [u8]) -> Img2ImgRequest {
        Img2ImgRequest {
            image: Bytes::from_static(image),
            prompt: "trade".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn single_and_batch_round_trip() {
        let (handler, _shutdown) = handler_with_worker();

        let first = handler
            .img2_img(Request::new(single(b"seed")))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(&first.generated_image[..], b"seed");

        let batch = handler
            .img2_img_batch(Request::new(Img2ImgBatchRequest {
                image: Bytes::from_static(b"seed"),
                prompt: "trade".into(),
                num_images: 3,
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(batch.generated_images.len(), 3);
        assert!(batch.request_id > first.request_id);
    }

    #[tokio::test]
    async fn invalid_requests_are_invalid_argument() {
        let (handler, _shutdown) = handler_with_worker();

        let err = handler
            .img2_img(Request::new(Img2ImgRequest {
                num_inference_steps: Some(0),
                ..single(b"seed")
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let err = handler.img2_img(Request::new(single(b""))).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let err = handler
            .img2_img_batch(Request::new(Img2ImgBatchRequest {
                image: Bytes::from_static(b"seed"),
                num_images: 0,
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let status = handler
            .get_queue_status(Request::new(QueueStatusRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(status.queue_length, 0);
    }

    #[tokio::test]
    async fn closed_queue_is_unavailable() {
        let (queue, _jobs) = RequestQueue::new(QueueConfig::default());
        let handler = GenerationHandler::new(queue.clone());
        queue.close();

        let err = handler.img2_img(Request::new(single(b"seed"))).await.unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
    }

    #[tokio::test]
    async fn queue_status_counts_waiting_jobs() {
        // No worker: submitted jobs stay queued.
        let (queue, _jobs) = RequestQueue::new(QueueConfig::default());
        let handler = GenerationHandler::new(queue.clone());
        let _a = queue.submit(JobRequest::single(vec![1], "a")).unwrap();
        let _b = queue.submit(JobRequest::single(vec![1], "b")).unwrap();

        let status = handler
            .get_queue_status(Request::new(QueueStatusRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(status.queue_length, 2);
        assert_eq!(status.active_requests, 0);
        assert_eq!(status.estimated_wait_time_ms, 0);
    }
}

use crate::{
    error::GenerationError,
    generator::Generator,
    queue::{ClaimedJob, JobReceiver},
};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// The single consumer loop that feeds jobs to the generator.
///
/// Pulls the head of the queue (suspending while it is empty), runs the
/// generator on it to completion, publishes the result and repeats. There is
/// exactly one of these per [`RequestQueue`](crate::RequestQueue): the
/// [`JobReceiver`] it consumes cannot be cloned, and the generator is only
/// reachable through the loop's `&mut` borrow.
///
/// Generation failures, including panics inside the generator future, are
/// reported to the affected submitter only; the loop keeps going.
///
/// # Shutdown
///
/// - Cancelling `shutdown` stops the loop before it claims another job. A job
///   that is already running is never interrupted.
/// - [`RequestQueue::close`](crate::RequestQueue::close) fails all waiting
///   jobs; the loop then exits once the active job is done.
pub async fn worker_loop<G: Generator>(
    mut jobs: JobReceiver,
    mut generator: G,
    shutdown: CancellationToken,
) {
    tracing::debug!("Worker started");

    loop {
        let claimed = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            next = jobs.next() => match next {
                Some(claimed) => claimed,
                None => break,
            },
        };
        run_job(&mut generator, claimed).await;
    }

    tracing::debug!("Worker stopped");
}

/// Spawns [`worker_loop`] on the current tokio runtime.
pub fn spawn_worker<G: Generator>(
    jobs: JobReceiver,
    generator: G,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(worker_loop(jobs, generator, shutdown).instrument(tracing::info_span!("worker")))
}

async fn run_job<G: Generator>(generator: &mut G, claimed: ClaimedJob) {
    let job = claimed.job();
    let job_id = job.id();
    let expected = job.kind().result_count();
    let waited = job.submitted_at().elapsed();

    tracing::info!(
        job_id = %job_id,
        kind = ?job.kind(),
        waited_ms = waited.as_millis() as u64,
        "Processing job"
    );

    let outcome = match AssertUnwindSafe(generator.generate(job)).catch_unwind().await {
        Ok(Ok(images)) if images.len() == expected => Ok(images),
        Ok(Ok(images)) => Err(GenerationError::ImageCount {
            expected,
            actual: images.len(),
        }),
        Ok(Err(e)) => Err(e),
        Err(_panic) => Err(GenerationError::Backend("generator panicked".to_string())),
    };

    let failure = outcome.as_ref().err().map(ToString::to_string);
    let elapsed = claimed.complete(outcome);

    match failure {
        None => tracing::info!(
            job_id = %job_id,
            images = expected,
            processing_ms = elapsed.as_millis() as u64,
            "Job completed"
        ),
        Some(error) => tracing::error!(
            job_id = %job_id,
            processing_ms = elapsed.as_millis() as u64,
            %error,
            "Job failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, Job, JobRequest, QueueConfig, RequestQueue};
    use bytes::Bytes;

    /// Echoes the prompt back once per requested image, failing on "boom".
    struct PromptEcho;

    impl Generator for PromptEcho {
        async fn generate(&mut self, job: &Job) -> Result<Vec<Bytes>, GenerationError> {
            match job.prompt() {
                "boom" => Err(GenerationError::Backend("model exploded".into())),
                "panic" => panic!("model crashed"),
                "short" => Ok(Vec::new()),
                prompt => Ok(vec![
                    Bytes::copy_from_slice(prompt.as_bytes());
                    job.kind().result_count()
                ]),
            }
        }
    }

    #[tokio::test]
    async fn failures_are_scoped_to_their_job() {
        let (queue, jobs) = RequestQueue::new(QueueConfig::default());
        let shutdown = CancellationToken::new();
        let worker = spawn_worker(jobs, PromptEcho, shutdown.clone());

        let failing = queue.submit(JobRequest::single(vec![1], "boom")).unwrap();
        let panicking = queue.submit(JobRequest::single(vec![1], "panic")).unwrap();
        let short = queue.submit(JobRequest::batch(vec![1], "short", 3)).unwrap();
        let ok = queue.submit(JobRequest::batch(vec![1], "lanterns", 2)).unwrap();

        assert!(matches!(
            failing.wait().await,
            Err(Error::Generation {
                source: GenerationError::Backend(_),
                ..
            })
        ));
        assert!(matches!(
            panicking.wait().await,
            Err(Error::Generation {
                source: GenerationError::Backend(_),
                ..
            })
        ));
        assert!(matches!(
            short.wait().await,
            Err(Error::Generation {
                source: GenerationError::ImageCount {
                    expected: 3,
                    actual: 0
                },
                ..
            })
        ));

        let output = ok.wait().await.unwrap();
        assert_eq!(output.images.len(), 2);
        assert_eq!(output.images[0], Bytes::from_static(b"lanterns"));

        shutdown.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn worker_exits_when_queue_closes() {
        let (queue, jobs) = RequestQueue::new(QueueConfig::default());
        let worker = spawn_worker(jobs, PromptEcho, CancellationToken::new());

        let done = queue.submit(JobRequest::single(vec![1], "dusk")).unwrap();
        assert!(done.wait().await.is_ok());

        queue.close();
        worker.await.unwrap();
    }
}

use bytes::Bytes;
use core::time::Duration;
use parking_lot::Mutex;
use psyche::{
    Error, GenerationError, Generator, Job, JobId, JobRequest, QueueConfig, RequestQueue,
    RequestedParams, StatusReporter, spawn_worker,
};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

/// Sleeps `per_image` for every requested image and records what it saw.
#[derive(Clone, Default)]
struct Recorder {
    per_image: Duration,
    calls: Arc<Mutex<Vec<JobId>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl Recorder {
    fn with_delay(per_image: Duration) -> Self {
        Self {
            per_image,
            ..Default::default()
        }
    }
}

impl Generator for Recorder {
    async fn generate(&mut self, job: &Job) -> Result<Vec<Bytes>, GenerationError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().push(job.id());

        let count = job.kind().result_count();
        sleep(self.per_image * count as u32).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(vec![job.input_image().clone(); count])
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_complete_in_order_one_at_a_time() {
    let (queue, jobs) = RequestQueue::new(QueueConfig::default());
    let recorder = Recorder::with_delay(Duration::from_millis(2));
    let shutdown = CancellationToken::new();
    let worker = spawn_worker(jobs, recorder.clone(), shutdown.clone());

    let submitted = Arc::new(Mutex::new(Vec::new()));
    let mut tasks = Vec::new();
    for i in 0..24u8 {
        let queue = queue.clone();
        let submitted = Arc::clone(&submitted);
        tasks.push(tokio::spawn(async move {
            let handle = {
                // Record under the same lock so `submitted` mirrors queue order.
                let mut submitted = submitted.lock();
                let handle = queue.submit(JobRequest::single(vec![i], "p")).unwrap();
                submitted.push(handle.id());
                handle
            };
            handle.wait().await.unwrap().job_id
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }

    let calls = recorder.calls.lock().clone();
    assert_eq!(calls, *submitted.lock());
    assert!(calls.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(recorder.max_in_flight.load(Ordering::SeqCst), 1);

    shutdown.cancel();
    worker.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn single_then_batch_scenario() {
    let (queue, jobs) = RequestQueue::new(QueueConfig::default());
    let status = StatusReporter::new(queue.clone());
    let recorder = Recorder::with_delay(Duration::from_millis(100));
    let _worker = spawn_worker(jobs, recorder.clone(), CancellationToken::new());

    // Prime the wait estimate with one 100ms job.
    queue
        .submit(JobRequest::single(vec![0], "warmup"))
        .unwrap()
        .wait()
        .await
        .unwrap();

    let a = queue.submit(JobRequest::single(vec![1], "a")).unwrap();
    while status.snapshot().active_requests == 0 {
        tokio::task::yield_now().await;
    }
    let b = queue.submit(JobRequest::batch(vec![2], "b", 4)).unwrap();

    let before_c = status.snapshot();
    assert_eq!(before_c.length, 1);
    assert_eq!(before_c.active_requests, 1);

    let c = queue.submit(JobRequest::single(vec![3], "c")).unwrap();
    let after_c = status.snapshot();
    assert_eq!(after_c.length, 2);
    assert_eq!(after_c.estimated_wait, Duration::from_millis(200));

    let (a_done, b_done) = tokio::join!(
        async {
            let out = a.wait().await.unwrap();
            (Instant::now(), out)
        },
        async {
            let out = b.wait().await.unwrap();
            (Instant::now(), out)
        },
    );
    assert!(a_done.0 < b_done.0);
    assert_eq!(a_done.1.images.len(), 1);
    assert_eq!(b_done.1.images.len(), 4);
    assert_eq!(b_done.1.processing_time, Duration::from_millis(400));

    c.wait().await.unwrap();
    assert_eq!(
        *recorder.calls.lock(),
        vec![JobId::new(0), JobId::new(1), JobId::new(2), JobId::new(3)]
    );
}

#[tokio::test]
async fn validation_failures_never_reach_the_queue() {
    let (queue, _jobs) = RequestQueue::new(QueueConfig::default());
    let _queued = queue.submit(JobRequest::single(vec![1], "ok")).unwrap();

    let rejected = queue.submit(JobRequest::single(vec![1], "bad").with_params(RequestedParams {
        strength: Some(1.5),
        ..Default::default()
    }));

    assert!(matches!(rejected, Err(Error::Validation(_))));
    assert_eq!(queue.snapshot().length, 1);
}

#[tokio::test(start_paused = true)]
async fn active_flag_tracks_the_worker() {
    let (queue, jobs) = RequestQueue::new(QueueConfig::default());
    let _worker = spawn_worker(
        jobs,
        Recorder::with_delay(Duration::from_millis(50)),
        CancellationToken::new(),
    );
    assert_eq!(queue.snapshot().active_requests, 0);

    let handle = queue.submit(JobRequest::single(vec![1], "p")).unwrap();
    while queue.snapshot().active_requests == 0 {
        tokio::task::yield_now().await;
    }
    assert_eq!(queue.snapshot().length, 0);

    handle.wait().await.unwrap();
    assert_eq!(queue.snapshot().active_requests, 0);
}

use core::time::Duration;
use futures::StreamExt;
use psyche::{
    Broadcaster, CanvasSlug, ConnectionRegistry, Frame, FrameSink, SinkReceiver, StreamReport,
};
use std::sync::Arc;

fn setup() -> (Arc<ConnectionRegistry>, Broadcaster) {
    let registry = Arc::new(ConnectionRegistry::new());
    let broadcaster = Broadcaster::new(Arc::clone(&registry));
    (registry, broadcaster)
}

fn connect(registry: &ConnectionRegistry, slug: &CanvasSlug) -> SinkReceiver {
    let (sink, rx) = FrameSink::channel(32);
    registry.register(slug, sink).unwrap();
    rx
}

async fn drain(rx: &mut SinkReceiver, n: usize) -> Vec<u8> {
    let mut seen = Vec::with_capacity(n);
    for _ in 0..n {
        seen.push(rx.recv().await.unwrap().image[0]);
    }
    seen
}

#[tokio::test(start_paused = true)]
async fn left_has_two_viewers_right_has_none() {
    let (registry, broadcaster) = setup();
    let left = CanvasSlug::from("left-canva");
    let right = CanvasSlug::from("right-canva");
    let mut a = connect(&registry, &left);
    let mut b = connect(&registry, &left);

    let report = broadcaster.deliver(&left, Frame::new(vec![7]));
    assert_eq!(report.delivered, 2);

    let report = broadcaster
        .stream(
            &right,
            futures::stream::iter([Frame::new(vec![1]), Frame::new(vec![2])]),
            Duration::from_millis(250),
        )
        .await;
    assert_eq!(
        report,
        StreamReport {
            frames: 2,
            ..Default::default()
        }
    );
    assert_eq!(registry.connection_count(&right), 0);

    assert_eq!(drain(&mut a, 1).await, vec![7]);
    assert_eq!(drain(&mut b, 1).await, vec![7]);
}

#[tokio::test]
async fn failed_sink_misses_everything_after_its_failure() {
    let (registry, broadcaster) = setup();
    let slug = CanvasSlug::from("wall");
    let mut a = connect(&registry, &slug);
    let b = connect(&registry, &slug);
    let mut c = connect(&registry, &slug);

    for i in 0..3u8 {
        assert_eq!(broadcaster.deliver(&slug, Frame::new(vec![i])).delivered, 3);
    }

    // Viewer `b` disconnects; frame 3 is the failing delivery.
    let b_id = b.id();
    drop(b);
    let report = broadcaster.deliver(&slug, Frame::new(vec![3]));
    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, 1);
    assert!(
        registry
            .snapshot(&slug)
            .iter()
            .all(|sink| sink.id() != b_id)
    );

    for i in 4..6u8 {
        let report = broadcaster.deliver(&slug, Frame::new(vec![i]));
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 0);
    }

    assert_eq!(drain(&mut a, 6).await, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(drain(&mut c, 6).await, vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test(start_paused = true)]
async fn every_viewer_gets_every_frame_in_order() {
    let (registry, broadcaster) = setup();
    let slug = CanvasSlug::from("gallery");
    let mut viewers: Vec<_> = (0..4).map(|_| connect(&registry, &slug)).collect();

    let frames = futures::stream::iter((0..10u8).map(|i| Frame::new(vec![i])));
    let report = broadcaster
        .stream(&slug, frames, Duration::from_millis(250))
        .await;
    assert_eq!(report.frames, 10);
    assert_eq!(report.delivered, 40);

    for rx in &mut viewers {
        assert_eq!(drain(rx, 10).await, (0..10).collect::<Vec<_>>());
    }
}

#[tokio::test(start_paused = true)]
async fn viewers_joining_mid_stream_pick_up_from_there() {
    let (registry, broadcaster) = setup();
    let slug = CanvasSlug::from("late");
    let mut early = connect(&registry, &slug);

    let late = Arc::new(parking_lot::Mutex::new(None));
    let frames = {
        let registry = Arc::clone(&registry);
        let slug = slug.clone();
        let late = Arc::clone(&late);
        futures::stream::iter(0..4u8).map(move |i| {
            if i == 2 {
                *late.lock() = Some(connect(&registry, &slug));
            }
            Frame::new(vec![i])
        })
    };

    broadcaster
        .stream(&slug, frames, Duration::from_millis(100))
        .await;

    let mut late = late.lock().take().unwrap();
    assert_eq!(drain(&mut early, 4).await, vec![0, 1, 2, 3]);
    assert_eq!(drain(&mut late, 2).await, vec![2, 3]);
}

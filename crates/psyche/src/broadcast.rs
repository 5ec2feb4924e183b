//! Paced delivery of frame sequences to canvas viewers.
//!
//! A stream produces frames one at a time. For each one the broadcaster takes
//! a fresh registry snapshot for the canvas and offers the frame to every
//! sink in it. Offers never wait on a viewer. A viewer that cannot take the
//! frame, because it is gone or still has a full buffer of earlier frames,
//! is unregistered, so every viewer that stays registered sees every frame
//! in order.
//!
//! A stream keeps running with nobody watching: its producer is not coupled
//! to viewer presence, so frames are simply produced and discarded.

use crate::{
    frame::{CanvasSlug, Frame},
    registry::ConnectionRegistry,
};
use core::time::Duration;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::time::{MissedTickBehavior, interval};

/// Default spacing between frames on one canvas (4 frames per second).
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(250);

/// Outcome of offering one frame to a canvas.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// Sinks that accepted the frame.
    pub delivered: usize,
    /// Sinks that refused it and have been unregistered.
    pub failed: usize,
}

/// Totals for a finished stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StreamReport {
    /// Frames produced, whether or not anyone was watching.
    pub frames: usize,
    pub delivered: usize,
    pub failed: usize,
}

impl StreamReport {
    fn absorb(&mut self, delivery: DeliveryReport) {
        self.frames += 1;
        self.delivered += delivery.delivered;
        self.failed += delivery.failed;
    }
}

/// Whether a canvas currently has a stream running.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Streaming,
}

type StreamCounts = Arc<Mutex<HashMap<CanvasSlug, usize>>>;

/// Fans frames out to the viewers of a canvas.
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    streams: StreamCounts,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            streams: StreamCounts::default(),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Offers `frame` to every sink currently registered for `slug`.
    ///
    /// Sinks that refuse the frame are unregistered and closed; the remaining
    /// sinks are unaffected. With no sinks registered nothing is attempted.
    pub fn deliver(&self, slug: &CanvasSlug, frame: Frame) -> DeliveryReport {
        let sinks = self.registry.snapshot(slug);
        let mut report = DeliveryReport::default();
        if sinks.is_empty() {
            tracing::trace!(canvas = %slug, "No viewers, frame discarded");
            return report;
        }

        let frame = Arc::new(frame);
        for sink in &sinks {
            match sink.send(Arc::clone(&frame)) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(canvas = %slug, sink_id = %sink.id(), error = %e, "Dropping viewer");
                    self.registry.unregister(slug, sink.id());
                    report.failed += 1;
                }
            }
        }

        tracing::debug!(
            canvas = %slug,
            image_id = %frame.image_id,
            delivered = report.delivered,
            failed = report.failed,
            "Frame sent"
        );
        report
    }

    /// Delivers every frame of `frames` to `slug`, in order, at least
    /// `interval` apart.
    ///
    /// The first frame goes out as soon as it is produced. If producing a
    /// frame takes longer than `interval` it is sent right away and the next
    /// one is again spaced a full `interval` after it. A zero `interval`
    /// disables pacing.
    pub async fn stream<S>(&self, slug: &CanvasSlug, frames: S, interval_len: Duration) -> StreamReport
    where
        S: Stream<Item = Frame>,
    {
        let _streaming = self.enter_stream(slug);
        let mut ticker = (!interval_len.is_zero()).then(|| {
            let mut ticker = interval(interval_len);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        let mut report = StreamReport::default();
        let mut frames = std::pin::pin!(frames);
        while let Some(frame) = frames.next().await {
            if let Some(ticker) = ticker.as_mut() {
                ticker.tick().await;
            }
            report.absorb(self.deliver(slug, frame));
        }

        tracing::info!(
            canvas = %slug,
            frames = report.frames,
            delivered = report.delivered,
            failed = report.failed,
            "Stream finished"
        );
        report
    }

    pub fn stream_state(&self, slug: &CanvasSlug) -> StreamState {
        if self.active_streams(slug) > 0 {
            StreamState::Streaming
        } else {
            StreamState::Idle
        }
    }

    /// Number of streams currently targeting `slug`.
    pub fn active_streams(&self, slug: &CanvasSlug) -> usize {
        self.streams.lock().get(slug).copied().unwrap_or(0)
    }

    fn enter_stream(&self, slug: &CanvasSlug) -> StreamGuard {
        let mut streams = self.streams.lock();
        let count = streams.entry(slug.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            // Frames from concurrent producers interleave in no defined order.
            tracing::warn!(canvas = %slug, streams = *count, "Concurrent streams on one canvas");
        }
        StreamGuard {
            streams: Arc::clone(&self.streams),
            slug: slug.clone(),
        }
    }
}

/// Returns the canvas to `Idle` when its last stream ends, even if the
/// stream future is dropped midway.
struct StreamGuard {
    streams: StreamCounts,
    slug: CanvasSlug,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let mut streams = self.streams.lock();
        if let Some(count) = streams.get_mut(&self.slug) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                streams.remove(&self.slug);
            }
        }
    }
}

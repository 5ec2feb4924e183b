//! Per-canvas sets of live viewer sinks.
//!
//! The registry is constructed once and shared (via `Arc`) with every
//! component that needs it. Each canvas has its own lock around its sink
//! set; the registry-wide lock only guards the slug map and is never held
//! while a set is mutated. Nothing is ever sent while a lock is held:
//! broadcasters work off [`ConnectionRegistry::snapshot`].

use crate::{
    error::{DeliveryError, Error, Result},
    frame::{CanvasSlug, Frame},
};
use core::fmt;
use parking_lot::{Mutex, RwLock};
use portable_atomic::{AtomicU64, Ordering};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

/// Default number of frames buffered per viewer before it is disconnected.
pub const DEFAULT_SINK_BUFFER: usize = 8;

static NEXT_SINK_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity of a sink. Increases with creation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkId(u64);

impl SinkId {
    fn next() -> Self {
        Self(NEXT_SINK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outbound channel to one connected viewer.
///
/// Sending never waits on the viewer: a frame is either queued into the
/// viewer's buffer or refused, because the viewer is gone or has let its
/// buffer fill up. The actual socket write happens on the viewer's own
/// task, draining the paired [`SinkReceiver`].
#[derive(Clone, Debug)]
pub struct FrameSink {
    id: SinkId,
    tx: mpsc::Sender<Arc<Frame>>,
    close: CancellationToken,
}

impl FrameSink {
    /// Creates a sink buffering up to `buffer` frames and its receiving end.
    pub fn channel(buffer: usize) -> (Self, SinkReceiver) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let close = CancellationToken::new();
        let id = SinkId::next();
        (
            Self {
                id,
                tx,
                close: close.clone(),
            },
            SinkReceiver { id, rx, close },
        )
    }

    pub const fn id(&self) -> SinkId {
        self.id
    }

    /// Hands `frame` to the viewer's buffer.
    ///
    /// # Errors
    ///
    /// - [`DeliveryError::Closed`] if the viewer disconnected or the sink was
    ///   closed.
    /// - [`DeliveryError::Lagging`] if the viewer's buffer is full.
    pub fn send(&self, frame: Arc<Frame>) -> Result<(), DeliveryError> {
        let sink_id = self.id.get();
        if self.close.is_cancelled() {
            return Err(DeliveryError::Closed { sink_id });
        }
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DeliveryError::Lagging { sink_id }),
            Err(TrySendError::Closed(_)) => Err(DeliveryError::Closed { sink_id }),
        }
    }

    /// Signals the viewer task to stop; frames still buffered are discarded.
    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled() || self.tx.is_closed()
    }
}

/// Receiving end of a [`FrameSink`], owned by the viewer's connection task.
#[derive(Debug)]
pub struct SinkReceiver {
    id: SinkId,
    rx: mpsc::Receiver<Arc<Frame>>,
    close: CancellationToken,
}

impl SinkReceiver {
    pub const fn id(&self) -> SinkId {
        self.id
    }

    /// Next frame in production order, or `None` once the sink is closed or
    /// every sender is gone.
    pub async fn recv(&mut self) -> Option<Arc<Frame>> {
        tokio::select! {
            biased;
            () = self.close.cancelled() => None,
            frame = self.rx.recv() => frame,
        }
    }
}

type SinkSet = Arc<Mutex<BTreeMap<SinkId, FrameSink>>>;

/// Concurrency-safe map from canvas to its current viewers.
///
/// Canvases are fully isolated: registering, failing or unregistering a sink
/// on one canvas never touches another canvas's set.
#[derive(Default)]
pub struct ConnectionRegistry {
    canvases: RwLock<HashMap<CanvasSlug, SinkSet>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sink_set(&self, slug: &CanvasSlug) -> Option<SinkSet> {
        self.canvases.read().get(slug).cloned()
    }

    fn sink_set_or_create(&self, slug: &CanvasSlug) -> SinkSet {
        if let Some(set) = self.sink_set(slug) {
            return set;
        }
        Arc::clone(self.canvases.write().entry(slug.clone()).or_default())
    }

    /// Adds `sink` to the set for `slug`, creating the set if needed.
    ///
    /// Returns the number of sinks now registered for `slug`.
    ///
    /// # Errors
    ///
    /// [`Error::Registration`] if the sink's viewer is already gone; nothing
    /// is registered in that case.
    pub fn register(&self, slug: &CanvasSlug, sink: FrameSink) -> Result<usize> {
        if sink.is_closed() {
            tracing::warn!(canvas = %slug, sink_id = %sink.id(), "Refusing to register a closed sink");
            return Err(Error::Registration {
                sink_id: sink.id().get(),
            });
        }

        let set = self.sink_set_or_create(slug);
        let mut sinks = set.lock();
        let sink_id = sink.id();
        sinks.insert(sink_id, sink);
        let total = sinks.len();
        drop(sinks);

        tracing::info!(canvas = %slug, sink_id = %sink_id, total, "Viewer connected");
        Ok(total)
    }

    /// Removes and closes the sink `sink_id` from `slug`'s set.
    ///
    /// The slug entry itself is kept even when its set becomes empty. Returns
    /// whether the sink was registered.
    pub fn unregister(&self, slug: &CanvasSlug, sink_id: SinkId) -> bool {
        let Some(set) = self.sink_set(slug) else {
            return false;
        };
        let mut sinks = set.lock();
        let removed = sinks.remove(&sink_id);
        let remaining = sinks.len();
        drop(sinks);

        match removed {
            Some(sink) => {
                sink.close();
                tracing::info!(canvas = %slug, sink_id = %sink_id, remaining, "Viewer removed");
                true
            }
            None => false,
        }
    }

    /// Point-in-time copy of the sinks for `slug`, in registration order.
    ///
    /// Changes made after the call are not reflected in the returned list.
    pub fn snapshot(&self, slug: &CanvasSlug) -> Vec<FrameSink> {
        self.sink_set(slug)
            .map(|set| set.lock().values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self, slug: &CanvasSlug) -> usize {
        self.sink_set(slug).map_or(0, |set| set.lock().len())
    }

    /// Connection count for every canvas ever seen, sorted by slug.
    pub fn census(&self) -> Vec<(CanvasSlug, usize)> {
        let sets: Vec<(CanvasSlug, SinkSet)> = self
            .canvases
            .read()
            .iter()
            .map(|(slug, set)| (slug.clone(), Arc::clone(set)))
            .collect();
        let mut census: Vec<_> = sets
            .into_iter()
            .map(|(slug, set)| (slug, set.lock().len()))
            .collect();
        census.sort_by(|a, b| a.0.cmp(&b.0));
        census
    }

    /// Closes and forgets every sink on every canvas. Returns how many were
    /// closed.
    pub fn close_all(&self) -> usize {
        let sets: Vec<SinkSet> = self.canvases.read().values().cloned().collect();
        let mut closed = 0;
        for set in sets {
            let drained = core::mem::take(&mut *set.lock());
            closed += drained.len();
            for sink in drained.into_values() {
                sink.close();
            }
        }
        tracing::info!(closed, "Closed all canvas connections");
        closed
    }
}

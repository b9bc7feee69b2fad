//! Broadcast fan-out to live subscribers.
//!
//! A single hub worker drains the bounded update queue and writes each
//! update to every registered subscriber. Failure handling is strictly
//! per-subscriber: a write error or deadline overrun removes that
//! subscriber and closes its handle without disturbing delivery to the
//! rest, and is never surfaced as a queue-level error.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use serde::Serialize;
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    record::DecodedEvent,
    stats::{SharedStats, StatsSummary},
};

/// One message on the live update channel.
///
/// Serializes as `{"type": "<variant>", "data": {...}}` with a fixed schema
/// per variant.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Update {
    /// Aggregate snapshot sent once per subscriber at registration.
    InitialStats(StatsSummary),
    /// A freshly aggregated packet observation.
    NewPacket(PacketUpdate),
    /// Windowed packet rate for the just-elapsed interval.
    TimeseriesUpdate(RateSample),
}

#[derive(Debug, Clone, Serialize)]
pub struct PacketUpdate {
    #[serde(flatten)]
    pub event: DecodedEvent,
    pub flow_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateSample {
    pub window_packets: u64,
    pub packets_per_second: f64,
}

/// Outbound half of a live subscriber connection.
///
/// The hub only ever writes; reading and connection upgrade mechanics stay
/// with the transport layer.
#[async_trait]
pub trait UpdateSink: Send {
    async fn send_text(&mut self, text: &str) -> anyhow::Result<()>;
    /// Best-effort close of the underlying connection.
    async fn close(&mut self);
}

pub type SubscriberId = u64;

/// The set of live subscribers, shared between the hub worker (removal on
/// write failure) and the registration path (insertion). Both sides take
/// the same lock, so add and remove never race and a registering subscriber
/// observes its initial snapshot before any concurrently broadcast update.
pub struct SubscriberSet {
    subscribers: Mutex<HashMap<SubscriberId, Box<dyn UpdateSink>>>,
    next_id: AtomicU64,
    write_timeout: Duration,
}

impl SubscriberSet {
    pub fn new(write_timeout: Duration) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            write_timeout,
        }
    }

    /// Registers a new subscriber and delivers its initial aggregate
    /// snapshot before any subsequent live update.
    ///
    /// The snapshot is taken while the set lock is held, so it is never
    /// older than the subscriber's registration point. A subscriber whose
    /// initial write fails or times out is closed and never enters the set.
    pub async fn register(
        &self,
        mut sink: Box<dyn UpdateSink>,
        stats: &SharedStats,
    ) -> anyhow::Result<SubscriberId> {
        let mut subscribers = self.subscribers.lock().await;

        let summary = stats.lock().await.summary();
        let text = serde_json::to_string(&Update::InitialStats(summary))?;

        match timeout(self.write_timeout, sink.send_text(&text)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = timeout(self.write_timeout, sink.close()).await;
                return Err(e.context("initial snapshot write failed"));
            }
            Err(_) => {
                let _ = timeout(self.write_timeout, sink.close()).await;
                return Err(anyhow!(
                    "initial snapshot write exceeded {:?}",
                    self.write_timeout
                ));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        subscribers.insert(id, sink);

        info!(
            event.name = "hub.subscriber_registered",
            subscriber.id = id,
            subscriber.count = subscribers.len(),
            "subscriber registered and initial snapshot delivered"
        );
        Ok(id)
    }

    /// Writes one update to every subscriber, in unspecified order.
    ///
    /// Each write is bounded by the configured deadline; a timeout is
    /// treated exactly like a write failure.
    pub async fn broadcast(&self, update: &Update) {
        let text = match serde_json::to_string(update) {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    event.name = "hub.encode_failed",
                    error.message = %e,
                    "failed to encode update, skipping"
                );
                return;
            }
        };

        let mut subscribers = self.subscribers.lock().await;
        let mut failed = Vec::new();

        for (id, sink) in subscribers.iter_mut() {
            match timeout(self.write_timeout, sink.send_text(&text)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(
                        event.name = "hub.subscriber_write_failed",
                        subscriber.id = id,
                        error.message = %e,
                        "subscriber write failed, removing"
                    );
                    failed.push(*id);
                }
                Err(_) => {
                    warn!(
                        event.name = "hub.subscriber_write_timeout",
                        subscriber.id = id,
                        timeout = ?self.write_timeout,
                        "subscriber write exceeded deadline, removing"
                    );
                    failed.push(*id);
                }
            }
        }

        for id in failed {
            if let Some(mut sink) = subscribers.remove(&id) {
                let _ = timeout(self.write_timeout, sink.close()).await;
                info!(
                    event.name = "hub.subscriber_removed",
                    subscriber.id = id,
                    subscriber.count = subscribers.len(),
                    "subscriber removed"
                );
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}

/// The broadcast worker: drains the update queue and fans each message out
/// through the shared [`SubscriberSet`].
pub struct BroadcastHub {
    updates_rx: mpsc::Receiver<Update>,
    subscribers: Arc<SubscriberSet>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl BroadcastHub {
    pub fn new(
        updates_rx: mpsc::Receiver<Update>,
        subscribers: Arc<SubscriberSet>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            updates_rx,
            subscribers,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!(event.name = "hub.started", "broadcast hub started");

        loop {
            tokio::select! {
                maybe_update = self.updates_rx.recv() => match maybe_update {
                    Some(update) => self.subscribers.broadcast(&update).await,
                    None => break,
                },
                _ = self.shutdown_rx.recv() => {
                    while let Ok(update) = self.updates_rx.try_recv() {
                        self.subscribers.broadcast(&update).await;
                    }
                    break;
                }
            }
        }

        info!(event.name = "hub.stopped", "broadcast hub drained and stopped");
    }
}

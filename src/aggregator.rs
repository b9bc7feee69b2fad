//! The aggregation worker.
//!
//! A single task multiplexes two wake sources onto one wait: receipt of a
//! decoded event from the bounded inbound queue, and a fixed-interval rate
//! window tick. Exactly one arm runs at a time, so all `AggregateState`
//! mutation is serialized on this worker; readers elsewhere take the shared
//! lock. Pushing to the outbound queue blocks when it is full, so a stalled
//! broadcast hub applies backpressure upstream instead of dropping updates.

use std::time::Duration;

use tokio::{
    sync::{broadcast, mpsc},
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::{
    hub::{PacketUpdate, RateSample, Update},
    record::DecodedEvent,
    stats::SharedStats,
};

pub struct Aggregator {
    events_rx: mpsc::Receiver<DecodedEvent>,
    updates_tx: mpsc::Sender<Update>,
    stats: SharedStats,
    rate_window: Duration,
    shutdown_rx: broadcast::Receiver<()>,
    /// Events seen since the last window tick. Local to this worker.
    window_packets: u64,
}

impl Aggregator {
    pub fn new(
        events_rx: mpsc::Receiver<DecodedEvent>,
        updates_tx: mpsc::Sender<Update>,
        stats: SharedStats,
        rate_window: Duration,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            events_rx,
            updates_tx,
            stats,
            rate_window,
            shutdown_rx,
            window_packets: 0,
        }
    }

    pub async fn run(mut self) {
        info!(
            event.name = "aggregator.started",
            rate_window = ?self.rate_window,
            "aggregation worker started"
        );

        let mut ticker = interval_at(Instant::now() + self.rate_window, self.rate_window);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_event = self.events_rx.recv() => match maybe_event {
                    Some(event) => {
                        if self.apply_event(event).await.is_err() {
                            break;
                        }
                    }
                    // Capture stream closed and the queue is drained.
                    None => break,
                },
                _ = ticker.tick() => {
                    if self.emit_rate_sample().await.is_err() {
                        break;
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    self.drain().await;
                    break;
                }
            }
        }

        info!(
            event.name = "aggregator.stopped",
            "aggregation worker stopped"
        );
    }

    /// Folds one event into the shared state and pushes the corresponding
    /// `new_packet` update. Errors only when the broadcast side is gone.
    async fn apply_event(&mut self, event: DecodedEvent) -> Result<(), ()> {
        self.window_packets += 1;
        let flow_id = event.flow_id();

        self.stats.lock().await.record(&event);

        self.updates_tx
            .send(Update::NewPacket(PacketUpdate { event, flow_id }))
            .await
            .map_err(|_| ())
    }

    async fn emit_rate_sample(&mut self) -> Result<(), ()> {
        let window_packets = self.window_packets;
        self.window_packets = 0;

        let sample = RateSample {
            window_packets,
            packets_per_second: window_packets as f64 / self.rate_window.as_secs_f64(),
        };
        debug!(
            event.name = "aggregator.rate_sample",
            window_packets, "emitting rate sample"
        );

        self.updates_tx
            .send(Update::TimeseriesUpdate(sample))
            .await
            .map_err(|_| ())
    }

    /// Processes whatever is already buffered on the inbound queue, then
    /// returns so the worker can exit.
    async fn drain(&mut self) {
        let mut drained = 0u64;
        while let Ok(event) = self.events_rx.try_recv() {
            if self.apply_event(event).await.is_err() {
                break;
            }
            drained += 1;
        }
        info!(
            event.name = "aggregator.drained",
            drained, "drained buffered events on shutdown"
        );
    }
}

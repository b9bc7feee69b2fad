//! End-to-end pipeline test: encoded capture records through the stream
//! reader, the aggregation worker, subscriber registration, and the
//! broadcast hub, using an in-memory byte stream and in-memory sinks.

use std::{io::Cursor, sync::Arc, time::Duration};

use async_trait::async_trait;
use pktviz::{
    aggregator::Aggregator,
    hub::{BroadcastHub, SubscriberSet, UpdateSink},
    record::{DecodedEvent, RawEventRecord, RECORD_LEN},
    source::EventReader,
    stats::{AggregateState, SharedStats},
};
use tokio::sync::{
    broadcast,
    mpsc::{self, unbounded_channel, UnboundedReceiver, UnboundedSender},
    Mutex,
};

fn encode_record(flow_hash: u32, protocol: u8, length: u32, cpu: u32) -> [u8; RECORD_LEN] {
    let mut buf = [0u8; RECORD_LEN];
    buf[0..8].copy_from_slice(&1_000_000_000u64.to_le_bytes());
    buf[8..12].copy_from_slice(&flow_hash.to_le_bytes());
    buf[12..16].copy_from_slice(&[10, 0, 0, 1]);
    buf[16..20].copy_from_slice(&[10, 0, 0, 2]);
    buf[20..22].copy_from_slice(&443u16.to_be_bytes());
    buf[22..24].copy_from_slice(&51000u16.to_be_bytes());
    buf[24] = protocol;
    buf[25] = 1;
    buf[28..32].copy_from_slice(&length.to_le_bytes());
    buf[32..36].copy_from_slice(&cpu.to_le_bytes());
    buf
}

struct RecordingSink(UnboundedSender<String>);

impl RecordingSink {
    fn channel() -> (Self, UnboundedReceiver<String>) {
        let (tx, rx) = unbounded_channel();
        (Self(tx), rx)
    }
}

#[async_trait]
impl UpdateSink for RecordingSink {
    async fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
        let _ = self.0.send(text.to_string());
        Ok(())
    }

    async fn close(&mut self) {}
}

#[tokio::test]
async fn hundred_records_aggregate_and_reach_a_late_subscriber() {
    let mut bytes = Vec::with_capacity(100 * RECORD_LEN);
    for i in 0..100u32 {
        bytes.extend_from_slice(&encode_record(i % 50, 6, 100, i % 4));
    }

    let (events_tx, events_rx) = mpsc::channel(256);
    let (updates_tx, updates_rx) = mpsc::channel(256);
    let (shutdown_tx, _) = broadcast::channel(1);
    let stats: SharedStats = Arc::new(Mutex::new(AggregateState::new()));

    // Reader and aggregator run to completion once the stream closes.
    EventReader::new(Cursor::new(bytes), events_tx, shutdown_tx.subscribe())
        .run()
        .await;
    Aggregator::new(
        events_rx,
        updates_tx,
        stats.clone(),
        Duration::from_secs(3600),
        shutdown_tx.subscribe(),
    )
    .run()
    .await;

    {
        let state = stats.lock().await;
        let summary = state.summary();
        assert_eq!(summary.total_packets, 100);
        assert_eq!(summary.total_bytes, 100 * 100);
        assert_eq!(summary.flow_count, 50);
        assert_eq!(summary.protocols.get("TCP"), Some(&100));
        assert_eq!(summary.protocols.values().sum::<u64>(), 100);
        assert_eq!(summary.cpus.values().sum::<u64>(), 100);

        let flows = state.flows();
        assert_eq!(flows.iter().map(|f| f.packet_count).sum::<u64>(), 100);
        assert!(flows.iter().all(|f| f.packet_count == 2));
        assert!(flows.iter().all(|f| f.total_latency == 0.0));
    }

    // A subscriber registering after the 100 events sees the snapshot as
    // its first message, then the queued per-packet updates in order.
    let subscribers = Arc::new(SubscriberSet::new(Duration::from_secs(1)));
    let (sink, mut received) = RecordingSink::channel();
    subscribers
        .register(Box::new(sink), &stats)
        .await
        .expect("registration succeeds");

    BroadcastHub::new(updates_rx, subscribers, shutdown_tx.subscribe())
        .run()
        .await;

    let first: serde_json::Value =
        serde_json::from_str(&received.recv().await.expect("initial message")).unwrap();
    assert_eq!(first["type"], "initial_stats");
    assert_eq!(first["data"]["total_packets"], 100);
    assert_eq!(first["data"]["flow_count"], 50);

    let mut packet_updates = 0;
    while let Ok(text) = received.try_recv() {
        let update: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(update["type"], "new_packet");
        assert_eq!(update["data"]["src_ip"], "10.0.0.1");
        assert_eq!(update["data"]["src_port"], 443);
        assert_eq!(
            update["data"]["flow_id"],
            "10.0.0.1:443 -> 10.0.0.2:51000"
        );
        packet_updates += 1;
    }
    assert_eq!(packet_updates, 100);
}

/// Queries taken under the shared lock while the aggregator is actively
/// folding events must always see internally consistent aggregates: the
/// histogram and flow-table sums match the packet total and no flow is
/// ever visible half-built.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queries_concurrent_with_ingestion_see_consistent_state() {
    let (events_tx, events_rx) = mpsc::channel(64);
    let (updates_tx, mut updates_rx) = mpsc::channel(64);
    let (shutdown_tx, _) = broadcast::channel(1);
    let stats: SharedStats = Arc::new(Mutex::new(AggregateState::new()));

    let aggregator_handle = tokio::spawn(
        Aggregator::new(
            events_rx,
            updates_tx,
            stats.clone(),
            Duration::from_secs(3600),
            shutdown_tx.subscribe(),
        )
        .run(),
    );
    // Keep the bounded broadcast queue from ever stalling the aggregator.
    let sink_handle = tokio::spawn(async move { while updates_rx.recv().await.is_some() {} });

    let feeder_handle = tokio::spawn(async move {
        for i in 0..500u32 {
            let frame = encode_record(i % 20, if i % 3 == 0 { 6 } else { 17 }, 100, i % 4);
            let record = RawEventRecord::parse(&frame).unwrap();
            events_tx
                .send(DecodedEvent::from_record(&record))
                .await
                .unwrap();
        }
    });

    for _ in 0..200 {
        // One lock acquisition for both reads, so they describe the same
        // point in time and can be checked against each other.
        let (summary, flows) = {
            let state = stats.lock().await;
            (state.summary(), state.flows())
        };

        assert_eq!(
            summary.protocols.values().sum::<u64>(),
            summary.total_packets
        );
        assert_eq!(summary.cpus.values().sum::<u64>(), summary.total_packets);
        assert_eq!(
            flows.iter().map(|f| f.packet_count).sum::<u64>(),
            summary.total_packets
        );
        assert_eq!(flows.len(), summary.flow_count);
        for flow in &flows {
            assert!(flow.packet_count >= 1);
            assert!(!flow.flow_id.is_empty());
            assert!(!flow.hash.is_empty());
        }

        tokio::task::yield_now().await;
    }

    feeder_handle.await.unwrap();
    aggregator_handle.await.unwrap();
    sink_handle.await.unwrap();

    let final_summary = stats.lock().await.summary();
    assert_eq!(final_summary.total_packets, 500);
    assert_eq!(final_summary.flow_count, 40);
}

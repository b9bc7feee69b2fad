//! In-memory telemetry aggregates shared between the aggregator worker and
//! the read-only query paths.
//!
//! `AggregateState` is written exclusively by the aggregator worker; every
//! other execution context (pull queries, subscriber registration) reads it
//! under the same lock. Flow table entries are created on first occurrence
//! of a key and never evicted.

use std::{
    collections::{hash_map::Entry, HashMap},
    sync::Arc,
    time::Instant,
};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::record::DecodedEvent;

/// The shared handle every reader and the aggregator worker hold.
pub type SharedStats = Arc<Mutex<AggregateState>>;

/// Per-flow aggregate, keyed by `"<hash>_<protocol-label>"`.
///
/// `flow_id` is fixed at first sight of the key. `total_latency` is always
/// zero; no latency source feeds it yet.
#[derive(Debug, Clone, Serialize)]
pub struct FlowRecord {
    pub hash: String,
    pub flow_id: String,
    pub protocol: String,
    pub packet_count: u64,
    pub total_bytes: u64,
    pub total_latency: f64,
    pub probe_count: u64,
}

/// Snapshot product of the aggregate summary query and the per-subscriber
/// initial state message.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    pub total_packets: u64,
    pub total_bytes: u64,
    pub flow_count: usize,
    pub uptime_seconds: f64,
    pub protocols: HashMap<String, u64>,
    pub cpus: HashMap<u32, u64>,
}

#[derive(Debug)]
pub struct AggregateState {
    total_packets: u64,
    total_bytes: u64,
    started_at: Instant,
    protocols: HashMap<String, u64>,
    cpus: HashMap<u32, u64>,
    flows: HashMap<String, FlowRecord>,
}

impl AggregateState {
    pub fn new() -> Self {
        Self {
            total_packets: 0,
            total_bytes: 0,
            started_at: Instant::now(),
            protocols: HashMap::new(),
            cpus: HashMap::new(),
            flows: HashMap::new(),
        }
    }

    /// Folds one decoded event into the aggregates.
    ///
    /// Every event updates exactly one flow, so the sum of flow packet
    /// counts and the sum of protocol histogram counts both stay equal to
    /// `total_packets`.
    pub fn record(&mut self, event: &DecodedEvent) {
        self.total_packets += 1;
        self.total_bytes += u64::from(event.len);

        *self.protocols.entry(event.protocol.clone()).or_insert(0) += 1;
        *self.cpus.entry(event.cpu).or_insert(0) += 1;

        match self.flows.entry(event.flow_key()) {
            Entry::Occupied(mut occupied) => {
                let flow = occupied.get_mut();
                flow.packet_count += 1;
                flow.total_bytes += u64::from(event.len);
                flow.probe_count += 1;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(FlowRecord {
                    hash: event.hash.clone(),
                    flow_id: event.flow_id(),
                    protocol: event.protocol.clone(),
                    packet_count: 1,
                    total_bytes: u64::from(event.len),
                    total_latency: 0.0,
                    probe_count: 0,
                });
            }
        }
    }

    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            total_packets: self.total_packets,
            total_bytes: self.total_bytes,
            flow_count: self.flows.len(),
            uptime_seconds: self.started_at.elapsed().as_secs_f64(),
            protocols: self.protocols.clone(),
            cpus: self.cpus.clone(),
        }
    }

    /// Point-in-time copy of the full flow table, unordered across flows.
    pub fn flows(&self) -> Vec<FlowRecord> {
        self.flows.values().cloned().collect()
    }

    pub fn total_packets(&self) -> u64 {
        self.total_packets
    }
}

impl Default for AggregateState {
    fn default() -> Self {
        Self::new()
    }
}

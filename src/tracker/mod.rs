/// Incremental flow tracker — keeps only open connections in memory while a
/// packet stream is absorbed batch by batch. Connections are completed and
/// evicted on an explicit close signal (FIN/RST) or after an inactivity
/// timeout measured against the newest timestamp in the current batch.
use indexmap::map::Entry;
use indexmap::IndexMap;

use crate::flow;
use crate::models::{ConnectionKey, Flow, PacketRecord, FIN, RST};

struct ConnectionEntry {
    packets: Vec<PacketRecord>,
    flow_id: String,
    last_packet_at: i64,
    has_fin_or_rst: bool,
}

pub struct FlowTracker {
    // Insertion order is kept so completion order and flow ids are
    // reproducible across runs
    connections: IndexMap<ConnectionKey, ConnectionEntry>,
    flow_counter: u64,
    timeout_micros: i64,
}

impl FlowTracker {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            connections: IndexMap::new(),
            flow_counter: 0,
            timeout_micros: timeout_secs as i64 * 1_000_000,
        }
    }

    /// Attaches one packet to its connection's accumulation buffer, creating
    /// the table entry (and assigning the flow id in first-seen order) as
    /// needed. Packets missing either port or address are not trackable and
    /// are skipped here; aggregation sees them regardless.
    pub fn attach(&mut self, packet: &PacketRecord) {
        if packet.src_port == 0
            || packet.dst_port == 0
            || packet.src_ip.is_empty()
            || packet.dst_ip.is_empty()
        {
            return;
        }

        let key = ConnectionKey::for_packet(packet);
        let entry = match self.connections.entry(key) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                self.flow_counter += 1;
                e.insert(ConnectionEntry {
                    packets: Vec::new(),
                    flow_id: format!("flow_{:06}", self.flow_counter),
                    last_packet_at: packet.timestamp,
                    has_fin_or_rst: false,
                })
            }
        };

        entry.packets.push(packet.clone());
        entry.last_packet_at = packet.timestamp;
        if packet.flags & (FIN | RST) != 0 {
            entry.has_fin_or_rst = true;
        }
    }

    pub fn absorb(&mut self, batch: &[PacketRecord]) {
        for packet in batch {
            self.attach(packet);
        }
    }

    /// Completion scan, run once per absorbed batch with `clock` set to the
    /// newest timestamp observed in that batch. A connection is eligible once
    /// it has seen FIN or RST, or once it has been inactive for the timeout.
    /// Eligible connections are assembled and evicted in table order;
    /// timeout-driven completions are tagged `completed_by_timeout`.
    pub fn sweep(&mut self, clock: i64) -> Vec<Flow> {
        let eligible: Vec<ConnectionKey> = self
            .connections
            .iter()
            .filter(|(_, entry)| {
                entry.has_fin_or_rst || clock - entry.last_packet_at >= self.timeout_micros
            })
            .map(|(key, _)| key.clone())
            .collect();

        let mut completed = Vec::with_capacity(eligible.len());
        for key in eligible {
            if let Some(entry) = self.connections.shift_remove(&key) {
                let timed_out = !entry.has_fin_or_rst;
                let mut flow = flow::assemble(key, entry.packets, entry.flow_id);
                if timed_out {
                    flow.completed_by_timeout = true;
                }
                completed.push(flow);
            }
        }
        completed
    }

    /// Force-completes every remaining connection at end of stream, so every
    /// attached packet is accounted for in exactly one flow. End-of-stream
    /// completion is not a timeout and is not tagged as one.
    pub fn drain(&mut self) -> Vec<Flow> {
        let connections = std::mem::take(&mut self.connections);
        connections
            .into_iter()
            .map(|(key, entry)| flow::assemble(key, entry.packets, entry.flow_id))
            .collect()
    }

    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

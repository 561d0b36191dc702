/// Aggregation engine — flag histogram, per-IP traffic counters, and
/// canonical-pair directional counters, updated exactly once per packet and
/// independent of flow completion. Also the post-hoc time-bin generator.
use indexmap::IndexMap;

use crate::models::{IpPairStats, IpStats, PacketRecord, TimeBin};

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

/// Run-level accumulators. Owned by the ingestion loop and updated on the
/// forward path only; nothing here ever rolls back, even when the owning
/// flow is later judged invalid.
#[derive(Default)]
pub struct Aggregates {
    ip_stats: IndexMap<String, IpStats>,
    ip_pairs: IndexMap<(String, String), IpPairStats>,
    flag_counts: IndexMap<String, u64>,
}

impl Aggregates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one packet: histogram bump, sender/receiver counters, and the
    /// unordered-pair entry with direction attributed against the pair's
    /// first element. Negative lengths count as zero bytes.
    pub fn record(&mut self, pkt: &PacketRecord) {
        let length = pkt.length.max(0) as u64;
        let ts = pkt.timestamp;

        *self.flag_counts.entry(pkt.flag_type.clone()).or_insert(0) += 1;

        let sender = self.ip_stats.entry(pkt.src_ip.clone()).or_default();
        sender.sent_packets += 1;
        sender.sent_bytes += length;
        sender.first_ts = Some(sender.first_ts.map_or(ts, |t| t.min(ts)));
        sender.last_ts = Some(sender.last_ts.map_or(ts, |t| t.max(ts)));

        let receiver = self.ip_stats.entry(pkt.dst_ip.clone()).or_default();
        receiver.recv_packets += 1;
        receiver.recv_bytes += length;
        receiver.first_ts = Some(receiver.first_ts.map_or(ts, |t| t.min(ts)));
        receiver.last_ts = Some(receiver.last_ts.map_or(ts, |t| t.max(ts)));

        let (a, b) = if pkt.src_ip <= pkt.dst_ip {
            (pkt.src_ip.clone(), pkt.dst_ip.clone())
        } else {
            (pkt.dst_ip.clone(), pkt.src_ip.clone())
        };
        let pair = self
            .ip_pairs
            .entry((a.clone(), b.clone()))
            .or_insert_with(|| IpPairStats {
                ip1: a,
                ip2: b,
                packet_count: 0,
                a_to_b_packets: 0,
                b_to_a_packets: 0,
                a_to_b_bytes: 0,
                b_to_a_bytes: 0,
                first_ts: ts,
                last_ts: ts,
            });
        pair.packet_count += 1;
        pair.first_ts = pair.first_ts.min(ts);
        pair.last_ts = pair.last_ts.max(ts);
        if pkt.src_ip == pair.ip1 {
            pair.a_to_b_packets += 1;
            pair.a_to_b_bytes += length;
        } else {
            pair.b_to_a_packets += 1;
            pair.b_to_a_bytes += length;
        }
    }

    pub fn ip_stats(&self) -> &IndexMap<String, IpStats> {
        &self.ip_stats
    }

    pub fn ip_pairs(&self) -> impl Iterator<Item = &IpPairStats> {
        self.ip_pairs.values()
    }

    pub fn flag_counts(&self) -> &IndexMap<String, u64> {
        &self.flag_counts
    }
}

// ---------------------------------------------------------------------------
// Time bins
// ---------------------------------------------------------------------------

/// Collects every observed timestamp and buckets them, once, into a fixed
/// number of equal-width windows over the observed range.
#[derive(Default)]
pub struct TimeBinner {
    timestamps: Vec<i64>,
}

impl TimeBinner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, ts: i64) {
        self.timestamps.push(ts);
    }

    pub fn observe_batch(&mut self, batch: &[PacketRecord]) {
        self.timestamps.extend(batch.iter().map(|p| p.timestamp));
    }

    /// Observed (min, max) range, or `None` when nothing was ingested.
    pub fn range(&self) -> Option<(i64, i64)> {
        let min = *self.timestamps.iter().min()?;
        let max = *self.timestamps.iter().max()?;
        Some((min, max))
    }

    /// Buckets the observed timestamps into `count` equal-width bins over
    /// `[min, max]`. Bin membership is `start <= ts < end` with float bin
    /// edges, so a timestamp equal to the range maximum lands in no bin. A
    /// degenerate single-instant range collapses to one full bin.
    pub fn bins(&self, count: usize) -> Vec<TimeBin> {
        let Some((min_ts, max_ts)) = self.range() else {
            return Vec::new();
        };
        if min_ts == max_ts {
            return vec![TimeBin {
                index: 0,
                start: min_ts,
                end: max_ts,
                count: self.timestamps.len() as u64,
            }];
        }

        let width = (max_ts - min_ts) as f64 / count as f64;
        let mut bins = Vec::with_capacity(count);
        for i in 0..count {
            let bin_start = min_ts as f64 + i as f64 * width;
            let bin_end = min_ts as f64 + (i + 1) as f64 * width;
            let hits = self
                .timestamps
                .iter()
                .filter(|&&ts| bin_start <= ts as f64 && (ts as f64) < bin_end)
                .count() as u64;
            bins.push(TimeBin {
                index: i,
                start: bin_start as i64,
                end: bin_end as i64,
                count: hits,
            });
        }
        bins
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

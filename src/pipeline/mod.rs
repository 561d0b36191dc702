/// Pipeline orchestration — pulls the packet log one bounded batch at a
/// time and pushes each batch through the packet echo, the aggregation
/// engine, and the flow tracker before the next batch is read. Completed
/// flows stream to the chunked writer as they are evicted; end of stream
/// drains the connection table and finalizes every artifact.
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use chrono::Utc;

use crate::ingest::{AddressMap, CsvRecordSource};
use crate::models::{ArtifactPaths, Manifest, RecordSource, Result, TimeRange};
use crate::output::{self, ChunkedFlowWriter, PacketLogWriter};
use crate::stats::{Aggregates, TimeBinner};
use crate::tracker::FlowTracker;

pub const DEFAULT_FLOWS_PER_CHUNK: usize = 200;
pub const DEFAULT_READ_BATCH_SIZE: usize = 500_000;
pub const DEFAULT_FLOW_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_TIME_BINS: usize = 100;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Run configuration. The sizing knobs trade memory for latency or file
/// count; none of them affect flow classification.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_file: PathBuf,
    pub ip_map_file: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub max_records: Option<u64>,
    pub flows_per_chunk: usize,
    pub read_batch_size: usize,
    pub flow_timeout_secs: u64,
    pub time_bins: usize,
}

impl PipelineConfig {
    pub fn new(data_file: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_file: data_file.into(),
            ip_map_file: None,
            output_dir: output_dir.into(),
            max_records: None,
            flows_per_chunk: DEFAULT_FLOWS_PER_CHUNK,
            read_batch_size: DEFAULT_READ_BATCH_SIZE,
            flow_timeout_secs: DEFAULT_FLOW_TIMEOUT_SECS,
            time_bins: DEFAULT_TIME_BINS,
        }
    }
}

/// Aggregate totals for one completed run.
#[derive(Debug)]
pub struct PipelineReport {
    pub total_packets: u64,
    pub tcp_packets: u64,
    pub unique_ips: usize,
    pub total_flows: u64,
    pub total_chunks: usize,
    pub flows_left_open: u64,
    pub manifest: Manifest,
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn run(config: &PipelineConfig) -> Result<PipelineReport> {
    let address_map = match &config.ip_map_file {
        Some(path) => AddressMap::load(path),
        None => AddressMap::default(),
    };

    let mut source =
        CsvRecordSource::open(&config.data_file, address_map, config.read_batch_size)?;
    run_with_source(&mut source, config).await
}

/// Drives the pipeline over any record source; `run` wires up the CSV reader.
pub async fn run_with_source<S: RecordSource>(
    source: &mut S,
    config: &PipelineConfig,
) -> Result<PipelineReport> {
    fs::create_dir_all(&config.output_dir)?;

    let mut packet_log = PacketLogWriter::create(&config.output_dir)?;
    let mut flow_writer = ChunkedFlowWriter::create(&config.output_dir, config.flows_per_chunk)?;
    let mut tracker = FlowTracker::new(config.flow_timeout_secs);
    let mut aggregates = Aggregates::new();
    let mut binner = TimeBinner::new();
    let mut unique_ips: HashSet<String> = HashSet::new();

    let mut total_packets: u64 = 0;
    let mut tcp_packets: u64 = 0;
    let mut batch_number: u64 = 0;

    while let Some(mut batch) = source.next_batch().await? {
        batch_number += 1;

        if let Some(max) = config.max_records {
            let remaining = max.saturating_sub(total_packets) as usize;
            if batch.len() > remaining {
                batch.truncate(remaining);
            }
        }
        if batch.is_empty() {
            break;
        }

        total_packets += batch.len() as u64;
        packet_log.append_batch(&batch)?;
        binner.observe_batch(&batch);
        for packet in &batch {
            unique_ips.insert(packet.src_ip.clone());
            unique_ips.insert(packet.dst_ip.clone());
        }

        // Flow tracking and aggregation run over the TCP portion in lockstep
        let mut tcp_in_batch: u64 = 0;
        let mut batch_clock: Option<i64> = None;
        for packet in &batch {
            if !packet.protocol.is_tcp() {
                continue;
            }
            tcp_in_batch += 1;
            aggregates.record(packet);
            tracker.attach(packet);
            batch_clock = Some(batch_clock.map_or(packet.timestamp, |t| t.max(packet.timestamp)));
        }
        tcp_packets += tcp_in_batch;

        let mut completed = 0usize;
        let mut timed_out = 0usize;
        if let Some(clock) = batch_clock {
            for flow in tracker.sweep(clock) {
                completed += 1;
                if flow.completed_by_timeout {
                    timed_out += 1;
                }
                flow_writer.push(flow)?;
            }
        }

        tracing::info!(
            batch = batch_number,
            packets = batch.len(),
            tcp = tcp_in_batch,
            active = tracker.active_connections(),
            completed,
            timed_out,
            buffered = flow_writer.pending_flows(),
            total = total_packets,
            "batch absorbed"
        );

        if config.max_records.is_some_and(|max| total_packets >= max) {
            tracing::info!(total = total_packets, "record cap reached");
            break;
        }
    }

    // Every connection still open at end of stream is force-completed, so
    // each ingested packet lands in exactly one flow
    let remaining = tracker.drain();
    tracing::info!(flows = remaining.len(), "finalizing remaining connections");
    for flow in remaining {
        flow_writer.push(flow)?;
    }

    packet_log.finish()?;
    let flow_report = flow_writer.finish()?;

    let mut sorted_ips: Vec<String> = unique_ips.into_iter().collect();
    sorted_ips.sort();

    output::write_ip_artifacts(&config.output_dir, &aggregates, &sorted_ips)?;
    output::write_time_bins(&config.output_dir, &binner.bins(config.time_bins))?;

    let (start, end) = binner.range().unwrap_or((0, 0));
    let manifest = Manifest {
        version: "2.0".to_string(),
        format: "chunked".to_string(),
        created: Utc::now().to_rfc3339(),
        source_file: config.data_file.display().to_string(),
        total_packets,
        tcp_packets,
        unique_ips: sorted_ips.len(),
        total_flows: flow_report.total_flows,
        flows_per_chunk: config.flows_per_chunk,
        total_chunks: flow_report.total_chunks,
        time_range: TimeRange { start, end, duration: end - start },
        structure: ArtifactPaths {
            packets: "packets.csv".to_string(),
            flows_index: "flows/flows_index.json".to_string(),
            flow_chunks: "flows/chunk_*.json".to_string(),
            time_bins: "indices/bins.json".to_string(),
            ip_stats: "ips/ip_stats.json".to_string(),
            flag_stats: "ips/flag_stats.json".to_string(),
            unique_ips: "ips/unique_ips.json".to_string(),
        },
    };
    output::write_manifest(&config.output_dir, &manifest)?;

    let flows_left_open = flow_report.index.iter().filter(|s| s.ongoing).count() as u64;
    tracing::info!(
        total_packets,
        tcp_packets,
        flows = flow_report.total_flows,
        left_open = flows_left_open,
        chunks = flow_report.total_chunks,
        unique_ips = sorted_ips.len(),
        "processing complete"
    );

    Ok(PipelineReport {
        total_packets,
        tcp_packets,
        unique_ips: sorted_ips.len(),
        total_flows: flow_report.total_flows,
        total_chunks: flow_report.total_chunks,
        flows_left_open,
        manifest,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Artifact persistence — the chunked flow writer plus the statistics, bin,
/// and manifest files that make up the output directory:
///
/// - `packets.csv` — incremental echo of every normalized packet
/// - `flows/chunk_NNNNN.json` — full flow detail, a fixed count per file
/// - `flows/flows_index.json` — flow summaries with chunk locators
/// - `ips/` — ip_stats, ip_pairs, flag_stats, unique_ips
/// - `indices/bins.json`, `manifest.json`
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::models::{
    Flow, FlowSummary, FlowscopeError, Manifest, PacketRecord, Result, TimeBin,
};
use crate::stats::Aggregates;

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Chunked flow writer
// ---------------------------------------------------------------------------

/// Totals reported once the writer is finished.
pub struct FlowWriteReport {
    pub index: Vec<FlowSummary>,
    pub total_flows: u64,
    pub total_chunks: usize,
}

/// Buffers completed flows and flushes them as immutable chunk files of a
/// fixed size, keeping only summaries in memory afterwards. Chunk size is
/// the sole memory/throughput knob here: smaller chunks bound peak memory
/// more tightly at the cost of more files.
pub struct ChunkedFlowWriter {
    flows_dir: PathBuf,
    flows_per_chunk: usize,
    pending: Vec<Flow>,
    index: Vec<FlowSummary>,
    chunk_counter: usize,
    total_written: u64,
}

impl ChunkedFlowWriter {
    pub fn create(output_dir: &Path, flows_per_chunk: usize) -> Result<Self> {
        if flows_per_chunk == 0 {
            return Err(FlowscopeError::Config("flows per chunk must be positive".into()));
        }
        let flows_dir = output_dir.join("flows");
        fs::create_dir_all(&flows_dir)?;
        Ok(Self {
            flows_dir,
            flows_per_chunk,
            pending: Vec::new(),
            index: Vec::new(),
            chunk_counter: 0,
            total_written: 0,
        })
    }

    /// Buffers one completed flow, flushing full chunks as they form.
    pub fn push(&mut self, flow: Flow) -> Result<()> {
        self.pending.push(flow);
        while self.pending.len() >= self.flows_per_chunk {
            let batch: Vec<Flow> = self.pending.drain(..self.flows_per_chunk).collect();
            self.write_chunk(&batch)?;
        }
        Ok(())
    }

    fn write_chunk(&mut self, flows: &[Flow]) -> Result<()> {
        let filename = format!("chunk_{:05}.json", self.chunk_counter);
        write_json(&self.flows_dir.join(&filename), flows)?;

        for (position, flow) in flows.iter().enumerate() {
            self.index.push(flow.summarize(&filename, position));
        }
        self.chunk_counter += 1;
        self.total_written += flows.len() as u64;

        tracing::debug!(chunk = %filename, flows = flows.len(), "flow chunk written");
        Ok(())
    }

    pub fn pending_flows(&self) -> usize {
        self.pending.len()
    }

    /// Flushes the final partial chunk and writes the flow index.
    pub fn finish(mut self) -> Result<FlowWriteReport> {
        if !self.pending.is_empty() {
            let rest: Vec<Flow> = self.pending.drain(..).collect();
            self.write_chunk(&rest)?;
        }
        write_json(&self.flows_dir.join("flows_index.json"), &self.index)?;

        Ok(FlowWriteReport {
            index: self.index,
            total_flows: self.total_written,
            total_chunks: self.chunk_counter,
        })
    }
}

// ---------------------------------------------------------------------------
// Packet log echo
// ---------------------------------------------------------------------------

/// Appends every normalized packet to `packets.csv` as batches arrive, so the
/// full log never sits in memory.
pub struct PacketLogWriter {
    writer: csv::Writer<File>,
}

impl PacketLogWriter {
    pub fn create(output_dir: &Path) -> Result<Self> {
        let writer = csv::Writer::from_path(output_dir.join("packets.csv"))?;
        Ok(Self { writer })
    }

    pub fn append_batch(&mut self, batch: &[PacketRecord]) -> Result<()> {
        for record in batch {
            self.writer.serialize(record)?;
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Statistics, bins, manifest
// ---------------------------------------------------------------------------

pub fn write_ip_artifacts(
    output_dir: &Path,
    aggregates: &Aggregates,
    unique_ips: &[String],
) -> Result<()> {
    let ips_dir = output_dir.join("ips");
    fs::create_dir_all(&ips_dir)?;

    write_json(&ips_dir.join("ip_stats.json"), aggregates.ip_stats())?;
    write_json(&ips_dir.join("flag_stats.json"), aggregates.flag_counts())?;
    let pairs: Vec<_> = aggregates.ip_pairs().collect();
    write_json(&ips_dir.join("ip_pairs.json"), &pairs)?;
    write_json(&ips_dir.join("unique_ips.json"), unique_ips)?;
    Ok(())
}

pub fn write_time_bins(output_dir: &Path, bins: &[TimeBin]) -> Result<()> {
    let indices_dir = output_dir.join("indices");
    fs::create_dir_all(&indices_dir)?;
    write_json(&indices_dir.join("bins.json"), bins)
}

pub fn write_manifest(output_dir: &Path, manifest: &Manifest) -> Result<()> {
    write_json(&output_dir.join("manifest.json"), manifest)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

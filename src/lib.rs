//! Flowscope reconstructs TCP connection lifecycles from a captured packet
//! log and writes a chunked artifact directory (flow detail + index, per-IP
//! statistics, flag histogram, time bins, manifest) for downstream
//! visualization. Processing is streaming: packets are ingested in bounded
//! batches, open connections are completed and evicted on close or
//! inactivity, and finished flows are flushed to disk in fixed-size chunks.

pub mod flow;
pub mod ingest;
pub mod models;
pub mod output;
pub mod pipeline;
pub mod stats;
pub mod tracker;

use std::path::PathBuf;

use clap::Parser;

use flowscope::pipeline::{self, PipelineConfig};

#[derive(Parser, Debug)]
#[command(
    name = "flowscope",
    version,
    about = "Reconstructs TCP flow lifecycles from a captured packet log"
)]
struct Cli {
    /// Input packet log (CSV, or gzip-compressed CSV by extension)
    #[arg(long, value_name = "FILE")]
    data: PathBuf,

    /// Address map JSON file (address string to integer)
    #[arg(long = "ip-map", value_name = "FILE")]
    ip_map: Option<PathBuf>,

    /// Output directory for the artifact set
    #[arg(long, value_name = "DIR")]
    output_dir: PathBuf,

    /// Maximum number of records to ingest
    #[arg(long, value_name = "N")]
    max_records: Option<u64>,

    /// Flows per output chunk file
    #[arg(long, value_name = "N", default_value_t = pipeline::DEFAULT_FLOWS_PER_CHUNK)]
    flows_per_chunk: usize,

    /// Rows per input read batch
    #[arg(long, value_name = "N", default_value_t = pipeline::DEFAULT_READ_BATCH_SIZE)]
    read_batch_size: usize,

    /// Seconds of inactivity before an open flow is completed by timeout
    #[arg(
        long = "flow-timeout-seconds",
        value_name = "SECS",
        default_value_t = pipeline::DEFAULT_FLOW_TIMEOUT_SECS
    )]
    flow_timeout_seconds: u64,

    /// Number of equal-width time bins over the observed range
    #[arg(long, value_name = "N", default_value_t = pipeline::DEFAULT_TIME_BINS)]
    time_bins: usize,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig {
        data_file: cli.data,
        ip_map_file: cli.ip_map,
        output_dir: cli.output_dir,
        max_records: cli.max_records,
        flows_per_chunk: cli.flows_per_chunk,
        read_batch_size: cli.read_batch_size,
        flow_timeout_secs: cli.flow_timeout_seconds,
        time_bins: cli.time_bins,
    };

    tracing::info!(
        data = %config.data_file.display(),
        output = %config.output_dir.display(),
        "starting flow reconstruction"
    );

    match pipeline::run(&config).await {
        Ok(report) => {
            tracing::info!(
                packets = report.total_packets,
                tcp = report.tcp_packets,
                flows = report.total_flows,
                chunks = report.total_chunks,
                output = %config.output_dir.display(),
                "run complete"
            );
        }
        Err(e) => {
            tracing::error!("fatal: {e}");
            std::process::exit(1);
        }
    }
}

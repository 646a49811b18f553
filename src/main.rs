use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::LevelFilter;

use qb_shots::config::{Backend, DEFAULT_RECEIVE_TIMEOUT_MS};
use qb_shots::distribute::{run_local_cluster, run_process, RunSpec, RunSummary};
use qb_shots::partition::shots_for_mpi_process;
use qb_shots::sampler::MAX_QUBITS;
use qb_shots::transport::{TcpTransport, Transport};
use qb_shots::{DistributedConfig, MpiManager};

const QB_SHOTS_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "qb-shots", version = QB_SHOTS_VERSION,
    about = "splits a shot budget across processes and aggregates the measured results on rank 0")]
struct Cli {
    /// print debug logs (RUST_LOG still takes precedence)
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// runs every process as a thread of this one.
    Local {
        /// number of simulated processes
        #[arg(long, default_value_t = 4)]
        processes: usize,
        #[command(flatten)]
        workload: Workload,
        /// per-process receive timeout in milliseconds
        #[arg(long, default_value_t = DEFAULT_RECEIVE_TIMEOUT_MS)]
        timeout_ms: u64,
    },
    /// runs this process as one rank of a tcp or mpi launched job.
    Run {
        /// json configuration file, overridden by QB_SHOTS_* variables
        #[arg(long)]
        config: Option<PathBuf>,
        #[command(flatten)]
        workload: Workload,
    },
    /// prints the shot quota of every process.
    Partition {
        #[arg(long)]
        processes: usize,
        #[arg(long)]
        shots: usize,
    },
}

#[derive(clap::Args, Debug)]
struct Workload {
    /// total shots across all processes
    #[arg(long)]
    shots: usize,
    /// bitstring width
    #[arg(long, default_value_t = 3)]
    qubits: usize,
    /// seed shared by every process, each draws from its own stream
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// circuit parameters, also the number of gradient rows
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true, default_values_t = vec![0.3, -0.6])]
    params: Vec<f64>,
    /// skip gradient estimation
    #[arg(long)]
    no_gradients: bool,
}

impl Workload {
    fn to_spec(&self) -> anyhow::Result<RunSpec> {
        if self.qubits == 0 || self.qubits > MAX_QUBITS {
            bail!("--qubits must be between 1 and {}, got {}", MAX_QUBITS, self.qubits);
        }
        Ok(RunSpec {
            num_qubits: self.qubits,
            total_shots: self.shots,
            params: self.params.clone(),
            seed: self.seed,
            with_gradients: !self.no_gradients,
        })
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(default_level)
        .parse_default_env()
        .format_timestamp_millis()
        .init();
}

fn print_summary(summary: &RunSummary) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(summary).context("serializing run summary")?;
    println!("{}", json);
    Ok(())
}

fn run_with<T: Transport>(
    transport: T,
    config: &DistributedConfig,
    spec: &RunSpec,
) -> anyhow::Result<()> {
    let mut manager = MpiManager::from_config(transport, config);
    if let Some(summary) = run_process(&mut manager, spec)? {
        print_summary(&summary)?;
    }
    Ok(())
}

#[cfg(feature = "mpi")]
fn run_mpi(config: &DistributedConfig, spec: &RunSpec) -> anyhow::Result<()> {
    let transport = qb_shots::transport::MpiTransport::initialize()?;
    run_with(transport, config, spec)
}

#[cfg(not(feature = "mpi"))]
fn run_mpi(_config: &DistributedConfig, _spec: &RunSpec) -> anyhow::Result<()> {
    bail!("this build has no mpi support, rebuild with `--features mpi`")
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Local {
            processes,
            workload,
            timeout_ms,
        } => {
            let spec = workload.to_spec()?;
            let summary =
                run_local_cluster(processes, &spec, Duration::from_millis(timeout_ms))?;
            print_summary(&summary)?;
        }
        Commands::Run { config, workload } => {
            let spec = workload.to_spec()?;
            let config = DistributedConfig::load(config.as_deref())
                .context("loading distributed configuration")?;
            log::info!(
                "starting process {} of {} over {:?}",
                config.process_id,
                config.total_processes,
                config.backend
            );
            match config.backend {
                Backend::Local => {
                    bail!("the local backend only runs in-process, use `qb-shots local`")
                }
                Backend::Tcp => {
                    let transport = TcpTransport::from_config(&config)
                        .context("connecting tcp transport")?;
                    run_with(transport, &config, &spec)?;
                }
                Backend::Mpi => run_mpi(&config, &spec)?,
            }
        }
        Commands::Partition { processes, shots } => {
            if processes == 0 {
                bail!("--processes must be at least 1");
            }
            let quotas: Vec<usize> = (0..processes)
                .map(|p| shots_for_mpi_process(processes, shots, p))
                .collect();
            for (process_id, quota) in quotas.iter().enumerate() {
                println!("process {:>4}: {} shots", process_id, quota);
            }
            println!("total       : {}", quotas.iter().sum::<usize>());
        }
    }

    Ok(())
}

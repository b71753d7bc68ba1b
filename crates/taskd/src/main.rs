mod receiver;
mod reporter;
mod tcp_transport;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use taskd_core::config::{self, LoggingConfig, TaskdConfig};
use taskd_core::protocol::Position;
use taskd_core::transport::Transport;
use taskd_core::types::{CONTROLLER, MANAGER_ROLE};
use taskd_manager::queue::{InboundQueue, ProcessorPool};
use taskd_manager::sender::{Dispatcher, MessageSender};
use taskd_manager::{
    Arbiter, ElasticTrainingPlugin, HotSwitchPlugin, PodReschedulingPlugin, RecoverPlugin,
    SnapshotStore,
};

use reporter::{ControllerMessage, ControllerReporter};
use tcp_transport::TcpTransport;

#[derive(Parser)]
#[command(name = "taskd", about = "Fault-recovery manager for distributed training jobs")]
struct Cli {
    /// Config file (defaults to ~/.config/taskd/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address the report receiver binds to
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Number of inbound processor workers
    #[arg(long)]
    workers: Option<usize>,

    /// Arbitration tick interval in milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,

    /// tracing filter, e.g. "taskd_manager=debug"
    #[arg(long)]
    log_filter: Option<String>,

    /// Log to stderr instead of the rolling log file
    #[arg(long)]
    stderr: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Send one report to the cluster controller and exit
    Report {
        #[arg(value_enum)]
        kind: ReportKind,

        #[arg(long, default_value = "0")]
        code: i32,

        #[arg(long, default_value = "")]
        msg: String,

        /// JSON object of rank -> fault level, e.g. '{"3":1}'
        #[arg(long, default_value = "{}")]
        fault_ranks: String,
    },
    /// Write the effective configuration to the config file
    InitConfig,
}

#[derive(Clone, Copy, ValueEnum)]
enum ReportKind {
    RecoverStatus,
    ProcessFault,
    RecoverStrategy,
    StopComplete,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(config::config_path);
    let mut config = config::load_config(&config_path);
    if let Some(listen) = cli.listen {
        config.network.listen_addr = listen;
    }
    if let Some(workers) = cli.workers {
        config.queue.processor_workers = workers;
    }
    if let Some(tick_ms) = cli.tick_ms {
        config.manager.tick_interval_ms = tick_ms;
    }
    config.validate()?;

    let _guard = init_logging(&config.logging, cli.log_filter.as_deref(), cli.stderr)?;

    match cli.command {
        Some(Command::Report {
            kind,
            code,
            msg,
            fault_ranks,
        }) => send_report(&config, kind, code, msg, &fault_ranks).await,
        Some(Command::InitConfig) => {
            config::save_config(&config, &config_path)?;
            eprintln!("[taskd] wrote {}", config_path.display());
            Ok(())
        }
        None => run(config).await,
    }
}

/// Precedence: `--log-filter`, then `RUST_LOG`, then the config file.
fn init_logging(
    logging: &LoggingConfig,
    filter_override: Option<&str>,
    stderr: bool,
) -> Result<Option<WorkerGuard>> {
    let filter = match filter_override {
        Some(filter) => EnvFilter::try_new(filter)?,
        None => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&logging.filter))?,
    };

    if stderr {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    }

    std::fs::create_dir_all(&logging.log_dir)
        .with_context(|| format!("creating log dir {}", logging.log_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(&logging.log_dir, "taskd.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

async fn run(config: TaskdConfig) -> Result<()> {
    info!(
        "Starting taskd job={} listen={} workers={} tick={}ms",
        config.manager.job_id,
        config.network.listen_addr,
        config.queue.processor_workers,
        config.manager.tick_interval_ms
    );
    eprintln!("[taskd] listening on {}", config.network.listen_addr);

    let cancel = CancellationToken::new();
    let store = Arc::new(SnapshotStore::new());

    let (sender, outbound_rx) = MessageSender::new(config.queue.outbound_capacity);
    let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(&config.network));
    if !transport.can_reach(CONTROLLER) {
        warn!("No route configured for {}; controller actions will not be delivered", CONTROLLER);
    }
    let dispatcher = Dispatcher::new(
        outbound_rx,
        transport,
        Position::new(MANAGER_ROLE, MANAGER_ROLE),
        config.queue.max_inflight_sends,
    );
    let dispatcher_handle = tokio::spawn(dispatcher.run(cancel.clone()));

    let (queue, inbound_rx) = InboundQueue::new(config.queue.inbound_capacity);
    let pool = ProcessorPool::spawn(
        config.queue.processor_workers,
        inbound_rx,
        store.clone(),
        sender.clone(),
        cancel.clone(),
    );

    let mut arbiter = Arbiter::new(store, sender);
    arbiter
        .register(Box::new(RecoverPlugin::new()))?
        .register(Box::new(HotSwitchPlugin::new()))?
        .register(Box::new(ElasticTrainingPlugin::new()))?
        .register(Box::new(
            PodReschedulingPlugin::new(
                config.manager.reset_config_path.clone(),
                config.manager.max_restart_times,
            )
            .with_stop_wait(Duration::from_millis(config.manager.stop_wait_ms)),
        ))?;
    info!("Plugins registered: {:?}", arbiter.plugin_names());
    let tick = Duration::from_millis(config.manager.tick_interval_ms);
    let arbiter_handle = tokio::spawn(arbiter.run(tick, cancel.clone()));

    let mut receiver_handle = tokio::spawn(receiver::serve(
        config.network.listen_addr,
        config.network.max_frame_bytes,
        queue,
        cancel.clone(),
    ));

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            signal.map_err(anyhow::Error::from)
        }
        served = &mut receiver_handle => {
            match served {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!("Receiver failed: {:#}", e);
                    Err(e)
                }
                Err(e) => Err(e.into()),
            }
        }
    };

    cancel.cancel();
    if !receiver_handle.is_finished() {
        let _ = receiver_handle.await;
    }
    let _ = arbiter_handle.await;
    pool.join().await;
    let _ = dispatcher_handle.await;
    info!("taskd stopped");
    outcome
}

async fn send_report(
    config: &TaskdConfig,
    kind: ReportKind,
    code: i32,
    msg: String,
    fault_ranks: &str,
) -> Result<()> {
    let fault_ranks: BTreeMap<i32, i32> =
        serde_json::from_str(fault_ranks).context("--fault-ranks must be a JSON object of ints")?;
    let message = ControllerMessage {
        code,
        msg,
        fault_ranks,
    };
    let reporter = ControllerReporter::new(
        Arc::new(TcpTransport::new(&config.network)),
        &config.manager.job_id,
    );
    let delivered = match kind {
        ReportKind::RecoverStatus => reporter.report_recover_status(message).await,
        ReportKind::ProcessFault => reporter.report_process_fault(message).await,
        ReportKind::RecoverStrategy => reporter.report_recover_strategy(message).await,
        ReportKind::StopComplete => reporter.report_stop_complete(message).await,
    };
    if !delivered {
        anyhow::bail!("controller did not accept the report");
    }
    eprintln!("[taskd] report delivered");
    Ok(())
}

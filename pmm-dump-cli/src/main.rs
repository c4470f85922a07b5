use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};
use pmm_dump_core::{ConnectionParams, LogBuffer};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing_subscriber::prelude::*;

mod client;
mod commands;

use commands::export::ExportArgs;
use commands::import::ImportArgs;
use commands::CommonOpts;

#[derive(Parser)]
#[command(name = "pmm-dump")]
#[command(about = "Export and import PMM Server monitoring data", long_about = None)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Export/import core metrics
    #[arg(long, global = true, default_value_t = true, action = ArgAction::Set,
          num_args = 0..=1, default_missing_value = "true")]
    dump_core: bool,

    /// Export/import QAN metrics
    #[arg(long, global = true)]
    dump_qan: bool,

    /// Path to the dump file
    #[arg(short = 'd', long, global = true)]
    dump_path: Option<PathBuf>,

    /// Number of transfer workers (default: one per available core)
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Use the metric store's native export format. Reduces dump size, but
    /// can be incompatible between server versions
    #[arg(long, global = true)]
    vm_native_data: bool,

    /// Enable verbose logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ConnectionArgs {
    /// PMM connection string
    #[arg(long, global = true, env = "PMM_URL")]
    pmm_url: Option<String>,

    /// PMM server host (with scheme)
    #[arg(long, global = true, env = "PMM_HOST")]
    pmm_host: Option<String>,

    /// PMM server port
    #[arg(long, global = true, env = "PMM_PORT")]
    pmm_port: Option<u16>,

    /// PMM credentials user
    #[arg(long, global = true, env = "PMM_USER")]
    pmm_user: Option<String>,

    /// PMM credentials password
    #[arg(long, global = true, env = "PMM_PASS")]
    pmm_pass: Option<String>,

    /// VictoriaMetrics connection string
    #[arg(long, global = true)]
    victoria_metrics_url: Option<String>,

    /// ClickHouse connection string
    #[arg(long, global = true)]
    click_house_url: Option<String>,

    /// Accept any certificate presented by the server
    #[arg(long, global = true)]
    allow_insecure_certs: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Export PMM Server metrics to a dump file. By default only the last
    /// 4 hours are exported; configure via --start-ts/--end-ts
    Export(ExportArgs),

    /// Import PMM Server metrics from a dump file
    Import(ImportArgs),

    /// Show metadata of the specified dump file
    ShowMeta {
        /// Print meta in a human-readable format
        #[arg(long, default_value_t = true, action = ArgAction::Set,
              num_args = 0..=1, default_missing_value = "true")]
        prettify: bool,
    },

    /// Show the tool version of the binary
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_buffer = LogBuffer::new();
    init_tracing(cli.verbose, log_buffer.clone());

    let shutdown_rx = shutdown_signal();

    let common = CommonOpts {
        connection: ConnectionParams {
            pmm_url: cli.connection.pmm_url,
            pmm_host: cli.connection.pmm_host,
            pmm_port: cli.connection.pmm_port,
            pmm_user: cli.connection.pmm_user,
            pmm_pass: cli.connection.pmm_pass,
            victoria_metrics_url: cli.connection.victoria_metrics_url,
            click_house_url: cli.connection.click_house_url,
            allow_insecure_certs: cli.connection.allow_insecure_certs,
        },
        dump_core: cli.dump_core,
        dump_qan: cli.dump_qan,
        dump_path: cli.dump_path,
        workers: cli.workers,
        vm_native_data: cli.vm_native_data,
    };

    match cli.command {
        Command::Export(args) => {
            commands::export::export(common, args, log_buffer, shutdown_rx).await
        }
        Command::Import(args) => commands::import::import(common, args, shutdown_rx).await,
        Command::ShowMeta { prettify } => commands::show_meta::show_meta(&common, prettify),
        Command::Version => {
            let version = commands::tool_version();
            println!("Version: {}, Build: {}", version.git_version, version.git_commit);
            Ok(())
        }
    }
}

/// Two layers: human-readable console output on stderr, and a debug-level
/// JSON stream captured for embedding into the archive as `log.json`.
fn init_tracing(verbose: bool, buffer: LogBuffer) {
    let console_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(tracing_subscriber::EnvFilter::new(console_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(buffer)
                .with_filter(tracing_subscriber::filter::LevelFilter::DEBUG),
        )
        .init();
}

/// Flip a shared flag when SIGINT arrives; the engine observes it at the next
/// suspension point.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Received interrupt signal");
            let _ = tx.send(true);
        }
    });
    rx
}

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mail_reply_smith::config::{AppConfig, DEFAULT_CONFIG_PATH, LoggingConfig};
use mail_reply_smith::error::PipelineError;
use mail_reply_smith::scheduler::{Scheduler, spawn_scheduler};

const EXIT_FATAL: u8 = 1;
const EXIT_CONFIG: u8 = 2;

#[derive(Parser)]
#[command(name = "mail-reply-smith", version, about = "Rule-driven mail forwarder and auto-responder")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "MAIL_REPLY_SMITH_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match AppConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {} ({})", e, cli.config.display());
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if cli.check {
        for warning in config.warnings() {
            println!("Warning: {warning}");
        }
        println!(
            "{}: OK ({} filters, folder {}, every {:?})",
            cli.config.display(),
            config.filters.len(),
            config.processor.folder,
            config.interval
        );
        return ExitCode::SUCCESS;
    }

    // Install rustls crypto provider before any TLS usage
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("Warning: a rustls crypto provider was already installed");
    }

    setup_logging(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), config = %cli.config.display(), "mail-reply-smith starting");
    info!(
        filters = config.filters.len(),
        folder = %config.processor.folder,
        interval = ?config.interval,
        "Loaded config"
    );
    for warning in config.warnings() {
        warn!("{warning}");
    }

    match run(config).await {
        Ok(code) => code,
        Err(e) => {
            error!("Fatal error: {e:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn run(config: AppConfig) -> anyhow::Result<ExitCode> {
    let scheduler = Scheduler::from_config(config).context("Failed to set up mail transports")?;

    let cancel = CancellationToken::new();
    let handle = spawn_scheduler(scheduler, cancel.clone());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            cancel.cancel();
        }
    });

    match handle.await.context("Scheduler task panicked")? {
        Ok(()) => {
            info!("Stopped");
            Ok(ExitCode::SUCCESS)
        }
        Err(e @ PipelineError::FetchEscalated { .. }) => {
            error!(error = %e, "Giving up on the mailbox");
            Ok(ExitCode::from(EXIT_FATAL))
        }
        Err(e) => Err(e.into()),
    }
}

/// Stderr logging plus an optional daily rolling file.
fn setup_logging(logging: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let file_layer = logging.directory.as_ref().and_then(|dir| match std::fs::create_dir_all(dir) {
        Ok(()) => Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(tracing_appender::rolling::daily(dir, "mail-reply-smith.log")),
        ),
        Err(e) => {
            eprintln!("Warning: cannot create log directory {}: {e}", dir.display());
            None
        }
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
}

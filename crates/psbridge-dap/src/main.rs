// ABOUTME: CLI entry point for the psbridge debug adapter binary
// ABOUTME: Loads configuration, starts the pwsh-backed session, and serves DAP on stdio or a pipe
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::Parser;
use psbridge::dispatcher::{EXIT_FAULT, EXIT_TRANSPORT};
use psbridge::{
    BridgeConfig, BridgeError, CountingFaultSink, ErrorKind, FaultSink, PwshEngine,
    SessionCoordinator, TransportChannel, TransportKind,
};
use psbridge_dap::DebugServer;
use tracing_subscriber::EnvFilter;

/// psbridge-dap: debug PowerShell scripts over the Debug Adapter Protocol
#[derive(Parser)]
#[command(name = "psbridge-dap", version, about)]
struct Cli {
    /// Serve on this named pipe or Unix socket instead of stdio
    #[arg(long)]
    pipe: Option<PathBuf>,

    /// Log filter used when `RUST_LOG` is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// TOML config file (defaults to the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the pwsh binary
    #[arg(long)]
    pwsh: Option<PathBuf>,

    /// Working directory for the engine
    #[arg(long)]
    cwd: Option<PathBuf>,
}

fn init_logging(level: &str, file: Option<&Path>) -> Result<(), BridgeError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match file {
        Some(path) => {
            let file = File::create(path).map_err(|e| {
                BridgeError::config(format!("Cannot open log file {}: {e}", path.display()))
            })?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        // Logs go to stderr to keep stdout clean for the stdio transport
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<BridgeConfig, BridgeError> {
    let mut config = BridgeConfig::default()
        .load_file(cli.config.as_deref())?
        .apply_env(|key| std::env::var(key).ok())?;
    if let Some(pipe) = &cli.pipe {
        config = config.with_transport(TransportKind::Pipe(pipe.clone()));
    }
    if let Some(pwsh) = &cli.pwsh {
        config = config.with_pwsh_path(pwsh.clone());
    }
    if let Some(cwd) = &cli.cwd {
        config = config.with_working_directory(cwd.clone());
    }
    Ok(config)
}

async fn run(cli: Cli) -> Result<i32, BridgeError> {
    let config = load_config(&cli)?;
    let engine = PwshEngine::from_config(&config)?;
    let sink = Arc::new(CountingFaultSink::default());
    let session = SessionCoordinator::start(
        Arc::new(engine),
        config.output_flush_interval,
        Arc::clone(&sink) as Arc<dyn FaultSink>,
    )?;

    tracing::info!(transport = %config.transport, "Starting psbridge debug adapter");
    let channel = TransportChannel::open(&config.transport).await?;
    let server = DebugServer::new(session.clone(), config, Arc::clone(&sink) as Arc<dyn FaultSink>);
    let clean = match server.serve(channel).await {
        Ok(clean) => clean,
        Err(e) => {
            tracing::error!(error = %e, "Debug adapter connection failed");
            false
        }
    };
    session.terminate("Debug adapter exited");
    Ok(sink.exit_code(clean))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli.log_level, cli.log_file.as_deref()) {
        eprintln!("psbridge-dap: {e}");
        return ExitCode::from(EXIT_FAULT as u8);
    }

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "psbridge-dap failed to start");
            if e.kind == ErrorKind::Transport {
                EXIT_TRANSPORT
            } else {
                EXIT_FAULT
            }
        }
    };
    ExitCode::from(code as u8)
}

// ABOUTME: CLI entry point for the psbridge language server binary
// ABOUTME: Starts the pwsh-backed session, serves LSP, and optionally hosts the debug adapter on a pipe
//
// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::Parser;
use psbridge::analysis::{Analyzer, ScriptAnalyzerProcess};
use psbridge::dispatcher::{EXIT_FAULT, EXIT_TRANSPORT};
use psbridge::symbols::{DeclarationSymbols, SymbolProvider};
use psbridge::workspace::{InMemoryWorkspace, Workspace};
use psbridge::{
    BridgeConfig, BridgeError, CountingFaultSink, ErrorKind, FaultSink, PwshEngine,
    SessionCoordinator, TransportChannel, TransportKind,
};
use psbridge_dap::DebugServer;
use psbridge_lsp::{LanguageServer, LanguageServices};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// psbridge-lsp: PowerShell language server with an optional debug adapter
#[derive(Parser)]
#[command(name = "psbridge-lsp", version, about)]
struct Cli {
    /// Serve LSP on this named pipe or Unix socket instead of stdio
    #[arg(long)]
    pipe: Option<PathBuf>,

    /// Also serve the debug adapter on this pipe, sharing the session
    #[arg(long)]
    debug_pipe: Option<PathBuf>,

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

    /// Workspace root for relative paths and workspace-wide lookups
    #[arg(long)]
    root: Option<PathBuf>,
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
    if let Some(root) = &cli.root {
        if config.working_directory.is_none() {
            config = config.with_working_directory(root.clone());
        }
    }
    Ok(config)
}

/// Accept debug connections one after another until the process exits
fn host_debug_adapter(
    pipe: PathBuf,
    session: SessionCoordinator,
    config: BridgeConfig,
    sink: Arc<dyn FaultSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let kind = TransportKind::Pipe(pipe);
        loop {
            let channel = match TransportChannel::open(&kind).await {
                Ok(channel) => channel,
                Err(e) => {
                    error!(transport = %kind, error = %e, "Debug adapter pipe unavailable");
                    break;
                }
            };
            let server = DebugServer::new(session.clone(), config.clone(), Arc::clone(&sink));
            match server.serve(channel).await {
                Ok(disconnected) => info!(disconnected, "Debug session ended"),
                Err(e) => warn!(error = %e, "Debug session failed"),
            }
            if session.terminated().is_cancelled() {
                break;
            }
        }
    })
}

async fn run(cli: Cli) -> Result<i32, BridgeError> {
    let config = load_config(&cli)?;
    let engine = PwshEngine::from_config(&config)?;
    let analyzer: Arc<dyn Analyzer> = Arc::new(ScriptAnalyzerProcess::new(
        engine.binary().to_path_buf(),
        engine.policy().clone(),
    ));
    let sink = Arc::new(CountingFaultSink::default());
    let fault_sink = Arc::clone(&sink) as Arc<dyn FaultSink>;
    let session = SessionCoordinator::start(
        Arc::new(engine),
        config.output_flush_interval,
        Arc::clone(&fault_sink),
    )?;

    let workspace: Arc<dyn Workspace> = match cli.root.clone() {
        Some(root) => Arc::new(InMemoryWorkspace::with_root(root)),
        None => Arc::new(InMemoryWorkspace::default()),
    };
    let symbols: Arc<dyn SymbolProvider> = Arc::new(DeclarationSymbols);

    let debug_adapter = cli.debug_pipe.clone().map(|pipe| {
        host_debug_adapter(
            pipe,
            session.clone(),
            config.clone(),
            Arc::clone(&fault_sink),
        )
    });

    info!(transport = %config.transport, "Starting psbridge language server");
    let channel = TransportChannel::open(&config.transport).await?;
    let server = LanguageServer::new(
        LanguageServices {
            session: session.clone(),
            workspace,
            analyzer,
            symbols,
            config,
        },
        fault_sink,
    );
    let clean = match server.serve(channel).await {
        Ok(clean) => clean,
        Err(e) => {
            error!(error = %e, "Language server connection failed");
            false
        }
    };

    session.terminate("Language server exited");
    if let Some(task) = debug_adapter {
        task.abort();
    }
    Ok(sink.exit_code(clean))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli.log_level, cli.log_file.as_deref()) {
        eprintln!("psbridge-lsp: {e}");
        return ExitCode::from(EXIT_FAULT as u8);
    }

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "psbridge-lsp failed to start");
            if e.kind == ErrorKind::Transport {
                EXIT_TRANSPORT
            } else {
                EXIT_FAULT
            }
        }
    };
    ExitCode::from(code as u8)
}

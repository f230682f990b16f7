//! Flowscript
//!
//! Runs a flow of script nodes over JSON lines read from stdin.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use flowscript::check::check_flow;
use flowscript::{FlowLoader, FlowRunner, FlowWatcher, FsModuleResolver, HostConfig, Input};

/// Flowscript pipeline runner
#[derive(Parser, Debug)]
#[command(name = "flowscript")]
#[command(about = "Run pipelines of TypeScript nodes", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a flow, reading JSON messages from stdin
    Run {
        /// Path to the flow file (.toml or .json)
        #[arg(short, long)]
        flow: PathBuf,

        /// Path to the config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Reload the flow when its file changes
        #[arg(long)]
        watch: bool,

        /// How long to keep running after stdin closes, in milliseconds
        #[arg(long, default_value = "200")]
        linger_ms: u64,
    },
    /// Compile every script in a flow and report problems
    Check {
        /// Path to the flow file (.toml or .json)
        #[arg(short, long)]
        flow: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries flow output; logs go to stderr
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flowscript=info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    match args.command {
        Command::Run {
            flow,
            config,
            watch,
            linger_ms,
        } => run(flow, config, watch, Duration::from_millis(linger_ms)).await,
        Command::Check { flow } => check(flow).await,
    }
}

async fn run(flow_path: PathBuf, config_path: Option<PathBuf>, watch: bool, linger: Duration) -> Result<()> {
    info!("Starting flowscript v{}", env!("CARGO_PKG_VERSION"));

    let config = HostConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
    let flow = FlowLoader::load(&flow_path)
        .await
        .with_context(|| format!("Failed to load flow from {}", flow_path.display()))?;

    let resolver = Arc::new(FsModuleResolver::new(
        config.modules_dir_for(&flow_path),
        &config.module_allowlist,
    ));
    let (runner, deliveries) = FlowRunner::start(&flow, &config, resolver).await;

    let (emitted_tx, mut emitted_rx) = mpsc::unbounded_channel();
    tokio::spawn(runner.clone().pump(deliveries, emitted_tx));

    let printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(record) = emitted_rx.recv().await {
            match serde_json::to_string(&record) {
                Ok(line) => {
                    let _ = stdout.write_all(line.as_bytes()).await;
                    let _ = stdout.write_all(b"\n").await;
                    let _ = stdout.flush().await;
                }
                Err(e) => warn!("Failed to encode output of {}: {}", record.node, e),
            }
        }
    });

    if watch {
        match FlowWatcher::new(&flow_path) {
            Ok(watcher) => {
                tokio::spawn(watcher.run(runner.clone()));
            }
            Err(e) => error!("Failed to start flow watcher: {}", e),
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => match Input::parse(&line) {
                    Ok(input) => {
                        if let Err(e) = runner.inject(input.node.as_deref(), input.msg).await {
                            warn!("{}", e);
                        }
                    }
                    Err(e) => warn!("{}", e),
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                runner.shutdown().await;
                printer.abort();
                return Ok(());
            }
        }
    }

    if watch {
        info!("Input closed; running until interrupted");
        let _ = tokio::signal::ctrl_c().await;
    } else {
        tokio::time::sleep(linger).await;
    }

    runner.shutdown().await;
    printer.abort();
    info!("Flow stopped");
    Ok(())
}

async fn check(flow_path: PathBuf) -> Result<()> {
    let flow = FlowLoader::load(&flow_path)
        .await
        .with_context(|| format!("Failed to load flow from {}", flow_path.display()))?;

    let mut failed = 0;
    for report in check_flow(&flow) {
        for diagnostic in &report.diagnostics {
            println!("{}: warning: {}", report.node, diagnostic);
        }
        for err in &report.errors {
            println!("{}: error: {}", report.node, err);
        }
        if report.is_ok() {
            println!("{}: ok", report.node);
        } else {
            failed += 1;
        }
    }

    if failed > 0 {
        error!("{} of {} nodes failed to compile", failed, flow.nodes.len());
        std::process::exit(1);
    }
    Ok(())
}

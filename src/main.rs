use std::{
    io::{self, Read},
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
};

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use orrery_kernel::{
    kernel,
    transport::{process::LocalProcess, zmq::RemoteKernel},
    Connector, ExecutionHandle, ExecutionStatus, KernelSession, Output, QueuePolicy,
    SessionConfig,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum InterruptPolicy {
    Drain,
    Clear,
}

impl From<InterruptPolicy> for QueuePolicy {
    fn from(policy: InterruptPolicy) -> Self {
        match policy {
            InterruptPolicy::Drain => QueuePolicy::Drain,
            InterruptPolicy::Clear => QueuePolicy::Clear,
        }
    }
}

/// Runs code cells on a Jupyter kernel and prints what they produce.
#[derive(Debug, Parser)]
#[command(name = "orrery", version)]
struct Cli {
    /// Attach to a running kernel through its connection file.
    #[arg(long, conflicts_with = "kernel")]
    connection_file: Option<PathBuf>,

    /// Session settings in TOML.
    #[arg(long)]
    config: Option<PathBuf>,

    /// A cell to run; repeat for several. Reads one cell from stdin when absent.
    #[arg(short, long)]
    code: Vec<String>,

    /// What Ctrl-C does to cells still waiting to run.
    #[arg(long, value_enum)]
    interrupt_policy: Option<InterruptPolicy>,

    /// Kernel command line; `{connection_file}` is replaced by the file path.
    #[arg(last = true)]
    kernel: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("orrery=info,orrery_kernel=info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(policy) = cli.interrupt_policy {
        config.interrupt_policy = policy.into();
    }

    let connector: Arc<dyn Connector> = match (&cli.connection_file, cli.kernel.is_empty()) {
        (Some(path), _) => Arc::new(
            RemoteKernel::from_file(path, &config)
                .with_context(|| format!("reading {}", path.display()))?,
        ),
        (None, false) => Arc::new(LocalProcess::new(cli.kernel.clone(), &config)),
        (None, true) => bail!("pass --connection-file or a kernel command line after `--`"),
    };

    let cells = if cli.code.is_empty() {
        let mut source = String::new();
        io::stdin().read_to_string(&mut source)?;
        vec![source]
    } else {
        cli.code
    };

    let policy = config.interrupt_policy;
    let session = kernel::launch(connector, config)
        .await
        .context("starting kernel")?;
    info!(session_id = session.session_id(), "kernel ready");

    let mut handles = Vec::with_capacity(cells.len());
    for cell in cells {
        handles.push(session.execute(cell).await?);
    }

    let mut failed = false;
    for handle in &handles {
        let status = wait_interruptibly(&session, handle, policy).await;
        print_cell(handle);
        failed |= status != ExecutionStatus::Ok;
    }

    if let Err(error) = session.shutdown().await {
        warn!(%error, "kernel did not shut down cleanly");
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn wait_interruptibly(
    session: &KernelSession,
    handle: &ExecutionHandle,
    policy: QueuePolicy,
) -> ExecutionStatus {
    loop {
        tokio::select! {
            snapshot = handle.wait() => return snapshot.status,
            signal = tokio::signal::ctrl_c() => {
                if let Err(error) = signal {
                    warn!(%error, "cannot listen for Ctrl-C");
                    return handle.wait().await.status;
                }
                info!(seq = handle.seq(), ?policy, "interrupting");
                if let Err(error) = session.interrupt(policy).await {
                    warn!(%error, "interrupt failed");
                }
            }
        }
    }
}

fn print_cell(handle: &ExecutionHandle) {
    let snapshot = handle.snapshot();
    let count = snapshot
        .result
        .execution_count
        .map_or_else(|| " ".to_string(), |count| count.to_string());

    for output in snapshot.result.rendered() {
        match &output {
            Output::Stream { .. } | Output::DisplayData { .. } => {
                if let Some(text) = output.plain_text() {
                    print!("{text}");
                    if !text.ends_with('\n') {
                        println!();
                    }
                }
            }
            Output::ExecuteResult { .. } => {
                if let Some(text) = output.plain_text() {
                    println!("Out[{count}]: {text}");
                }
            }
            Output::Error(error) => {
                for line in &error.traceback {
                    eprintln!("{line}");
                }
                eprintln!("{}: {}", error.ename, error.evalue);
            }
        }
    }

    if snapshot.status == ExecutionStatus::Aborted {
        eprintln!("[cell {} aborted]", snapshot.seq);
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::{debug, info};

use shepherd_core::app::{
    App, ShepherdBuilder, WorkerOptions, install_signal_handlers, shell_quote, shutdown_channel,
};
use shepherd_core::config::ShepherdConfig;
use shepherd_core::domain::{ReceivedMessage, TaskOptions};
use shepherd_core::impls::SpoolQueueClient;
use shepherd_core::ports::MessageProcessor;
use shepherd_core::telemetry;

const DEMO_CHUNK_SIZE: usize = 10;

#[derive(Parser, Debug)]
#[command(name = "shepherd", about = "Queue worker orchestration")]
struct Cli {
    /// TOML config; built-in defaults when omitted
    #[arg(long, global = true, env = "SHEPHERD_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the worker loop until its time budget, a shutdown signal or empty queues
    Worker {
        #[arg(long)]
        stop_when_empty: bool,

        /// Command each subprocess runs, the queue name is appended to it
        #[arg(long)]
        task_command: Option<String>,
    },
    /// Process one batch from a queue
    Task {
        queue: String,

        #[arg(long)]
        no_ack: bool,

        #[arg(long, env = "APPLICATION_STORE")]
        store: Option<String>,
    },
    /// Print one metrics snapshot as JSON
    Scan,
    /// Enqueue one message on the spool
    Publish {
        queue: String,
        body: String,

        #[arg(long, env = "APPLICATION_STORE")]
        store: Option<String>,
    },
}

/// Demo processor: acknowledges everything it receives.
struct AcknowledgeAll;

#[async_trait]
impl MessageProcessor for AcknowledgeAll {
    async fn process_messages(&self, messages: Vec<ReceivedMessage>) -> Vec<ReceivedMessage> {
        messages
            .into_iter()
            .map(|message| {
                debug!(queue = %message.queue_name, body = %message.body, "acknowledging");
                message.acknowledged()
            })
            .collect()
    }

    fn chunk_size(&self) -> usize {
        DEMO_CHUNK_SIZE
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ShepherdConfig> {
    match path {
        Some(path) => ShepherdConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(ShepherdConfig::default()),
    }
}

fn build_app(config: ShepherdConfig, store: Option<String>) -> Result<App> {
    let spool = Arc::new(
        SpoolQueueClient::new(config.spool.root.clone())
            .with_store(store)
            .with_visibility_timeout(config.spool.visibility_timeout()),
    );
    let queues = config.queues.names.clone();

    let mut builder = ShepherdBuilder::new(config)
        .expect_queues()
        .queue_client(spool.clone())
        .metrics_reader(spool);
    for queue in queues {
        builder = builder
            .register(&queue, Arc::new(AcknowledgeAll))
            .with_context(|| format!("registering processor for {queue}"))?;
    }
    builder.build().context("building shepherd")
}

/// `<this binary> task [--config <path>]`; the worker appends the queue name.
fn default_task_command(config: Option<&PathBuf>) -> Result<String> {
    let exe = std::env::current_exe().context("resolving current executable")?;
    Ok(render_task_command(&exe, config))
}

fn render_task_command(exe: &Path, config: Option<&PathBuf>) -> String {
    let mut command = format!("{} task", shell_quote(&exe.to_string_lossy()));
    if let Some(path) = config {
        command.push_str(&format!(" --config {}", shell_quote(&path.to_string_lossy())));
    }
    command
}

async fn run_worker(cli: &Cli, stop_when_empty: bool, task_command: Option<String>) -> Result<()> {
    let config = load_config(cli.config.as_ref())?;
    let signals = config.worker.graceful_shutdown_signals.clone();
    let app = build_app(config, None)?;

    let command = match task_command {
        Some(command) => command,
        None => default_task_command(cli.config.as_ref())?,
    };

    let (trigger, signal) = shutdown_channel();
    let _listeners = install_signal_handlers(&signals, trigger).context("installing signal handlers")?;

    info!(command = %command, stop_when_empty, "starting worker");
    let report = app
        .worker(signal)
        .start(&command, WorkerOptions { stop_when_empty })
        .await
        .context("worker run failed")?;
    info!(termination = ?report.termination, success_rate = report.success_rate, "worker finished");
    Ok(())
}

async fn run_task(cli: &Cli, queue: &str, no_ack: bool, store: Option<String>) -> Result<()> {
    let config = load_config(cli.config.as_ref())?;
    let app = build_app(config, store)?;
    let result = app
        .task_manager()?
        .run(queue, TaskOptions { no_ack })
        .await
        .with_context(|| format!("task for queue {queue} failed"))?;

    // an empty queue is not a failure
    info!(successful = result.is_successful, "{}", result.message);
    Ok(())
}

async fn run_scan(cli: &Cli) -> Result<()> {
    let config = load_config(cli.config.as_ref())?;
    let app = build_app(config, None)?;
    let metrics = app.scan().await;
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}

async fn run_publish(cli: &Cli, queue: &str, body: &str, store: Option<String>) -> Result<()> {
    let config = load_config(cli.config.as_ref())?;
    let spool = SpoolQueueClient::new(config.spool.root).with_store(store);
    let tag = spool
        .publish(queue, body)
        .await
        .with_context(|| format!("publishing to {queue}"))?;
    println!("{tag}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing("info");
    let cli = Cli::parse();

    match &cli.command {
        Command::Worker {
            stop_when_empty,
            task_command,
        } => run_worker(&cli, *stop_when_empty, task_command.clone()).await,
        Command::Task { queue, no_ack, store } => run_task(&cli, queue, *no_ack, store.clone()).await,
        Command::Scan => run_scan(&cli).await,
        Command::Publish { queue, body, store } => run_publish(&cli, queue, body, store.clone()).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_command_quotes_paths_with_spaces() {
        let config = PathBuf::from("/etc/my configs/shepherd.toml");
        assert_eq!(
            render_task_command(Path::new("/opt/shepherd/bin/shepherd"), Some(&config)),
            "/opt/shepherd/bin/shepherd task --config '/etc/my configs/shepherd.toml'"
        );
        assert_eq!(
            render_task_command(Path::new("/opt/my apps/shepherd"), None),
            "'/opt/my apps/shepherd' task"
        );
    }
}

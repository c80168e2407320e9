//! `ddsb`: page messages out of a DDS archive and tail worker event ports.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ddsbridge_core::config::{LogFormat, resolve_config_path};
use ddsbridge_core::error::format_error_with_remediation;
use ddsbridge_core::logging::init_logging;
use ddsbridge_core::model::{AppEvent, WorkerStatus};
use ddsbridge_core::sources::StaticWorkerRegistry;
use ddsbridge_core::{AppId, Config, Gateway, SearchCriteria, SessionKey};
use serde::Serialize;

/// Session key used for everything one CLI invocation does.
const CLI_SESSION: &str = "ddsb-cli";

#[derive(Parser, Debug)]
#[command(name = "ddsb", version, about = "DDS archive retrieval and worker event client")]
struct Cli {
    /// Config file (default: $DDSBRIDGE_CONFIG, then the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format override (pretty, json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Retrieve messages and print them as JSON lines
    Fetch {
        /// Start of the window, e.g. "now - 1 hour"
        #[arg(long, default_value = "now - 1 hour")]
        since: String,

        /// End of the window; open-ended when omitted
        #[arg(long)]
        until: Option<String>,

        /// Archive source name (default: gateway.default_source)
        #[arg(long)]
        source: Option<String>,

        /// Platform/transport id (repeatable)
        #[arg(long = "platform")]
        platforms: Vec<String>,

        /// Network list name (repeatable)
        #[arg(long = "netlist")]
        netlists: Vec<String>,

        /// GOES channel (repeatable)
        #[arg(long = "channel")]
        channels: Vec<u32>,

        /// Stop after this many blocks
        #[arg(long)]
        max_blocks: Option<usize>,
    },

    /// Most recent message for one platform/transport id
    Message {
        id: String,
    },

    /// One-shot archive status
    Status {
        #[arg(long)]
        source: Option<String>,
    },

    /// Poll a worker's event port
    Events {
        #[arg(long)]
        app_id: AppId,

        #[arg(long, default_value = "localhost")]
        host: String,

        #[arg(long)]
        port: u16,

        /// Pid the worker is running under
        #[arg(long)]
        pid: u32,

        #[arg(long)]
        name: Option<String>,

        /// Keep polling until interrupted
        #[arg(long)]
        follow: bool,

        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },

    /// Print the effective configuration (passwords redacted)
    Config,
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match resolve_config_path(cli.config.as_deref()) {
        Some(path) => Config::load(&path).map_err(ddsbridge_core::Error::from)?,
        None => Config::default(),
    };
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value).context("serialize output")?);
    Ok(())
}

async fn fetch(gateway: &Gateway, criteria: SearchCriteria, max_blocks: Option<usize>) -> anyhow::Result<()> {
    let session = SessionKey::from(CLI_SESSION);
    gateway.submit_search_criteria(&session, criteria).await;

    let mut blocks = 0usize;
    let mut messages = 0usize;
    let outcome = loop {
        if max_blocks.is_some_and(|max| blocks >= max) {
            break Ok(());
        }
        let block = match gateway.pull_next_message_block(&session).await {
            Ok(block) => block,
            Err(err) => break Err(err),
        };
        blocks += 1;
        messages += block.messages.len();
        for message in &block.messages {
            print_json(message)?;
        }
        if !block.more_to_follow {
            break Ok(());
        }
    };
    gateway.end_session(&session).await;
    tracing::info!(blocks, messages, "Fetch finished");
    outcome.map_err(|e| ddsbridge_core::Error::from(e).into())
}

#[allow(clippy::too_many_arguments)]
async fn events(
    config: &Config,
    app_id: AppId,
    host: String,
    port: u16,
    pid: u32,
    name: Option<String>,
    follow: bool,
    interval: Duration,
) -> anyhow::Result<()> {
    let registry = Arc::new(StaticWorkerRegistry::new());
    let gateway = Gateway::from_config(config, Arc::clone(&registry) as _);
    let session = SessionKey::from(CLI_SESSION);
    let app_name = name.unwrap_or_else(|| format!("app-{app_id}"));

    let outcome = loop {
        // The CLI stands in for the registry: the worker is live as long as we poll it.
        registry.upsert(WorkerStatus {
            app_id,
            app_name: app_name.clone(),
            hostname: Some(host.clone()),
            pid: Some(pid),
            event_port: Some(port),
            heartbeat: Some(chrono::Utc::now()),
        });
        let batch: Vec<AppEvent> = match gateway.get_worker_events(&session, app_id).await {
            Ok(batch) => batch,
            Err(err) => break Err(err),
        };
        for event in &batch {
            print_json(event)?;
        }
        if !follow {
            break Ok(());
        }
        tokio::time::sleep(interval).await;
    };
    gateway.end_session(&session).await;
    outcome.map_err(|e| ddsbridge_core::Error::from(e).into())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    init_logging(&config.logging).map_err(ddsbridge_core::Error::from)?;

    match cli.command {
        Commands::Config => {
            let rendered = config.to_redacted_toml().map_err(ddsbridge_core::Error::from)?;
            print!("{rendered}");
            Ok(())
        }
        Commands::Fetch {
            since,
            until,
            source,
            platforms,
            netlists,
            channels,
            max_blocks,
        } => {
            let mut config = config;
            if source.is_some() {
                config.gateway.default_source = source;
            }
            let criteria = SearchCriteria {
                since: Some(since),
                until,
                platform_ids: platforms,
                netlist_names: netlists,
                goes_channels: channels,
                ..SearchCriteria::default()
            };
            fetch(&Gateway::from_config(&config, Arc::new(StaticWorkerRegistry::new())), criteria, max_blocks).await
        }
        Commands::Message { id } => {
            let gateway = Gateway::from_config(&config, Arc::new(StaticWorkerRegistry::new()));
            let session = SessionKey::from(CLI_SESSION);
            let result = gateway.get_single_message(&session, &id).await;
            gateway.end_session(&session).await;
            let message = result.map_err(ddsbridge_core::Error::from)?;
            print_json(&message)
        }
        Commands::Status { source } => {
            let gateway = Gateway::from_config(&config, Arc::new(StaticWorkerRegistry::new()));
            let status = gateway
                .get_archive_status(source.as_deref())
                .await
                .map_err(ddsbridge_core::Error::from)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Commands::Events {
            app_id,
            host,
            port,
            pid,
            name,
            follow,
            interval_ms,
        } => {
            events(
                &config,
                app_id,
                host,
                port,
                pid,
                name,
                follow,
                Duration::from_millis(interval_ms.max(1)),
            )
            .await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<ddsbridge_core::Error>() {
                Some(core) => eprintln!("{}", format_error_with_remediation(core)),
                None => eprintln!("Error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

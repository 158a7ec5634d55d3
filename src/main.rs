//! Personabot CLI entry point.

use personabot::config::{Config, FrontEnd};
use personabot::db::Db;
use personabot::ledger::Ledger;
use personabot::pipeline::Orchestrator;
use personabot::platform::{PublisherDyn, TelegramPublisher, TwitterClient};
use personabot::prompts::PromptEngine;
use personabot::provider::{Providers, http_client};
use personabot::trigger::{ChatListener, MentionWatcher, ProactiveScanner};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "personabot")]
#[command(about = "A virtual persona answering chat and social triggers with voice and video")]
struct Cli {
    /// Path to config file (optional)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Write logs to a daily rolling file in this directory instead of stderr
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Answer mentions in allowlisted Telegram groups
    Chat,
    /// Watch X for mentions of the persona and reply with video
    Watch,
    /// Scan a roster of X accounts and answer relevant posts unprompted
    Scan,
}

impl Command {
    fn front_end(self) -> FrontEnd {
        match self {
            Command::Chat => FrontEnd::Chat,
            Command::Watch => FrontEnd::Mentions,
            Command::Scan => FrontEnd::Proactive,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("failed to load config from {}", path.display()),
        None => "failed to load configuration from environment".to_string(),
    })?;

    let logging = personabot::logging::init(cli.debug, cli.log_dir.as_deref(), &config.telemetry)
        .context("failed to initialize logging")?;

    let result = run(cli.command, config).await;
    if let Err(error) = &result {
        tracing::error!(%error, "personabot exited with an error");
    }
    logging.shutdown();
    result
}

async fn run(command: Command, config: Config) -> anyhow::Result<()> {
    config
        .validate_for(command.front_end())
        .context("configuration is incomplete for this front-end")?;
    tracing::info!(data_dir = %config.data_dir.display(), "configuration loaded");

    let db = Db::connect(&config.ledger_path())
        .await
        .context("failed to open the ledger database")?;
    let ledger = Ledger::new(db.sqlite.clone());
    let prompts = Arc::new(PromptEngine::new()?);
    let providers = Providers::from_config(&config, prompts.clone())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut front_end = match command {
        Command::Chat => {
            let publisher = TelegramPublisher::from_config(&config.telegram)?;
            let bot = publisher.bot().clone();
            let publisher: Arc<dyn PublisherDyn> = Arc::new(publisher);
            publisher
                .health_check()
                .await
                .context("telegram bot token was rejected")?;
            let orchestrator = Arc::new(Orchestrator::new(
                &config, providers, ledger, publisher, prompts,
            )?);
            let listener = Arc::new(ChatListener::new(orchestrator, &config));
            tokio::spawn(listener.run(bot, shutdown_rx))
        }
        Command::Watch | Command::Scan => {
            let http = http_client(Duration::from_secs(config.llm.timeout_secs))?;
            let twitter = Arc::new(TwitterClient::new(http, &config.twitter)?);
            let orchestrator = Arc::new(Orchestrator::new(
                &config,
                providers,
                ledger,
                twitter.clone(),
                prompts,
            )?);
            if let Command::Watch = command {
                let watcher = MentionWatcher::new(twitter, orchestrator, &config)?;
                tokio::spawn(watcher.run(shutdown_rx))
            } else {
                let scanner = ProactiveScanner::new(twitter, orchestrator, &config);
                tokio::spawn(scanner.run(shutdown_rx))
            }
        }
    };

    tracing::info!(front_end = ?command.front_end(), "personabot started");

    tokio::select! {
        result = &mut front_end => {
            if let Err(error) = result {
                tracing::error!(%error, "front-end task ended unexpectedly");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received, waiting for the current cycle");
            shutdown_tx.send(true).ok();
            if let Err(error) = front_end.await {
                tracing::error!(%error, "front-end task failed during shutdown");
            }
        }
    }

    db.close().await;
    tracing::info!("personabot stopped");
    Ok(())
}

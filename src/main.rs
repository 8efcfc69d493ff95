#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::uninlined_format_args)]

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use groupcast::config::Config;
use groupcast::dispatch::CycleRunner;
use groupcast::scheduler::{Scheduler, MIN_TICK_SECS};
use groupcast::store::{BotConfig, BotConfigSpec, ConfigStore};
use groupcast::telegram::{TelegramTransport, Transport};

/// Scheduled Telegram group broadcaster
#[derive(Parser, Debug)]
#[command(name = "groupcast", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replace the bot configuration from a TOML file
    Apply {
        /// Path to the configuration file (token, interval, destinations, collections)
        file: PathBuf,
    },
    /// Mark the configuration active and run the dispatch scheduler until Ctrl-C
    Run,
    /// Run exactly one dispatch cycle now and exit
    Cycle,
    /// Show the stored configuration and per-destination send state
    Status,
    /// Discover group chats visible to the configured bot token
    Chats,
    /// Validate the configured bot token against the Telegram API
    Check,
    /// Mark the stored configuration active without starting a scheduler
    Activate,
    /// Mark the stored configuration inactive
    Deactivate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");

    let config = Config::load_or_init()?;
    let store = Arc::new(ConfigStore::new(config.store_db_path()));

    match cli.command {
        Commands::Apply { file } => {
            let contents = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let spec: BotConfigSpec = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", file.display()))?;
            let applied = store.replace_config(&spec)?;
            println!("✅ Applied configuration {}", applied.id);
            println!("  Interval    : every {} min", applied.interval_minutes);
            println!("  Send mode   : {}", applied.send_mode.as_str());
            println!("  Destinations: {}", applied.destinations.len());
            println!("  Collections : {}", applied.collections.len());
            println!("\nRun `groupcast run` to start dispatching.");
            Ok(())
        }
        Commands::Run => {
            let bot = require_config(&store)?;
            let runner = build_runner(&config, &store);
            info!(
                destinations = bot.destinations.len(),
                interval_minutes = bot.interval_minutes,
                "starting dispatcher"
            );

            store.set_active(true)?;
            let scheduler = Scheduler::new();
            let tick = config.scheduler.tick_secs.max(MIN_TICK_SECS);
            scheduler.start(runner, Duration::from_secs(tick));

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            info!("shutting down");

            scheduler.stop();
            store.set_active(false)?;
            Ok(())
        }
        Commands::Cycle => {
            require_config(&store)?;
            let runner = build_runner(&config, &store);
            let report = runner.run_one_cycle(Utc::now()).await?;
            println!(
                "Cycle finished: {} dispatched, {} skipped, {} failed",
                report.dispatched, report.skipped, report.failed
            );
            Ok(())
        }
        Commands::Status => {
            let Some(bot) = store.current_config()? else {
                println!("No bot configuration yet. Run `groupcast apply <file>` first.");
                return Ok(());
            };
            println!("Configuration {}", bot.id);
            println!("  Active    : {}", if bot.active { "yes" } else { "no" });
            println!("  Interval  : every {} min", bot.interval_minutes);
            println!("  Send mode : {}", bot.send_mode.as_str());
            println!("  Created   : {}", bot.created_at.to_rfc3339());
            println!("  Collections ({}):", bot.collections.len());
            for collection in &bot.collections {
                println!(
                    "    - {} ({} messages, order {})",
                    collection.name,
                    collection.messages.len(),
                    collection.sort_order
                );
            }
            println!("  Destinations ({}):", bot.destinations.len());
            for dest in &bot.destinations {
                let last = dest
                    .last_sent_at
                    .map_or_else(|| "never".into(), |d| d.to_rfc3339());
                println!("    - {} ({}) last sent: {}", dest.name, dest.chat_id, last);
            }
            Ok(())
        }
        Commands::Chats => {
            let bot = require_config(&store)?;
            let transport = TelegramTransport::new();
            let chats = transport.list_chats(&bot.token).await?;
            if chats.is_empty() {
                println!("No group chats visible. Add the bot to a group and send a message there first.");
                return Ok(());
            }
            println!("Group chats visible to the bot:");
            for chat in chats {
                println!("  {} — {}", chat.chat_id, chat.name);
            }
            Ok(())
        }
        Commands::Check => {
            let bot = require_config(&store)?;
            let transport = TelegramTransport::new();
            if transport.test_connection(&bot.token).await {
                println!("✅ Token is valid");
                Ok(())
            } else {
                bail!("Token check failed — Telegram did not accept the credential");
            }
        }
        Commands::Activate => {
            if !store.set_active(true)? {
                bail!("No bot configuration to activate. Run `groupcast apply <file>` first.");
            }
            println!("✅ Configuration activated");
            Ok(())
        }
        Commands::Deactivate => {
            if !store.set_active(false)? {
                bail!("No bot configuration to deactivate.");
            }
            println!("✅ Configuration deactivated");
            Ok(())
        }
    }
}

fn require_config(store: &Arc<ConfigStore>) -> Result<BotConfig> {
    store
        .current_config()?
        .context("No bot configuration yet. Run `groupcast apply <file>` first.")
}

fn build_runner(config: &Config, store: &Arc<ConfigStore>) -> Arc<CycleRunner> {
    let transport = Arc::new(TelegramTransport::new());
    Arc::new(CycleRunner::new(
        store.clone(),
        transport,
        Duration::from_millis(config.dispatch.inter_message_delay_ms),
    ))
}

//! Weekly Basket Automation Engine
//!
//! Trades a weekly basket of instruments when independent positioning models
//! agree, sizes legs against account equity and margin, locks in profit with
//! a trailing stop, and reconciles intended legs against the broker.

mod api;
mod bot;
mod db;
mod models;
mod trading;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, info_span, Instrument, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::bot::{AccountServices, Scheduler};
use crate::db::{Database, StateStore};
use crate::trading::{AccountConfig, EngineConfig, ReconcileOptions, SizingRegime, DEFAULT_REPORT_LIMIT};

/// Weekly basket trading bot CLI.
#[derive(Parser)]
#[command(name = "basketbot")]
#[command(about = "Trade aligned weekly baskets with a trailing profit lock", long_about = None)]
struct Cli {
    /// SQLite database URL
    #[arg(
        short,
        long,
        env = "DATABASE_URL",
        default_value = "sqlite:./basketbot.db?mode=rwc"
    )]
    database_url: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until Ctrl+C
    Run {
        /// Accounts to run (defaults to BOT_ACCOUNTS)
        #[arg(short, long)]
        account: Vec<String>,
    },

    /// Run exactly one tick for an account
    Tick {
        #[arg(short, long)]
        account: String,
    },

    /// Compare intended legs against open broker positions
    Reconcile {
        #[arg(short, long)]
        account: String,

        /// Maximum entries listed per diff section
        #[arg(long, default_value_t = DEFAULT_REPORT_LIMIT)]
        limit: usize,

        /// Also list positions without a recognised tag as extra
        #[arg(long)]
        include_unmanaged: bool,
    },

    /// Show persisted state and recent events for an account
    State {
        #[arg(short, long)]
        account: String,

        /// Number of events to show
        #[arg(long, default_value = "10")]
        events: i64,
    },

    /// Clear persisted state for an account
    Reset {
        #[arg(short, long)]
        account: String,
    },

    /// Show effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(log_level.into()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let engine = EngineConfig::from_env(&cli.database_url)?;

    match cli.command {
        Commands::Run { account } => {
            let accounts = if account.is_empty() {
                AccountConfig::configured()?
            } else {
                account
                    .iter()
                    .map(|id| AccountConfig::preset(id))
                    .collect::<Result<Vec<_>>>()?
            };

            let db = Arc::new(Database::new(&engine.database_url).await?);
            let mut scheduler = Scheduler::new(engine.tick_interval());

            println!("\n=== Weekly Basket Bot ===");
            println!("Tick interval: {}s", engine.tick_seconds);
            for config in accounts {
                println!(
                    "  {:<24} {}",
                    config.bot_id,
                    if config.trading_enabled { "LIVE TRADING" } else { "DRY RUN" }
                );
                let services = AccountServices::connect(&engine, config, db.clone())?;
                scheduler.add(services.machine(db.clone()), engine.tick_timeout());
            }
            println!("\nPress Ctrl+C to stop.\n");

            scheduler.run().await?;
        }

        Commands::Tick { account } => {
            let config = AccountConfig::preset(&account)?;
            let db = Arc::new(Database::new(&engine.database_url).await?);
            let services = AccountServices::connect(&engine, config, db.clone())?;
            let machine = services.machine(db.clone());

            let outcome = machine
                .tick()
                .instrument(info_span!("tick", bot_id = %account))
                .await?;
            info!(%outcome, "Tick complete");

            println!("\nOutcome: {}", outcome);
            match db.read_state(&account).await? {
                Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                None => println!("No state persisted."),
            }
        }

        Commands::Reconcile {
            account,
            limit,
            include_unmanaged,
        } => {
            let config = AccountConfig::preset(&account)?;
            let db = Arc::new(Database::new(&engine.database_url).await?);
            let services = AccountServices::connect(&engine, config, db)?;
            let options = ReconcileOptions {
                limit,
                include_unmanaged,
            };

            match services.reconciler().reconcile(options).await {
                Ok(report) => println!("{}", serde_json::to_string_pretty(&report)?),
                Err(e) => {
                    let failure = serde_json::json!({ "ok": false, "error": e.to_string() });
                    println!("{}", serde_json::to_string_pretty(&failure)?);
                    return Err(e).context("Reconcile failed");
                }
            }
        }

        Commands::State { account, events } => {
            let db = Database::new(&engine.database_url).await?;

            match db.read_state(&account).await? {
                Some(state) => {
                    println!("\n=== State: {} ===", account);
                    println!("{}", serde_json::to_string_pretty(&state)?);
                }
                None => {
                    println!("No state for {}. Run 'basketbot tick --account {}' first.", account, account);
                }
            }

            let recent = db.recent_events(&account, events).await?;
            if !recent.is_empty() {
                println!("\n{:<20} {:<12} {}", "TIME", "EVENT", "DETAIL");
                println!("{}", "-".repeat(72));
                for event in recent {
                    println!("{:<20} {:<12} {}", event.created_at, event.kind, event.detail);
                }
            }
        }

        Commands::Reset { account } => {
            let db = Database::new(&engine.database_url).await?;
            db.clear_state(&account).await?;
            db.record_event(&account, "reset", "operator reset").await?;
            info!(bot_id = %account, "State cleared");
            println!("Cleared state for {}", account);
        }

        Commands::Config => {
            println!("\n=== Engine Configuration ===\n");
            println!("  Tick Interval:        {}s", engine.tick_seconds);
            println!("  Tick Timeout:         {}s", engine.tick_timeout().as_secs());
            println!("  Request Timeout:      {}s", engine.request_timeout_secs);
            println!(
                "  Signal Feed:          {}",
                if engine.app_base_url.is_empty() { "(not set)" } else { engine.app_base_url.as_str() }
            );
            println!("  Database:             {}", engine.database_url);
            println!("  Paper Balance:        {:.2}", engine.paper_balance);
            println!(
                "  Market File:          {}",
                engine.market_file.as_deref().unwrap_or("(not set)")
            );

            for config in AccountConfig::configured()? {
                print_account(&config);
            }
        }
    }

    Ok(())
}

fn print_account(config: &AccountConfig) {
    println!("\n=== Account: {} ===\n", config.bot_id);
    println!("  Trading Enabled:      {}", config.trading_enabled);
    println!("  Tag Prefix:           {}", config.tag_prefix);

    println!("\nBasket:");
    let symbols = if config.basket.symbols.is_empty() {
        "(every signalled symbol)".to_string()
    } else {
        config.basket.symbols.join(", ")
    };
    let models: Vec<&str> = config.basket.models.iter().map(|m| m.as_str()).collect();
    println!("  Symbols:              {}", symbols);
    println!("  Models:               {}", models.join(", "));
    println!("  Alignment:            {:?}", config.basket.alignment);
    println!("  Feed Asset:           {}", config.basket.asset);
    println!("  Window:               {}h", config.window_hours);

    println!("\nSizing:");
    match &config.sizing {
        SizingRegime::Leveraged {
            leverage,
            equity_fraction,
        } => {
            println!("  Regime:               leveraged");
            println!("  Leverage:             {}x", leverage);
            match equity_fraction {
                Some(fraction) => println!("  Equity per Symbol:    {:.0}%", fraction * 100.0),
                None => println!("  Equity per Symbol:    split evenly"),
            }
        }
        SizingRegime::MarginConstrained {
            margin_buffer,
            margin_basis,
        } => {
            println!("  Regime:               margin constrained");
            println!("  Margin Buffer:        {:.0}%", margin_buffer * 100.0);
            println!("  Margin Basis:         {:?}", margin_basis);
        }
    }

    println!("\nTrailing Stop:");
    println!("  Start:                +{}%", config.trail.start_pct);
    println!("  Offset:               {}%", config.trail.offset_pct);

    println!("\nReconcile:");
    println!("  Tolerance:            {}%", config.reconcile_tolerance_pct * 100.0);
    println!("  Min Units:            {}", config.reconcile_min_units);
}

//! Digit Cracker - Main Entry Point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use digit_cracker::config::Config;
use digit_cracker::export::ExportFormat;
use digit_cracker::replay::{ReplayEngine, ReplayOptions, TickCsvLoader};
use digit_cracker::strategy::StrategyKind;
use digit_cracker::{DashboardSnapshot, DigitCracker};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Digit Cracker CLI
#[derive(Parser)]
#[command(name = "digit-cracker")]
#[command(version, about = "Last-digit statistics and strategy engine for tick streams")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream a symbol live and optionally run one strategy
    Run {
        /// Symbol to stream (defaults to the configured market symbol)
        #[arg(short, long)]
        symbol: Option<String>,

        /// Strategy to start once connected
        #[arg(long)]
        strategy: Option<StrategyKind>,

        /// Seconds between status lines
        #[arg(long, default_value = "30")]
        status_interval: u64,
    },

    /// Load a symbol's recent history and export its digit statistics
    Export {
        /// Symbol to export
        #[arg(short, long)]
        symbol: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "json")]
        format: ExportFormat,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<String>,

        /// Seconds to wait for history
        #[arg(long, default_value = "15")]
        timeout: u64,
    },

    /// Replay recorded ticks through a strategy against the paper service
    Replay {
        /// Path to an epoch,quote CSV file
        #[arg(short, long)]
        data: String,

        /// Strategy to replay
        #[arg(long)]
        strategy: StrategyKind,

        /// Symbol label for the replayed ticks
        #[arg(short, long, default_value = "R_100")]
        symbol: String,

        /// Paper account starting balance
        #[arg(short = 'b', long, default_value = "1000")]
        initial_balance: Decimal,

        /// Write the summary as JSON to this file
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load()?;
    config.validate()?;

    match cli.command {
        Some(Commands::Export {
            symbol,
            format,
            output,
            timeout,
        }) => run_export(config, symbol, format, output.as_deref(), timeout).await,
        Some(Commands::Replay {
            data,
            strategy,
            symbol,
            initial_balance,
            output,
        }) => run_replay(config, &data, strategy, symbol, initial_balance, output.as_deref()).await,
        Some(Commands::Run {
            symbol,
            strategy,
            status_interval,
        }) => run_live(config, symbol, strategy, status_interval).await,
        None => run_live(config, None, None, 30).await,
    }
}

async fn run_live(
    mut config: Config,
    symbol: Option<String>,
    strategy: Option<StrategyKind>,
    status_interval: u64,
) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║              Digit Cracker v{} - Live Session              ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    if let Some(symbol) = symbol {
        config.market.symbol = symbol;
    }
    log_config(&config);

    let token = config.connection.token();
    if token.is_none() {
        warn!("No API token configured. Streaming only, trades will be rejected.");
    }

    let app = DigitCracker::new(config);
    app.connect(token).await;

    if let Some(kind) = strategy {
        app.toggle_strategy(kind);
        info!(strategy = %kind, "Strategy armed");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    let mut status = tokio::time::interval(Duration::from_secs(status_interval.max(1)));
    let mut poll = tokio::time::interval(Duration::from_millis(250));
    while !shutdown.load(Ordering::SeqCst) {
        tokio::select! {
            _ = status.tick() => log_status(&app.snapshot()),
            _ = poll.tick() => {}
        }
    }

    app.shutdown().await;
    log_status(&app.snapshot());
    Ok(())
}

async fn run_export(
    mut config: Config,
    symbol: Option<String>,
    format: ExportFormat,
    output: Option<&str>,
    timeout: u64,
) -> Result<()> {
    if let Some(symbol) = symbol {
        config.market.symbol = symbol;
    }
    let symbol = config.market.symbol.clone();
    let token = config.connection.token();

    let app = DigitCracker::new(config);
    app.connect(token).await;

    let mut snapshots = app.watch();
    let loaded = tokio::time::timeout(Duration::from_secs(timeout), async {
        loop {
            if snapshots.borrow_and_update().window_len > 0 {
                return true;
            }
            if snapshots.changed().await.is_err() {
                return false;
            }
        }
    })
    .await;

    let result = match loaded {
        Ok(true) => app.export_data(format),
        _ => Err(anyhow::anyhow!("No history received for {} within {}s", symbol, timeout)),
    };
    app.shutdown().await;
    let rendered = result?;

    match output {
        Some(path) => {
            std::fs::write(path, &rendered)
                .with_context(|| format!("Failed to write export: {}", path))?;
            info!(%symbol, %format, path, "Statistics exported");
        }
        None => println!("{}", rendered),
    }
    Ok(())
}

async fn run_replay(
    config: Config,
    data: &str,
    strategy: StrategyKind,
    symbol: String,
    initial_balance: Decimal,
    output: Option<&str>,
) -> Result<()> {
    let loader = TickCsvLoader::new(data)?;
    info!("Loaded {} ticks from {}", loader.len(), data);

    let mut options = ReplayOptions::new(strategy, symbol);
    options.initial_balance = initial_balance;

    let engine = ReplayEngine::new(config, options);
    let summary = engine.run(loader.ticks()).await?;

    println!("{}", summary.summary());

    if let Some(path) = output {
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write replay summary: {}", path))?;
        info!("Summary written to {}", path);
    }
    Ok(())
}

/// Initialize logging with console and file output.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "digit-cracker.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("digit_cracker=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("Configuration:");
    info!("   Endpoint: {}", config.connection.endpoint);
    info!("   App ID: {}", config.connection.app_id);
    info!("   Symbol: {} ({})", config.market.symbol, config.market.currency);
    info!("   Window: {} ticks", config.stats.window_capacity);
    info!("   Over/Under Threshold: {}", config.stats.over_under_threshold);
    info!(
        "   Trigger Threshold: {:.0}%",
        config.triggers.polarity_threshold_pct
    );
    info!(
        "   Settlement Polling: {}ms x {}",
        config.execution.poll_interval_ms, config.execution.max_poll_attempts
    );
}

fn log_status(snapshot: &DashboardSnapshot) {
    let price = snapshot
        .current_price
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".to_string());
    let digit = snapshot
        .last_digit
        .map(|d| d.to_string())
        .unwrap_or_else(|| "-".to_string());
    let latency = snapshot
        .latency_ms
        .map(|l| format!("{}ms", l))
        .unwrap_or_else(|| "-".to_string());

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!(
        "{} [{}] {} price {} digit {} window {}",
        snapshot.symbol, snapshot.connection, latency, price, digit, snapshot.window_len
    );
    info!(
        "   Even {:.1}% | Over {:.1}% | Differs {:.1}% | Rise {:.1}%",
        snapshot.percentages.even,
        snapshot.percentages.over,
        snapshot.percentages.differs,
        snapshot.percentages.rise
    );
    if let Some(prediction) = &snapshot.prediction {
        info!(
            "   Prediction: {} ({}%) then {}",
            prediction.top.digit,
            prediction.confidence(),
            prediction.second.digit
        );
    }
    if let Some(balance) = &snapshot.balance {
        info!("   Balance: {} {}", balance.balance, balance.currency);
    }

    let engine = &snapshot.strategies;
    for view in &engine.strategies {
        if view.config.is_running || engine.active == Some(view.kind) {
            info!(
                "   {} {} runs {}/{} busy {}",
                view.kind, view.status, view.config.runs_count, view.config.max_runs, view.busy
            );
        }
    }
    info!(
        "   Session P&L: ${:.2} | Total P&L: ${:.2} | Loss Streak: {}",
        engine.session_profit, engine.total_profit, engine.loss_streak
    );
}

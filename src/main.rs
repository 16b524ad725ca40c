mod main_runtime;

use anyhow::{bail, Context};
use bulwark::bus::EventBus;
use bulwark::config::AppConfig;
use bulwark::coordinator::{CoordinatorSettings, StrategyCoordinator, StrategyFactory, StrategyGraphConfig};
use bulwark::lifecycle::{BracketManager, HaltEnforcer, OcoManager, OrderGateway, TrailingStopManager};
use bulwark::persistence::{CheckpointService, JsonFileStore};
use bulwark::portfolio::PortfolioService;
use bulwark::telemetry::{Telemetry, TracingSink};
use bulwark::venue::SimulatedVenue;
use clap::Parser;
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Paper session: strategies against the simulated venue until Ctrl-C
#[derive(Debug, Parser)]
#[command(name = "bulwark", version, about)]
struct Cli {
    /// Directory holding default.toml and <BULWARK_ENV>.toml
    #[arg(long, default_value = "config", env = "BULWARK_CONFIG_DIR")]
    config_dir: PathBuf,

    /// Strategy graph (TOML or JSON); overrides coordinator.graph_file
    #[arg(long)]
    graph: Option<PathBuf>,

    /// Symbols for the built-in SMA graph when no graph file is given
    #[arg(long, value_delimiter = ',', default_value = "AAPL")]
    symbols: Vec<String>,

    #[arg(long, default_value_t = 10)]
    position_size: u64,

    #[arg(long, default_value_t = 100000)]
    starting_cash: u64,

    /// Publish a synthetic price walk on every graph symbol at this interval
    #[arg(long)]
    tick_interval_ms: Option<u64>,

    /// Override logging.level
    #[arg(long)]
    log_level: Option<String>,
}

/// Deterministic random walk so a paper session has something to trade on
fn spawn_price_walk(
    venue: Arc<SimulatedVenue>,
    symbols: Vec<String>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut prices: Vec<Decimal> = symbols.iter().map(|_| Decimal::from(100)).collect();
        let mut seed: u64 = 0x9E37_79B9_7F4A_7C15;
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                _ = tick.tick() => {
                    for (symbol, price) in symbols.iter().zip(prices.iter_mut()) {
                        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                        let step = Decimal::new(((seed >> 33) % 101) as i64 - 50, 2);
                        *price = (*price + step).max(Decimal::ONE);
                        venue.push_tick(symbol, *price);
                    }
                }
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config_dir)
        .with_context(|| format!("loading configuration from {}", cli.config_dir.display()))?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Err(errors) = config.validate() {
        bail!("invalid configuration:\n  {}", errors.join("\n  "));
    }

    let _log_guard = main_runtime::init_logging(&config.logging);
    info!(mode = %config.trading.mode, "bulwark paper session starting");

    let graph = match cli.graph.as_ref().or(config.coordinator.graph_file.as_ref()) {
        Some(path) => StrategyGraphConfig::load(path)?,
        None => {
            let symbols: Vec<&str> = cli.symbols.iter().map(String::as_str).collect();
            StrategyGraphConfig::single_sma(&symbols, cli.position_size, 10, 30)
        }
    };

    let (telemetry, telemetry_task) = Telemetry::spawn(TracingSink, config.telemetry.channel_capacity);
    let bus = EventBus::with_backlog_warning(config.bus.backlog_warn_threshold);
    let venue = Arc::new(SimulatedVenue::new(bus.clone()));
    let checkpoints = CheckpointService::new(Arc::new(JsonFileStore::new(&config.persistence.directory)));
    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    let (portfolio, portfolio_handle) = PortfolioService::restore_or_new(
        &bus,
        checkpoints.clone(),
        Decimal::from(cli.starting_cash),
        config.persistence.snapshot_interval(),
    )
    .await?;

    let gate = Arc::new(config.live_gate());
    let kill_switch = Arc::new(
        config
            .kill_switch()?
            .with_bus(bus.clone())
            .with_telemetry(telemetry.clone()),
    );
    let pipeline = config.risk_pipeline(gate, kill_switch.clone(), telemetry.clone())?;
    let gateway = OrderGateway::new(Arc::new(pipeline), venue.clone(), portfolio_handle)
        .with_timeout(config.coordinator.venue_call_timeout())
        .with_telemetry(telemetry.clone());

    let (brackets, _bracket_handle) = BracketManager::new(&bus, gateway.clone(), telemetry.clone());
    let (ocos, _oco_handle) = OcoManager::new(&bus, gateway.clone(), telemetry.clone());
    let (trailing, _trailing_handle) = TrailingStopManager::new(
        &bus,
        gateway.clone(),
        config.trailing.min_update_interval(),
        telemetry.clone(),
    );
    let trailing = trailing.with_checkpoints(checkpoints);
    let halt = HaltEnforcer::new(&bus, gateway.clone(), kill_switch.clone(), telemetry.clone());

    let mut tasks = vec![
        tokio::spawn(portfolio.run(shutdown_tx.subscribe())),
        tokio::spawn(brackets.run(shutdown_tx.subscribe())),
        tokio::spawn(ocos.run(shutdown_tx.subscribe())),
        tokio::spawn(trailing.run(shutdown_tx.subscribe())),
        tokio::spawn(halt.run(shutdown_tx.subscribe())),
    ];
    let kill_watch = kill_switch.watch_venue(&bus);

    let mut coordinator = StrategyCoordinator::new(
        bus.clone(),
        gateway,
        venue.clone(),
        StrategyFactory::with_defaults(),
        telemetry.clone(),
    )
    .with_settings(CoordinatorSettings {
        intent_queue_capacity: config.coordinator.intent_queue_capacity,
    });
    coordinator.start(graph.clone()).await?;

    if let Some(ms) = cli.tick_interval_ms {
        tasks.push(spawn_price_walk(
            venue.clone(),
            graph.symbols(),
            Duration::from_millis(ms.max(1)),
            shutdown_tx.subscribe(),
        ));
    }

    main_runtime::shutdown_signal().await;
    info!("shutdown requested");

    if let Err(e) = coordinator.stop().await {
        warn!(error = %e, "coordinator stop reported an error");
    }
    let _ = shutdown_tx.send(());
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "task ended abnormally");
        }
    }
    kill_watch.abort();
    let _ = kill_watch.await;

    let dropped = telemetry.dropped();
    drop(coordinator);
    drop(kill_switch);
    drop(telemetry);
    if tokio::time::timeout(Duration::from_secs(5), telemetry_task).await.is_err() {
        warn!("telemetry forwarder did not drain in time");
    }
    info!(
        published = bus.stats().published,
        dropped_telemetry = dropped,
        "bulwark stopped"
    );
    Ok(())
}

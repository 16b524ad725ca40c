use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::risk::{
    CorrelationGuard, CorrelationMatrix, FeeConfig, FeeModel, KillSwitch, LiveTradingGate,
    RiskPipeline, SymbolLimitOverride, SymbolLimitRegistry, SymbolLimits, TradingMode,
    DEFAULT_ACKNOWLEDGEMENT_PHRASE, DEFAULT_MAX_CLIP_PASSES,
};
use crate::telemetry::Telemetry;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub trailing: TrailingConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    #[serde(default)]
    pub mode: TradingMode,
    /// Explicit live flag; arms the gate but never acknowledges it
    #[serde(default)]
    pub live_flag: bool,
    #[serde(default = "default_acknowledgement_phrase")]
    pub acknowledgement_phrase: String,
    /// Where the kill switch keeps its state; in memory when unset
    #[serde(default)]
    pub kill_switch_file: Option<PathBuf>,
    /// Cancel working orders when the kill switch engages
    #[serde(default = "default_true")]
    pub kill_switch_cancel_orders: bool,
}

fn default_true() -> bool {
    true
}

fn default_acknowledgement_phrase() -> String {
    DEFAULT_ACKNOWLEDGEMENT_PHRASE.to_string()
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            mode: TradingMode::Paper,
            live_flag: false,
            acknowledgement_phrase: default_acknowledgement_phrase(),
            kill_switch_file: None,
            kill_switch_cancel_orders: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    #[serde(default)]
    pub limits: SymbolLimits,
    /// Per-symbol overrides; may only tighten `limits`
    #[serde(default)]
    pub symbol_limits: BTreeMap<String, SymbolLimitOverride>,
    /// Registry file (defaults + overrides) that replaces the two fields above
    #[serde(default)]
    pub limits_file: Option<PathBuf>,
    /// Account-wide net realized loss at which new exposure stops
    #[serde(default)]
    pub global_max_daily_loss: Option<Decimal>,
    #[serde(default = "default_correlation_threshold")]
    pub correlation_threshold: Decimal,
    /// Correlation guard is off while unset
    #[serde(default)]
    pub max_correlated_exposure: Option<Decimal>,
    #[serde(default)]
    pub correlation_matrix: HashMap<String, HashMap<String, Decimal>>,
    #[serde(default)]
    pub correlation_file: Option<PathBuf>,
    #[serde(default)]
    pub enable_fee_estimates: bool,
    #[serde(default)]
    pub fees: FeeConfig,
}

fn default_correlation_threshold() -> Decimal {
    Decimal::new(75, 2)
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            limits: SymbolLimits::default(),
            symbol_limits: BTreeMap::new(),
            limits_file: None,
            global_max_daily_loss: None,
            correlation_threshold: default_correlation_threshold(),
            max_correlated_exposure: None,
            correlation_matrix: HashMap::new(),
            correlation_file: None,
            enable_fee_estimates: false,
            fees: FeeConfig::default(),
        }
    }
}

impl RiskConfig {
    pub fn limit_registry(&self) -> Result<SymbolLimitRegistry> {
        match &self.limits_file {
            Some(path) => SymbolLimitRegistry::load(path),
            None => SymbolLimitRegistry::with_overrides(
                self.limits,
                self.symbol_limits.iter().map(|(s, o)| (s.to_uppercase(), *o)),
            ),
        }
    }

    pub fn correlation_guard(&self) -> Result<Option<CorrelationGuard>> {
        let Some(max_exposure) = self.max_correlated_exposure else {
            return Ok(None);
        };
        let matrix = match &self.correlation_file {
            Some(path) => CorrelationMatrix::load(path)?,
            None => CorrelationMatrix::from_nested(&self.correlation_matrix)?,
        };
        CorrelationGuard::new(matrix, self.correlation_threshold, max_exposure).map(Some)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_intent_queue_capacity")]
    pub intent_queue_capacity: usize,
    #[serde(default = "default_venue_call_timeout_ms")]
    pub venue_call_timeout_ms: u64,
    #[serde(default = "default_max_clip_passes")]
    pub max_clip_passes: u32,
    /// Strategy graph file (TOML or JSON); a single SMA strategy when unset
    #[serde(default)]
    pub graph_file: Option<PathBuf>,
}

fn default_intent_queue_capacity() -> usize {
    crate::coordinator::DEFAULT_INTENT_QUEUE_CAPACITY
}

fn default_venue_call_timeout_ms() -> u64 {
    5000
}

fn default_max_clip_passes() -> u32 {
    DEFAULT_MAX_CLIP_PASSES
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            intent_queue_capacity: default_intent_queue_capacity(),
            venue_call_timeout_ms: default_venue_call_timeout_ms(),
            max_clip_passes: default_max_clip_passes(),
            graph_file: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn venue_call_timeout(&self) -> Duration {
        Duration::from_millis(self.venue_call_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrailingConfig {
    #[serde(default = "default_min_update_interval_ms")]
    pub min_update_interval_ms: u64,
}

fn default_min_update_interval_ms() -> u64 {
    1000
}

impl Default for TrailingConfig {
    fn default() -> Self {
        Self {
            min_update_interval_ms: default_min_update_interval_ms(),
        }
    }
}

impl TrailingConfig {
    pub fn min_update_interval(&self) -> Duration {
        Duration::from_millis(self.min_update_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_persistence_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
}

fn default_persistence_directory() -> PathBuf {
    PathBuf::from("data")
}

fn default_snapshot_interval_secs() -> u64 {
    60
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            directory: default_persistence_directory(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
        }
    }
}

impl PersistenceConfig {
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Subscriber backlog that triggers a warning
    #[serde(default = "default_backlog_warn_threshold")]
    pub backlog_warn_threshold: usize,
}

fn default_backlog_warn_threshold() -> usize {
    1024
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backlog_warn_threshold: default_backlog_warn_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_channel_capacity() -> usize {
    crate::telemetry::DEFAULT_TELEMETRY_CAPACITY
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Daily rolling log files go here when set
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            directory: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> std::result::Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("trading.mode", "paper")?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // environment-specific file, e.g. config/production.toml
            .add_source(
                File::from(config_dir.join(
                    std::env::var("BULWARK_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // BULWARK_RISK__CORRELATION_THRESHOLD, BULWARK_LOGGING__LEVEL, ...
            .add_source(
                Environment::with_prefix("BULWARK")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Parse a single TOML document on top of the built-in defaults
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Validate configuration values
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = self.risk.limits.validate() {
            errors.push(format!("risk.limits: {}", e));
        }
        if self.risk.limits_file.is_none() {
            if let Err(e) = SymbolLimitRegistry::with_overrides(
                self.risk.limits,
                self.risk.symbol_limits.iter().map(|(s, o)| (s.clone(), *o)),
            ) {
                errors.push(format!("risk.symbol_limits: {}", e));
            }
        }
        if matches!(self.risk.global_max_daily_loss, Some(v) if v <= Decimal::ZERO) {
            errors.push("risk.global_max_daily_loss must be positive".to_string());
        }
        if self.risk.correlation_threshold <= Decimal::ZERO
            || self.risk.correlation_threshold > Decimal::ONE
        {
            errors.push("risk.correlation_threshold must be in (0, 1]".to_string());
        }
        if matches!(self.risk.max_correlated_exposure, Some(v) if v <= Decimal::ZERO) {
            errors.push("risk.max_correlated_exposure must be positive".to_string());
        }

        if self.trading.live_flag && self.trading.mode != TradingMode::Live {
            errors.push("trading.live_flag is set but trading.mode is not live".to_string());
        }
        if self.trading.acknowledgement_phrase.trim().is_empty() {
            errors.push("trading.acknowledgement_phrase must not be empty".to_string());
        }

        if self.coordinator.intent_queue_capacity == 0 {
            errors.push("coordinator.intent_queue_capacity must be positive".to_string());
        }
        if self.coordinator.venue_call_timeout_ms == 0 {
            errors.push("coordinator.venue_call_timeout_ms must be positive".to_string());
        }
        if self.coordinator.max_clip_passes == 0 {
            errors.push("coordinator.max_clip_passes must be positive".to_string());
        }
        if self.persistence.snapshot_interval_secs == 0 {
            errors.push("persistence.snapshot_interval_secs must be positive".to_string());
        }
        if self.bus.backlog_warn_threshold == 0 {
            errors.push("bus.backlog_warn_threshold must be positive".to_string());
        }
        if self.telemetry.channel_capacity == 0 {
            errors.push("telemetry.channel_capacity must be positive".to_string());
        }
        if !matches!(
            self.logging.level.to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            errors.push(format!("logging.level '{}' is not a level", self.logging.level));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn live_gate(&self) -> LiveTradingGate {
        let gate = LiveTradingGate::new(self.trading.mode, &self.trading.acknowledgement_phrase);
        if self.trading.live_flag {
            gate.arm();
        }
        gate
    }

    pub fn kill_switch(&self) -> Result<KillSwitch> {
        let switch = match &self.trading.kill_switch_file {
            Some(path) => KillSwitch::load(path)?,
            None => KillSwitch::in_memory(),
        };
        Ok(switch.with_cancel_orders(self.trading.kill_switch_cancel_orders))
    }

    /// Assemble the risk pipeline described by the `risk` section
    pub fn risk_pipeline(
        &self,
        gate: Arc<LiveTradingGate>,
        kill_switch: Arc<KillSwitch>,
        telemetry: Telemetry,
    ) -> Result<RiskPipeline> {
        let mut pipeline = RiskPipeline::new(gate, kill_switch, self.risk.limit_registry()?)
            .with_max_clip_passes(self.coordinator.max_clip_passes)
            .with_telemetry(telemetry);
        if let Some(limit) = self.risk.global_max_daily_loss {
            pipeline = pipeline.with_global_daily_loss(limit);
        }
        if let Some(guard) = self.risk.correlation_guard()? {
            pipeline = pipeline.with_correlation(guard);
        }
        if self.risk.enable_fee_estimates {
            pipeline = pipeline.with_fees(FeeModel::new(self.risk.fees.clone()));
        }
        Ok(pipeline)
    }
}

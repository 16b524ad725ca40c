//! Strategy graph configuration
//!
//! Describes which strategies the coordinator runs, the symbols each one
//! trades, its hard size limits and how capital is split between them.
//! Loadable from TOML or JSON.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::error::{BulwarkError, Result};

const MAX_WARMUP_BARS: u32 = 5000;

/// 1-40 chars of `[A-Za-z0-9_-]`
pub fn is_valid_slug(value: &str) -> bool {
    (1..=40).contains(&value.len())
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyNodeConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub symbols: Vec<String>,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub max_position: Option<u64>,
    #[serde(default)]
    pub max_notional: Option<Decimal>,
    #[serde(default)]
    pub warmup_bars: u32,
}

impl StrategyNodeConfig {
    pub fn new(id: &str, kind: &str, symbols: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            kind: kind.to_string(),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            params: serde_json::Map::new(),
            max_position: None,
            max_notional: None,
            warmup_bars: 0,
        }
        .normalized()
    }

    pub fn with_param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn with_max_position(mut self, max_position: u64) -> Self {
        self.max_position = Some(max_position);
        self
    }

    pub fn with_max_notional(mut self, max_notional: Decimal) -> Self {
        self.max_notional = Some(max_notional);
        self
    }

    /// Upper-case symbols and drop duplicates, keeping first occurrence
    pub fn normalized(mut self) -> Self {
        let mut seen = HashSet::new();
        self.symbols = self
            .symbols
            .into_iter()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| seen.insert(s.clone()))
            .collect();
        self
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(|v| v.as_u64())
    }

    fn collect_errors(&self, errors: &mut Vec<String>) {
        if !is_valid_slug(&self.id) {
            errors.push(format!(
                "strategy id '{}' must be 1-40 chars of letters, digits, '-' or '_'",
                self.id
            ));
        }
        if self.kind.trim().is_empty() {
            errors.push(format!("strategy '{}' has no type", self.id));
        }
        if self.symbols.is_empty() {
            errors.push(format!("strategy '{}' needs at least one symbol", self.id));
        }
        if self.symbols.iter().any(|s| s.is_empty()) {
            errors.push(format!("strategy '{}' has an empty symbol", self.id));
        }
        if self.max_position == Some(0) {
            errors.push(format!("strategy '{}': max_position must be positive", self.id));
        }
        if matches!(self.max_notional, Some(n) if n <= Decimal::ZERO) {
            errors.push(format!("strategy '{}': max_notional must be positive", self.id));
        }
        if self.warmup_bars > MAX_WARMUP_BARS {
            errors.push(format!(
                "strategy '{}': warmup_bars {} exceeds {}",
                self.id, self.warmup_bars, MAX_WARMUP_BARS
            ));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapitalPolicyKind {
    #[default]
    EqualWeight,
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CapitalPolicyConfig {
    #[serde(rename = "type")]
    pub kind: CapitalPolicyKind,
    /// Fixed policy: weight per strategy id
    pub weights: Option<BTreeMap<String, Decimal>>,
    /// Fixed policy: capital the weights apply to
    pub capital: Option<Decimal>,
    /// Equal-weight policy: shares per symbol split across the strategies
    /// trading it
    pub per_symbol_position_budget: Option<u64>,
}

impl CapitalPolicyConfig {
    pub fn fixed(weights: BTreeMap<String, Decimal>, capital: Decimal) -> Self {
        Self {
            kind: CapitalPolicyKind::Fixed,
            weights: Some(weights),
            capital: Some(capital),
            per_symbol_position_budget: None,
        }
    }

    fn collect_errors(&self, errors: &mut Vec<String>) {
        match self.kind {
            CapitalPolicyKind::EqualWeight => {
                if self.weights.is_some() || self.capital.is_some() {
                    errors.push("equal_weight policy does not accept weights or capital".to_string());
                }
                if self.per_symbol_position_budget == Some(0) {
                    errors.push("per_symbol_position_budget must be positive".to_string());
                }
            }
            CapitalPolicyKind::Fixed => {
                match &self.weights {
                    Some(weights) if !weights.is_empty() => {
                        let bad: Vec<&str> = weights
                            .iter()
                            .filter(|(_, w)| **w <= Decimal::ZERO)
                            .map(|(k, _)| k.as_str())
                            .collect();
                        if !bad.is_empty() {
                            errors.push(format!("fixed policy weights must be positive: {:?}", bad));
                        }
                        let total: Decimal = weights.values().copied().sum();
                        if total > Decimal::ONE {
                            errors.push(format!("fixed policy weights sum to {} (> 1)", total));
                        }
                    }
                    _ => errors.push("fixed policy requires a non-empty weights table".to_string()),
                }
                match self.capital {
                    Some(c) if c > Decimal::ZERO => {}
                    _ => errors.push("fixed policy requires positive capital".to_string()),
                }
                if self.per_symbol_position_budget.is_some() {
                    errors.push("per_symbol_position_budget only applies to equal_weight".to_string());
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GraphRuntimeSettings {
    /// Start even if some strategies fail to build; those are marked failed
    pub allow_partial_start: bool,
    /// How long `stop()` waits for each strategy task
    pub heartbeat_timeout_secs: u64,
    pub telemetry_interval_secs: u64,
}

impl Default for GraphRuntimeSettings {
    fn default() -> Self {
        Self {
            allow_partial_start: false,
            heartbeat_timeout_secs: 30,
            telemetry_interval_secs: 60,
        }
    }
}

impl GraphRuntimeSettings {
    fn collect_errors(&self, errors: &mut Vec<String>) {
        if !(5..=600).contains(&self.heartbeat_timeout_secs) {
            errors.push(format!(
                "heartbeat_timeout_secs {} outside 5..=600",
                self.heartbeat_timeout_secs
            ));
        }
        if !(10..=600).contains(&self.telemetry_interval_secs) {
            errors.push(format!(
                "telemetry_interval_secs {} outside 10..=600",
                self.telemetry_interval_secs
            ));
        }
    }
}

fn default_graph_name() -> String {
    "default_graph".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyGraphConfig {
    #[serde(default = "default_graph_name")]
    pub name: String,
    pub strategies: Vec<StrategyNodeConfig>,
    #[serde(default)]
    pub capital_policy: CapitalPolicyConfig,
    #[serde(default)]
    pub settings: GraphRuntimeSettings,
}

impl StrategyGraphConfig {
    pub fn new(strategies: Vec<StrategyNodeConfig>) -> Self {
        Self {
            name: default_graph_name(),
            strategies: strategies.into_iter().map(|n| n.normalized()).collect(),
            capital_policy: CapitalPolicyConfig::default(),
            settings: GraphRuntimeSettings::default(),
        }
    }

    pub fn with_policy(mut self, policy: CapitalPolicyConfig) -> Self {
        self.capital_policy = policy;
        self
    }

    pub fn with_settings(mut self, settings: GraphRuntimeSettings) -> Self {
        self.settings = settings;
        self
    }

    /// One SMA node, as used by the paper-trading binary
    pub fn single_sma(symbols: &[&str], position_size: u64, fast_period: u64, slow_period: u64) -> Self {
        let node = StrategyNodeConfig::new("sma_default", "sma", symbols)
            .with_param("fast_period", fast_period)
            .with_param("slow_period", slow_period)
            .with_param("position_size", position_size)
            .with_max_position(position_size);
        Self::new(vec![node])
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let graph: Self = toml::from_str(raw)?;
        graph.normalized().checked()
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let graph: Self = serde_json::from_str(raw)?;
        graph.normalized().checked()
    }

    /// Load by extension: `.toml`, anything else is read as JSON
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&raw),
            _ => Self::from_json_str(&raw),
        }
    }

    pub fn normalized(mut self) -> Self {
        self.strategies = self.strategies.into_iter().map(|n| n.normalized()).collect();
        self
    }

    fn checked(self) -> Result<Self> {
        self.validate()
            .map_err(|errors| BulwarkError::Validation(errors.join("; ")))?;
        Ok(self)
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !is_valid_slug(&self.name) {
            errors.push(format!("graph name '{}' is not a valid slug", self.name));
        }
        if self.strategies.is_empty() {
            errors.push("graph needs at least one strategy".to_string());
        }

        let mut ids = HashSet::new();
        for node in &self.strategies {
            node.collect_errors(&mut errors);
            if !ids.insert(node.id.as_str()) {
                errors.push(format!("duplicate strategy id '{}'", node.id));
            }
        }

        self.capital_policy.collect_errors(&mut errors);
        if let (CapitalPolicyKind::Fixed, Some(weights)) =
            (self.capital_policy.kind, &self.capital_policy.weights)
        {
            let mut missing: Vec<&str> = ids
                .iter()
                .filter(|id| !weights.contains_key(**id))
                .copied()
                .collect();
            missing.sort_unstable();
            if !missing.is_empty() {
                errors.push(format!("fixed policy has no weight for {:?}", missing));
            }
        }
        self.settings.collect_errors(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Every symbol the graph trades, sorted and deduplicated
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .strategies
            .iter()
            .flat_map(|n| n.symbols.iter().cloned())
            .collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_slug_rules() {
        assert!(is_valid_slug("sma_fast-1"));
        assert!(!is_valid_slug(""));
        assert!(!is_valid_slug("has space"));
        assert!(!is_valid_slug(&"x".repeat(41)));
    }

    #[test]
    fn test_symbols_normalized() {
        let node = StrategyNodeConfig::new("a", "sma", &["aapl", "AAPL", " msft "]);
        assert_eq!(node.symbols, vec!["AAPL", "MSFT"]);
    }

    #[test]
    fn test_toml_graph() {
        let raw = r#"
            name = "pair"

            [[strategies]]
            id = "fast"
            type = "sma"
            symbols = ["aapl"]
            max_position = 5
            params = { fast_period = 3, slow_period = 8, position_size = 5 }

            [[strategies]]
            id = "slow"
            type = "sma"
            symbols = ["AAPL", "msft"]
            max_notional = "25000"

            [capital_policy]
            type = "equal_weight"
            per_symbol_position_budget = 10

            [settings]
            allow_partial_start = true
        "#;
        let graph = StrategyGraphConfig::from_toml_str(raw).unwrap();
        assert_eq!(graph.strategies.len(), 2);
        assert_eq!(graph.strategies[0].param_u64("fast_period"), Some(3));
        assert_eq!(graph.strategies[1].max_notional, Some(dec!(25000)));
        assert_eq!(graph.symbols(), vec!["AAPL", "MSFT"]);
        assert!(graph.settings.allow_partial_start);
        assert_eq!(graph.settings.telemetry_interval_secs, 60);
    }

    #[test]
    fn test_json_graph_rejects_unknown_fields() {
        let raw = r#"{"strategies":[{"id":"a","type":"sma","symbols":["AAPL"],"leverage":3}]}"#;
        assert!(StrategyGraphConfig::from_json_str(raw).is_err());
    }

    #[test]
    fn test_validation_collects_every_problem() {
        let mut graph = StrategyGraphConfig::new(vec![
            StrategyNodeConfig::new("dup", "sma", &["AAPL"]).with_max_position(0),
            StrategyNodeConfig::new("dup", "sma", &[]),
        ]);
        graph.settings.heartbeat_timeout_secs = 1;
        let errors = graph.validate().unwrap_err();
        assert_eq!(errors.len(), 4, "{:?}", errors);
    }

    #[test]
    fn test_fixed_policy_rules() {
        let nodes = vec![
            StrategyNodeConfig::new("a", "sma", &["AAPL"]),
            StrategyNodeConfig::new("b", "sma", &["AAPL"]),
        ];
        let mut weights = BTreeMap::new();
        weights.insert("a".to_string(), dec!(0.6));
        let graph = StrategyGraphConfig::new(nodes.clone())
            .with_policy(CapitalPolicyConfig::fixed(weights.clone(), dec!(100000)));
        let errors = graph.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("no weight")));

        weights.insert("b".to_string(), dec!(0.5));
        let graph = StrategyGraphConfig::new(nodes.clone())
            .with_policy(CapitalPolicyConfig::fixed(weights.clone(), dec!(100000)));
        assert!(graph.validate().unwrap_err().iter().any(|e| e.contains("sum")));

        weights.insert("b".to_string(), dec!(0.4));
        let graph = StrategyGraphConfig::new(nodes)
            .with_policy(CapitalPolicyConfig::fixed(weights, dec!(100000)));
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_single_sma_defaults() {
        let graph = StrategyGraphConfig::single_sma(&["spy"], 10, 5, 20);
        assert!(graph.validate().is_ok());
        assert_eq!(graph.strategies[0].max_position, Some(10));
        assert_eq!(graph.strategies[0].symbols, vec!["SPY"]);
    }
}

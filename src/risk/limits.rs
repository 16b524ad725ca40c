//! Per-symbol limit registry
//!
//! Global defaults apply to every symbol. A symbol override may tighten any
//! field but never loosen it: registering a looser value is an error, and the
//! effective lookup takes the field-wise minimum regardless.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::error::{BulwarkError, Result};

/// Limits applied to one symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolLimits {
    /// Maximum absolute position in shares
    #[serde(default = "default_max_position_size")]
    pub max_position_size: u64,
    /// Maximum notional of a single order
    #[serde(default = "default_max_order_notional")]
    pub max_order_notional: Decimal,
    /// Net realized loss for the day at which new exposure stops
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: Decimal,
}

fn default_max_position_size() -> u64 {
    100
}

fn default_max_order_notional() -> Decimal {
    Decimal::from(10_000)
}

fn default_max_daily_loss() -> Decimal {
    Decimal::from(1_000)
}

impl Default for SymbolLimits {
    fn default() -> Self {
        Self {
            max_position_size: default_max_position_size(),
            max_order_notional: default_max_order_notional(),
            max_daily_loss: default_max_daily_loss(),
        }
    }
}

impl SymbolLimits {
    pub fn validate(&self) -> Result<()> {
        if self.max_position_size == 0 {
            return Err(BulwarkError::Validation(
                "max_position_size must be positive".to_string(),
            ));
        }
        if self.max_order_notional <= Decimal::ZERO {
            return Err(BulwarkError::Validation(
                "max_order_notional must be positive".to_string(),
            ));
        }
        if self.max_daily_loss <= Decimal::ZERO {
            return Err(BulwarkError::Validation(
                "max_daily_loss must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Partial per-symbol override; unset fields fall back to the defaults
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolLimitOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_position_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_order_notional: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_daily_loss: Option<Decimal>,
}

impl SymbolLimitOverride {
    fn looser_fields(&self, defaults: &SymbolLimits) -> Vec<String> {
        let mut fields = Vec::new();
        if let Some(v) = self.max_position_size {
            if v == 0 || v > defaults.max_position_size {
                fields.push(format!(
                    "max_position_size {} (default {})",
                    v, defaults.max_position_size
                ));
            }
        }
        if let Some(v) = self.max_order_notional {
            if v <= Decimal::ZERO || v > defaults.max_order_notional {
                fields.push(format!(
                    "max_order_notional {} (default {})",
                    v, defaults.max_order_notional
                ));
            }
        }
        if let Some(v) = self.max_daily_loss {
            if v <= Decimal::ZERO || v > defaults.max_daily_loss {
                fields.push(format!(
                    "max_daily_loss {} (default {})",
                    v, defaults.max_daily_loss
                ));
            }
        }
        fields
    }
}

/// On-disk layout of the registry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryFile {
    default_limits: SymbolLimits,
    #[serde(default)]
    symbol_limits: BTreeMap<String, SymbolLimitOverride>,
}

#[derive(Debug, Clone, Default)]
pub struct SymbolLimitRegistry {
    defaults: SymbolLimits,
    overrides: BTreeMap<String, SymbolLimitOverride>,
}

impl SymbolLimitRegistry {
    pub fn new(defaults: SymbolLimits) -> Self {
        Self {
            defaults,
            overrides: BTreeMap::new(),
        }
    }

    /// Build from defaults plus overrides, failing on the first looser override
    pub fn with_overrides<I>(defaults: SymbolLimits, overrides: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, SymbolLimitOverride)>,
    {
        defaults.validate()?;
        let mut registry = Self::new(defaults);
        for (symbol, limits) in overrides {
            registry.set_override(&symbol, limits)?;
        }
        Ok(registry)
    }

    pub fn defaults(&self) -> &SymbolLimits {
        &self.defaults
    }

    pub fn set_override(&mut self, symbol: &str, limits: SymbolLimitOverride) -> Result<()> {
        let symbol = symbol.trim().to_uppercase();
        let looser = limits.looser_fields(&self.defaults);
        if !looser.is_empty() {
            return Err(BulwarkError::Validation(format!(
                "limits for {} must be stricter than the defaults: {}",
                symbol,
                looser.join(", ")
            )));
        }
        self.overrides.insert(symbol, limits);
        Ok(())
    }

    pub fn remove_override(&mut self, symbol: &str) -> Option<SymbolLimitOverride> {
        self.overrides.remove(&symbol.to_uppercase())
    }

    pub fn override_for(&self, symbol: &str) -> Option<&SymbolLimitOverride> {
        self.overrides.get(&symbol.to_uppercase())
    }

    /// Limits in force for `symbol`
    pub fn effective(&self, symbol: &str) -> SymbolLimits {
        let mut limits = self.defaults;
        if let Some(o) = self.overrides.get(&symbol.to_uppercase()) {
            if let Some(v) = o.max_position_size {
                limits.max_position_size = limits.max_position_size.min(v);
            }
            if let Some(v) = o.max_order_notional {
                limits.max_order_notional = limits.max_order_notional.min(v);
            }
            if let Some(v) = o.max_daily_loss {
                limits.max_daily_loss = limits.max_daily_loss.min(v);
            }
        }
        limits
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = RegistryFile {
            default_limits: self.defaults,
            symbol_limits: self.overrides.clone(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&file)?)?;
        info!(path = %path.display(), symbols = self.overrides.len(), "saved symbol limits");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let file: RegistryFile = serde_json::from_str(&raw)?;
        let registry = Self::with_overrides(file.default_limits, file.symbol_limits)?;
        info!(
            path = %path.display(),
            symbols = registry.overrides.len(),
            "loaded symbol limits"
        );
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn defaults() -> SymbolLimits {
        SymbolLimits {
            max_position_size: 100,
            max_order_notional: dec!(10000),
            max_daily_loss: dec!(1000),
        }
    }

    #[test]
    fn test_effective_falls_back_to_defaults() {
        let mut registry = SymbolLimitRegistry::new(defaults());
        registry
            .set_override(
                "x",
                SymbolLimitOverride {
                    max_daily_loss: Some(dec!(200)),
                    ..Default::default()
                },
            )
            .unwrap();

        let x = registry.effective("X");
        assert_eq!(x.max_daily_loss, dec!(200));
        assert_eq!(x.max_position_size, 100);
        assert_eq!(registry.effective("AAPL"), defaults());
    }

    #[test]
    fn test_looser_override_is_refused() {
        let mut registry = SymbolLimitRegistry::new(defaults());
        let err = registry
            .set_override(
                "TSLA",
                SymbolLimitOverride {
                    max_position_size: Some(500),
                    max_order_notional: Some(dec!(5000)),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(err.to_string().contains("max_position_size 500"));
        assert!(registry.override_for("TSLA").is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("bulwark-limits-{}", uuid::Uuid::new_v4()));
        let path = dir.join("limits.json");

        let mut registry = SymbolLimitRegistry::new(defaults());
        registry
            .set_override(
                "AAPL",
                SymbolLimitOverride {
                    max_position_size: Some(50),
                    ..Default::default()
                },
            )
            .unwrap();
        registry.save(&path).unwrap();

        let loaded = SymbolLimitRegistry::load(&path).unwrap();
        assert_eq!(loaded.effective("AAPL").max_position_size, 50);
        assert_eq!(loaded.defaults(), &defaults());
        std::fs::remove_dir_all(dir).ok();
    }
}

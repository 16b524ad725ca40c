//! Commission and slippage estimates used for fee-adjusted exposure

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Commission schedule for one asset class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommissionProfile {
    #[serde(default)]
    pub per_share: Decimal,
    #[serde(default)]
    pub minimum: Decimal,
    /// Per-order cap, zero means uncapped
    #[serde(default)]
    pub maximum: Decimal,
    /// Fraction of notional
    #[serde(default)]
    pub percentage: Decimal,
}

impl CommissionProfile {
    pub fn calculate(&self, quantity: u64, price: Decimal) -> Decimal {
        let qty = Decimal::from(quantity);
        let mut commission = self.per_share * qty;
        if self.percentage > Decimal::ZERO {
            commission += qty * price * self.percentage;
        }
        if self.minimum > Decimal::ZERO {
            commission = commission.max(self.minimum);
        }
        if self.maximum > Decimal::ZERO {
            commission = commission.min(self.maximum);
        }
        commission
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlippageEstimate {
    #[serde(default = "default_slippage_bps")]
    pub basis_points: Decimal,
    /// Per-share amount; takes precedence over basis points when set
    #[serde(default)]
    pub fixed_amount: Decimal,
}

fn default_slippage_bps() -> Decimal {
    Decimal::from(5)
}

impl Default for SlippageEstimate {
    fn default() -> Self {
        Self {
            basis_points: default_slippage_bps(),
            fixed_amount: Decimal::ZERO,
        }
    }
}

impl SlippageEstimate {
    pub fn bps(basis_points: Decimal) -> Self {
        Self {
            basis_points,
            fixed_amount: Decimal::ZERO,
        }
    }

    pub fn calculate(&self, quantity: u64, price: Decimal) -> Decimal {
        let qty = Decimal::from(quantity);
        if self.fixed_amount > Decimal::ZERO {
            return self.fixed_amount * qty;
        }
        qty * price * self.basis_points / Decimal::from(10_000)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    #[default]
    Stock,
    Forex,
    Option,
    Future,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub commission: CommissionProfile,
    pub slippage: SlippageEstimate,
}

/// Fee configuration per asset class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeConfig {
    #[serde(default = "FeeConfig::default_stock")]
    pub stock: FeeSchedule,
    #[serde(default = "FeeConfig::default_forex")]
    pub forex: FeeSchedule,
    #[serde(default = "FeeConfig::default_option")]
    pub option: FeeSchedule,
    #[serde(default = "FeeConfig::default_future")]
    pub future: FeeSchedule,
    /// Symbols that are not stocks
    #[serde(default)]
    pub asset_classes: HashMap<String, AssetClass>,
}

impl FeeConfig {
    fn default_stock() -> FeeSchedule {
        FeeSchedule {
            commission: CommissionProfile {
                per_share: Decimal::new(5, 3),
                minimum: Decimal::ONE,
                ..Default::default()
            },
            slippage: SlippageEstimate::bps(Decimal::from(5)),
        }
    }

    fn default_forex() -> FeeSchedule {
        FeeSchedule {
            commission: CommissionProfile {
                percentage: Decimal::new(2, 5),
                ..Default::default()
            },
            slippage: SlippageEstimate::bps(Decimal::ONE),
        }
    }

    fn default_option() -> FeeSchedule {
        FeeSchedule {
            commission: CommissionProfile {
                per_share: Decimal::new(65, 2),
                minimum: Decimal::ONE,
                ..Default::default()
            },
            slippage: SlippageEstimate::bps(Decimal::from(20)),
        }
    }

    fn default_future() -> FeeSchedule {
        FeeSchedule {
            commission: CommissionProfile {
                per_share: Decimal::new(85, 2),
                ..Default::default()
            },
            slippage: SlippageEstimate::bps(Decimal::from(5)),
        }
    }
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            stock: Self::default_stock(),
            forex: Self::default_forex(),
            option: Self::default_option(),
            future: Self::default_future(),
            asset_classes: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeeEstimate {
    pub commission: Decimal,
    pub slippage: Decimal,
}

impl FeeEstimate {
    pub fn total(&self) -> Decimal {
        self.commission + self.slippage
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeeModel {
    config: FeeConfig,
}

impl FeeModel {
    pub fn new(config: FeeConfig) -> Self {
        Self { config }
    }

    pub fn asset_class(&self, symbol: &str) -> AssetClass {
        self.config
            .asset_classes
            .get(&symbol.to_uppercase())
            .copied()
            .unwrap_or_default()
    }

    fn schedule(&self, symbol: &str) -> &FeeSchedule {
        match self.asset_class(symbol) {
            AssetClass::Stock => &self.config.stock,
            AssetClass::Forex => &self.config.forex,
            AssetClass::Option => &self.config.option,
            AssetClass::Future => &self.config.future,
        }
    }

    pub fn estimate(&self, symbol: &str, quantity: u64, price: Decimal) -> FeeEstimate {
        let schedule = self.schedule(symbol);
        FeeEstimate {
            commission: schedule.commission.calculate(quantity, price),
            slippage: schedule.slippage.calculate(quantity, price),
        }
    }

    /// Notional plus estimated costs
    pub fn adjusted_notional(&self, symbol: &str, quantity: u64, price: Decimal) -> Decimal {
        Decimal::from(quantity) * price + self.estimate(symbol, quantity, price).total()
    }

    /// Largest quantity whose fee-adjusted notional fits under `ceiling`
    pub fn max_quantity_within(&self, symbol: &str, ceiling: Decimal, price: Decimal) -> u64 {
        if price <= Decimal::ZERO || ceiling <= Decimal::ZERO {
            return 0;
        }
        let upper = (ceiling / price).floor();
        let mut qty: u64 = upper.try_into().unwrap_or(0);
        // fees are monotonic in quantity, so walk down from the raw bound
        while qty > 0 && self.adjusted_notional(symbol, qty, price) > ceiling {
            let over = self.adjusted_notional(symbol, qty, price) - ceiling;
            let step: u64 = (over / price).ceil().try_into().unwrap_or(1);
            qty = qty.saturating_sub(step.max(1));
        }
        qty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_stock_commission_minimum_applies() {
        let model = FeeModel::default();
        let small = model.estimate("AAPL", 10, dec!(150));
        assert_eq!(small.commission, dec!(1));
        assert_eq!(small.slippage, dec!(0.75));

        let large = model.estimate("AAPL", 1000, dec!(150));
        assert_eq!(large.commission, dec!(5));
    }

    #[test]
    fn test_commission_cap_and_fixed_slippage() {
        let profile = CommissionProfile {
            per_share: dec!(0.01),
            maximum: dec!(2),
            ..Default::default()
        };
        assert_eq!(profile.calculate(1000, dec!(10)), dec!(2));

        let slippage = SlippageEstimate {
            basis_points: dec!(5),
            fixed_amount: dec!(0.02),
        };
        assert_eq!(slippage.calculate(100, dec!(50)), dec!(2));
    }

    #[test]
    fn test_asset_class_lookup() {
        let mut config = FeeConfig::default();
        config.asset_classes.insert("EURUSD".to_string(), AssetClass::Forex);
        let model = FeeModel::new(config);

        assert_eq!(model.asset_class("eurusd"), AssetClass::Forex);
        let fx = model.estimate("EURUSD", 100_000, dec!(1.1));
        assert_eq!(fx.commission, dec!(2.2));
    }

    #[test]
    fn test_max_quantity_within_respects_fees() {
        let model = FeeModel::default();
        let qty = model.max_quantity_within("AAPL", dec!(1500), dec!(150));
        assert_eq!(qty, 9);
        assert!(model.adjusted_notional("AAPL", qty, dec!(150)) <= dec!(1500));
        assert_eq!(model.max_quantity_within("AAPL", dec!(100), dec!(150)), 0);
    }
}

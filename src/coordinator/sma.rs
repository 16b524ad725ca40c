//! Moving-average crossover
//!
//! Goes long `position_size` when the fast SMA crosses above the slow SMA
//! and back to flat when it crosses below. Registered as type `sma`.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

use super::graph::StrategyNodeConfig;
use super::strategy::{IntentOutcome, Strategy, StrategyContext};
use crate::bus::MarketDataEvent;
use crate::domain::{OrderIntent, OrderSide};
use crate::error::{BulwarkError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trend {
    Above,
    Below,
}

#[derive(Debug, Default)]
struct SymbolWindow {
    prices: VecDeque<Decimal>,
    bars: u64,
    trend: Option<Trend>,
}

pub struct SmaCrossover {
    fast_period: usize,
    slow_period: usize,
    position_size: u64,
    warmup_bars: u64,
    windows: HashMap<String, SymbolWindow>,
}

impl SmaCrossover {
    pub fn new(fast_period: usize, slow_period: usize, position_size: u64) -> Result<Self> {
        if fast_period == 0 || fast_period >= slow_period {
            return Err(BulwarkError::Validation(format!(
                "fast_period ({}) must be positive and below slow_period ({})",
                fast_period, slow_period
            )));
        }
        if position_size == 0 {
            return Err(BulwarkError::Validation("position_size must be positive".to_string()));
        }
        Ok(Self {
            fast_period,
            slow_period,
            position_size,
            warmup_bars: 0,
            windows: HashMap::new(),
        })
    }

    pub fn from_node(node: &StrategyNodeConfig) -> Result<Self> {
        let fast = node.param_u64("fast_period").unwrap_or(10) as usize;
        let slow = node.param_u64("slow_period").unwrap_or(30) as usize;
        let size = node
            .param_u64("position_size")
            .or(node.max_position)
            .unwrap_or(1);
        let mut strategy = Self::new(fast, slow, size)?;
        strategy.warmup_bars = node.warmup_bars as u64;
        Ok(strategy)
    }

    fn average(prices: &VecDeque<Decimal>, period: usize) -> Decimal {
        let sum: Decimal = prices.iter().rev().take(period).copied().sum();
        sum / Decimal::from(period as u64)
    }

    /// Feed one price; returns the new trend when it flipped
    fn update(&mut self, symbol: &str, price: Decimal) -> Option<Trend> {
        let slow_period = self.slow_period;
        let fast_period = self.fast_period;
        let warmup = self.warmup_bars.max(slow_period as u64);
        let window = self.windows.entry(symbol.to_string()).or_default();

        window.prices.push_back(price);
        if window.prices.len() > slow_period {
            window.prices.pop_front();
        }
        window.bars += 1;
        if window.bars < warmup || window.prices.len() < slow_period {
            return None;
        }

        let fast = Self::average(&window.prices, fast_period);
        let slow = Self::average(&window.prices, slow_period);
        let trend = if fast > slow {
            Trend::Above
        } else if fast < slow {
            Trend::Below
        } else {
            return None;
        };

        let previous = window.trend.replace(trend);
        match previous {
            Some(prev) if prev != trend => Some(trend),
            _ => None,
        }
    }
}

#[async_trait]
impl Strategy for SmaCrossover {
    async fn on_start(&mut self, ctx: &StrategyContext) -> Result<()> {
        info!(
            strategy_id = ctx.strategy_id(),
            fast = self.fast_period,
            slow = self.slow_period,
            size = self.position_size,
            "sma crossover started"
        );
        Ok(())
    }

    async fn on_market_data(&mut self, event: &MarketDataEvent, ctx: &StrategyContext) -> Result<()> {
        let Some(trend) = self.update(&event.symbol, event.price) else {
            return Ok(());
        };

        let position = ctx.position(&event.symbol);
        let target = match trend {
            Trend::Above => self.position_size as i64,
            Trend::Below => 0,
        };
        let delta = target - position;
        if delta == 0 {
            return Ok(());
        }
        let side = if delta > 0 { OrderSide::Buy } else { OrderSide::Sell };
        let intent = OrderIntent::market(&event.symbol, side, delta.unsigned_abs())
            .with_expected_price(event.price);

        let outcome = ctx.submit(intent).await?;
        match &outcome {
            IntentOutcome::Submitted { order_id, quantity } => info!(
                strategy_id = ctx.strategy_id(),
                symbol = %event.symbol,
                %side,
                quantity,
                %order_id,
                "crossover order sent"
            ),
            other => debug!(
                strategy_id = ctx.strategy_id(),
                symbol = %event.symbol,
                outcome = ?other,
                "crossover order not sent"
            ),
        }
        Ok(())
    }
}

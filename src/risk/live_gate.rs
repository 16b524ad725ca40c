//! Live-trading gate
//!
//! Paper mode always passes. Live mode needs two separate steps before any
//! order may pass: the live flag must be armed at startup, and an operator
//! must then acknowledge with the exact confirmation phrase. Configuration
//! can only arm; there is no configuration path to the acknowledgement.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tracing::{info, warn};

use super::decision::RejectReason;
use crate::error::{BulwarkError, Result};

pub const DEFAULT_ACKNOWLEDGEMENT_PHRASE: &str = "I ACCEPT LIVE TRADING RISK";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    #[default]
    Paper,
    Live,
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Paper => write!(f, "paper"),
            TradingMode::Live => write!(f, "live"),
        }
    }
}

impl FromStr for TradingMode {
    type Err = BulwarkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "paper" => Ok(TradingMode::Paper),
            "live" => Ok(TradingMode::Live),
            other => Err(BulwarkError::Validation(format!(
                "unknown trading mode '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub operator: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct LiveTradingGate {
    mode: TradingMode,
    phrase: String,
    armed: AtomicBool,
    acknowledged: AtomicBool,
    acknowledgement: RwLock<Option<Acknowledgement>>,
}

impl LiveTradingGate {
    pub fn new(mode: TradingMode, phrase: &str) -> Self {
        let phrase = if phrase.trim().is_empty() {
            DEFAULT_ACKNOWLEDGEMENT_PHRASE.to_string()
        } else {
            phrase.trim().to_string()
        };
        Self {
            mode,
            phrase,
            armed: AtomicBool::new(false),
            acknowledged: AtomicBool::new(false),
            acknowledgement: RwLock::new(None),
        }
    }

    pub fn paper() -> Self {
        Self::new(TradingMode::Paper, DEFAULT_ACKNOWLEDGEMENT_PHRASE)
    }

    pub fn mode(&self) -> TradingMode {
        self.mode
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Step one: the explicit live flag was supplied at startup
    pub fn arm(&self) {
        if self.mode != TradingMode::Live {
            return;
        }
        self.armed.store(true, Ordering::SeqCst);
        warn!("live trading flag armed; waiting for operator acknowledgement");
    }

    /// Step two: operator confirmation
    pub fn acknowledge(&self, operator: &str, phrase: &str) -> Result<()> {
        if self.mode != TradingMode::Live {
            return Err(BulwarkError::LiveGate(
                "acknowledgement is only meaningful in live mode".to_string(),
            ));
        }
        if !self.is_armed() {
            return Err(BulwarkError::LiveGate(
                "live flag is not armed; restart with the live flag first".to_string(),
            ));
        }
        if operator.trim().is_empty() {
            return Err(BulwarkError::LiveGate("operator name is required".to_string()));
        }
        if phrase.trim() != self.phrase {
            warn!(operator, "live trading acknowledgement phrase mismatch");
            return Err(BulwarkError::LiveGate(
                "confirmation phrase does not match".to_string(),
            ));
        }

        if let Ok(mut ack) = self.acknowledgement.write() {
            *ack = Some(Acknowledgement {
                operator: operator.to_string(),
                at: Utc::now(),
            });
        }
        self.acknowledged.store(true, Ordering::SeqCst);
        warn!(operator, "LIVE TRADING ACKNOWLEDGED - real orders will be sent");
        Ok(())
    }

    /// Withdraw the acknowledgement; the flag stays armed
    pub fn revoke(&self) {
        self.acknowledged.store(false, Ordering::SeqCst);
        if let Ok(mut ack) = self.acknowledgement.write() {
            *ack = None;
        }
        info!("live trading acknowledgement revoked");
    }

    pub fn acknowledgement(&self) -> Option<Acknowledgement> {
        self.acknowledgement.read().ok().and_then(|a| a.clone())
    }

    pub fn is_cleared(&self) -> bool {
        match self.mode {
            TradingMode::Paper => true,
            TradingMode::Live => self.is_armed() && self.acknowledged.load(Ordering::SeqCst),
        }
    }

    pub fn check(&self) -> std::result::Result<(), RejectReason> {
        if self.is_cleared() {
            Ok(())
        } else {
            Err(RejectReason::LiveTradingNotAcknowledged)
        }
    }
}

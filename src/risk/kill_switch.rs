//! Kill switch
//!
//! Platform-wide halt of new order submission. Engaged on an unrecoverable
//! venue disconnect or by an operator. It never clears by itself: a venue
//! reconnect is logged but the switch stays engaged until an operator clears
//! it. State is persisted so a restart comes back halted. With order
//! cancellation enabled (the default), engaging also asks the
//! [`crate::lifecycle::HaltEnforcer`] to cancel every working venue order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bus::{AccountEvent, BusEvent, DiagnosticEvent, EventBus, Topic};
use crate::error::{BulwarkError, Result};
use crate::telemetry::Telemetry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum KillReason {
    Manual(String),
    VenueDisconnected(String),
}

impl std::fmt::Display for KillReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KillReason::Manual(note) => write!(f, "manual: {}", note),
            KillReason::VenueDisconnected(detail) => write!(f, "venue disconnected: {}", detail),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillSwitchState {
    pub engaged: bool,
    pub reason: Option<KillReason>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

pub struct KillSwitch {
    engaged: AtomicBool,
    state: RwLock<KillSwitchState>,
    path: Option<PathBuf>,
    bus: Option<EventBus>,
    telemetry: Telemetry,
    cancel_orders: bool,
}

impl KillSwitch {
    /// Switch that lives only in memory
    pub fn in_memory() -> Self {
        Self {
            engaged: AtomicBool::new(false),
            state: RwLock::new(KillSwitchState::default()),
            path: None,
            bus: None,
            telemetry: Telemetry::disabled(),
            cancel_orders: true,
        }
    }

    /// Switch persisted at `path`, loading any earlier state
    pub fn load(path: &Path) -> Result<Self> {
        let state = match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str::<KillSwitchState>(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => KillSwitchState::default(),
            Err(e) => return Err(e.into()),
        };
        if state.engaged {
            warn!(
                reason = ?state.reason,
                triggered_at = ?state.triggered_at,
                "kill switch restored ENGAGED; operator clearance required"
            );
        }
        Ok(Self {
            engaged: AtomicBool::new(state.engaged),
            state: RwLock::new(state),
            path: Some(path.to_path_buf()),
            bus: None,
            telemetry: Telemetry::disabled(),
            cancel_orders: true,
        })
    }

    /// Announce state changes on the account topic
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Whether engaging should also cancel working orders
    pub fn with_cancel_orders(mut self, enabled: bool) -> Self {
        self.cancel_orders = enabled;
        self
    }

    pub fn cancel_orders_enabled(&self) -> bool {
        self.cancel_orders
    }

    /// Fast check used on every order
    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> KillSwitchState {
        self.state.read().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn reason_text(&self) -> String {
        self.state()
            .reason
            .map(|r| r.to_string())
            .unwrap_or_else(|| "unspecified".to_string())
    }

    /// Engage. Returns true only when this call changed the state.
    pub fn engage(&self, reason: KillReason) -> bool {
        if self.engaged.swap(true, Ordering::SeqCst) {
            return false;
        }

        let snapshot = {
            let mut state = match self.state.write() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            *state = KillSwitchState {
                engaged: true,
                reason: Some(reason.clone()),
                triggered_at: Some(Utc::now()),
                ..Default::default()
            };
            state.clone()
        };

        error!(%reason, "KILL SWITCH ENGAGED - new order submission halted");
        self.persist(&snapshot);
        self.announce(true, &reason.to_string());
        self.telemetry.error(
            "safety.kill_switch_engaged",
            serde_json::json!({ "reason": reason.to_string() }),
        );
        true
    }

    /// Operator clearance. Fails when the switch is not engaged.
    pub fn clear(&self, operator: &str, note: Option<&str>) -> Result<()> {
        if operator.trim().is_empty() {
            return Err(BulwarkError::Validation(
                "operator name is required to clear the kill switch".to_string(),
            ));
        }
        if !self.is_engaged() {
            return Err(BulwarkError::Validation(
                "kill switch is not engaged".to_string(),
            ));
        }

        let snapshot = {
            let mut state = match self.state.write() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.engaged = false;
            state.acknowledged_by = Some(operator.to_string());
            state.acknowledged_at = Some(Utc::now());
            state.note = note.map(str::to_string);
            state.clone()
        };
        self.engaged.store(false, Ordering::SeqCst);

        info!(operator, note = ?note, "kill switch cleared");
        self.persist(&snapshot);
        self.announce(false, &format!("cleared by {}", operator));
        self.telemetry.info(
            "safety.kill_switch_cleared",
            serde_json::json!({ "operator": operator, "note": note }),
        );
        Ok(())
    }

    fn persist(&self, state: &KillSwitchState) {
        let Some(path) = &self.path else {
            return;
        };
        let result = serde_json::to_string_pretty(state)
            .map_err(BulwarkError::from)
            .and_then(|body| {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, body).map_err(BulwarkError::from)
            });
        if let Err(e) = result {
            error!(path = %path.display(), error = %e, "failed to persist kill switch state");
        }
    }

    fn announce(&self, engaged: bool, reason: &str) {
        if let Some(bus) = &self.bus {
            bus.publish(AccountEvent::KillSwitch {
                engaged,
                reason: reason.to_string(),
            });
        }
    }

    /// Engage on venue disconnect notices from the diagnostic topic
    pub fn watch_venue(self: &Arc<Self>, bus: &EventBus) -> JoinHandle<()> {
        let switch = Arc::clone(self);
        bus.spawn_subscriber(Topic::Diagnostic, "kill-switch", move |event| {
            let switch = switch.clone();
            async move {
                if let BusEvent::Diagnostic(DiagnosticEvent::VenueConnectivity {
                    connected,
                    detail,
                    ..
                }) = event
                {
                    if connected {
                        if switch.is_engaged() {
                            warn!(%detail, "venue reconnected; kill switch stays engaged until cleared");
                        }
                    } else {
                        switch.engage(KillReason::VenueDisconnected(detail));
                    }
                }
                Ok(())
            }
        })
    }
}

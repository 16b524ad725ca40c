//! Structured telemetry events
//!
//! Components emit `{event_name, context}` records through a [`Telemetry`]
//! handle. Emission is a `try_send` into a bounded channel drained by a
//! forwarder task, so a slow or missing sink never stalls trading code; when
//! the channel is full the event is dropped and counted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DEFAULT_TELEMETRY_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_name: String,
    pub level: TelemetryLevel,
    pub context: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Destination for telemetry events. Called from the forwarder task only.
pub trait TelemetrySink: Send + Sync + 'static {
    fn emit(&self, event: &TelemetryEvent);
}

/// Writes events to the `tracing` pipeline under the `telemetry` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: &TelemetryEvent) {
        let context = event.context.to_string();
        match event.level {
            TelemetryLevel::Debug => {
                debug!(target: "telemetry", event = %event.event_name, %context)
            }
            TelemetryLevel::Info => {
                info!(target: "telemetry", event = %event.event_name, %context)
            }
            TelemetryLevel::Warning => {
                warn!(target: "telemetry", event = %event.event_name, %context)
            }
            TelemetryLevel::Error => {
                error!(target: "telemetry", event = %event.event_name, %context)
            }
        }
    }
}

/// Keeps every event in memory. Used by tests and local tooling.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<TelemetryEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn named(&self, event_name: &str) -> Vec<TelemetryEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_name == event_name)
            .collect()
    }
}

impl TelemetrySink for MemorySink {
    fn emit(&self, event: &TelemetryEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Cloneable emitter handle
#[derive(Clone)]
pub struct Telemetry {
    tx: Option<mpsc::Sender<TelemetryEvent>>,
    dropped: Arc<AtomicU64>,
}

impl Telemetry {
    /// Spawn the forwarder task feeding `sink`.
    ///
    /// The task exits once every `Telemetry` clone is dropped and the queue
    /// is drained, so awaiting the handle flushes outstanding events.
    pub fn spawn<S: TelemetrySink>(sink: S, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<TelemetryEvent>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink.emit(&event);
            }
        });
        (
            Self {
                tx: Some(tx),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            handle,
        )
    }

    /// Handle that discards everything
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn emit(&self, event_name: &str, level: TelemetryLevel, context: serde_json::Value) {
        let Some(tx) = &self.tx else {
            return;
        };
        let event = TelemetryEvent {
            event_name: event_name.to_string(),
            level,
            context,
            timestamp: Utc::now(),
        };
        if tx.try_send(event).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                warn!(dropped, event = event_name, "telemetry queue full, dropping events");
            }
        }
    }

    pub fn info(&self, event_name: &str, context: serde_json::Value) {
        self.emit(event_name, TelemetryLevel::Info, context);
    }

    pub fn warning(&self, event_name: &str, context: serde_json::Value) {
        self.emit(event_name, TelemetryLevel::Warning, context);
    }

    pub fn error(&self, event_name: &str, context: serde_json::Value) {
        self.emit(event_name, TelemetryLevel::Error, context);
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("enabled", &self.tx.is_some())
            .field("dropped", &self.dropped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_events_reach_sink_in_order() {
        let sink = MemorySink::new();
        let (telemetry, handle) = Telemetry::spawn(sink.clone(), 16);

        telemetry.info("risk.clipped", json!({"symbol": "AAPL"}));
        telemetry.warning("risk.rejected", json!({"symbol": "MSFT"}));
        drop(telemetry);
        handle.await.unwrap();

        let names: Vec<_> = sink.events().into_iter().map(|e| e.event_name).collect();
        assert_eq!(names, vec!["risk.clipped", "risk.rejected"]);
        assert_eq!(sink.named("risk.rejected")[0].level, TelemetryLevel::Warning);
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let telemetry = Telemetry {
            tx: Some(tx),
            dropped: Arc::new(AtomicU64::new(0)),
        };

        for _ in 0..5 {
            telemetry.info("coordinator.intent_decision", json!({}));
        }
        assert_eq!(telemetry.dropped(), 4);
    }

    #[test]
    fn test_disabled_is_silent() {
        let telemetry = Telemetry::disabled();
        telemetry.error("anything", json!({}));
        assert_eq!(telemetry.dropped(), 0);
    }
}

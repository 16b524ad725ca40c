#![allow(dead_code)]

use bulwark::bus::EventBus;
use bulwark::lifecycle::OrderGateway;
use bulwark::portfolio::{PortfolioHandle, PortfolioService, PortfolioState};
use bulwark::risk::RiskPipeline;
use bulwark::telemetry::Telemetry;
use bulwark::venue::{SimulatedVenue, SimulatedVenueConfig, Venue};
use rust_decimal_macros::dec;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Bus, simulated venue, live portfolio and a gateway over them
pub struct Harness {
    pub bus: EventBus,
    pub venue: Arc<SimulatedVenue>,
    pub portfolio: PortfolioHandle,
    pub gateway: OrderGateway,
    pub shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Harness {
    pub fn new(pipeline: RiskPipeline) -> Self {
        Self::with_venue_config(pipeline, SimulatedVenueConfig::default())
    }

    pub fn with_venue_config(pipeline: RiskPipeline, config: SimulatedVenueConfig) -> Self {
        let bus = EventBus::new();
        let venue = Arc::new(SimulatedVenue::with_config(bus.clone(), config));
        let (shutdown, _) = broadcast::channel(4);
        let (service, portfolio) = PortfolioService::new(
            &bus,
            PortfolioState::new(dec!(100000)),
            None,
            Duration::from_secs(60),
        );
        let tasks = vec![tokio::spawn(service.run(shutdown.subscribe()))];
        let gateway = OrderGateway::new(
            Arc::new(pipeline),
            venue.clone() as Arc<dyn Venue>,
            portfolio.clone(),
        )
        .with_telemetry(Telemetry::disabled());
        Self {
            bus,
            venue,
            portfolio,
            gateway,
            shutdown,
            tasks,
        }
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(task));
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        for task in self.tasks {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

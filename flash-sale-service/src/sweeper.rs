use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info};

use crate::service::FlashSaleService;
use crate::store::Store;

/// Background loop that returns expired holds to the pool and drops
/// idempotency records past their retention window.
pub struct Sweeper<S: Store> {
    service: Arc<FlashSaleService<S>>,
}

impl<S: Store> Sweeper<S> {
    pub fn new(service: Arc<FlashSaleService<S>>) -> Self {
        Self { service }
    }

    pub async fn run(&self) {
        let period = self.service.settings().sweep_interval.max(Duration::from_millis(1));
        let mut interval = time::interval(period);
        info!(interval_ms = period.as_millis() as u64, "Expired hold sweeper started");

        loop {
            interval.tick().await;
            self.sweep().await;
        }
    }

    /// One sweep pass. Failures are logged and the next tick tries again.
    pub async fn sweep(&self) {
        if let Err(e) = self.service.release_expired_holds().await {
            error!(error = %e, "Error releasing expired holds");
        }

        if let Err(e) = self.service.purge_expired_idempotency_records().await {
            error!(error = %e, "Error purging idempotency records");
        }
    }
}

use std::time::Duration;

/// Engine tunables. The binary fills these from command-line flags and
/// environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub hold_ttl: Duration,
    pub max_hold_quantity: i32,
    pub sweep_interval: Duration,
    pub sweep_batch_size: i64,
    pub idempotency_retention: Duration,
    pub transaction_attempts: u32,
    pub retry_backoff: Duration,
    pub lock_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            hold_ttl: Duration::from_secs(120),
            max_hold_quantity: 10,
            sweep_interval: Duration::from_secs(60),
            sweep_batch_size: 100,
            idempotency_retention: Duration::from_secs(7 * 24 * 60 * 60),
            transaction_attempts: 3,
            retry_backoff: Duration::from_millis(25),
            lock_timeout: Duration::from_secs(5),
        }
    }
}

impl Settings {
    pub fn hold_ttl(&self) -> chrono::Duration {
        to_chrono(self.hold_ttl)
    }

    pub fn idempotency_retention(&self) -> chrono::Duration {
        to_chrono(self.idempotency_retention)
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

//! Replay protection for settlement notifications.
//!
//! The first response computed for an idempotency key is stored in the same
//! transaction as the state change that produced it, and every later request
//! carrying that key gets the stored response back without running anything.

use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use sha2::{Digest, Sha256};
use shared::{IdempotencyRecord, SettlementPayload, SettlementResponse};
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::EngineResult;
use crate::store::IdempotencyRepository;

/// SHA-256 over the canonical JSON form of the payload. Object keys are
/// serialized in sorted order, so field order in the incoming request body
/// does not matter.
pub fn fingerprint(payload: &SettlementPayload) -> EngineResult<String> {
    let canonical = serde_json::to_vec(&serde_json::to_value(payload)?)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

#[derive(Debug, Clone, Copy)]
pub struct IdempotencyStore {
    retention: Duration,
}

impl IdempotencyStore {
    pub fn new(settings: &Settings) -> Self {
        Self {
            retention: settings.idempotency_retention(),
        }
    }

    /// Returns the response stored for `key`, or runs `work`, stores its
    /// response under `key` and returns it. Must run inside the same
    /// transaction as whatever `work` mutates.
    pub async fn process_once<T, F>(
        self,
        tx: &mut T,
        key: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
        work: F,
    ) -> EngineResult<SettlementResponse>
    where
        T: IdempotencyRepository + ?Sized,
        F: for<'t> FnOnce(&'t mut T) -> BoxFuture<'t, EngineResult<SettlementResponse>> + Send,
    {
        if let Some(existing) = tx.find_idempotency(key).await? {
            if existing.request_fingerprint != fingerprint {
                warn!(
                    idempotency_key = key,
                    stored = %existing.request_fingerprint,
                    received = fingerprint,
                    "Idempotency key reused with a different payload, replaying stored response"
                );
            }
            info!(idempotency_key = key, status = existing.response_status, "Idempotency key found, returning cached response");
            return Ok(existing.response());
        }

        let response = work(tx).await?;

        let record = IdempotencyRecord {
            key: key.to_string(),
            request_fingerprint: fingerprint.to_string(),
            response_body: response.body.clone(),
            response_status: response.status_code,
            expires_at: now + self.retention,
            created_at: now,
        };
        tx.insert_idempotency(&record).await?;

        Ok(response)
    }

    pub async fn purge_expired<T>(self, tx: &mut T, now: DateTime<Utc>) -> EngineResult<u64>
    where
        T: IdempotencyRepository + ?Sized,
    {
        Ok(tx.purge_idempotency(now).await?)
    }
}

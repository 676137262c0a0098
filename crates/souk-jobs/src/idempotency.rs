//! Idempotency guard.
//!
//! Converts "may run N times" into "runs once, observed N times". The first
//! caller to present a key creates an InProgress record with set-if-absent;
//! everyone else observes that record and must skip the protected operation.
//! Once the owner completes, later callers read the stored result instead.
//!
//! A crashed owner leaves its record InProgress until the TTL expires, after
//! which the key can be begun again. The TTL therefore bounds both the replay
//! protection window and the worst-case suppression of a lost attempt.
//!
//! [`begin`](IdempotencyGuard::begin) hands the owner an
//! [`IdempotencyClaim`]. Completing or abandoning through the claim only
//! touches the record the claim created, so an owner whose record expired
//! cannot overwrite or delete the record of whoever began the key next.

use crate::config::IdempotencyConfig;
use crate::error::JobResult;
use crate::keys::StoreKeys;
use crate::store::LockStore;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Record status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    InProgress,
    Completed,
}

/// Stored outcome of a keyed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub status: IdempotencyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub expires_at: DateTime<Utc>,
    /// Token of the caller that began the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl IdempotencyRecord {
    fn in_progress(ttl: Duration, owner: &str) -> Self {
        let now = Utc::now();
        Self {
            status: IdempotencyStatus::InProgress,
            result: None,
            expires_at: chrono::Duration::from_std(ttl)
                .ok()
                .and_then(|ttl| now.checked_add_signed(ttl))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            owner: Some(owner.to_string()),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == IdempotencyStatus::Completed
    }

    fn is_owned_by(&self, claim: &IdempotencyClaim) -> bool {
        self.owner.as_deref() == Some(claim.owner_token.as_str())
    }
}

/// Proof of having begun a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyClaim {
    pub key: String,
    pub owner_token: String,
}

/// What [`IdempotencyGuard::run_once`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotentOutcome<T> {
    /// This call ran the operation.
    Executed(T),
    /// An earlier call already completed; this is its result.
    Replayed(T),
    /// Another caller holds the key and has not completed yet.
    InFlight,
}

impl<T> IdempotentOutcome<T> {
    /// The result, whether computed now or replayed.
    pub fn into_value(self) -> Option<T> {
        match self {
            IdempotentOutcome::Executed(value) | IdempotentOutcome::Replayed(value) => Some(value),
            IdempotentOutcome::InFlight => None,
        }
    }

    pub fn was_executed(&self) -> bool {
        matches!(self, IdempotentOutcome::Executed(_))
    }
}

/// Records the outcome of uniquely keyed operations exactly once.
pub struct IdempotencyGuard {
    store: Arc<dyn LockStore>,
    keys: StoreKeys,
    default_ttl: Duration,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn LockStore>, keys: StoreKeys, config: &IdempotencyConfig) -> Self {
        Self {
            store,
            keys,
            default_ttl: config.default_ttl(),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Claims `key` for the caller. Only the caller that created the record
    /// gets `true`.
    pub async fn try_begin(&self, key: &str, ttl: Duration) -> JobResult<bool> {
        Ok(self.begin(key, ttl).await?.is_some())
    }

    /// Like [`try_begin`](Self::try_begin), returning the claim that
    /// [`complete_claim`](Self::complete_claim) and [`abandon`](Self::abandon)
    /// take.
    pub async fn begin(&self, key: &str, ttl: Duration) -> JobResult<Option<IdempotencyClaim>> {
        let owner_token = Uuid::new_v4().to_string();
        let record = serde_json::to_string(&IdempotencyRecord::in_progress(ttl, &owner_token))?;
        let begun = self
            .store
            .set_if_absent(&self.keys.idempotency(key), &record, ttl)
            .await?;
        debug!(key = %key, begun, "idempotency begin");
        Ok(begun.then(|| IdempotencyClaim {
            key: key.to_string(),
            owner_token,
        }))
    }

    /// Moves the InProgress record of `key` to Completed with `result`,
    /// keeping the remaining TTL.
    ///
    /// Returns false if the record expired or was already completed.
    pub async fn complete(&self, key: &str, result: Value) -> JobResult<bool> {
        self.complete_record(key, None, result).await
    }

    /// Completes the record `claim` created. Returns false if that record
    /// expired, even when someone else has begun the key since.
    pub async fn complete_claim(&self, claim: &IdempotencyClaim, result: Value) -> JobResult<bool> {
        self.complete_record(&claim.key, Some(claim), result).await
    }

    async fn complete_record(
        &self,
        key: &str,
        claim: Option<&IdempotencyClaim>,
        result: Value,
    ) -> JobResult<bool> {
        let store_key = self.keys.idempotency(key);
        let Some(raw) = self.store.get(&store_key).await? else {
            warn!(key = %key, "idempotency record expired before completion");
            return Ok(false);
        };

        let current: IdempotencyRecord = serde_json::from_str(&raw)?;
        if current.is_completed() {
            warn!(key = %key, "idempotency record already completed");
            return Ok(false);
        }
        if claim.is_some_and(|claim| !current.is_owned_by(claim)) {
            warn!(key = %key, "idempotency record was begun by another owner");
            return Ok(false);
        }

        let completed = IdempotencyRecord {
            status: IdempotencyStatus::Completed,
            result: Some(result),
            expires_at: current.expires_at,
            owner: current.owner,
        };
        let swapped = self
            .store
            .compare_and_swap(&store_key, &raw, &serde_json::to_string(&completed)?)
            .await?;
        Ok(swapped)
    }

    /// Result of a completed operation, `None` if absent or still in progress.
    pub async fn get_result(&self, key: &str) -> JobResult<Option<Value>> {
        Ok(self
            .get_record(key)
            .await?
            .filter(IdempotencyRecord::is_completed)
            .map(|record| record.result.unwrap_or(Value::Null)))
    }

    pub async fn get_record(&self, key: &str) -> JobResult<Option<IdempotencyRecord>> {
        match self.store.get(&self.keys.idempotency(key)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Deletes the InProgress record `claim` created so the operation can be
    /// attempted again.
    ///
    /// Completed records and records begun by another owner are never
    /// removed. Returns true if a record was deleted.
    pub async fn abandon(&self, claim: &IdempotencyClaim) -> JobResult<bool> {
        let store_key = self.keys.idempotency(&claim.key);
        let Some(raw) = self.store.get(&store_key).await? else {
            return Ok(false);
        };
        let record: IdempotencyRecord = serde_json::from_str(&raw)?;
        if record.is_completed() || !record.is_owned_by(claim) {
            return Ok(false);
        }
        self.store.compare_and_delete(&store_key, &raw).await
    }

    /// Runs `f` at most once per `key` within `ttl`.
    ///
    /// A failed `f` abandons the key so a later delivery can try again.
    pub async fn run_once<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        f: F,
    ) -> JobResult<IdempotentOutcome<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = JobResult<T>>,
    {
        let Some(claim) = self.begin(key, ttl).await? else {
            return match self.get_record(key).await? {
                Some(record) if record.is_completed() => {
                    let value = serde_json::from_value(record.result.unwrap_or(Value::Null))?;
                    Ok(IdempotentOutcome::Replayed(value))
                }
                _ => Ok(IdempotentOutcome::InFlight),
            };
        };

        match f().await {
            Ok(value) => {
                self.complete_claim(&claim, serde_json::to_value(&value)?)
                    .await?;
                Ok(IdempotentOutcome::Executed(value))
            }
            Err(err) => {
                if let Err(abandon_err) = self.abandon(&claim).await {
                    warn!(key = %key, error = %abandon_err, "failed to abandon idempotency key");
                }
                Err(err)
            }
        }
    }
}

use async_trait::async_trait;

use crate::records::{ErrorRecord, UsageRecord};
use crate::snapshot::StorageSnapshot;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Storage is used for:
/// - bootstrap (load_snapshot)
/// - admin mutations (writes only)
/// - recorder persistence (insert_usage / insert_error)
///
/// Runtime reads must NOT hit DB; they read from in-memory snapshots.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Entity-first schema sync (SeaORM 2.0). Enabled by default at bootstrap.
    async fn sync(&self) -> StorageResult<()>;

    async fn load_snapshot(&self) -> StorageResult<StorageSnapshot>;

    // Recorder path (append-only).
    async fn insert_usage(&self, record: &UsageRecord) -> StorageResult<i64>;
    async fn insert_error(&self, record: &ErrorRecord) -> StorageResult<i64>;

    // Admin mutations.
    async fn upsert_user(
        &self,
        id: i64,
        name: &str,
        balance_cents: i64,
        concurrency: i32,
        enabled: bool,
    ) -> StorageResult<()>;
    async fn set_user_transfer_overrides(
        &self,
        user_id: i64,
        ratio: Option<f64>,
        probability: Option<f64>,
    ) -> StorageResult<()>;
    async fn upsert_group(
        &self,
        id: i64,
        name: &str,
        transfer_ratio: f64,
        transfer_probability: f64,
    ) -> StorageResult<()>;
    async fn insert_api_key(
        &self,
        key_value: &str,
        user_id: i64,
        group_id: i64,
        label: Option<&str>,
    ) -> StorageResult<i64>;
    async fn set_api_key_enabled(&self, api_key_id: i64, enabled: bool) -> StorageResult<()>;
    async fn upsert_account(
        &self,
        id: i64,
        name: &str,
        group_id: i64,
        base_url: &str,
        credential: &str,
        max_concurrency: i32,
        supported_models: &[String],
        enabled: bool,
    ) -> StorageResult<()>;
    async fn set_account_healthy(&self, account_id: i64, healthy: bool) -> StorageResult<()>;
}

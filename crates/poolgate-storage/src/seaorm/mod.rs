use sea_orm::{
    ActiveModelTrait, ActiveValue, ConnectionTrait, Database, DatabaseBackend,
    DatabaseConnection, EntityTrait, Schema,
};
use async_trait::async_trait;
use time::OffsetDateTime;

use crate::entities;
use crate::records::{ErrorRecord, UsageRecord};
use crate::snapshot::{AccountRow, ApiKeyRow, GroupRow, StorageSnapshot, UserRow};
use crate::storage::{Storage, StorageResult};

#[derive(Clone)]
pub struct SeaOrmStorage {
    db: DatabaseConnection,
}

impl SeaOrmStorage {
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let db = Database::connect(dsn).await?;
        // Ensure sqlite enforces foreign keys (required for cascade + integrity).
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
        }
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

fn models_from_json(value: &serde_json::Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Storage for SeaOrmStorage {
    async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::Users)
            .register(entities::Groups)
            .register(entities::ApiKeys)
            .register(entities::Accounts)
            .register(entities::UsageLogs)
            .sync(&self.db)
            .await?;
        Ok(())
    }

    async fn load_snapshot(&self) -> StorageResult<StorageSnapshot> {
        let users = entities::Users::find().all(&self.db).await?;
        let users = users
            .into_iter()
            .map(|m| UserRow {
                id: m.id,
                name: m.name,
                balance_cents: m.balance_cents,
                concurrency: m.concurrency,
                cache_read_transfer_ratio: m.cache_read_transfer_ratio,
                cache_read_transfer_probability: m.cache_read_transfer_probability,
                subscription_expires_at: m.subscription_expires_at,
                enabled: m.enabled,
                created_at: m.created_at,
                updated_at: m.updated_at,
            })
            .collect();

        let groups = entities::Groups::find().all(&self.db).await?;
        let groups = groups
            .into_iter()
            .map(|m| GroupRow {
                id: m.id,
                name: m.name,
                cache_read_transfer_ratio: m.cache_read_transfer_ratio,
                cache_read_transfer_probability: m.cache_read_transfer_probability,
                updated_at: m.updated_at,
            })
            .collect();

        let api_keys = entities::ApiKeys::find().all(&self.db).await?;
        let api_keys = api_keys
            .into_iter()
            .map(|m| ApiKeyRow {
                id: m.id,
                key_value: m.key_value,
                user_id: m.user_id,
                group_id: m.group_id,
                label: m.label,
                enabled: m.enabled,
                created_at: m.created_at,
            })
            .collect();

        let accounts = entities::Accounts::find().all(&self.db).await?;
        let accounts = accounts
            .into_iter()
            .map(|m| AccountRow {
                id: m.id,
                name: m.name,
                group_id: m.group_id,
                base_url: m.base_url,
                credential: m.credential,
                enabled: m.enabled,
                healthy: m.healthy,
                max_concurrency: m.max_concurrency,
                supported_models: models_from_json(&m.supported_models),
                updated_at: m.updated_at,
            })
            .collect();

        Ok(StorageSnapshot {
            users,
            groups,
            api_keys,
            accounts,
        })
    }

    async fn insert_usage(&self, record: &UsageRecord) -> StorageResult<i64> {
        let now = OffsetDateTime::now_utc();
        let active = entities::usage_logs::ActiveModel {
            request_id: ActiveValue::Set(record.request_id.clone()),
            at: ActiveValue::Set(now),
            user_id: ActiveValue::Set(record.user_id),
            api_key_id: ActiveValue::Set(record.api_key_id),
            group_id: ActiveValue::Set(Some(record.group_id)),
            account_id: ActiveValue::Set(Some(record.account_id)),
            model: ActiveValue::Set(Some(record.model.clone())),
            stream: ActiveValue::Set(record.stream),
            user_agent: ActiveValue::Set(record.user_agent.clone()),
            client_ip: ActiveValue::Set(record.client_ip.clone()),
            duration_ms: ActiveValue::Set(record.duration_ms),
            is_error: ActiveValue::Set(false),
            input_tokens: ActiveValue::Set(Some(record.input_tokens)),
            output_tokens: ActiveValue::Set(Some(record.output_tokens)),
            cache_creation_input_tokens: ActiveValue::Set(Some(
                record.cache_creation_input_tokens,
            )),
            cache_read_input_tokens: ActiveValue::Set(Some(record.cache_read_input_tokens)),
            upstream_request_id: ActiveValue::Set(record.upstream_request_id.clone()),
            created_at: ActiveValue::Set(now),
            ..Default::default()
        };
        let inserted = entities::UsageLogs::insert(active).exec(&self.db).await?;
        Ok(inserted.last_insert_id)
    }

    async fn insert_error(&self, record: &ErrorRecord) -> StorageResult<i64> {
        let now = OffsetDateTime::now_utc();
        let active = entities::usage_logs::ActiveModel {
            request_id: ActiveValue::Set(record.request_id.clone()),
            at: ActiveValue::Set(now),
            user_id: ActiveValue::Set(record.user_id),
            api_key_id: ActiveValue::Set(record.api_key_id),
            group_id: ActiveValue::Set(record.group_id),
            account_id: ActiveValue::Set(record.account_id),
            model: ActiveValue::Set(record.model.clone()),
            stream: ActiveValue::Set(record.stream),
            user_agent: ActiveValue::Set(record.user_agent.clone()),
            client_ip: ActiveValue::Set(record.client_ip.clone()),
            duration_ms: ActiveValue::Set(record.duration_ms),
            is_error: ActiveValue::Set(true),
            error_type: ActiveValue::Set(Some(record.error_type.clone())),
            status_code: ActiveValue::Set(Some(record.status_code)),
            error_message: ActiveValue::Set(Some(record.error_message.clone())),
            error_body: ActiveValue::Set(Some(record.error_body.clone())),
            request_headers: ActiveValue::Set(Some(record.request_headers_json.clone())),
            upstream_status_code: ActiveValue::Set(record.upstream_status_code),
            upstream_error_message: ActiveValue::Set(record.upstream_error_message.clone()),
            sse_errors: ActiveValue::Set(record.sse_errors_json.clone()),
            created_at: ActiveValue::Set(now),
            ..Default::default()
        };
        let inserted = entities::UsageLogs::insert(active).exec(&self.db).await?;
        Ok(inserted.last_insert_id)
    }

    async fn upsert_user(
        &self,
        id: i64,
        name: &str,
        balance_cents: i64,
        concurrency: i32,
        enabled: bool,
    ) -> StorageResult<()> {
        let now = OffsetDateTime::now_utc();
        let existing = entities::Users::find_by_id(id).one(&self.db).await?;
        match existing {
            Some(model) => {
                let mut active: entities::users::ActiveModel = model.into();
                active.name = ActiveValue::Set(name.to_string());
                active.balance_cents = ActiveValue::Set(balance_cents);
                active.concurrency = ActiveValue::Set(concurrency);
                active.enabled = ActiveValue::Set(enabled);
                active.updated_at = ActiveValue::Set(now);
                active.update(&self.db).await?;
            }
            None => {
                let active = entities::users::ActiveModel {
                    id: ActiveValue::Set(id),
                    name: ActiveValue::Set(name.to_string()),
                    balance_cents: ActiveValue::Set(balance_cents),
                    concurrency: ActiveValue::Set(concurrency),
                    cache_read_transfer_ratio: ActiveValue::Set(None),
                    cache_read_transfer_probability: ActiveValue::Set(None),
                    subscription_expires_at: ActiveValue::Set(None),
                    enabled: ActiveValue::Set(enabled),
                    created_at: ActiveValue::Set(now),
                    updated_at: ActiveValue::Set(now),
                    ..Default::default()
                };
                entities::Users::insert(active).exec(&self.db).await?;
            }
        }
        Ok(())
    }

    async fn set_user_transfer_overrides(
        &self,
        user_id: i64,
        ratio: Option<f64>,
        probability: Option<f64>,
    ) -> StorageResult<()> {
        let Some(model) = entities::Users::find_by_id(user_id).one(&self.db).await? else {
            return Ok(());
        };
        let mut active: entities::users::ActiveModel = model.into();
        active.cache_read_transfer_ratio = ActiveValue::Set(ratio);
        active.cache_read_transfer_probability = ActiveValue::Set(probability);
        active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        active.update(&self.db).await?;
        Ok(())
    }

    async fn upsert_group(
        &self,
        id: i64,
        name: &str,
        transfer_ratio: f64,
        transfer_probability: f64,
    ) -> StorageResult<()> {
        let now = OffsetDateTime::now_utc();
        let existing = entities::Groups::find_by_id(id).one(&self.db).await?;
        match existing {
            Some(model) => {
                let mut active: entities::groups::ActiveModel = model.into();
                active.name = ActiveValue::Set(name.to_string());
                active.cache_read_transfer_ratio = ActiveValue::Set(transfer_ratio);
                active.cache_read_transfer_probability = ActiveValue::Set(transfer_probability);
                active.updated_at = ActiveValue::Set(now);
                active.update(&self.db).await?;
            }
            None => {
                let active = entities::groups::ActiveModel {
                    id: ActiveValue::Set(id),
                    name: ActiveValue::Set(name.to_string()),
                    cache_read_transfer_ratio: ActiveValue::Set(transfer_ratio),
                    cache_read_transfer_probability: ActiveValue::Set(transfer_probability),
                    created_at: ActiveValue::Set(now),
                    updated_at: ActiveValue::Set(now),
                    ..Default::default()
                };
                entities::Groups::insert(active).exec(&self.db).await?;
            }
        }
        Ok(())
    }

    async fn insert_api_key(
        &self,
        key_value: &str,
        user_id: i64,
        group_id: i64,
        label: Option<&str>,
    ) -> StorageResult<i64> {
        let now = OffsetDateTime::now_utc();
        let active = entities::api_keys::ActiveModel {
            key_value: ActiveValue::Set(key_value.to_string()),
            user_id: ActiveValue::Set(user_id),
            group_id: ActiveValue::Set(group_id),
            label: ActiveValue::Set(label.map(|s| s.to_string())),
            enabled: ActiveValue::Set(true),
            created_at: ActiveValue::Set(now),
            last_used_at: ActiveValue::Set(None),
            ..Default::default()
        };
        let inserted = entities::ApiKeys::insert(active).exec(&self.db).await?;
        Ok(inserted.last_insert_id)
    }

    async fn set_api_key_enabled(&self, api_key_id: i64, enabled: bool) -> StorageResult<()> {
        let Some(model) = entities::ApiKeys::find_by_id(api_key_id).one(&self.db).await? else {
            return Ok(());
        };
        let mut active: entities::api_keys::ActiveModel = model.into();
        active.enabled = ActiveValue::Set(enabled);
        active.update(&self.db).await?;
        Ok(())
    }

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
    ) -> StorageResult<()> {
        let now = OffsetDateTime::now_utc();
        let models = serde_json::to_value(supported_models)?;
        let existing = entities::Accounts::find_by_id(id).one(&self.db).await?;
        match existing {
            Some(model) => {
                let mut active: entities::accounts::ActiveModel = model.into();
                active.name = ActiveValue::Set(name.to_string());
                active.group_id = ActiveValue::Set(group_id);
                active.base_url = ActiveValue::Set(base_url.to_string());
                active.credential = ActiveValue::Set(credential.to_string());
                active.max_concurrency = ActiveValue::Set(max_concurrency);
                active.supported_models = ActiveValue::Set(models);
                active.enabled = ActiveValue::Set(enabled);
                active.updated_at = ActiveValue::Set(now);
                active.update(&self.db).await?;
            }
            None => {
                let active = entities::accounts::ActiveModel {
                    id: ActiveValue::Set(id),
                    name: ActiveValue::Set(name.to_string()),
                    group_id: ActiveValue::Set(group_id),
                    base_url: ActiveValue::Set(base_url.to_string()),
                    credential: ActiveValue::Set(credential.to_string()),
                    enabled: ActiveValue::Set(enabled),
                    healthy: ActiveValue::Set(true),
                    max_concurrency: ActiveValue::Set(max_concurrency),
                    supported_models: ActiveValue::Set(models),
                    created_at: ActiveValue::Set(now),
                    updated_at: ActiveValue::Set(now),
                    ..Default::default()
                };
                entities::Accounts::insert(active).exec(&self.db).await?;
            }
        }
        Ok(())
    }

    async fn set_account_healthy(&self, account_id: i64, healthy: bool) -> StorageResult<()> {
        let Some(model) = entities::Accounts::find_by_id(account_id).one(&self.db).await? else {
            return Ok(());
        };
        let mut active: entities::accounts::ActiveModel = model.into();
        active.healthy = ActiveValue::Set(healthy);
        active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        active.update(&self.db).await?;
        Ok(())
    }
}

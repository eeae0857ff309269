use time::OffsetDateTime;

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub name: String,
    pub balance_cents: i64,
    pub concurrency: i32,
    pub cache_read_transfer_ratio: Option<f64>,
    pub cache_read_transfer_probability: Option<f64>,
    pub subscription_expires_at: Option<OffsetDateTime>,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct GroupRow {
    pub id: i64,
    pub name: String,
    pub cache_read_transfer_ratio: f64,
    pub cache_read_transfer_probability: f64,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct ApiKeyRow {
    pub id: i64,
    pub key_value: String,
    pub user_id: i64,
    pub group_id: i64,
    pub label: Option<String>,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct AccountRow {
    pub id: i64,
    pub name: String,
    pub group_id: i64,
    pub base_url: String,
    pub credential: String,
    pub enabled: bool,
    pub healthy: bool,
    pub max_concurrency: i32,
    pub supported_models: Vec<String>,
    pub updated_at: OffsetDateTime,
}

/// Everything the gateway needs in memory at bootstrap. Runtime reads never
/// hit the database; only the recorder writes back.
#[derive(Debug, Clone, Default)]
pub struct StorageSnapshot {
    pub users: Vec<UserRow>,
    pub groups: Vec<GroupRow>,
    pub api_keys: Vec<ApiKeyRow>,
    pub accounts: Vec<AccountRow>,
}

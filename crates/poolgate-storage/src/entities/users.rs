use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    /// Monetary balance kept in cents (two-decimal precision).
    pub balance_cents: i64,
    pub concurrency: i32,
    pub cache_read_transfer_ratio: Option<f64>,
    pub cache_read_transfer_probability: Option<f64>,
    /// Active plan expiry; a live subscription bypasses the balance check.
    pub subscription_expires_at: Option<OffsetDateTime>,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(has_many)]
    pub api_keys: HasMany<super::api_keys::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}

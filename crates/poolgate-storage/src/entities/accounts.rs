use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "accounts")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    pub group_id: i64,
    pub base_url: String,
    /// Upstream credential secret (bearer token or api key).
    pub credential: String,
    pub enabled: bool,
    pub healthy: bool,
    pub max_concurrency: i32,
    /// JSON array of model names; empty means every model is accepted.
    pub supported_models: Json,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "group_id", to = "id", on_delete = "Cascade")]
    pub group: HasOne<super::groups::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}

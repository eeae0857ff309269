use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// One row per finished request. Success rows carry the billed usage tuple;
/// error rows (`is_error = true`) carry the error fields instead. Users are
/// never deleted while referenced here, hence the restricting FK.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "usage_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "usage_log_request_id")]
    pub request_id: String,
    pub at: OffsetDateTime,
    pub user_id: i64,
    pub api_key_id: i64,
    pub group_id: Option<i64>,
    pub account_id: Option<i64>,
    pub model: Option<String>,
    pub stream: bool,
    pub user_agent: Option<String>,
    pub client_ip: Option<String>,
    pub duration_ms: i64,

    pub is_error: bool,

    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cache_creation_input_tokens: Option<i64>,
    pub cache_read_input_tokens: Option<i64>,
    pub upstream_request_id: Option<String>,

    pub error_type: Option<String>,
    pub status_code: Option<i32>,
    pub error_message: Option<String>,
    pub error_body: Option<String>,
    /// Whitelisted request headers as JSON (Authorization truncated).
    pub request_headers: Option<String>,
    pub upstream_status_code: Option<i32>,
    pub upstream_error_message: Option<String>,
    /// JSON array of SSE error event payloads observed mid-stream.
    pub sse_errors: Option<String>,

    pub created_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "user_id", to = "id", on_delete = "Restrict")]
    pub user: HasOne<super::users::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}

/// Billed usage for one successful request, post cache transfer. The tuple
/// here must be bit-identical to what was written into the response body.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub request_id: String,
    pub user_id: i64,
    pub api_key_id: i64,
    pub group_id: i64,
    pub account_id: i64,
    pub model: String,
    pub stream: bool,
    pub user_agent: Option<String>,
    pub client_ip: Option<String>,
    pub duration_ms: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cache_read_input_tokens: i64,
    pub upstream_request_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub request_id: String,
    pub user_id: i64,
    pub api_key_id: i64,
    pub group_id: Option<i64>,
    pub account_id: Option<i64>,
    pub model: Option<String>,
    pub stream: bool,
    pub user_agent: Option<String>,
    pub client_ip: Option<String>,
    pub duration_ms: i64,
    pub error_type: String,
    pub status_code: i32,
    pub error_message: String,
    pub error_body: String,
    /// Whitelisted request headers as JSON (Authorization truncated).
    pub request_headers_json: String,
    pub upstream_status_code: Option<i32>,
    pub upstream_error_message: Option<String>,
    /// JSON array of SSE error event payloads, when the failure happened
    /// mid-stream.
    pub sse_errors_json: Option<String>,
}

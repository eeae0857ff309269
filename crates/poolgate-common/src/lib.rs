use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GatewayConfigError {
    #[error("missing required gateway config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged gateway configuration used by the running process.
///
/// Merge order: CLI > ENV > defaults (clap applies CLI > ENV per field).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Database DSN used for this process.
    pub dsn: String,
    /// Max account switches per request before failover is exhausted.
    pub max_account_switches: u32,
    /// Heartbeat interval while a streaming client waits on a slot. 0 = disabled.
    pub ping_interval_secs: u64,
    /// How long a request may wait for an account slot.
    pub slot_wait_timeout_secs: u64,
    /// Inbound request body cap.
    pub body_max_bytes: usize,
    pub upstream_connect_timeout_secs: u64,
    pub upstream_request_timeout_secs: u64,
    pub upstream_stream_idle_timeout_secs: u64,
    /// Sticky session binding lifetime.
    pub sticky_ttl_secs: u64,
    /// Default `instructions` injected for non-CLI callers of the Responses endpoint.
    pub responses_default_instructions: Option<String>,
}

/// Request headers captured into error logs. Authorization is truncated before storage.
pub const ERROR_CAPTURE_HEADER_WHITELIST: &[&str] = &[
    "Content-Type",
    "Accept",
    "X-Request-ID",
    "X-Forwarded-For",
    "X-Real-IP",
    "Authorization",
    "OpenAI-Beta",
];

/// Optional layer used for merging gateway config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dsn: Option<String>,
    pub max_account_switches: Option<u32>,
    pub ping_interval_secs: Option<u64>,
    pub slot_wait_timeout_secs: Option<u64>,
    pub body_max_bytes: Option<usize>,
    pub upstream_connect_timeout_secs: Option<u64>,
    pub upstream_request_timeout_secs: Option<u64>,
    pub upstream_stream_idle_timeout_secs: Option<u64>,
    pub sticky_ttl_secs: Option<u64>,
    pub responses_default_instructions: Option<String>,
}

impl GatewayConfigPatch {
    pub fn overlay(&mut self, other: GatewayConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.dsn.is_some() {
            self.dsn = other.dsn;
        }
        if other.max_account_switches.is_some() {
            self.max_account_switches = other.max_account_switches;
        }
        if other.ping_interval_secs.is_some() {
            self.ping_interval_secs = other.ping_interval_secs;
        }
        if other.slot_wait_timeout_secs.is_some() {
            self.slot_wait_timeout_secs = other.slot_wait_timeout_secs;
        }
        if other.body_max_bytes.is_some() {
            self.body_max_bytes = other.body_max_bytes;
        }
        if other.upstream_connect_timeout_secs.is_some() {
            self.upstream_connect_timeout_secs = other.upstream_connect_timeout_secs;
        }
        if other.upstream_request_timeout_secs.is_some() {
            self.upstream_request_timeout_secs = other.upstream_request_timeout_secs;
        }
        if other.upstream_stream_idle_timeout_secs.is_some() {
            self.upstream_stream_idle_timeout_secs = other.upstream_stream_idle_timeout_secs;
        }
        if other.sticky_ttl_secs.is_some() {
            self.sticky_ttl_secs = other.sticky_ttl_secs;
        }
        if other.responses_default_instructions.is_some() {
            self.responses_default_instructions = other.responses_default_instructions;
        }
    }

    pub fn into_config(self) -> Result<GatewayConfig, GatewayConfigError> {
        Ok(GatewayConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8686),
            dsn: self.dsn.ok_or(GatewayConfigError::MissingField("dsn"))?,
            max_account_switches: self.max_account_switches.unwrap_or(3),
            ping_interval_secs: self.ping_interval_secs.unwrap_or(0),
            slot_wait_timeout_secs: self.slot_wait_timeout_secs.unwrap_or(60),
            body_max_bytes: self.body_max_bytes.unwrap_or(10 * 1024 * 1024),
            upstream_connect_timeout_secs: self.upstream_connect_timeout_secs.unwrap_or(5),
            upstream_request_timeout_secs: self.upstream_request_timeout_secs.unwrap_or(600),
            upstream_stream_idle_timeout_secs: self
                .upstream_stream_idle_timeout_secs
                .unwrap_or(30),
            sticky_ttl_secs: self.sticky_ttl_secs.unwrap_or(3600),
            responses_default_instructions: self.responses_default_instructions,
        })
    }
}

impl From<GatewayConfig> for GatewayConfigPatch {
    fn from(value: GatewayConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            dsn: Some(value.dsn),
            max_account_switches: Some(value.max_account_switches),
            ping_interval_secs: Some(value.ping_interval_secs),
            slot_wait_timeout_secs: Some(value.slot_wait_timeout_secs),
            body_max_bytes: Some(value.body_max_bytes),
            upstream_connect_timeout_secs: Some(value.upstream_connect_timeout_secs),
            upstream_request_timeout_secs: Some(value.upstream_request_timeout_secs),
            upstream_stream_idle_timeout_secs: Some(value.upstream_stream_idle_timeout_secs),
            sticky_ttl_secs: Some(value.sticky_ttl_secs),
            responses_default_instructions: value.responses_default_instructions,
        }
    }
}

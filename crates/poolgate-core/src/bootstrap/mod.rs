use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use poolgate_common::{GatewayConfig, GatewayConfigPatch};
use poolgate_storage::{SeaOrmStorage, Storage};

use crate::auth::{AuthSnapshot, MemoryAuth};
use crate::core::Core;
use crate::registry::PoolRegistry;
use crate::upstream_client::{UpstreamClientConfig, WreqUpstreamClient};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "poolgate",
    version,
    about = "API gateway multiplexing user keys onto a pool of upstream LLM accounts"
)]
pub struct CliArgs {
    /// Database DSN (users, groups, accounts, usage logs).
    #[arg(
        long,
        env = "POOLGATE_DSN",
        default_value = "sqlite://poolgate.db?mode=rwc"
    )]
    pub dsn: String,

    /// Bind host.
    #[arg(long, env = "POOLGATE_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "POOLGATE_PORT")]
    pub port: Option<u16>,

    /// Max account switches per request before failover is exhausted.
    #[arg(long, env = "POOLGATE_MAX_ACCOUNT_SWITCHES")]
    pub max_account_switches: Option<u32>,

    /// Heartbeat interval (seconds) for streaming clients waiting on a slot.
    /// 0 disables heartbeats.
    #[arg(long, env = "POOLGATE_PING_INTERVAL_SECS")]
    pub ping_interval_secs: Option<u64>,

    /// How long a request may wait for a slot (seconds).
    #[arg(long, env = "POOLGATE_SLOT_WAIT_TIMEOUT_SECS")]
    pub slot_wait_timeout_secs: Option<u64>,

    /// Inbound request body cap in bytes.
    #[arg(long, env = "POOLGATE_BODY_MAX_BYTES")]
    pub body_max_bytes: Option<usize>,

    #[arg(long, env = "POOLGATE_UPSTREAM_CONNECT_TIMEOUT_SECS")]
    pub upstream_connect_timeout_secs: Option<u64>,

    #[arg(long, env = "POOLGATE_UPSTREAM_REQUEST_TIMEOUT_SECS")]
    pub upstream_request_timeout_secs: Option<u64>,

    #[arg(long, env = "POOLGATE_UPSTREAM_STREAM_IDLE_TIMEOUT_SECS")]
    pub upstream_stream_idle_timeout_secs: Option<u64>,

    /// Sticky session binding lifetime in seconds.
    #[arg(long, env = "POOLGATE_STICKY_TTL_SECS")]
    pub sticky_ttl_secs: Option<u64>,

    /// Default `instructions` injected for non-CLI callers of the Responses
    /// endpoint.
    #[arg(long, env = "POOLGATE_RESPONSES_DEFAULT_INSTRUCTIONS")]
    pub responses_default_instructions: Option<String>,
}

impl CliArgs {
    fn into_patch(self) -> GatewayConfigPatch {
        GatewayConfigPatch {
            host: self.host,
            port: self.port,
            dsn: Some(self.dsn),
            max_account_switches: self.max_account_switches,
            ping_interval_secs: self.ping_interval_secs,
            slot_wait_timeout_secs: self.slot_wait_timeout_secs,
            body_max_bytes: self.body_max_bytes,
            upstream_connect_timeout_secs: self.upstream_connect_timeout_secs,
            upstream_request_timeout_secs: self.upstream_request_timeout_secs,
            upstream_stream_idle_timeout_secs: self.upstream_stream_idle_timeout_secs,
            sticky_ttl_secs: self.sticky_ttl_secs,
            responses_default_instructions: self.responses_default_instructions,
        }
    }
}

pub struct Bootstrap {
    pub storage: Arc<SeaOrmStorage>,
    pub core: Core,
    pub config: GatewayConfig,
}

pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    let args = CliArgs::parse();
    bootstrap(args).await
}

pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    // clap already applied CLI > ENV precedence per field; overlay on defaults.
    let config: GatewayConfig = args
        .into_patch()
        .into_config()
        .context("finalize gateway config")?;

    let storage = Arc::new(
        SeaOrmStorage::connect(&config.dsn)
            .await
            .context("connect storage")?,
    );
    storage.sync().await.context("schema sync")?;

    let snapshot = storage.load_snapshot().await.context("load snapshot")?;
    let auth = Arc::new(MemoryAuth::new(AuthSnapshot::from_storage(&snapshot)));
    let registry = PoolRegistry::from_snapshot(&snapshot);

    let upstream = Arc::new(
        WreqUpstreamClient::new(UpstreamClientConfig::from_gateway(&config))
            .context("build upstream client")?,
    );

    let core = Core::new(
        config.clone(),
        auth,
        registry,
        upstream,
        storage.clone() as Arc<dyn Storage>,
    );

    Ok(Bootstrap {
        storage,
        core,
        config,
    })
}

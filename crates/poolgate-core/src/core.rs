use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::routing::post;
use axum::Router;

use poolgate_common::GatewayConfig;
use poolgate_storage::Storage;

use crate::auth::AuthProvider;
use crate::concurrency::SlotController;
use crate::handler::{anthropic_messages, openai_responses};
use crate::registry::PoolRegistry;
use crate::sticky::StickyStore;
use crate::upstream_client::UpstreamClient;

pub struct CoreState {
    pub config: ArcSwap<GatewayConfig>,
    pub auth: Arc<dyn AuthProvider>,
    pub registry: PoolRegistry,
    pub slots: SlotController,
    pub sticky: StickyStore,
    pub upstream: Arc<dyn UpstreamClient>,
    pub storage: Arc<dyn Storage>,
}

pub struct Core {
    state: Arc<CoreState>,
}

impl Core {
    pub fn new(
        config: GatewayConfig,
        auth: Arc<dyn AuthProvider>,
        registry: PoolRegistry,
        upstream: Arc<dyn UpstreamClient>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let sticky = StickyStore::new(Duration::from_secs(config.sticky_ttl_secs));
        Self {
            state: Arc::new(CoreState {
                config: ArcSwap::from_pointee(config),
                auth,
                registry,
                slots: SlotController::new(),
                sticky,
                upstream,
                storage,
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/openai/v1/responses", post(openai_responses))
            .route("/v1/messages", post(anthropic_messages))
            .with_state(self.state.clone())
    }

    pub fn state(&self) -> Arc<CoreState> {
        self.state.clone()
    }
}

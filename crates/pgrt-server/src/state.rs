use std::sync::Arc;

use crate::config::ServerConfig;
use crate::hub::Hub;
use crate::router::EventRouter;
use crate::subscription::SubscriptionTable;

/// Application state shared across all routes
#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub router: EventRouter,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Start a hub for this config and wrap it with a router.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: ServerConfig) -> Self {
        let hub = Hub::start(Arc::new(SubscriptionTable::new()), config.outbound_capacity);
        Self {
            router: EventRouter::new(hub.clone()),
            hub,
            config: Arc::new(config),
        }
    }
}

pub mod accounts;
pub mod config;
pub mod identity;
pub mod ipc;
pub mod mdns;
pub mod pairing;
pub mod storage;

use std::sync::Arc;

use config::GatewayConfig;
use ipc::event::EventBroadcaster;
use storage::Storage;

/// Shared application state passed to every RPC handler.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<GatewayConfig>,
    pub storage: Arc<Storage>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub started_at: std::time::Instant,
    /// Stable machine identity (SHA-256 of platform hardware ID).
    pub gateway_id: String,
}

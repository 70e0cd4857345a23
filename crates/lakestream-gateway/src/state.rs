//! Application state and configuration.

use std::sync::Arc;

use crate::gateway::Gateway;

/// HTTP surface configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Server bind address.
    /// Default: "0.0.0.0:8080"
    pub bind_addr: String,

    /// Largest accepted request body.
    /// Default: 1 MB
    pub max_body_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            max_body_bytes: 1024 * 1024,
        }
    }
}

/// Shared application state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub config: Arc<GatewayConfig>,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>, config: GatewayConfig) -> Self {
        Self {
            gateway,
            config: Arc::new(config),
        }
    }
}

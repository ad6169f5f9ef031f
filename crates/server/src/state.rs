//! Application state shared across handlers.

use crate::auth::AuthChain;
use irobot_core::config::AppConfig;
use irobot_precache::Precache;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// The precache manager.
    pub precache: Precache,
    /// Ordered authentication chain; empty means open access.
    pub auth: Arc<AuthChain>,
}

impl AppState {
    /// Create a new application state.
    ///
    /// # Panics
    ///
    /// Panics if the configuration fails validation; `main` validates before
    /// building state, so this guards programming errors only.
    pub fn new(config: AppConfig, precache: Precache, auth: AuthChain) -> Self {
        if let Err(error) = config.validate() {
            panic!("invalid configuration: {error}");
        }
        Self {
            config: Arc::new(config),
            precache,
            auth: Arc::new(auth),
        }
    }
}

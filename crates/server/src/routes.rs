//! Route configuration.

use crate::auth::auth_middleware;
use crate::handlers;
use crate::state::AppState;
use axum::Router;
use axum::middleware;
use axum::routing::get;
use tower_http::trace::TraceLayer;

/// Create the application router.
///
/// The admin endpoints are fixed routes; every other path names a data
/// object on the upstream, so the data-object handler is the fallback.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/status",
            get(handlers::status).options(handlers::admin_options),
        )
        .route(
            "/config",
            get(handlers::config_echo).options(handlers::admin_options),
        )
        .route(
            "/manifest",
            get(handlers::manifest).options(handlers::admin_options),
        )
        .fallback(handlers::data_object)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

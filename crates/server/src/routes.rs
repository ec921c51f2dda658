//! Route configuration.

use crate::auth::{admin_auth_middleware, trace_middleware};
use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::middleware;
use axum::routing::{delete, get, post, put};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let public_routes = Router::new()
        // Health check (intentionally unauthenticated for load balancers/k8s probes)
        .route("/v1/health", get(handlers::health_check))
        .route("/v1/vaults/{key}/status", get(handlers::vault_status))
        .route("/v1/vaults/{key}/progress", get(handlers::vault_progress))
        .route("/v1/vaults/{key}/manifest", get(handlers::vault_manifest));

    let admin_routes = Router::new()
        .route("/v1/admin/vaults/popular", get(handlers::popular_vaults))
        .route(
            "/v1/admin/vaults/{key}",
            get(handlers::get_vault_info).delete(handlers::delete_vault),
        )
        .route("/v1/admin/users", post(handlers::create_user))
        .route("/v1/admin/users/{user_id}", get(handlers::get_user))
        .route(
            "/v1/admin/users/{user_id}/quota",
            put(handlers::set_user_quota),
        )
        .route(
            "/v1/admin/users/{user_id}/vaults",
            post(handlers::add_user_vault),
        )
        .route(
            "/v1/admin/users/{user_id}/vaults/{key}",
            delete(handlers::remove_user_vault),
        )
        .route("/v1/admin/jobs/{job}", post(handlers::run_job))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ));

    let mut router = Router::new().merge(public_routes).merge(admin_routes);

    // SECURITY: When enabled, this endpoint MUST be network-restricted
    // to authorized Prometheus scraper IPs only.
    // See crate::metrics module documentation for details.
    if state.config.server.metrics_enabled {
        let metrics_routes = Router::new().route("/metrics", get(metrics_handler));
        router = router.merge(metrics_routes);
    }

    // Order of execution: TraceLayer -> trace id span -> (admin auth) -> Handler
    router
        .layer(middleware::from_fn(trace_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

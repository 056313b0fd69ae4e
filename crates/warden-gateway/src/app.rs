use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::auth::auth_middleware;
use crate::handlers::{execute, health, invalidate, stats};
use crate::metrics::{metrics_handler, track_requests};
use crate::state::AppState;

pub fn build_app(st: AppState) -> Router {
    // Routes that require auth
    let authed_routes = Router::new()
        .route("/execute", post(execute))
        .route("/stats", get(stats))
        .route("/cache/invalidate", post(invalidate))
        .layer(middleware::from_fn_with_state(
            st.clone(),
            auth_middleware::<AppState>,
        ));

    // Routes that do NOT require auth (health/metrics)
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler));

    public_routes
        .merge(authed_routes)
        .layer(middleware::from_fn_with_state(st.clone(), track_requests))
        .with_state(st)
}

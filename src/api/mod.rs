mod handlers;
pub mod middleware;

use axum::{
    http::HeaderValue,
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::db::Database;
use middleware::{auth_middleware, rate_limit_middleware, SecurityConfig};

/// Router with authentication, rate limiting and CORS disabled.
pub fn create_router(db: Database) -> Router {
    create_router_with_security(db, SecurityConfig::disabled())
}

pub fn create_router_with_security(db: Database, security: SecurityConfig) -> Router {
    let mut api = Router::new()
        // Manifests
        .route(
            "/manifests",
            get(handlers::list_manifests).post(handlers::create_manifest),
        )
        .route(
            "/manifests/{id}",
            get(handlers::get_manifest)
                .put(handlers::update_manifest)
                .delete(handlers::delete_manifest),
        )
        // Releases
        .route(
            "/manifests/{id}/releases",
            get(handlers::list_releases).post(handlers::create_release),
        )
        .route(
            "/manifests/{id}/releases/latest",
            get(handlers::get_latest_release),
        )
        .route(
            "/manifests/{id}/releases/{version}",
            get(handlers::get_release),
        )
        // Forks and followers
        .route("/manifests/{id}/fork", post(handlers::fork_manifest))
        .route(
            "/manifests/{id}/followers",
            get(handlers::list_followers).post(handlers::add_follower),
        )
        .route("/manifests/{id}/unfollow", post(handlers::unfollow))
        .route("/manifests/{id}/sync", post(handlers::sync_follower))
        .layer(from_fn_with_state(security.clone(), auth_middleware));

    if let Some(limiter) = security.rate_limiter.clone() {
        api = api.layer(from_fn_with_state(limiter, rate_limit_middleware));
    }

    // Health stays reachable without credentials
    let api = api.route("/health", get(handlers::health));

    Router::new()
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&security))
        .with_state(db)
}

fn cors_layer(security: &SecurityConfig) -> CorsLayer {
    match &security.cors_origins {
        Some(origins) => {
            let origins: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|o| match o.parse() {
                    Ok(value) => Some(value),
                    Err(_) => {
                        tracing::warn!("Ignoring invalid CORS origin: {}", o);
                        None
                    }
                })
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
        None => CorsLayer::permissive(),
    }
}

pub mod error;
mod handlers;
pub mod middleware;
pub mod rate_limit;

use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::HeaderValue,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer};
use tracing::warn;

use crate::{
    application::compile::CompilationService,
    config::{AppEnvironment, CorsOrigins, CorsSettings},
};

pub use rate_limit::RateLimiter;

pub const RATE_LIMITED_METRIC: &str = "latex_http_rate_limited_total";

pub const COMPILE_ROUTE: &str = "/v1/compiler/tex_file/";

#[derive(Clone)]
pub struct HttpState {
    pub service: Arc<CompilationService>,
    pub rate_limiter: Arc<RateLimiter>,
    pub environment: AppEnvironment,
}

pub fn build_router(state: HttpState, body_limit: usize, cors: &CorsSettings) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::health_check))
        .route(COMPILE_ROUTE, post(handlers::compile_tex_file))
        .route(
            COMPILE_ROUTE.trim_end_matches('/'),
            post(handlers::compile_tex_file),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(from_fn_with_state(state.clone(), middleware::rate_limit))
        .layer(from_fn(middleware::log_responses))
        .layer(from_fn(middleware::set_request_context))
        .layer(cors_layer(cors))
        .with_state(state)
}

fn cors_layer(settings: &CorsSettings) -> CorsLayer {
    match &settings.origins {
        CorsOrigins::Any => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
        CorsOrigins::List(origins) => {
            let origins: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|origin| match HeaderValue::from_str(origin) {
                    Ok(value) => Some(value),
                    Err(err) => {
                        warn!(
                            target = "latex_compiler::http::cors",
                            origin = %origin,
                            error = %err,
                            "Ignoring invalid CORS origin"
                        );
                        None
                    }
                })
                .collect();
            // Credentials cannot be combined with wildcards, so mirror the request instead.
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(AllowMethods::mirror_request())
                .allow_headers(AllowHeaders::mirror_request())
                .allow_credentials(true)
        }
    }
}

use std::time::Duration;

use axum::Router;
use axum::error_handling::HandleErrorLayer;
use axum::routing::{get, post};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use super::handlers;
use super::state::AppState;

/// Upper bound on request handling, including any upstream IdP round
/// trip. A hung Keycloak request should not hold a connection forever.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// The axum router implementing the §6.1 HTTP surface plus the
/// supplemented health endpoint.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/validate-token", get(handlers::validate_token))
        .route("/refresh-token-id", get(handlers::refresh_token_id))
        .route("/access-token", get(handlers::access_token))
        .route("/offline-consent", post(handlers::offline_consent))
        .route("/offline-callback", get(handlers::offline_callback))
        .route(
            "/offline-token-id",
            get(handlers::get_offline_token_id)
                .post(handlers::post_offline_token_id)
                .delete(handlers::delete_offline_token_id),
        )
        .route("/invalidate", post(handlers::invalidate))
        .fallback(handlers::not_found)
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handlers::timeout_error))
                .timeout(REQUEST_TIMEOUT)
                .layer(TraceLayer::new_for_http()),
        )
        .with_state(state)
}

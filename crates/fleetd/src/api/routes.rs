//! Router construction.

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::auth::CurrentUser;
use super::handlers;
use super::state::AppState;
use crate::events::subscribe_handler;

pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    let api = Router::new()
        .route("/v1/events/subscribe", get(subscribe_handler))
        .route("/v1/events/unsubscribe", post(handlers::unsubscribe))
        .route("/v1/events/stats", get(handlers::event_stats))
        .route("/v1/orchestrator/hosts", get(handlers::list_hosts))
        .route("/v1/orchestrator/hosts/{host_id}", get(handlers::get_host))
        .route("/v1/orchestrator/refresh", post(handlers::refresh))
        .route(
            "/v1/orchestrator/hosts/{host_id}/machines/{vm_id}",
            axum::routing::delete(handlers::delete_vm),
        )
        .route(
            "/v1/orchestrator/hosts/{host_id}/machines/{vm_id}/{action}",
            post(handlers::vm_action),
        )
        .route(
            "/v1/orchestrator/hosts/{host_id}/catalog/cache",
            get(handlers::catalog_cache).delete(handlers::delete_catalog_cache),
        );

    let api = if state.dev_mode {
        let admin = CurrentUser::dev_admin();
        api.layer(middleware::from_fn(
            move |mut req: axum::http::Request<axum::body::Body>, next: middleware::Next| {
                let admin = admin.clone();
                async move {
                    req.extensions_mut().insert(admin);
                    next.run(req).await
                }
            },
        ))
    } else {
        api
    };

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api)
        .layer(trace_layer)
        .with_state(state)
}

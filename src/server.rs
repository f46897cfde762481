//! HTTP server and routes.

mod handlers;
mod state;

pub use state::AppState;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let body_limit = state.config.server.max_upload_mb.saturating_mul(1024 * 1024);

    let opds_routes = Router::new()
        .route("/", get(handlers::opds_root))
        .route("/search", get(handlers::opds_search))
        .route("/opensearch.xml", get(handlers::opensearch));

    let book_routes = Router::new()
        .route("/", get(handlers::book_list))
        .route("/upload", post(handlers::book_upload))
        .route("/batch", post(handlers::book_batch))
        .route("/import", post(handlers::book_import))
        .route("/{id}", get(handlers::book_metadata))
        .route("/{id}/download", get(handlers::book_download))
        .route("/{id}/cover", get(handlers::book_cover))
        .route(
            "/{id}/status",
            get(handlers::book_status_get).put(handlers::book_status_put),
        )
        .layer(DefaultBodyLimit::max(body_limit));

    let auth_routes = Router::new()
        .route("/login", post(handlers::auth_login))
        .route("/register", post(handlers::auth_register))
        .route("/logout", post(handlers::auth_logout))
        .route("/me", get(handlers::auth_me));

    Router::new()
        .nest("/opds", opds_routes)
        .nest("/api/books", book_routes)
        .nest("/api/auth", auth_routes)
        .route("/api/jobs", get(handlers::job_list))
        .route("/api/stats", get(handlers::api_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

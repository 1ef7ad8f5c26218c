pub mod handlers;
pub mod ws;

use std::sync::Arc;

use axum::{
    routing::{get, patch, post},
    Router,
};

pub use handlers::AppState;

/// Ingest and delivery control-plane routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        // Upload session lifecycle
        .route("/uploads", post(handlers::create_upload))
        .route("/uploads/:id/refresh-urls", post(handlers::refresh_urls))
        .route(
            "/uploads/:id/part-checksums",
            patch(handlers::register_part_checksums),
        )
        .route("/uploads/:id/complete", post(handlers::complete_upload))
        .route("/uploads/:id/abort", post(handlers::abort_upload))
        .route("/uploads/:id/status", get(handlers::upload_status))
        // Video catalogue
        .route("/videos", get(handlers::list_videos))
        .route(
            "/videos/:id",
            get(handlers::get_video).delete(handlers::delete_video),
        )
        // Status fan-out
        .route("/ws", get(ws::ws_handler))
        // Health check
        .route("/healthz", get(handlers::health))
}

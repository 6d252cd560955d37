//! HTTP server and routes.

mod handlers;
mod state;

pub use handlers::{DEVICE_HEADER, READER_HEADER};
pub use state::AppState;

use axum::{
    Router,
    routing::{delete, get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let book_routes = Router::new()
        .route("/{book_id}/chapters", post(handlers::retry_chapters))
        .route(
            "/{book_id}/chapters/{chapter_number}",
            get(handlers::get_chapter),
        )
        .route("/{book_id}/prefetch", post(handlers::prefetch));

    let api_routes = Router::new()
        .route("/manuscripts", post(handlers::upload_manuscript))
        .route("/history", get(handlers::get_history))
        .route("/history/{book_id}", delete(handlers::forget_history))
        .nest("/books", book_routes);

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

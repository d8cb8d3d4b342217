//! Transit — direct file-transfer relay.
//!
//! Pairs a sender to a receiver under a transfer ID and streams bytes
//! through a bounded in-memory queue. No payload is ever written to disk.

pub mod error;
pub mod html;
pub mod http;
pub mod metadata;
pub mod store;
pub mod transfer;
pub mod ws;

use axum::{
    routing::{get, put},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

pub use http::AppState;
pub use store::{Store, StoreConfig};

/// Assembles the full route table. `static_dir` backs the `/` fallback
/// (spec §6's "Static files mounted at `/`"); `disable_legacy_receive`
/// toggles the deprecated `/receive/<uid>` WebSocket endpoint (spec §9).
pub fn build_router(state: AppState, static_dir: &str, disable_legacy_receive: bool) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let mut app = Router::new()
        .route("/health", get(http::health))
        .route("/robots.txt", get(http::robots))
        .route("/send/:uid", get(ws::send_handler))
        .route("/:uid/:filename", put(http::put_upload))
        .route("/:uid", get(http::get_download))
        .route("/:uid/", get(http::get_download));

    if !disable_legacy_receive {
        app = app.route("/receive/:uid", get(ws::receive_handler));
    }

    app.fallback_service(ServeDir::new(static_dir))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

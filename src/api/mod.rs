//! REST API for the streaming gateway
//!
//! Exposes the stable NZB surface:
//! - `POST /usenet/nzb/parse` — parse an uploaded NZB without persisting
//! - `POST /usenet/nzb/upload` — persist an NZB and queue inspection
//! - `GET /usenet/nzb` — list persisted records
//! - `DELETE /usenet/nzb/{id}` — remove a record and its cached blob
//! - `POST /usenet/nzb/{id}/requeue` — re-run inspection
//! - `GET /usenet/nzb/{id}/xml` — the raw NZB document
//! - `GET /usenet/nzb/{id}/download/{path...}` — stream content; the
//!   path segments joined with `::` form the content path, and HTTP
//!   Range is honoured through the seekable stream

pub mod error_response;
pub mod routes;
pub mod state;

pub use state::AppState;

use axum::{
    Json, Router,
    routing::{delete, get, post},
};
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;

/// OpenAPI document for the NZB endpoints
#[derive(OpenApi)]
#[openapi(
    info(
        title = "nzb-streamer",
        description = "On-demand streaming gateway for Usenet content"
    ),
    components(schemas(
        routes::NzbParseResponse,
        routes::NzbFileResponse,
        routes::NzbSegmentResponse,
        routes::NzbResponse,
        routes::QueueItemResponse,
        crate::types::ContentFile,
        crate::types::FileType,
        crate::error::ApiError,
        crate::error::ErrorDetail,
    ))
)]
pub struct ApiDoc;

/// Build the API router over the shared state
pub fn create_router(state: AppState) -> Router {
    // The framework default body cap is far below a realistic NZB
    let body_limit = axum::extract::DefaultBodyLimit::max(
        usize::try_from(state.config.fetch.nzb_file_max_size).unwrap_or(usize::MAX),
    );

    Router::new()
        .route("/usenet/nzb/parse", post(routes::parse_nzb))
        .route("/usenet/nzb/upload", post(routes::upload_nzb))
        .route("/usenet/nzb", get(routes::list_nzbs))
        .route("/usenet/nzb/:id", delete(routes::delete_nzb))
        .route("/usenet/nzb/:id/requeue", post(routes::requeue_nzb))
        .route("/usenet/nzb/:id/xml", get(routes::get_nzb_xml))
        .route(
            "/usenet/nzb/:id/download/*path",
            get(routes::download_content),
        )
        .route(
            "/usenet/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .layer(body_limit)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

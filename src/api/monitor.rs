//! The embedded monitor page.

use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use rust_embed::RustEmbed;

/// Static dashboard assets compiled into the binary.
#[derive(RustEmbed)]
#[folder = "dashboard/"]
struct DashboardAssets;

/// GET /llmhealth-monitor - the HTML monitor page.
pub async fn page() -> Response {
    match DashboardAssets::get("monitor.html") {
        Some(content) => match std::str::from_utf8(&content.data) {
            Ok(html) => Html(html.to_string()).into_response(),
            Err(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Invalid HTML encoding").into_response()
            }
        },
        None => (StatusCode::INTERNAL_SERVER_ERROR, "Monitor page not found").into_response(),
    }
}

/// GET /favicon.ico - nothing to see, and nothing to proxy either.
pub async fn favicon() -> StatusCode {
    StatusCode::NO_CONTENT
}

use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use rust_embed::Embed;

/// Browser-side assets shipped inside the binary.
#[derive(Embed)]
#[folder = "assets/"]
struct ClientAssets;

/// Path of the hot-reload script, relative to the asset mount point.
pub const CLIENT_SCRIPT: &str = "hot-reload.js";

pub async fn client_asset(uri: axum::http::Uri) -> impl IntoResponse {
    let path = uri.path().trim_start_matches('/');

    match ClientAssets::get(path) {
        Some(content) => {
            let mime = mime_guess::from_path(path).first_or_text_plain().to_string();
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, mime),
                    (header::CACHE_CONTROL, "no-cache".to_string()),
                ],
                content.data.to_vec(),
            )
                .into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

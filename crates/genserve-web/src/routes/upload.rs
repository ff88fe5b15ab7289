// Raw-body file upload into the upload directory.

use std::path::Path;

use genserve_types::current_timestamp_secs;
use hyper::{Body, Request, Response};
use log::{error, info};
use serde_json::json;

use crate::request_parsing::get_query_param;
use crate::response_helpers::{api_error, api_ok, CODE_BAD_REQUEST, CODE_SERVER_ERROR};
use crate::SharedState;

const ALLOWED_IMAGE_TYPES: [&str; 4] = ["png", "jpg", "jpeg", "gif"];
const ALLOWED_VIDEO_TYPES: [&str; 4] = ["mp4", "avi", "mov", "mkv"];

/// Lowercased extension of `filename` if it is an accepted media type.
pub fn allowed_extension(filename: &str) -> Option<String> {
    let (_, ext) = filename.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    (ALLOWED_IMAGE_TYPES.contains(&ext.as_str()) || ALLOWED_VIDEO_TYPES.contains(&ext.as_str()))
        .then_some(ext)
}

/// `{ts}_{8 hex}.{ext}`
pub fn unique_file_name(timestamp: i64, ext: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{timestamp}_{}.{ext}", &id[..8])
}

pub async fn handle(req: Request<Body>, state: SharedState) -> Response<Body> {
    let Some(filename) = get_query_param(req.uri(), "filename").filter(|f| !f.is_empty()) else {
        return api_error(CODE_BAD_REQUEST, "filename query parameter is required");
    };
    let Some(ext) = allowed_extension(&filename) else {
        return api_error(
            CODE_BAD_REQUEST,
            "unsupported file type; images (png, jpg, jpeg, gif) and videos (mp4, avi, mov, mkv) only",
        );
    };

    let bytes = match hyper::body::to_bytes(req.into_body()).await {
        Ok(bytes) if !bytes.is_empty() => bytes,
        Ok(_) => return api_error(CODE_BAD_REQUEST, "empty upload"),
        Err(_) => return api_error(CODE_BAD_REQUEST, "failed to read request body"),
    };

    let timestamp = current_timestamp_secs();
    let stored = unique_file_name(timestamp, &ext);
    let dir = state.config.upload_dir.clone();
    let path = dir.join(&stored);

    if let Err(e) = write_upload(&dir, &path, &bytes).await {
        error!("[API] failed to save upload {filename}: {e}");
        return api_error(CODE_SERVER_ERROR, format!("failed to save file: {e}"));
    }
    info!("[API] uploaded {filename} -> {stored} ({} bytes)", bytes.len());

    api_ok(
        "file uploaded",
        json!({
            "file_path": path.to_string_lossy(),
            "file_name": stored,
            "file_size": bytes.len(),
            "upload_time": timestamp,
        }),
    )
}

async fn write_upload(dir: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(path, bytes).await
}

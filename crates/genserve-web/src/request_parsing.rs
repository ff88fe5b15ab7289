// Request parsing utilities for HTTP handlers

use hyper::{Body, Response, Uri};
use log::debug;
use serde::de::DeserializeOwned;

use crate::response_helpers::{api_error, CODE_BAD_REQUEST};

/// Parse a JSON request body into a typed structure, or a ready-made error
/// response.
pub async fn parse_json_body<T: DeserializeOwned>(body: Body) -> Result<T, Response<Body>> {
    let bytes = hyper::body::to_bytes(body)
        .await
        .map_err(|_| api_error(CODE_BAD_REQUEST, "failed to read request body"))?;

    serde_json::from_slice::<T>(&bytes).map_err(|e| {
        debug!("[API] rejected JSON body: {e}");
        api_error(CODE_BAD_REQUEST, format!("invalid JSON body: {e}"))
    })
}

/// Extract a URL-decoded query parameter.
pub fn get_query_param(uri: &Uri, key: &str) -> Option<String> {
    let query = uri.query()?;

    for param in query.split('&') {
        let (param_key, param_value) = param.split_once('=').unwrap_or((param, ""));
        if param_key == key {
            return urlencoding::decode(param_value).ok().map(|s| s.into_owned());
        }
    }

    None
}

/// The path segment after `prefix`, if it is a single non-empty segment.
pub fn path_id<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    path.strip_prefix(prefix)
        .filter(|rest| !rest.is_empty() && !rest.contains('/'))
}

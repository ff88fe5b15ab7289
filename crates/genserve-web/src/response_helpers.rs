// HTTP response helpers. Every API answer is HTTP 200 carrying a
// `{code, msg, data}` envelope; `code` is the business status.

use genserve_types::GenError;
use hyper::{Body, Response, StatusCode};
use serde::Serialize;
use serde_json::Value;

/// Standard CORS headers
const CORS_ORIGIN: &str = "*";
const CORS_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";
const CORS_HEADERS: &str = "content-type, authorization";

pub const CODE_OK: u16 = 200;
pub const CODE_BAD_REQUEST: u16 = 400;
pub const CODE_UNAUTHORIZED: u16 = 401;
pub const CODE_NOT_FOUND: u16 = 404;
pub const CODE_SERVER_ERROR: u16 = 500;

#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub code: u16,
    pub msg: String,
    pub data: Option<T>,
}

fn with_cors(builder: hyper::http::response::Builder) -> hyper::http::response::Builder {
    builder
        .header("access-control-allow-origin", CORS_ORIGIN)
        .header("access-control-allow-methods", CORS_METHODS)
        .header("access-control-allow-headers", CORS_HEADERS)
}

/// Build a JSON response with CORS headers
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let json = serde_json::to_string(body)
        .unwrap_or_else(|_| r#"{"code":500,"msg":"serialization failed","data":null}"#.to_string());
    let mut response = Response::new(Body::from(json));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert("content-type", hyper::header::HeaderValue::from_static("application/json"));
    for (name, value) in [
        ("access-control-allow-origin", CORS_ORIGIN),
        ("access-control-allow-methods", CORS_METHODS),
        ("access-control-allow-headers", CORS_HEADERS),
    ] {
        headers.insert(name, hyper::header::HeaderValue::from_static(value));
    }
    response
}

pub fn api_ok<T: Serialize>(msg: &str, data: T) -> Response<Body> {
    json_response(
        StatusCode::OK,
        &Envelope {
            code: CODE_OK,
            msg: msg.to_string(),
            data: Some(data),
        },
    )
}

pub fn api_error(code: u16, msg: impl Into<String>) -> Response<Body> {
    json_response(
        StatusCode::OK,
        &Envelope::<Value> {
            code,
            msg: msg.into(),
            data: None,
        },
    )
}

/// Validation problems are the caller's fault; everything else is ours.
pub fn api_gen_error(context: &str, err: &GenError) -> Response<Body> {
    match err {
        GenError::Validation(msg) => api_error(CODE_BAD_REQUEST, msg.clone()),
        other => {
            log::error!("[API] {context}: {other}");
            api_error(CODE_SERVER_ERROR, format!("{context}: {other}"))
        }
    }
}

/// CORS preflight response
pub fn cors_preflight() -> Response<Body> {
    with_cors(Response::builder().status(StatusCode::OK))
        .body(Body::empty())
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

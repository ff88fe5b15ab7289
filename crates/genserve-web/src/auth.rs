// Password login and bearer-token checks.

use hyper::{header, Body, Request, Response};
use log::{info, warn};
use serde::Deserialize;
use serde_json::json;

use crate::request_parsing::parse_json_body;
use crate::response_helpers::{
    api_error, api_gen_error, api_ok, CODE_BAD_REQUEST, CODE_UNAUTHORIZED,
};
use crate::SharedState;

#[derive(Deserialize)]
struct LoginRequest {
    password: Option<String>,
}

pub async fn login(req: Request<Body>, state: SharedState) -> Response<Body> {
    let body: LoginRequest = match parse_json_body(req.into_body()).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    let Some(password) = body.password else {
        warn!("[API] login request without a password");
        return api_error(CODE_BAD_REQUEST, "password is required");
    };
    if password != state.config.login_password {
        warn!("[API] login rejected: wrong password");
        return api_error(CODE_UNAUTHORIZED, "invalid password");
    }
    match state.sessions.create() {
        Ok(token) => {
            info!("[API] login succeeded");
            api_ok("login succeeded", json!({ "token": token }))
        }
        Err(e) => api_gen_error("login", &e),
    }
}

/// `Authorization: Bearer <token>` value, if present.
pub fn bearer_token(req: &Request<Body>) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// `Err` carries the response to send instead of running the handler.
pub fn authorize(req: &Request<Body>, state: &SharedState) -> Result<(), Response<Body>> {
    let Some(token) = bearer_token(req) else {
        return Err(api_error(CODE_UNAUTHORIZED, "missing bearer token"));
    };
    match state.sessions.is_valid(token) {
        Ok(true) => Ok(()),
        Ok(false) => Err(api_error(CODE_UNAUTHORIZED, "invalid token")),
        Err(e) => Err(api_gen_error("verify token", &e)),
    }
}

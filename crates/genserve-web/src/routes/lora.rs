// LoRA catalog endpoint

use genserve_config::CATALOG_FILE_NAME;
use hyper::{Body, Response};

use crate::response_helpers::{api_error, api_ok, CODE_NOT_FOUND};
use crate::SharedState;

pub fn config(state: &SharedState) -> Response<Body> {
    let raw = state.catalog.raw();
    if raw.is_null() {
        return api_error(CODE_NOT_FOUND, format!("{CATALOG_FILE_NAME} is not configured"));
    }
    api_ok("LoRA config", raw.clone())
}

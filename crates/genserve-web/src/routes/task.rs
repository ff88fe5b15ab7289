// Task query, list, requeue and delete.

use genserve_types::TaskStatus;
use hyper::{Body, Request, Response};
use serde_json::json;

use crate::request_parsing::get_query_param;
use crate::response_helpers::{api_error, api_gen_error, api_ok, CODE_BAD_REQUEST, CODE_NOT_FOUND};
use crate::SharedState;

const DEFAULT_PAGE_SIZE: usize = 10;

pub fn list(req: &Request<Body>, state: &SharedState) -> Response<Body> {
    let uri = req.uri();
    let page = get_query_param(uri, "page")
        .and_then(|p| p.parse::<usize>().ok())
        .unwrap_or(1);
    let page_size = get_query_param(uri, "page_size")
        .and_then(|p| p.parse::<usize>().ok())
        .unwrap_or(DEFAULT_PAGE_SIZE);
    let status = match get_query_param(uri, "status").filter(|s| !s.is_empty()) {
        None => None,
        Some(raw) => match raw.parse::<TaskStatus>() {
            Ok(status) => Some(status),
            Err(e) => return api_error(CODE_BAD_REQUEST, e.to_string()),
        },
    };

    match state.tasks.get_task_list(page, page_size, status) {
        Ok(page) => api_ok("task list", page),
        Err(e) => api_gen_error("list tasks", &e),
    }
}

pub fn detail(state: &SharedState, task_id: &str) -> Response<Body> {
    match state.tasks.get_task(task_id) {
        Ok(Some(task)) => api_ok("task detail", task),
        Ok(None) => api_error(CODE_NOT_FOUND, "task not found"),
        Err(e) => api_gen_error("get task", &e),
    }
}

pub fn requeue(state: &SharedState, task_id: &str) -> Response<Body> {
    match state.tasks.requeue_task(task_id) {
        Ok(true) => api_ok("task requeued", json!({ "task_id": task_id })),
        Ok(false) => api_error(CODE_NOT_FOUND, "task not found"),
        Err(e) => api_gen_error("requeue task", &e),
    }
}

pub fn delete(state: &SharedState, task_id: &str) -> Response<Body> {
    match state.tasks.delete_task(task_id) {
        Ok(true) => api_ok("task deleted", json!({ "task_id": task_id })),
        Ok(false) => api_error(CODE_NOT_FOUND, "task not found"),
        Err(e) => api_gen_error("delete task", &e),
    }
}

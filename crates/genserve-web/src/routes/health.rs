// Health check and model status route handlers

use hyper::{Body, Response};
use serde_json::json;

use crate::response_helpers::api_ok;
use crate::SharedState;

pub fn health() -> Response<Body> {
    api_ok("service is up", json!({ "status": "ok", "service": "genserve" }))
}

/// Scheduler introspection. Without an in-process dispatcher only the queue
/// depth is known.
pub fn model_status(state: &SharedState) -> Response<Body> {
    let queued = state
        .tasks
        .queue()
        .message_count(state.tasks.queue_name())
        .ok();

    let Some(scheduler) = &state.scheduler else {
        return api_ok(
            "model status",
            json!({ "scheduler": null, "queued": queued }),
        );
    };

    api_ok(
        "model status",
        json!({
            "scheduler": {
                "current": scheduler.get_current_model(),
                "stats": scheduler.stats(),
                "gpu": scheduler.gpu_memory(),
                "host": scheduler.host_memory(),
            },
            "queued": queued,
        }),
    )
}

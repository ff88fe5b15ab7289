//! HTTP API for the generation service.
//!
//! Clients submit generation tasks, poll their results and manage the task
//! list. Everything is answered with HTTP 200 and a `{code, msg, data}`
//! envelope; every `/api/*` route except login and health needs a bearer
//! token from `/api/auth/login`.

pub mod auth;
pub mod request_parsing;
pub mod response_helpers;
pub mod routes;

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use genserve_config::{AppConfig, LoraCatalog};
use genserve_db::{SessionStore, TaskManager};
use genserve_types::{TaskFamily, TaskType};
use genserve_worker::ModelScheduler;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server};
use log::{debug, info};

use request_parsing::path_id;
use response_helpers::{api_error, cors_preflight, CODE_NOT_FOUND};

/// Everything the handlers share.
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub tasks: Arc<TaskManager>,
    pub catalog: Arc<LoraCatalog>,
    pub sessions: SessionStore,
    /// Present when the dispatcher runs in this process.
    pub scheduler: Option<Arc<ModelScheduler>>,
}

pub type SharedState = Arc<AppState>;

pub async fn handle_request(
    req: Request<Body>,
    state: SharedState,
) -> std::result::Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!("[API] {method} {path}");

    if method == Method::OPTIONS {
        return Ok(cors_preflight());
    }

    // public routes
    match (&method, path.as_str()) {
        (&Method::GET, "/api/health") => return Ok(routes::health::health()),
        (&Method::POST, "/api/auth/login") => return Ok(auth::login(req, state).await),
        _ => {}
    }

    if let Err(response) = auth::authorize(&req, &state) {
        return Ok(response);
    }

    let response = match (&method, path.as_str()) {
        (&Method::POST, "/api/image/text2img") => {
            routes::generate::create(req, state, TaskType::Text2Img).await
        }
        (&Method::POST, "/api/image/img2img") => {
            routes::generate::create(req, state, TaskType::Img2Img).await
        }
        (&Method::POST, "/api/video/text2video") => {
            routes::generate::create(req, state, TaskType::Text2Video).await
        }
        (&Method::POST, "/api/video/img2video") => {
            routes::generate::create(req, state, TaskType::Img2Video).await
        }
        (&Method::GET, p) if path_id(p, "/api/image/result/").is_some() => {
            let id = path_id(p, "/api/image/result/").unwrap_or_default();
            routes::generate::result(&state, TaskFamily::Image, id)
        }
        (&Method::GET, p) if path_id(p, "/api/video/result/").is_some() => {
            let id = path_id(p, "/api/video/result/").unwrap_or_default();
            routes::generate::result(&state, TaskFamily::Video, id)
        }
        (&Method::GET, "/api/task/list") => routes::task::list(&req, &state),
        (&Method::POST, p) if p.starts_with("/api/task/") && p.ends_with("/requeue") => {
            match p
                .strip_suffix("/requeue")
                .and_then(|rest| path_id(rest, "/api/task/"))
            {
                Some(id) => routes::task::requeue(&state, id),
                None => api_error(CODE_NOT_FOUND, "route not found"),
            }
        }
        (&Method::GET, p) if path_id(p, "/api/task/").is_some() => {
            routes::task::detail(&state, path_id(p, "/api/task/").unwrap_or_default())
        }
        (&Method::DELETE, p) if path_id(p, "/api/task/").is_some() => {
            routes::task::delete(&state, path_id(p, "/api/task/").unwrap_or_default())
        }
        (&Method::GET, "/api/lora/config") => routes::lora::config(&state),
        (&Method::POST, "/api/upload") => routes::upload::handle(req, state).await,
        (&Method::GET, "/api/model/status") => routes::health::model_status(&state),
        _ => api_error(CODE_NOT_FOUND, format!("no route for {method} {path}")),
    };
    Ok(response)
}

/// Serve the API on `addr` until `shutdown` resolves.
pub async fn serve<F>(state: SharedState, addr: SocketAddr, shutdown: F) -> hyper::Result<()>
where
    F: Future<Output = ()>,
{
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle_request(req, state.clone())))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    info!("[API] listening on http://{addr}");
    server.with_graceful_shutdown(shutdown).await
}

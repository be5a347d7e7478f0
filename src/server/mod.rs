//! HTTP and WebSocket front door
//!
//! A warp filter tree over the registry, the engine handle and the
//! subscriber hub: printer management under `/api`, live updates on `/ws`,
//! and the built frontend for everything else.

pub mod browser;
mod handlers;
mod ws;

use std::convert::Infallible;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::engine::EngineHandle;
use crate::hub::SubscriberHub;
use crate::registry::{DeviceRegistry, RegistryError};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    Internal(String),

    #[error("Failed to bind {0}: {1}")]
    Bind(SocketAddr, String),
}

impl ServerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ServerError::Internal(_) | ServerError::Bind(..) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RegistryError> for ServerError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(_) => ServerError::NotFound("Printer not found".to_string()),
            RegistryError::AlreadyExists(_) => {
                ServerError::BadRequest("Printer already exists".to_string())
            }
            RegistryError::InvalidId(_) => ServerError::BadRequest("Missing printer ID".to_string()),
            other => ServerError::Internal(other.to_string()),
        }
    }
}

impl warp::reject::Reject for ServerError {}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    /// Directory holding the built frontend (`index.html` and `static/`).
    pub frontend_dir: PathBuf,
    pub allowed_origins: Vec<String>,
    /// Open the dashboard in the default browser once listening.
    pub open_browser: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8000,
            frontend_dir: PathBuf::from("frontend/build"),
            allowed_origins: vec![
                "http://localhost:5173".to_string(),
                "http://127.0.0.1:5173".to_string(),
            ],
            open_browser: false,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Everything a request handler can reach.
#[derive(Clone)]
pub struct ServerState {
    pub registry: Arc<DeviceRegistry>,
    pub hub: Arc<SubscriberHub>,
    pub engine: EngineHandle,
}

fn with_state(
    state: ServerState,
) -> impl Filter<Extract = (ServerState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// The full filter tree, CORS and error mapping included.
pub fn routes(
    state: ServerState,
    config: &ServerConfig,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let origins: Vec<&str> = config
        .allowed_origins
        .iter()
        .map(String::as_str)
        .filter(|origin| {
            let valid = origin.contains("://");
            if !valid {
                log::warn!("Ignoring malformed CORS origin {:?}", origin);
            }
            valid
        })
        .collect();
    let cors = warp::cors()
        .allow_origins(origins)
        .allow_credentials(true)
        .allow_headers(vec!["content-type", "authorization", "accept"])
        .allow_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"]);

    let api = warp::path("api");
    let printers = api.and(warp::path("printers"));

    let api_status = api
        .and(warp::path("status"))
        .and(warp::path::end())
        .and(warp::get())
        .map(|| warp::reply::json(&serde_json::json!({ "ok": true })));

    let list_printers = printers
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handlers::list_printers);

    let add_printer = printers
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handlers::add_printer);

    let remove_printer = printers
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::delete())
        .and(with_state(state.clone()))
        .and_then(handlers::remove_printer);

    let printer_status = printers
        .and(warp::path::param::<String>())
        .and(warp::path("status"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handlers::printer_status);

    let filament_info = printers
        .and(warp::path::param::<String>())
        .and(warp::path("filamentinfo"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handlers::filament_info);

    let control = printers
        .and(warp::path::param::<String>())
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::post())
        .and(with_state(state.clone()))
        .and_then(handlers::perform_action);

    let hub = Arc::clone(&state.hub);
    let live = warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .map(move |upgrade: warp::ws::Ws| {
            let hub = Arc::clone(&hub);
            upgrade.on_upgrade(move |socket| ws::session(socket, hub))
        });

    let static_files = warp::path("static").and(warp::fs::dir(config.frontend_dir.join("static")));

    let index = config.frontend_dir.join("index.html");
    let frontend = warp::get()
        .and(warp::any().map(move || index.clone()))
        .and_then(handlers::frontend);

    api_status
        .or(list_printers)
        .or(add_printer)
        .or(remove_printer)
        .or(printer_status)
        .or(filament_info)
        .or(control)
        .or(live)
        .or(static_files)
        .or(frontend)
        .recover(handle_rejection)
        .with(cors)
}

/// Map every rejection to a JSON `{"detail": ...}` body.
async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (code, detail) = if let Some(e) = err.find::<ServerError>() {
        (e.status_code(), e.to_string())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not Found".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed".to_string())
    } else {
        log::error!("Unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal Server Error".to_string(),
        )
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&serde_json::json!({ "detail": detail })),
        code,
    ))
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    state: ServerState,
    config: &ServerConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let addr = config.addr();
    let (bound, server) = warp::serve(routes(state, config))
        .try_bind_with_graceful_shutdown(addr, shutdown)
        .map_err(|e| ServerError::Bind(addr, e.to_string()))?;

    log::info!("Listening on http://{}", bound);
    if config.open_browser {
        browser::open(&browser::dashboard_url(bound));
    }
    server.await;
    log::info!("HTTP server stopped");
    Ok(())
}

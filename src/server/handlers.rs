use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use warp::{Rejection, Reply};

use super::{ServerError, ServerState};
use crate::driver::{ControlAction, PrinterDriver};
use crate::engine::bounded;
use crate::registry::{DeviceConfig, DeviceSummary};
use crate::status::NormalizedStatus;

fn reject(e: ServerError) -> Rejection {
    warp::reject::custom(e)
}

async fn lookup(state: &ServerState, id: &str) -> Result<Arc<dyn PrinterDriver>, Rejection> {
    state
        .registry
        .get(id)
        .await
        .ok_or_else(|| reject(ServerError::NotFound("Printer not found".to_string())))
}

pub(crate) async fn list_printers(state: ServerState) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&state.registry.list().await))
}

/// Body is `{"id": ..., "type": ..., <driver config>}`.
pub(crate) async fn add_printer(
    mut body: serde_json::Value,
    state: ServerState,
) -> Result<impl Reply, Rejection> {
    let id = body
        .as_object_mut()
        .and_then(|fields| fields.remove("id"))
        .and_then(|value| value.as_str().map(str::to_string))
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| reject(ServerError::BadRequest("Missing printer ID".to_string())))?;

    if state.registry.get(&id).await.is_some() {
        return Err(reject(ServerError::BadRequest(
            "Printer already exists".to_string(),
        )));
    }

    let config: DeviceConfig = serde_json::from_value(body).map_err(|e| {
        reject(ServerError::BadRequest(format!("Invalid printer config: {}", e)))
    })?;

    let driver = state
        .registry
        .add(&id, config)
        .await
        .map_err(|e| reject(ServerError::from(e)))?;

    // The printer stays registered even if it is offline right now.
    if let Err(e) = driver.connect().await {
        log::warn!("[{}] Initial connect failed: {}", id, e);
    }

    Ok(warp::reply::json(&DeviceSummary {
        id,
        kind: driver.kind().to_string(),
    }))
}

pub(crate) async fn remove_printer(id: String, state: ServerState) -> Result<impl Reply, Rejection> {
    state
        .registry
        .remove(&id)
        .await
        .map_err(|e| reject(ServerError::from(e)))?;
    Ok(warp::reply::json(&json!({ "removed": id })))
}

pub(crate) async fn printer_status(id: String, state: ServerState) -> Result<impl Reply, Rejection> {
    let driver = lookup(&state, &id).await?;
    let status = match bounded(state.engine.driver_timeout(), driver.status()).await {
        Ok(raw) => NormalizedStatus::from_raw(&raw),
        Err(e) => NormalizedStatus::unavailable(e.to_string()),
    };
    Ok(warp::reply::json(&status))
}

pub(crate) async fn filament_info(id: String, state: ServerState) -> Result<impl Reply, Rejection> {
    let driver = lookup(&state, &id).await?;
    let reply = match bounded(state.engine.driver_timeout(), driver.filament()).await {
        Ok(report) => warp::reply::json(&report),
        Err(e) => warp::reply::json(&json!({ "error": e.to_string() })),
    };
    Ok(reply)
}

pub(crate) async fn perform_action(
    id: String,
    action: String,
    state: ServerState,
) -> Result<impl Reply, Rejection> {
    let action = ControlAction::parse(&action).ok_or_else(|| {
        reject(ServerError::NotFound(format!("Unknown action: {}", action)))
    })?;
    let driver = lookup(&state, &id).await?;

    if !driver.capabilities().supports(action) {
        return Err(reject(ServerError::BadRequest(format!(
            "Printer does not support {}",
            action
        ))));
    }

    let ack = bounded(state.engine.driver_timeout(), driver.perform(action))
        .await
        .map_err(|e| {
            log::warn!("[{}] {} failed: {}", id, action, e);
            reject(ServerError::Upstream(e.to_string()))
        })?;

    log::info!("[{}] {} sent", id, action);
    state.engine.refresh(&id);
    Ok(warp::reply::json(&ack))
}

/// Serve the single-page app shell for any unmatched GET.
pub(crate) async fn frontend(index: PathBuf) -> Result<warp::reply::Response, Rejection> {
    match tokio::fs::read_to_string(&index).await {
        Ok(html) => Ok(warp::reply::html(html).into_response()),
        Err(_) => Ok(warp::reply::json(&json!({ "detail": "Frontend not built" })).into_response()),
    }
}

//! Ops behind the script-side `Application`, `Request` and `Response`.
//!
//! Objects are referenced by numeric id. Structured values travel as JSON
//! strings and byte buffers as base64.

use std::sync::Arc;

use base64::Engine;
use deno_core::{op2, OpState};
use deno_error::JsErrorBox;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

use crate::address::ListenArgs;
use crate::application::Application;
use crate::error::Error;
use crate::method::Method;
use crate::middleware::Middleware;
use crate::options::Options;
use crate::request::{Body, Request};
use crate::response::Response;

use super::bridge::{Bridge, Outcome, ScriptMiddleware};
use super::registry::{self, Hosted, APPS, EXCHANGES, LANES, NEXT_APP_ID, NEXT_LANE_ID};

/// Ids of the applications created by one runtime.
#[derive(Debug, Default)]
pub struct HostedApps(pub Vec<u32>);

fn hosted(app_id: u32) -> Result<Hosted, JsErrorBox> {
    registry::lock(&APPS)
        .get(&app_id)
        .cloned()
        .ok_or_else(|| JsErrorBox::generic(format!("Application {} not found", app_id)))
}

fn exchange(exchange_id: u32) -> Result<(Arc<Request>, Arc<Response>), JsErrorBox> {
    let exchanges = registry::lock(&EXCHANGES);
    exchanges
        .get(&exchange_id)
        .and_then(|ex| Some((ex.req.upgrade()?, ex.res.upgrade()?)))
        .ok_or_else(|| JsErrorBox::generic(format!("Request {} has already finished", exchange_id)))
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, JsErrorBox> {
    serde_json::to_string(value).map_err(|e| Error::from(e).into())
}

fn script_middlewares(bridge: &Arc<Bridge>, ids_json: &str) -> Result<Vec<Arc<dyn Middleware>>, JsErrorBox> {
    let ids: Vec<u32> = serde_json::from_str(ids_json)
        .map_err(|e| JsErrorBox::type_error(format!("Invalid middleware list: {}", e)))?;
    Ok(ids
        .into_iter()
        .map(|id| Arc::new(ScriptMiddleware::new(bridge.clone(), id)) as Arc<dyn Middleware>)
        .collect())
}

fn decode(data: String, is_base64: bool) -> Result<Vec<u8>, JsErrorBox> {
    if is_base64 {
        base64::engine::general_purpose::STANDARD
            .decode(&data)
            .map_err(|e| JsErrorBox::type_error(format!("Invalid base64: {}", e)))
    } else {
        Ok(data.into_bytes())
    }
}

/// Host function: names of the verb registration methods
#[op2]
#[string]
pub fn op_muxpress_methods() -> Result<String, JsErrorBox> {
    let names: Vec<&str> = Method::ALL.iter().map(|m| m.name()).collect();
    to_json(&names)
}

/// Host function: create an application with the runtime's options
#[op2(fast)]
pub fn op_muxpress_app_new(state: &mut OpState) -> u32 {
    let options = state.borrow::<Options>().clone();
    let app_id = registry::next_id(&NEXT_APP_ID);

    registry::lock(&APPS).insert(
        app_id,
        Hosted {
            app: Arc::new(Application::new(options)),
            bridge: Arc::new(Bridge::new()),
        },
    );
    state.borrow_mut::<HostedApps>().0.push(app_id);

    app_id
}

/// Host function: append global middlewares
#[op2(fast)]
pub fn op_muxpress_use(app_id: u32, #[string] ids_json: &str) -> Result<(), JsErrorBox> {
    let hosted = hosted(app_id)?;
    let middlewares = script_middlewares(&hosted.bridge, ids_json)?;
    hosted.app.use_middleware(middlewares);
    Ok(())
}

/// Host function: bind a verb and path pattern to middlewares
#[op2(fast)]
pub fn op_muxpress_route(
    app_id: u32,
    #[string] method: &str,
    #[string] pattern: &str,
    #[string] ids_json: &str,
) -> Result<(), JsErrorBox> {
    let hosted = hosted(app_id)?;
    let method = Method::from_name(method)
        .ok_or_else(|| JsErrorBox::type_error(format!("Unsupported method {}", method)))?;
    let middlewares = script_middlewares(&hosted.bridge, ids_json)?;
    hosted.app.handle(method, pattern, middlewares)?;
    Ok(())
}

/// Host function: mount a document root
#[op2(fast)]
pub fn op_muxpress_static(
    app_id: u32,
    #[string] mount: &str,
    #[string] docroot: &str,
) -> Result<(), JsErrorBox> {
    hosted(app_id)?.app.static_files(mount, docroot)?;
    Ok(())
}

/// Host function: start listening
/// Takes the positional arguments as a JSON array, returns the address
#[op2]
#[string]
pub fn op_muxpress_listen(app_id: u32, #[string] args_json: &str) -> Result<String, JsErrorBox> {
    let hosted = hosted(app_id)?;
    let args: Vec<Value> = serde_json::from_str(args_json).map_err(Error::from)?;
    let args = ListenArgs::parse(&args)?;

    let address = hosted.listen(&args)?;
    to_json(&address)
}

/// Host function: stop listening
#[op2(fast)]
pub fn op_muxpress_shutdown(app_id: u32) -> Result<(), JsErrorBox> {
    hosted(app_id)?.app.shutdown();
    Ok(())
}

/// Host function: address JSON, or "null" before the first listen
#[op2]
#[string]
pub fn op_muxpress_address(app_id: u32) -> Result<String, JsErrorBox> {
    to_json(&hosted(app_id)?.app.address())
}

/// Host function: wait for the next bridge message
/// Returns "null" once the application stopped
#[op2]
#[string]
pub async fn op_muxpress_accept(app_id: u32) -> Result<String, JsErrorBox> {
    let hosted = hosted(app_id)?;
    match hosted.bridge.accept(&hosted.app).await {
        Some(message) => to_json(&message),
        None => Ok("null".to_string()),
    }
}

/// Host function: report how a middleware invocation ended
/// An empty error means it returned normally
#[op2(fast)]
pub fn op_muxpress_done(
    app_id: u32,
    job: u32,
    called: bool,
    #[string] error: &str,
) -> Result<(), JsErrorBox> {
    let outcome = Outcome {
        called,
        error: (!error.is_empty()).then(|| error.to_string()),
    };
    hosted(app_id)?.bridge.complete(job, outcome);
    Ok(())
}

/// Host function: wait for an exclusive slot on the application's runner
/// The slot is held until op_muxpress_lane_exit
#[op2]
pub async fn op_muxpress_lane_enter(app_id: u32) -> Result<u32, JsErrorBox> {
    let app = hosted(app_id)?.app;
    let (entered_tx, entered_rx) = oneshot::channel::<()>();
    let (exit_tx, exit_rx) = oneshot::channel::<()>();

    let lane = registry::next_id(&NEXT_LANE_ID);
    registry::lock(&LANES).insert(lane, exit_tx);

    tokio::spawn(async move {
        app.run_exclusive(Box::pin(async move {
            let _ = entered_tx.send(());
            let _ = exit_rx.await;
        }))
        .await;
    });

    if entered_rx.await.is_err() {
        registry::lock(&LANES).remove(&lane);
        return Err(JsErrorBox::generic("Runner dropped the callback"));
    }
    Ok(lane)
}

/// Host function: give the runner slot back
#[op2(fast)]
pub fn op_muxpress_lane_exit(lane: u32) {
    if let Some(exit) = registry::lock(&LANES).remove(&lane) {
        let _ = exit.send(());
    }
}

/// Host function: identity fields of a request
#[op2]
#[string]
pub fn op_muxpress_req_info(exchange_id: u32) -> Result<String, JsErrorBox> {
    let (req, _) = exchange(exchange_id)?;
    to_json(&serde_json::json!({
        "host": req.host(),
        "method": req.method(),
        "path": req.path(),
        "protocol": req.protocol(),
    }))
}

#[op2]
#[string]
pub fn op_muxpress_req_params(exchange_id: u32) -> Result<String, JsErrorBox> {
    let (req, _) = exchange(exchange_id)?;
    to_json(req.params())
}

#[op2]
#[string]
pub fn op_muxpress_req_query(exchange_id: u32) -> Result<String, JsErrorBox> {
    let (req, _) = exchange(exchange_id)?;
    to_json(req.query())
}

#[op2]
#[string]
pub fn op_muxpress_req_cookies(exchange_id: u32) -> Result<String, JsErrorBox> {
    let (req, _) = exchange(exchange_id)?;
    to_json(req.cookies())
}

/// Host function: parsed body as JSON, "" when there is none
#[op2]
#[string]
pub fn op_muxpress_req_body(exchange_id: u32) -> Result<String, JsErrorBox> {
    let (req, _) = exchange(exchange_id)?;
    match req.body()? {
        Body::Absent => Ok(String::new()),
        Body::Json(map) => to_json(map),
    }
}

#[op2]
#[string]
pub fn op_muxpress_req_get(exchange_id: u32, #[string] field: &str) -> Result<String, JsErrorBox> {
    let (req, _) = exchange(exchange_id)?;
    Ok(req.get(field).to_string())
}

#[op2(fast)]
pub fn op_muxpress_res_json(exchange_id: u32, #[string] json: &str) -> Result<(), JsErrorBox> {
    let (_, res) = exchange(exchange_id)?;
    let value: Value = serde_json::from_str(json).map_err(Error::from)?;
    res.json(&value)?;
    Ok(())
}

#[op2(fast)]
pub fn op_muxpress_res_text(
    exchange_id: u32,
    #[string] format: &str,
    #[string] args_json: &str,
) -> Result<(), JsErrorBox> {
    let (_, res) = exchange(exchange_id)?;
    let args: Vec<Value> = serde_json::from_str(args_json).map_err(Error::from)?;
    res.text(format, &args);
    Ok(())
}

#[op2(fast)]
pub fn op_muxpress_res_html(
    exchange_id: u32,
    #[string] data: String,
    is_base64: bool,
) -> Result<(), JsErrorBox> {
    let (_, res) = exchange(exchange_id)?;
    res.html(&decode(data, is_base64)?);
    Ok(())
}

#[op2(fast)]
pub fn op_muxpress_res_binary(
    exchange_id: u32,
    #[string] data: String,
    is_base64: bool,
) -> Result<(), JsErrorBox> {
    let (_, res) = exchange(exchange_id)?;
    res.binary(&decode(data, is_base64)?);
    Ok(())
}

#[op2(fast)]
pub fn op_muxpress_res_status(exchange_id: u32, code: u32) -> Result<(), JsErrorBox> {
    let (_, res) = exchange(exchange_id)?;
    let code = u16::try_from(code)
        .map_err(|_| Error::InvalidArgument(format!("invalid status code {}", code)))?;
    res.status(code)?;
    Ok(())
}

#[op2(fast)]
pub fn op_muxpress_res_set(
    exchange_id: u32,
    #[string] field: &str,
    #[string] value: &str,
) -> Result<(), JsErrorBox> {
    let (_, res) = exchange(exchange_id)?;
    res.set(field, value)?;
    Ok(())
}

#[op2(fast)]
pub fn op_muxpress_res_append(
    exchange_id: u32,
    #[string] field: &str,
    #[string] value: &str,
) -> Result<(), JsErrorBox> {
    let (_, res) = exchange(exchange_id)?;
    res.append(field, value)?;
    Ok(())
}

#[op2(fast)]
pub fn op_muxpress_res_type(exchange_id: u32, #[string] mime: &str) -> Result<(), JsErrorBox> {
    let (_, res) = exchange(exchange_id)?;
    res.content_type(mime)?;
    Ok(())
}

#[op2(fast)]
pub fn op_muxpress_res_vary(exchange_id: u32, #[string] field: &str) -> Result<(), JsErrorBox> {
    let (_, res) = exchange(exchange_id)?;
    res.vary(field)?;
    Ok(())
}

#[op2(fast)]
pub fn op_muxpress_res_redirect(
    exchange_id: u32,
    code: u32,
    #[string] location: &str,
) -> Result<(), JsErrorBox> {
    let (_, res) = exchange(exchange_id)?;
    let code = u16::try_from(code)
        .map_err(|_| Error::InvalidArgument(format!("invalid status code {}", code)))?;
    res.redirect(code, location)?;
    Ok(())
}

/// Host function: console output, routed to the configured logger
#[op2(fast)]
pub fn op_muxpress_log(state: &mut OpState, #[string] level: &str, #[string] message: &str) {
    let logger = state.borrow::<Options>().logger.clone();
    tracing::dispatcher::with_default(&logger, || match level {
        "error" => error!(target: "muxpress::script", "{}", message),
        "warn" => warn!(target: "muxpress::script", "{}", message),
        "debug" => debug!(target: "muxpress::script", "{}", message),
        "trace" => trace!(target: "muxpress::script", "{}", message),
        _ => info!(target: "muxpress::script", "{}", message),
    });
}

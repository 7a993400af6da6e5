//! Local HTTP proxy.
//!
//! Every request is rebased onto the configured origin and routed through the
//! registration, as one long-lived application instance. Requests the cache
//! does not handle go straight to the network. `POST /__shellcache/message`
//! delivers control messages.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method as HttpMethod, StatusCode, Uri};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::post;
use axum::Json;
use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;

use shellcache_core::{
    ClientId, FetchEvent, InstallOutcome, Method, Request, RequestMode, Response, WorkerHost,
};

use crate::app::App;

pub const CONTROL_PATH: &str = "/__shellcache/message";

/// Request headers not forwarded upstream. Bodies are relayed as received,
/// so content negotiation for compression is left out.
const SKIP_REQUEST_HEADERS: &[&str] = &["accept-encoding"];

/// Response headers axum sets itself.
const SKIP_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "content-length",
    "keep-alive",
    "transfer-encoding",
];

#[derive(Clone)]
struct ProxyState {
    app: Arc<App>,
    client: ClientId,
}

#[derive(Debug, Serialize)]
struct ControlReply {
    activated: bool,
    active: Option<String>,
    waiting: Option<String>,
    deleted: Vec<String>,
}

pub async fn serve(app: App, listen: &str) -> Result<()> {
    let app = Arc::new(app);
    let state = prepare(Arc::clone(&app)).await?;

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Cannot listen on {}", listen))?;
    info!("Proxying {} on http://{}", app.origin(), listen);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    app.persist().await?;
    info!("Proxy stopped");
    Ok(())
}

/// Bring the registration up to date and open the proxy's own client.
async fn prepare(app: Arc<App>) -> Result<ProxyState> {
    let registration = app.registration();

    // The previous run's instance is gone, so a waiting generation can take over
    if let Some(report) = registration.try_activate().await? {
        info!(deleted = report.deleted.len(), "Activated waiting generation");
    }
    if registration.active_version().await.is_some() {
        if let Err(e) = registration.host().enable_navigation_preload().await {
            debug!(error = %e, "Navigation preload not enabled");
        }
    }

    let client = registration.attach_client().await;

    let configured = app.config().generation();
    let record = registration.record().await;
    let version = Some(configured.version().to_string());
    if record.active_version != version && record.waiting_version != version {
        match app.install_configured().await {
            Ok(InstallOutcome::Activated(_)) => {
                info!(generation = %configured, "Installed and activated");
            }
            Ok(InstallOutcome::Waiting) => {
                info!(generation = %configured, control = CONTROL_PATH, "Installed; send SKIP_WAITING to switch");
            }
            Err(e) => {
                warn!(generation = %configured, error = %e, "Install failed; keeping current generation");
            }
        }
    }
    app.persist().await?;

    Ok(ProxyState { app, client })
}

fn router(state: ProxyState) -> axum::Router {
    axum::Router::new()
        .route(CONTROL_PATH, post(control))
        .fallback(proxy)
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

async fn proxy(
    State(state): State<ProxyState>,
    method: HttpMethod,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResponse {
    let request = match to_request(state.app.origin(), &method, &uri, &headers, body) {
        Ok(request) => request,
        Err(message) => return (StatusCode::BAD_REQUEST, message).into_response(),
    };

    let registration = state.app.registration();
    let mut event = FetchEvent::new(request.clone());
    if request.mode == RequestMode::Navigate && registration.host().navigation_preload_enabled() {
        let network = state.app.fetcher();
        let preload = request.clone();
        event = event.with_preload(Box::pin(async move { network.fetch(&preload).await }));
    }

    let response = match registration.fetch(state.client, event).await {
        Some(response) => response,
        None => match state.app.fetcher().fetch(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %request.url, error = %e, "Upstream fetch failed");
                Response::network_error()
            }
        },
    };
    into_http(response)
}

async fn control(State(state): State<ProxyState>, body: Bytes) -> HttpResponse {
    let registration = state.app.registration();
    let report = match registration.post_message(&body).await {
        Ok(report) => report,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    if let Err(e) = state.app.persist().await {
        warn!(error = %e, "Failed to save registration record");
    }

    let record = registration.record().await;
    Json(ControlReply {
        activated: report.is_some(),
        active: record.active_version,
        waiting: record.waiting_version,
        deleted: report.map(|r| r.deleted).unwrap_or_default(),
    })
    .into_response()
}

fn is_navigation(method: &HttpMethod, headers: &HeaderMap) -> bool {
    if let Some(mode) = headers.get("sec-fetch-mode") {
        return mode.as_bytes() == b"navigate";
    }
    // Clients without fetch metadata: a GET that prefers HTML
    *method == HttpMethod::GET
        && headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|accept| accept.contains("text/html"))
}

fn to_request(
    origin: &Url,
    method: &HttpMethod,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Request, String> {
    let parsed = Method::parse(method.as_str())
        .ok_or_else(|| format!("Unsupported method {}", method))?;
    let target = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let url = Request::resolve(origin, target).map_err(|e| e.to_string())?;

    let mode = if is_navigation(method, headers) {
        RequestMode::Navigate
    } else {
        RequestMode::SameOrigin
    };
    let mut request = Request::new(parsed, url).with_mode(mode).with_body(body.to_vec());
    for (name, value) in headers {
        if SKIP_REQUEST_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            request = request.with_header(name.as_str(), value);
        }
    }
    Ok(request)
}

fn into_http(response: Response) -> HttpResponse {
    if response.is_network_error() {
        return (StatusCode::BAD_GATEWAY, "Network error and nothing cached").into_response();
    }

    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut headers = HeaderMap::new();
    for (name, value) in &response.headers {
        if SKIP_RESPONSE_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    (status, headers, response.body).into_response()
}

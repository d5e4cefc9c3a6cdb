// src/web.rs
use crate::config::AppConfig;
use crate::connection::{self, Timings};
use crate::error::{Error, Result};
use crate::hub::HubHandle;
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use percent_encoding::percent_decode_str;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Path of the websocket endpoint browsers connect to.
pub const RELOAD_PATH: &str = "/_toil/reload";

/// Marker the reload script is inserted in front of.
const HEAD_CLOSE: &[u8] = b"</head>";

/// Client side of the reload protocol: reconnect two seconds after any close,
/// reload the page on any message.
const RELOAD_SCRIPT: &str = concat!(
    "<script type='text/javascript'>function fresh_reload() {\n",
    "\tvar socket = new WebSocket(\"ws://\" + window.location.host + \"/_toil/reload\");\n",
    "\tsocket.onclose = function(evt) {\n",
    "\t\tsetTimeout(() => fresh_reload(), 2000);\n",
    "\t};\n",
    "\tsocket.onmessage = function(evt) {\n",
    "\t\tlocation.reload();\n",
    "\t};\n",
    "};\n",
    "fresh_reload()</script>",
);

/// Shared application state for the web server.
#[derive(Clone)]
pub struct AppState {
    hub: HubHandle,
    root: Arc<PathBuf>,
    timings: Timings,
}

impl AppState {
    pub fn new(hub: HubHandle, root: impl Into<PathBuf>) -> Self {
        AppState {
            hub,
            root: Arc::new(root.into()),
            timings: Timings::default(),
        }
    }
}

/// Builds the router: the reload endpoint plus static files for everything else.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(RELOAD_PATH, get(reload_socket))
        .fallback(serve_static)
        .with_state(state)
}

/// Handles incoming WebSocket upgrade requests on the reload endpoint.
///
/// A rejected or failed upgrade is logged and no connection is created.
async fn reload_socket(
    State(state): State<AppState>,
    upgrade: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!("Rejected reload socket request: {}", rejection);
            return rejection.into_response();
        }
    };
    debug!("New reload socket request.");
    ws.on_failed_upgrade(|e| warn!("Reload socket upgrade failed: {}", e))
        .on_upgrade(move |socket| connection::run_connection(socket, state.hub, state.timings))
}

/// Serves a file from the root, injecting the reload script into HTML.
async fn serve_static(State(state): State<AppState>, uri: Uri) -> Response {
    let Some(path) = resolve(&state.root, uri.path()) else {
        debug!("No file for {}", uri.path());
        return no_cache(StatusCode::NOT_FOUND.into_response());
    };

    let body = match tokio::fs::read(&path).await {
        Ok(body) => body,
        Err(e) => {
            warn!("Failed to read {}: {}", path.display(), e);
            return no_cache(StatusCode::NOT_FOUND.into_response());
        }
    };

    let body = if is_html(&path) {
        inject_reload_script(&body)
    } else {
        body
    };
    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    debug!("Serving {} as {}", path.display(), mime);
    no_cache(([(header::CONTENT_TYPE, mime.as_ref().to_string())], body).into_response())
}

fn no_cache(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

/// Maps a request path to a file under `root`.
///
/// `/` means `index`. A path without an extension resolves to the directory's
/// `index.html` if there is one, then to `<path>.html`. Paths that would
/// climb out of `root` resolve to nothing.
pub fn resolve(root: &Path, request_path: &str) -> Option<PathBuf> {
    let decoded = percent_decode_str(request_path).decode_utf8().ok()?;
    let relative = match decoded.trim_start_matches('/') {
        "" => "index",
        rest => rest,
    };
    let relative = Path::new(relative);
    if !relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return None;
    }

    let candidate = root.join(relative);
    if relative.extension().is_some() {
        return candidate.is_file().then_some(candidate);
    }

    if candidate.is_dir() {
        let index = candidate.join("index.html");
        if index.is_file() {
            return Some(index);
        }
    }

    let mut with_html = candidate.into_os_string();
    with_html.push(".html");
    let with_html = PathBuf::from(with_html);
    with_html.is_file().then_some(with_html)
}

fn is_html(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("html") || ext.eq_ignore_ascii_case("htm"))
}

/// Inserts the reload script before the first `</head>`. Pages without one are returned unchanged.
pub fn inject_reload_script(page: &[u8]) -> Vec<u8> {
    let Some(at) = page
        .windows(HEAD_CLOSE.len())
        .position(|window| window == HEAD_CLOSE)
    else {
        return page.to_vec();
    };
    let mut out = Vec::with_capacity(page.len() + RELOAD_SCRIPT.len());
    out.extend_from_slice(&page[..at]);
    out.extend_from_slice(RELOAD_SCRIPT.as_bytes());
    out.extend_from_slice(&page[at..]);
    out
}

/// Serves `state` on an already bound listener until the process exits.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Parses and binds the configured listen address.
pub async fn bind(app_config: &AppConfig) -> Result<TcpListener> {
    let socket_addr: SocketAddr = app_config
        .addr
        .parse()
        .map_err(|source| Error::InvalidAddr {
            addr: app_config.addr.clone(),
            source,
        })?;
    let listener = TcpListener::bind(socket_addr).await?;
    info!(
        "Serving {} on http://{}",
        app_config.root.display(),
        listener.local_addr()?
    );
    Ok(listener)
}

/// URL a local browser should open for a server bound to `addr`.
pub fn browse_url(addr: SocketAddr) -> String {
    format!("http://localhost:{}", addr.port())
}

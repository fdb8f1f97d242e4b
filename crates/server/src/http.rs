//! HTTP surface of the signaling hub: health check, `/turn` credential
//! endpoint, WebSocket upgrade, and static file serving under the web root.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Request, StatusCode, Uri, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use bytes::Bytes;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::auth::{AuthOutcome, BasicAuth};
use crate::hub::{Hub, handle_socket};
use glint_protocol::rtc::make_rtc_config;

/// Memoized file bytes are reused for this long before re-reading.
const FILE_CACHE_TTL: Duration = Duration::from_secs(300);

/// TURN-related settings for the `/turn` endpoint.
#[derive(Debug, Clone, Default)]
pub struct TurnSettings {
    /// Shared secret for HMAC credentials; empty disables generation.
    pub shared_secret: String,
    pub host: String,
    pub port: String,
    /// `udp` or `tcp`.
    pub protocol: String,
    pub tls: bool,
    /// Header carrying the credential username, e.g. `x-auth-user`.
    pub auth_header_name: String,
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub addr: String,
    pub port: u16,
    pub web_root: PathBuf,
    pub keepalive_timeout: Duration,
    pub basic_auth: Option<BasicAuth>,
    pub turn: TurnSettings,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0".into(),
            port: 8080,
            web_root: PathBuf::from("/opt/glint-web"),
            keepalive_timeout: Duration::from_secs(30),
            basic_auth: None,
            turn: TurnSettings {
                protocol: "udp".into(),
                auth_header_name: "x-auth-user".into(),
                ..Default::default()
            },
        }
    }
}

/// Small TTL cache for static file bytes. No eviction beyond expiry; the
/// web root is a handful of app assets.
pub struct FileCache {
    entries: Mutex<HashMap<PathBuf, (Bytes, Instant)>>,
}

impl FileCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn read(&self, path: &Path) -> std::io::Result<Bytes> {
        {
            let entries = self.entries.lock().await;
            if let Some((data, stored)) = entries.get(path) {
                if stored.elapsed() < FILE_CACHE_TTL {
                    return Ok(data.clone());
                }
            }
        }
        let data = Bytes::from(tokio::fs::read(path).await?);
        self.entries
            .lock()
            .await
            .insert(path.to_path_buf(), (data.clone(), Instant::now()));
        Ok(data)
    }
}

impl Default for FileCache {
    fn default() -> Self {
        Self::new()
    }
}

pub struct AppState {
    pub hub: Arc<Hub>,
    pub options: ServerOptions,
    /// Last-set static RTC config, served at `/turn` when no shared secret
    /// is configured. Refreshed at runtime by the TURN monitors.
    pub rtc_config: RwLock<Option<String>>,
    pub cache: FileCache,
}

impl AppState {
    pub fn new(options: ServerOptions, initial_rtc_config: Option<String>) -> Self {
        Self {
            hub: Arc::new(Hub::new()),
            options,
            rtc_config: RwLock::new(initial_rtc_config),
            cache: FileCache::new(),
        }
    }

    pub async fn set_rtc_config(&self, config: String) {
        *self.rtc_config.write().await = Some(config);
    }
}

/// MIME type by file extension; anything unknown is served as octet-stream.
pub fn mime_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html",
        Some("js") => "text/javascript",
        Some("css") => "text/css",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/", get(health))
        .route("/turn", get(turn))
        .route("/turn/", get(turn))
        .route("/ws", any(ws_upgrade))
        .route("/ws/", any(ws_upgrade))
        .fallback(serve_path)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_basic_auth,
        ))
        .with_state(state)
}

/// Gate every route behind basic auth when configured. The first
/// unauthenticated request receives a `WWW-Authenticate` challenge.
async fn require_basic_auth(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(auth) = &state.options.basic_auth else {
        return next.run(request).await;
    };
    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    match auth.check(header_value) {
        AuthOutcome::Granted(_) => next.run(request).await,
        AuthOutcome::Challenge => (
            StatusCode::UNAUTHORIZED,
            [(
                header::WWW_AUTHENTICATE,
                "Basic realm=\"restricted\", charset=\"UTF-8\"",
            )],
            "Authorization required",
        )
            .into_response(),
        AuthOutcome::Denied => (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
    }
}

async fn health() -> impl IntoResponse {
    "OK\n"
}

/// Serve an RTC configuration: freshly generated HMAC credentials when a
/// shared secret is configured, otherwise the last-set static config.
async fn turn(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let turn = &state.options.turn;
    if !turn.shared_secret.is_empty() {
        // Prefer the basic-auth identity, fall back to the auth-user header.
        let username = basic_auth_user(&state, &headers).or_else(|| {
            headers
                .get(turn.auth_header_name.as_str())
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        });
        let Some(username) = username.filter(|u| !u.is_empty()) else {
            warn!(
                header = %turn.auth_header_name,
                "/turn request missing auth user header"
            );
            return (
                StatusCode::UNAUTHORIZED,
                "401 Unauthorized - missing auth header",
            )
                .into_response();
        };
        info!(user = %username, "Generating HMAC TURN credential");
        let config = make_rtc_config(
            &turn.host,
            &turn.port,
            &turn.shared_secret,
            &username,
            &turn.protocol,
            turn.tls,
        );
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            config,
        )
            .into_response();
    }

    if let Some(config) = state.rtc_config.read().await.clone() {
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            config,
        )
            .into_response();
    }

    warn!("/turn requested but no RTC config available");
    (StatusCode::NOT_FOUND, "404 NOT FOUND").into_response()
}

fn basic_auth_user(state: &AppState, headers: &HeaderMap) -> Option<String> {
    let auth = state.options.basic_auth.as_ref()?;
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    match auth.check(Some(value)) {
        AuthOutcome::Granted(user) => Some(user),
        _ => None,
    }
}

async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let hub = Arc::clone(&state.hub);
    let keepalive = state.options.keepalive_timeout;
    ws.on_upgrade(move |socket| handle_socket(socket, addr.to_string(), hub, keepalive))
}

/// Catch-all: signaling upgrades on `*/signalling[/]`, otherwise static
/// files under the web root.
async fn serve_path(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    uri: Uri,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let path = uri.path();
    if path.ends_with("/signalling") || path.ends_with("/signalling/") {
        if let Ok(ws) = ws {
            let hub = Arc::clone(&state.hub);
            let keepalive = state.options.keepalive_timeout;
            return ws
                .on_upgrade(move |socket| handle_socket(socket, addr.to_string(), hub, keepalive));
        }
        return (StatusCode::BAD_REQUEST, "WebSocket upgrade required").into_response();
    }
    serve_static(&state, path).await
}

async fn serve_static(state: &AppState, path: &str) -> Response {
    let path = if path == "/" { "/index.html" } else { path };

    let Ok(root) = state.options.web_root.canonicalize() else {
        return (StatusCode::NOT_FOUND, "404 NOT FOUND").into_response();
    };
    let Ok(full_path) = root.join(path.trim_start_matches('/')).canonicalize() else {
        return (StatusCode::NOT_FOUND, "404 NOT FOUND").into_response();
    };
    // Canonicalization resolves `..` and symlinks; anything that escapes
    // the web root is refused.
    if !full_path.starts_with(&root) || !full_path.is_file() {
        return (StatusCode::NOT_FOUND, "404 NOT FOUND").into_response();
    }

    match state.cache.read(&full_path).await {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, mime_type(&full_path))],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(path = %full_path.display(), "Failed to read static file: {e}");
            (StatusCode::NOT_FOUND, "404 NOT FOUND").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state(options: ServerOptions, rtc: Option<String>) -> Arc<AppState> {
        Arc::new(AppState::new(options, rtc))
    }

    /// `oneshot` needs `ConnectInfo` injected since no real socket exists.
    fn request(uri: &str) -> Request<Body> {
        let mut req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("127.0.0.1:9999".parse().unwrap()));
        req
    }

    fn request_with_header(uri: &str, name: &str, value: &str) -> Request<Body> {
        let mut req = Request::builder()
            .uri(uri)
            .header(name, value)
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("127.0.0.1:9999".parse().unwrap()));
        req
    }

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn mime_table() {
        assert_eq!(mime_type(Path::new("index.html")), "text/html");
        assert_eq!(mime_type(Path::new("app.js")), "text/javascript");
        assert_eq!(mime_type(Path::new("style.css")), "text/css");
        assert_eq!(mime_type(Path::new("favicon.ico")), "image/x-icon");
        assert_eq!(mime_type(Path::new("blob.wasm")), "application/octet-stream");
        assert_eq!(mime_type(Path::new("noext")), "application/octet-stream");
    }

    #[tokio::test]
    async fn health_serves_ok() {
        let app = build_router(test_state(ServerOptions::default(), None));
        let response = app.oneshot(request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "OK\n");
    }

    #[tokio::test]
    async fn health_trailing_slash() {
        let app = build_router(test_state(ServerOptions::default(), None));
        let response = app.oneshot(request("/health/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn turn_without_config_is_404() {
        let app = build_router(test_state(ServerOptions::default(), None));
        let response = app.oneshot(request("/turn")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn turn_serves_static_config() {
        let rtc = glint_protocol::rtc::default_rtc_config();
        let app = build_router(test_state(ServerOptions::default(), Some(rtc.clone())));
        let response = app.oneshot(request("/turn")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let body = body_string(response).await;
        assert_eq!(body, rtc);
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["iceTransportPolicy"], "all");
    }

    fn hmac_options() -> ServerOptions {
        let mut options = ServerOptions::default();
        options.turn = TurnSettings {
            shared_secret: "s3cret".into(),
            host: "turn.example".into(),
            port: "3478".into(),
            protocol: "udp".into(),
            tls: false,
            auth_header_name: "x-auth-user".into(),
        };
        options
    }

    #[tokio::test]
    async fn turn_generates_hmac_credential_from_header() {
        let app = build_router(test_state(hmac_options(), None));
        let response = app
            .oneshot(request_with_header("/turn", "x-auth-user", "alice"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        let parsed = glint_protocol::rtc::parse_rtc_config(&body).unwrap();
        assert_eq!(parsed.turn_uris.len(), 1);
        assert!(parsed.turn_uris[0].ends_with("@turn.example:3478"));
    }

    #[tokio::test]
    async fn turn_requires_auth_user_header_for_hmac() {
        let app = build_router(test_state(hmac_options(), None));
        let response = app.oneshot(request("/turn")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn basic_auth_challenges_then_grants() {
        let mut options = ServerOptions::default();
        options.basic_auth = Some(BasicAuth {
            user: "u".into(),
            password: "p".into(),
        });
        let state = test_state(options, None);

        let response = build_router(Arc::clone(&state))
            .oneshot(request("/health"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

        use base64::Engine;
        let creds = base64::engine::general_purpose::STANDARD.encode("u:p");
        let response = build_router(state)
            .oneshot(request_with_header(
                "/health",
                "authorization",
                &format!("Basic {creds}"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn static_files_served_with_mime_and_traversal_guard() {
        let dir = std::env::temp_dir().join(format!("glint-http-test-{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        std::fs::write(dir.join("index.html"), "<html>hi</html>").unwrap();

        let mut options = ServerOptions::default();
        options.web_root = dir.clone();
        let state = test_state(options, None);

        let response = build_router(Arc::clone(&state))
            .oneshot(request("/"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/html"
        );
        assert_eq!(body_string(response).await, "<html>hi</html>");

        let response = build_router(Arc::clone(&state))
            .oneshot(request("/../etc/passwd"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = build_router(state)
            .oneshot(request("/missing.js"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn file_cache_returns_cached_bytes() {
        let dir = std::env::temp_dir().join(format!("glint-cache-test-{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        let file = dir.join("a.txt");
        std::fs::write(&file, "first").unwrap();

        let cache = FileCache::new();
        assert_eq!(cache.read(&file).await.unwrap(), Bytes::from("first"));

        // Within the TTL the stale bytes are intentionally reused.
        std::fs::write(&file, "second").unwrap();
        assert_eq!(cache.read(&file).await.unwrap(), Bytes::from("first"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}

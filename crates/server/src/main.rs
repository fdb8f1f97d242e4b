use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use axum::extract::ConnectInfo;
use glint_server::auth::BasicAuth;
use glint_server::http::{AppState, ServerOptions, TurnSettings, build_router};
use glint_server::tls;
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

struct Args {
    addr: String,
    port: u16,
    web_root: String,
    rtc_config_file: String,
    rtc_config: String,
    turn_shared_secret: String,
    turn_host: String,
    turn_port: String,
    turn_protocol: String,
    turn_tls: bool,
    turn_auth_header_name: String,
    keepalive_timeout: u64,
    enable_https: bool,
    https_cert: Option<String>,
    https_key: Option<String>,
    cert_restart: bool,
    enable_basic_auth: bool,
    basic_auth_user: String,
    basic_auth_password: String,
}

/// Every flag reads its default from a parallel `GLINT_*` environment
/// variable, so the hub is fully configurable without a command line.
fn env_default(name: &str, fallback: &str) -> String {
    std::env::var(format!("GLINT_{name}")).unwrap_or_else(|_| fallback.to_string())
}

fn env_flag(name: &str, fallback: bool) -> bool {
    std::env::var(format!("GLINT_{name}"))
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(fallback)
}

fn parse_args() -> Result<Args> {
    let mut parsed = Args {
        addr: env_default("ADDR", "0.0.0.0"),
        port: env_default("PORT", "8443")
            .parse()
            .context("Invalid GLINT_PORT")?,
        web_root: env_default("WEB_ROOT", "/opt/glint-web"),
        rtc_config_file: env_default("RTC_CONFIG_FILE", "/tmp/rtc.json"),
        rtc_config: env_default("RTC_CONFIG", ""),
        turn_shared_secret: env_default("TURN_SHARED_SECRET", ""),
        turn_host: env_default("TURN_HOST", ""),
        turn_port: env_default("TURN_PORT", ""),
        turn_protocol: env_default("TURN_PROTOCOL", "udp"),
        turn_tls: env_flag("TURN_TLS", false),
        turn_auth_header_name: env_default("TURN_AUTH_HEADER_NAME", "x-auth-user"),
        keepalive_timeout: env_default("KEEPALIVE_TIMEOUT", "30")
            .parse()
            .context("Invalid GLINT_KEEPALIVE_TIMEOUT")?,
        enable_https: env_flag("ENABLE_HTTPS", false),
        https_cert: std::env::var("GLINT_HTTPS_CERT").ok(),
        https_key: std::env::var("GLINT_HTTPS_KEY").ok(),
        cert_restart: env_flag("RESTART_ON_CERT_CHANGE", false),
        enable_basic_auth: env_flag("ENABLE_BASIC_AUTH", false),
        basic_auth_user: env_default("BASIC_AUTH_USER", ""),
        basic_auth_password: env_default("BASIC_AUTH_PASSWORD", ""),
    };

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        let value = |i: &mut usize| -> Result<String> {
            *i += 1;
            args.get(*i)
                .cloned()
                .with_context(|| format!("Missing value for {}", args[*i - 1]))
        };
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("glint-server {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "--addr" => parsed.addr = value(&mut i)?,
            "--port" => parsed.port = value(&mut i)?.parse().context("Invalid --port")?,
            "--web-root" => parsed.web_root = value(&mut i)?,
            "--rtc-config-file" => parsed.rtc_config_file = value(&mut i)?,
            "--rtc-config" => parsed.rtc_config = value(&mut i)?,
            "--turn-shared-secret" => parsed.turn_shared_secret = value(&mut i)?,
            "--turn-host" => parsed.turn_host = value(&mut i)?,
            "--turn-port" => parsed.turn_port = value(&mut i)?,
            "--turn-protocol" => parsed.turn_protocol = value(&mut i)?,
            "--enable-turn-tls" => parsed.turn_tls = true,
            "--turn-auth-header-name" => parsed.turn_auth_header_name = value(&mut i)?,
            "--keepalive-timeout" => {
                parsed.keepalive_timeout =
                    value(&mut i)?.parse().context("Invalid --keepalive-timeout")?
            }
            "--enable-https" => parsed.enable_https = true,
            "--https-cert" => parsed.https_cert = Some(value(&mut i)?),
            "--https-key" => parsed.https_key = Some(value(&mut i)?),
            "--restart-on-cert-change" => parsed.cert_restart = true,
            "--enable-basic-auth" => parsed.enable_basic_auth = true,
            "--basic-auth-user" => parsed.basic_auth_user = value(&mut i)?,
            "--basic-auth-password" => parsed.basic_auth_password = value(&mut i)?,
            other => bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    if parsed.turn_protocol != "tcp" {
        parsed.turn_protocol = "udp".to_string();
    }

    // Configuration errors are fatal at startup, before any socket binds.
    if !parsed.turn_shared_secret.is_empty()
        && (parsed.turn_host.is_empty() || parsed.turn_port.is_empty())
    {
        bail!("--turn-host and --turn-port are required with --turn-shared-secret");
    }
    if parsed.enable_basic_auth && parsed.basic_auth_password.is_empty() {
        bail!("--basic-auth-password is required with --enable-basic-auth");
    }

    Ok(parsed)
}

fn print_help() {
    println!("glint-server - Glint WebRTC signaling hub");
    println!();
    println!("USAGE:");
    println!("    glint-server [OPTIONS]");
    println!();
    println!("OPTIONS (each with a GLINT_* environment variable):");
    println!("    --addr <ADDR>                    Listen address [default: 0.0.0.0]");
    println!("    --port <PORT>                    Listen port [default: 8443]");
    println!("    --web-root <DIR>                 Static web app directory");
    println!("    --rtc-config-file <PATH>         JSON RTC config file served at /turn");
    println!("    --rtc-config <JSON>              Inline JSON RTC config");
    println!("    --turn-shared-secret <SECRET>    Generate HMAC TURN credentials at /turn");
    println!("    --turn-host <HOST>               TURN host for generated configs");
    println!("    --turn-port <PORT>               TURN port for generated configs");
    println!("    --turn-protocol <udp|tcp>        TURN transport [default: udp]");
    println!("    --enable-turn-tls                Use turns: URIs");
    println!("    --turn-auth-header-name <NAME>   Username header [default: x-auth-user]");
    println!("    --keepalive-timeout <SECS>       WebSocket ping cadence [default: 30]");
    println!("    --enable-https                   Serve HTTPS/WSS");
    println!("    --https-cert <PATH>              TLS certificate (self-signed if absent)");
    println!("    --https-key <PATH>               TLS private key");
    println!("    --restart-on-cert-change         Exit when the certificate changes");
    println!("    --enable-basic-auth              Require basic authentication");
    println!("    --basic-auth-user <USER>         Basic auth username");
    println!("    --basic-auth-password <PASS>     Basic auth password");
    println!("    -V, --version                    Print version and exit");
    println!("    -h, --help                       Print this help and exit");
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args()?;

    // Static RTC config: inline JSON wins, else the config file if present.
    let initial_rtc_config = if !args.rtc_config.is_empty() {
        Some(args.rtc_config.clone())
    } else if std::path::Path::new(&args.rtc_config_file).exists() {
        info!(path = %args.rtc_config_file, "Loading RTC config file");
        Some(
            std::fs::read_to_string(&args.rtc_config_file)
                .with_context(|| format!("Failed to read {}", args.rtc_config_file))?,
        )
    } else {
        None
    };

    let options = ServerOptions {
        addr: args.addr.clone(),
        port: args.port,
        web_root: PathBuf::from(&args.web_root),
        keepalive_timeout: Duration::from_secs(args.keepalive_timeout),
        basic_auth: args.enable_basic_auth.then(|| BasicAuth {
            user: args.basic_auth_user.clone(),
            password: args.basic_auth_password.clone(),
        }),
        turn: TurnSettings {
            shared_secret: args.turn_shared_secret.clone(),
            host: args.turn_host.clone(),
            port: args.turn_port.clone(),
            protocol: args.turn_protocol.clone(),
            tls: args.turn_tls,
            auth_header_name: args.turn_auth_header_name.clone(),
        },
    };

    if !options.web_root.is_dir() {
        warn!(
            "Web root '{}' does not exist, only signaling and /turn will be served",
            options.web_root.display()
        );
    }

    let state = Arc::new(AppState::new(options, initial_rtc_config));
    let app = build_router(Arc::clone(&state))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-");
                tracing::info_span!(
                    "request",
                    method = %request.method(),
                    path = %request.uri().path(),
                    request_id = %request_id,
                )
            }),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let bind_addr: SocketAddr = format!("{}:{}", args.addr, args.port)
        .parse()
        .context("Invalid bind address")?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;

    let scheme = if args.enable_https { "https" } else { "http" };
    info!("Glint signaling hub listening on {scheme}://{bind_addr}");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    if !args.enable_https {
        let shutdown = async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            }
        };
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown)
            .await
            .context("HTTP server error")?;
        return Ok(());
    }

    let tls_result = tls::build_tls_config(args.https_cert.as_deref(), args.https_key.as_deref())?;
    let cert_path = PathBuf::from(&tls_result.cert_pem_path);
    let key_path = PathBuf::from(&tls_result.key_pem_path);
    let acceptor = tls::make_acceptor(tls_result.config);

    let cert_changed = async {
        if args.cert_restart {
            tls::wait_for_cert_change(cert_path, key_path).await;
        } else {
            std::future::pending::<()>().await;
        }
    };
    tokio::pin!(cert_changed);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Failed to accept TCP connection: {e}");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                // Hand each connection its peer address the same way
                // `into_make_service_with_connect_info` would.
                let conn_app = app
                    .clone()
                    .layer(axum::Extension(ConnectInfo(peer_addr)));

                tokio::spawn(async move {
                    let tls_stream = match tokio::time::timeout(
                        Duration::from_secs(10),
                        acceptor.accept(stream),
                    )
                    .await
                    {
                        Ok(Ok(s)) => s,
                        Ok(Err(e)) => {
                            tracing::debug!(%peer_addr, "TLS handshake failed: {e}");
                            return;
                        }
                        Err(_) => {
                            tracing::debug!(%peer_addr, "TLS handshake timed out");
                            return;
                        }
                    };

                    let io = hyper_util::rt::TokioIo::new(tls_stream);
                    let hyper_service = hyper_util::service::TowerToHyperService::new(conn_app);
                    let builder = hyper_util::server::conn::auto::Builder::new(
                        hyper_util::rt::TokioExecutor::new(),
                    );
                    if let Err(e) = builder.serve_connection_with_upgrades(io, hyper_service).await {
                        tracing::debug!(%peer_addr, "Connection error: {e}");
                    }
                });
            }
            _ = &mut cert_changed => {
                info!("Certificate changed, stopping so the supervisor restarts us");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
        }
    }

    info!("Glint signaling hub stopped");
    Ok(())
}

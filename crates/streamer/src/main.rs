mod cli;
mod clipboard;
mod cursor;
mod gamepad;
mod hdrext;
mod input;
mod monitors;
mod pipeline;
mod resize;
mod sdp;
mod signaling;
mod telemetry;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use glint_protocol::channel::{ChannelCommand, CursorData, OutboundMessage};
use glint_protocol::rtc::{self, ParsedRtcConfig};
use glint_server::auth::BasicAuth;
use glint_server::http::{AppState, ServerOptions, TurnSettings, build_router};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::clipboard::{ClipboardBridge, ClipboardPolicy};
use crate::gamepad::GamepadHub;
use crate::pipeline::{PipelineController, PipelineEvent, PipelineSettings, PipelineState};
use crate::signaling::{
    SignalingClientConfig, SignalingCommand, SignalingEvent, run_signaling_client,
};
use crate::telemetry::{Metrics, SystemSampler};

/// Registration identities on the loopback hub: the streamer is `0`, the
/// browser registers as `1`.
const STREAMER_UID: &str = "0";
const BROWSER_UID: &str = "1";

/// Operations handed to the X11 input worker thread.
enum InputOp {
    Key { keysym: u32, down: bool },
    Reset,
    Mouse {
        x: i32,
        y: i32,
        button_mask: u8,
        scroll_magnitude: u8,
        relative: bool,
    },
}

/// Which source produced the initial RTC config; the matching monitor
/// keeps it fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RtcSource {
    File,
    Rest,
    StaticCredentials,
    Hmac,
    Default,
}

async fn select_initial_rtc_config(args: &cli::Args) -> Result<(ParsedRtcConfig, RtcSource)> {
    if std::path::Path::new(&args.rtc_config_json).exists() {
        info!(path = %args.rtc_config_json, "Using RTC config file");
        let data = tokio::fs::read_to_string(&args.rtc_config_json)
            .await
            .with_context(|| format!("failed to read {}", args.rtc_config_json))?;
        let parsed = rtc::parse_rtc_config(&data)
            .with_context(|| format!("invalid RTC config in {}", args.rtc_config_json))?;
        return Ok((parsed, RtcSource::File));
    }

    if !args.turn_rest_uri.is_empty() {
        let settings = rest_monitor_settings(args);
        let client = reqwest::Client::new();
        match monitors::fetch_turn_rest(&client, &settings).await {
            Ok(parsed) => {
                info!("Using TURN REST API RTC configuration");
                return Ok((parsed, RtcSource::Rest));
            }
            Err(e) => {
                warn!("TURN REST fetch failed, falling back: {e:#}");
            }
        }
    }

    let have_host = !args.turn_host.is_empty() && !args.turn_port.is_empty();
    if have_host && !args.turn_username.is_empty() && !args.turn_password.is_empty() {
        info!("Using long-term TURN credentials");
        let json = rtc::make_static_rtc_config(
            &args.turn_host,
            &args.turn_port,
            &args.turn_username,
            &args.turn_password,
            &args.turn_protocol,
            args.turn_tls,
        );
        return Ok((rtc::parse_rtc_config(&json)?, RtcSource::StaticCredentials));
    }
    if have_host && !args.turn_shared_secret.is_empty() {
        info!("Using shared-secret HMAC TURN credentials");
        let json = rtc::make_rtc_config(
            &args.turn_host,
            &args.turn_port,
            &args.turn_shared_secret,
            &args.turn_rest_username,
            &args.turn_protocol,
            args.turn_tls,
        );
        return Ok((rtc::parse_rtc_config(&json)?, RtcSource::Hmac));
    }

    warn!("No TURN server configured, STUN only");
    Ok((
        rtc::parse_rtc_config(&rtc::default_rtc_config())?,
        RtcSource::Default,
    ))
}

fn rest_monitor_settings(args: &cli::Args) -> monitors::RestMonitorSettings {
    monitors::RestMonitorSettings {
        uri: args.turn_rest_uri.clone(),
        user: args.turn_rest_username.clone(),
        auth_user_header: args.turn_rest_username_auth_header.clone(),
        protocol: args.turn_protocol.clone(),
        protocol_header: args.turn_rest_protocol_header.clone(),
        tls: args.turn_tls,
        tls_header: args.turn_rest_tls_header.clone(),
        period: monitors::DEFAULT_PERIOD,
    }
}

/// Serve the embedded signaling hub, plain or TLS.
async fn serve_hub(state: Arc<AppState>, args: cli::Args) -> Result<()> {
    let app = build_router(Arc::clone(&state));
    let bind_addr: SocketAddr = format!("{}:{}", args.addr, args.port)
        .parse()
        .context("invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;

    if !args.enable_https {
        info!("Signaling hub listening on http://{bind_addr}");
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .context("signaling hub error")?;
        return Ok(());
    }

    let tls_result = glint_server::tls::build_tls_config(
        args.https_cert.as_deref(),
        args.https_key.as_deref(),
    )?;
    let acceptor = glint_server::tls::make_acceptor(tls_result.config);
    info!("Signaling hub listening on https://{bind_addr}");

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Failed to accept connection: {e}");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let conn_app = app
            .clone()
            .layer(axum::Extension(axum::extract::ConnectInfo(peer_addr)));
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(%peer_addr, "TLS handshake failed: {e}");
                    return;
                }
            };
            let io = hyper_util::rt::TokioIo::new(tls_stream);
            let service = hyper_util::service::TowerToHyperService::new(conn_app);
            let builder =
                hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new());
            if let Err(e) = builder.serve_connection_with_upgrades(io, service).await {
                debug!(%peer_addr, "Connection error: {e}");
            }
        });
    }
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

struct Orchestrator {
    args: cli::Args,
    pipeline: Arc<PipelineController>,
    hub_state: Arc<AppState>,
    sig_cmd: mpsc::Sender<SignalingCommand>,
    input_tx: std::sync::mpsc::Sender<InputOp>,
    gamepads: GamepadHub,
    clipboard: ClipboardBridge,
    clipboard_policy: ClipboardPolicy,
    clipboard_out_tx: mpsc::Sender<String>,
    metrics: Arc<Metrics>,
    resize_enabled: bool,
    ping_start: Option<f64>,
    last_cursor: Option<CursorData>,
}

impl Orchestrator {
    fn send_system(&self, action: String) {
        self.pipeline
            .send_channel_message(&OutboundMessage::System { action });
    }

    /// Announce the current pipeline configuration to a freshly opened
    /// data channel.
    fn on_data_channel_open(&self) {
        info!("Data channel open, announcing current state");
        self.send_system(format!("framerate,{}", self.args.framerate));
        self.send_system(format!("video_bitrate,{}", self.args.video_bitrate));
        self.send_system(format!("audio_bitrate,{}", self.args.audio_bitrate));
        self.send_system(format!("resize,{}", self.resize_enabled));
        self.send_system(format!("encoder,{}", self.args.encoder));
        if let Some(cursor) = &self.last_cursor {
            self.pipeline
                .send_channel_message(&OutboundMessage::Cursor(cursor.clone()));
        }
    }

    async fn start_pipeline(&mut self, meta: Option<serde_json::Value>) {
        if let Some(meta) = meta {
            if self.resize_enabled {
                if let Some(res) = meta.get("res").and_then(|v| v.as_str()) {
                    if let Some((w, h)) = glint_protocol::channel::parse_even_resolution(res) {
                        self.request_resize(w, h).await;
                    }
                }
                if let Some(scale) = meta.get("scale").and_then(|v| v.as_f64()) {
                    if let Err(e) = resize::apply_scaling(None, scale).await {
                        warn!("Failed to apply session scale: {e:#}");
                    }
                }
            } else {
                let _ = resize::set_cursor_size(None, 16).await;
            }
        }

        if self.pipeline.state() != PipelineState::Stopped {
            self.pipeline.stop();
        }
        info!("Starting pipeline for new session");
        let pipeline = Arc::clone(&self.pipeline);
        let started = tokio::task::spawn_blocking(move || pipeline.start())
            .await
            .map_err(anyhow::Error::from)
            .and_then(|r| r);
        match started {
            Ok(()) => {
                tokio::spawn(Arc::clone(&self.pipeline).run_bus_loop());
            }
            Err(e) => error!("Failed to start pipeline: {e:#}"),
        }
    }

    async fn request_resize(&self, width: u32, height: u32) {
        match resize::resize_display(None, width, height).await {
            Ok(true) => {
                self.send_system(format!("resolution,{width}x{height}"));
            }
            Ok(false) => {}
            Err(e) => warn!("Resize to {width}x{height} failed: {e:#}"),
        }
    }

    /// One inbound data-channel command.
    async fn handle_channel_message(&mut self, raw: &str) {
        let command = match ChannelCommand::parse(raw) {
            Ok(command) => command,
            Err(e) => {
                debug!(%raw, "Ignoring data channel message: {e}");
                return;
            }
        };
        match command {
            ChannelCommand::Pong => {
                let Some(start) = self.ping_start else {
                    warn!("Received pong before ping");
                    return;
                };
                let latency_ms = ((epoch_seconds() - start) / 2.0 * 1000.0 * 1000.0).round() / 1000.0;
                self.metrics.set_latency(latency_ms as u32);
                self.pipeline
                    .send_channel_message(&OutboundMessage::LatencyMeasurement { latency_ms });
            }
            ChannelCommand::KeyDown { keysym } => {
                let _ = self.input_tx.send(InputOp::Key { keysym, down: true });
            }
            ChannelCommand::KeyUp { keysym } => {
                let _ = self.input_tx.send(InputOp::Key {
                    keysym,
                    down: false,
                });
            }
            ChannelCommand::KeyboardReset => {
                let _ = self.input_tx.send(InputOp::Reset);
            }
            ChannelCommand::Mouse {
                x,
                y,
                button_mask,
                scroll_magnitude,
                relative,
            } => {
                let _ = self.input_tx.send(InputOp::Mouse {
                    x,
                    y,
                    button_mask,
                    scroll_magnitude,
                    relative,
                });
            }
            ChannelCommand::PointerVisible(visible) => {
                info!(visible, "Setting pointer visibility");
                self.pipeline.set_pointer_visible(visible);
                self.pipeline.send_channel_message(&OutboundMessage::Pipeline {
                    status: format!("Set pointer visibility to: {}", visible as u8),
                });
            }
            ChannelCommand::VideoBitrate(bps) => {
                let kbps = bps / 1000;
                info!(kbps, "Client requested video bitrate");
                let _ = cli::set_json_app_argument(
                    &self.args.json_config,
                    "video_bitrate",
                    json!(kbps),
                );
                self.args.video_bitrate = kbps;
                self.pipeline.set_video_bitrate(kbps, false);
                self.pipeline.send_channel_message(&OutboundMessage::Pipeline {
                    status: format!("Video bitrate set to: {kbps}"),
                });
            }
            ChannelCommand::AudioBitrate(bps) => {
                info!(bps, "Client requested audio bitrate");
                let _ = cli::set_json_app_argument(
                    &self.args.json_config,
                    "audio_bitrate",
                    json!(bps),
                );
                self.args.audio_bitrate = bps;
                self.pipeline.set_audio_bitrate(bps);
                self.pipeline.send_channel_message(&OutboundMessage::Pipeline {
                    status: format!("Audio bitrate set to: {bps}"),
                });
            }
            ChannelCommand::GamepadConnect {
                index,
                name,
                num_axes,
                num_btns,
            } => {
                if let Err(e) = self.gamepads.create(index, &name, num_btns, num_axes) {
                    warn!(index, "Failed to create gamepad: {e:#}");
                }
            }
            ChannelCommand::GamepadDisconnect { index } => self.gamepads.destroy(index),
            ChannelCommand::GamepadButton {
                index,
                button,
                value,
            } => self.gamepads.send_button(index, button, value),
            ChannelCommand::GamepadAxis { index, axis, value } => {
                self.gamepads.send_axis(index, axis, value)
            }
            ChannelCommand::ClipboardRead => {
                if !self.clipboard_policy.outbound_enabled() {
                    warn!("Rejecting clipboard read, outbound clipboard disabled");
                    return;
                }
                let bridge = self.clipboard.clone();
                let tx = self.clipboard_out_tx.clone();
                tokio::spawn(async move {
                    match bridge.read().await {
                        Ok(data) if !data.is_empty() => {
                            let _ = tx.send(data).await;
                        }
                        Ok(_) => warn!("No clipboard content to send"),
                        Err(e) => warn!("Clipboard read failed: {e:#}"),
                    }
                });
            }
            ChannelCommand::ClipboardWrite { data } => {
                if !self.clipboard_policy.inbound_enabled() {
                    warn!("Rejecting clipboard write, inbound clipboard disabled");
                    return;
                }
                let bridge = self.clipboard.clone();
                tokio::spawn(async move {
                    if let Err(e) = bridge.write(&data).await {
                        warn!("Clipboard write failed: {e:#}");
                    }
                });
            }
            ChannelCommand::Resize { width, height } => {
                if self.resize_enabled {
                    self.request_resize(width, height).await;
                } else {
                    warn!("Remote resize is disabled, skipping resize to {width}x{height}");
                }
            }
            ChannelCommand::ScalingRatio(scale) => {
                if self.resize_enabled {
                    if let Err(e) = resize::apply_scaling(None, scale).await {
                        warn!("Failed to apply scaling ratio: {e:#}");
                    }
                } else {
                    warn!("Remote resize is disabled, skipping DPI scale change to {scale}");
                }
            }
            ChannelCommand::SetFps(fps) => {
                info!(fps, "Client requested framerate");
                let _ = cli::set_json_app_argument(&self.args.json_config, "framerate", json!(fps));
                self.args.framerate = fps;
                self.pipeline.set_framerate(fps);
                self.send_system(format!("framerate,{fps}"));
            }
            ChannelCommand::SetResizeEnabled {
                enabled,
                resolution,
            } => {
                info!(enabled, "Client toggled remote resize");
                let _ = cli::set_json_app_argument(
                    &self.args.json_config,
                    "enable_resize",
                    json!(enabled),
                );
                self.resize_enabled = enabled;
                if enabled {
                    if let Some((w, h)) = resolution {
                        self.request_resize(w, h).await;
                    }
                }
                self.send_system(format!("resize,{enabled}"));
            }
            ChannelCommand::ClientFps(fps) => self.metrics.set_fps(fps),
            ChannelCommand::ClientLatency(ms) => self.metrics.set_latency(ms),
            ChannelCommand::ClientStats { kind, body } => {
                self.metrics.record_webrtc_stats(kind, &body)
            }
        }
    }

    /// A refreshed RTC config from one of the monitors: re-point webrtcbin
    /// and update the hub's `/turn` payload.
    async fn apply_rtc_config(&self, parsed: ParsedRtcConfig) {
        info!(
            stun = parsed.stun_uris.len(),
            turn = parsed.turn_uris.len(),
            "Applying refreshed RTC configuration"
        );
        self.pipeline
            .update_ice_servers(&parsed.stun_uris, &parsed.turn_uris);
        self.hub_state.set_rtc_config(parsed.raw).await;
    }

    fn telemetry_tick(&mut self, sampler: &mut SystemSampler) {
        let stats = sampler.sample();
        self.pipeline
            .send_channel_message(&OutboundMessage::SystemStats {
                cpu_percent: stats.cpu_percent,
                mem_total: stats.mem_total,
                mem_used: stats.mem_used,
            });
        let now = epoch_seconds();
        self.ping_start = Some(now);
        self.pipeline.send_channel_message(&OutboundMessage::Ping {
            start_time: (now * 1000.0).round() / 1000.0,
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let mut args = cli::parse_args()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(if args.debug { "debug" } else { "info" })
        }))
        .init();

    // Overlay file keys win over CLI/env.
    if let Ok(content) = std::fs::read_to_string(&args.json_config) {
        match serde_json::from_str::<serde_json::Value>(&content) {
            Ok(overlay) => cli::apply_json_overlay(&mut args, &overlay),
            Err(e) => warn!(path = %args.json_config, "Ignoring bad overlay file: {e}"),
        }
    }

    gstreamer::init().context("Failed to initialize GStreamer")?;

    let encoder = pipeline::lookup_encoder(&args.encoder).with_context(|| {
        format!(
            "unsupported encoder '{}', expected one of: {}",
            args.encoder,
            pipeline::ENCODERS
                .iter()
                .map(|e| e.id)
                .collect::<Vec<_>>()
                .join(", ")
        )
    })?;
    PipelineController::check_plugins(&encoder)?;

    let (initial_rtc, rtc_source) = select_initial_rtc_config(&args).await?;

    // Embedded signaling hub.
    let hub_options = ServerOptions {
        addr: args.addr.clone(),
        port: args.port,
        web_root: PathBuf::from(&args.web_root),
        keepalive_timeout: Duration::from_secs(args.keepalive_timeout),
        basic_auth: args.enable_basic_auth.then(|| BasicAuth {
            user: args.basic_auth_user.clone(),
            password: args.basic_auth_password.clone(),
        }),
        turn: TurnSettings {
            shared_secret: if rtc_source == RtcSource::Hmac {
                args.turn_shared_secret.clone()
            } else {
                String::new()
            },
            host: args.turn_host.clone(),
            port: args.turn_port.clone(),
            protocol: args.turn_protocol.clone(),
            tls: args.turn_tls,
            auth_header_name: args.turn_rest_username_auth_header.clone(),
        },
    };
    let hub_state = Arc::new(AppState::new(hub_options, Some(initial_rtc.raw.clone())));
    {
        let state = Arc::clone(&hub_state);
        let hub_args = args.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_hub(state, hub_args).await {
                error!("Signaling hub failed: {e:#}");
                std::process::exit(1);
            }
        });
    }

    // Media pipeline controller.
    let (pipeline_tx, mut pipeline_rx) = mpsc::unbounded_channel();
    let pipeline_controller = PipelineController::new(
        PipelineSettings {
            encoder,
            gpu_id: args.gpu_id,
            framerate: args.framerate,
            video_bitrate_kbps: args.video_bitrate,
            audio_bitrate_bps: args.audio_bitrate,
            audio_channels: args.audio_channels,
            keyframe_distance_secs: args.keyframe_distance,
            congestion_control: args.congestion_control,
            video_packetloss_pct: args.video_packetloss_percent,
            audio_packetloss_pct: args.audio_packetloss_percent,
            enable_audio: args.enable_audio,
            stun_uris: initial_rtc.stun_uris.clone(),
            turn_uris: initial_rtc.turn_uris.clone(),
        },
        pipeline_tx,
    );

    // Loopback signaling client.
    let ws_scheme = if args.enable_https { "wss" } else { "ws" };
    let (sig_cmd_tx, sig_cmd_rx) = mpsc::channel(32);
    let (sig_event_tx, mut sig_event_rx) = mpsc::channel(32);
    let client_config = SignalingClientConfig {
        server_url: format!("{ws_scheme}://127.0.0.1:{}/ws", args.port),
        id: STREAMER_UID.to_string(),
        peer_id: BROWSER_UID.to_string(),
        basic_auth: args.enable_basic_auth.then(|| {
            (
                args.basic_auth_user.clone(),
                args.basic_auth_password.clone(),
            )
        }),
        tls_cert_path: args.https_cert.clone(),
    };
    tokio::spawn(run_signaling_client(client_config, sig_cmd_rx, sig_event_tx));

    // X11 input worker thread.
    let (input_tx, input_rx) = std::sync::mpsc::channel::<InputOp>();
    let uinput_socket = args.uinput_mouse_socket.clone();
    std::thread::Builder::new()
        .name("x11-input".into())
        .spawn(move || {
            let broker = (!uinput_socket.is_empty()).then_some(uinput_socket.as_str());
            let mut injector = match input::InputInjector::new(None, broker) {
                Ok(injector) => injector,
                Err(e) => {
                    error!("Input injector failed to start: {e:#}");
                    std::process::exit(1);
                }
            };
            while let Ok(op) = input_rx.recv() {
                match op {
                    InputOp::Key { keysym, down } => injector.send_key(keysym, down),
                    InputOp::Reset => injector.reset_keyboard(),
                    InputOp::Mouse {
                        x,
                        y,
                        button_mask,
                        scroll_magnitude,
                        relative,
                    } => injector.send_mouse(x, y, button_mask, scroll_magnitude, relative),
                }
            }
        })
        .context("failed to spawn input thread")?;

    // Cursor monitor.
    let cursor_stop = Arc::new(AtomicBool::new(false));
    let mut cursor_rx = if args.enable_cursors {
        Some(cursor::spawn_cursor_monitor(
            None,
            cursor::CursorSizing {
                size: args.cursor_size,
                scale: 1.0,
            },
            Arc::clone(&cursor_stop),
        ))
    } else {
        None
    };

    // Clipboard.
    let clipboard_policy = ClipboardPolicy::parse(&args.enable_clipboard);
    let clipboard_bridge = ClipboardBridge::new(None);
    let (clipboard_out_tx, mut clipboard_out_rx) = mpsc::channel::<String>(8);
    let (stop_tx, stop_rx) = watch::channel(false);
    if clipboard_policy.outbound_enabled() {
        tokio::spawn(clipboard::run_outbound_poll(
            clipboard_bridge.clone(),
            clipboard_out_tx.clone(),
            stop_rx.clone(),
        ));
    } else {
        info!("Skipping outbound clipboard service");
    }

    // TURN refresh monitors; only the active source's monitor runs.
    let (rtc_tx, mut rtc_rx) = mpsc::channel::<ParsedRtcConfig>(4);
    match rtc_source {
        RtcSource::Hmac => {
            tokio::spawn(monitors::run_hmac_monitor(
                monitors::HmacMonitorSettings {
                    host: args.turn_host.clone(),
                    port: args.turn_port.clone(),
                    shared_secret: args.turn_shared_secret.clone(),
                    user: args.turn_rest_username.clone(),
                    protocol: args.turn_protocol.clone(),
                    tls: args.turn_tls,
                    period: monitors::DEFAULT_PERIOD,
                },
                rtc_tx.clone(),
                stop_rx.clone(),
            ));
        }
        RtcSource::Rest => {
            tokio::spawn(monitors::run_rest_monitor(
                rest_monitor_settings(&args),
                rtc_tx.clone(),
                stop_rx.clone(),
            ));
        }
        RtcSource::File => {
            tokio::spawn(monitors::run_file_monitor(
                PathBuf::from(&args.rtc_config_json),
                rtc_tx.clone(),
                stop_rx.clone(),
            ));
        }
        RtcSource::StaticCredentials | RtcSource::Default => {}
    }

    let resize_enabled = args.enable_resize;
    let js_socket_dir = args.js_socket_path.clone();
    let mut orchestrator = Orchestrator {
        args,
        pipeline: Arc::clone(&pipeline_controller),
        hub_state,
        sig_cmd: sig_cmd_tx,
        input_tx,
        gamepads: GamepadHub::new(js_socket_dir),
        clipboard: clipboard_bridge,
        clipboard_policy,
        clipboard_out_tx,
        metrics: Arc::new(Metrics::default()),
        resize_enabled,
        ping_start: None,
        last_cursor: None,
    };

    let mut sampler = SystemSampler::default();
    let mut telemetry_interval = tokio::time::interval(Duration::from_secs(1));
    telemetry_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    info!("Glint streamer ready");

    loop {
        tokio::select! {
            event = sig_event_rx.recv() => {
                let Some(event) = event else {
                    bail!("signaling client terminated unexpectedly");
                };
                match event {
                    SignalingEvent::Connected => {
                        info!("Registered with signaling hub, calling browser peer");
                        let _ = orchestrator.sig_cmd.send(SignalingCommand::SetupCall).await;
                    }
                    SignalingEvent::NoPeer => {
                        debug!("Browser peer not connected yet, retrying in 2s");
                        let cmd = orchestrator.sig_cmd.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(signaling::RETRY_INTERVAL).await;
                            let _ = cmd.send(SignalingCommand::SetupCall).await;
                        });
                    }
                    SignalingEvent::Session { meta } => {
                        info!("Session established with browser peer");
                        orchestrator.start_pipeline(meta).await;
                    }
                    SignalingEvent::Sdp { sdp_type, sdp } => {
                        if let Err(e) = orchestrator.pipeline.set_sdp(&sdp_type, &sdp) {
                            warn!("Failed to apply remote SDP: {e:#}");
                        }
                    }
                    SignalingEvent::Ice { mline_index, candidate } => {
                        if let Err(e) = orchestrator.pipeline.set_ice(mline_index, &candidate) {
                            warn!("Failed to apply ICE candidate: {e:#}");
                        }
                    }
                    SignalingEvent::ProtocolError(message) => {
                        warn!(%message, "Signaling protocol error");
                    }
                    SignalingEvent::Disconnected => {
                        info!("Signaling connection lost, stopping pipeline");
                        orchestrator.pipeline.stop();
                    }
                }
            }
            event = pipeline_rx.recv() => {
                let Some(event) = event else {
                    bail!("pipeline event channel closed unexpectedly");
                };
                match event {
                    PipelineEvent::Offer { sdp } => {
                        let _ = orchestrator.sig_cmd.send(SignalingCommand::SendSdp {
                            sdp_type: "offer".into(),
                            sdp,
                        }).await;
                    }
                    PipelineEvent::IceCandidate { mline_index, candidate } => {
                        let _ = orchestrator.sig_cmd.send(SignalingCommand::SendIce {
                            mline_index,
                            candidate,
                        }).await;
                    }
                    PipelineEvent::DataChannelOpen => orchestrator.on_data_channel_open(),
                    PipelineEvent::DataChannelClose => info!("Data channel closed"),
                    PipelineEvent::DataChannelError(e) => warn!("Data channel error: {e}"),
                    PipelineEvent::DataChannelMessage(msg) => {
                        orchestrator.handle_channel_message(&msg).await;
                    }
                    PipelineEvent::CongestionBitrate(bps) => {
                        orchestrator.pipeline.set_video_bitrate(bps / 1000, true);
                    }
                    PipelineEvent::Eos => {
                        warn!("Pipeline reported EOS, stopping");
                        orchestrator.pipeline.stop();
                    }
                    PipelineEvent::Error(e) => {
                        error!("Pipeline error: {e}");
                        orchestrator.pipeline.stop();
                    }
                }
            }
            cursor = async {
                match cursor_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match cursor {
                    Some(data) => {
                        orchestrator.last_cursor = Some(data.clone());
                        orchestrator.pipeline.send_channel_message(&OutboundMessage::Cursor(data));
                    }
                    // Monitor thread ended; stop selecting on the channel.
                    None => cursor_rx = None,
                }
            }
            text = clipboard_out_rx.recv() => {
                if let Some(text) = text {
                    match OutboundMessage::clipboard(&text) {
                        Some(msg) => orchestrator.pipeline.send_channel_message(&msg),
                        None => warn!(
                            len = text.len(),
                            "Clipboard content exceeds data channel frame limit, dropped"
                        ),
                    }
                }
            }
            parsed = rtc_rx.recv() => {
                if let Some(parsed) = parsed {
                    orchestrator.apply_rtc_config(parsed).await;
                }
            }
            _ = telemetry_interval.tick() => {
                if orchestrator.pipeline.is_data_channel_open() {
                    orchestrator.telemetry_tick(&mut sampler);
                }
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

    // Cooperative shutdown: stop the pollers, close the pads, tear down
    // the pipeline.
    let _ = stop_tx.send(true);
    cursor_stop.store(true, Ordering::Relaxed);
    orchestrator.gamepads.destroy_all();
    orchestrator.pipeline.stop();
    info!("Glint streamer stopped");
    Ok(())
}

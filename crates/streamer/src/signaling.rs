//! Loopback signaling client.
//!
//! Speaks the hub's text protocol from the media side: registers with
//! `HELLO <id>`, pairs with the browser peer via `SESSION <peer>`, then
//! exchanges `{"sdp": ...}` / `{"ice": ...}` JSON envelopes. Connection
//! refusals retry every 2 seconds forever; a missing peer surfaces as the
//! typed [`SignalingEvent::NoPeer`] so the orchestrator can re-dial the
//! call on its own cadence.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::{debug, info, warn};

/// Fixed reconnect/retry backoff for signaling.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Events surfaced to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Server echoed HELLO; registration complete.
    Connected,
    /// `SESSION_OK`, with the callee's decoded metadata when present.
    Session { meta: Option<serde_json::Value> },
    Sdp {
        sdp_type: String,
        sdp: String,
    },
    Ice {
        mline_index: u32,
        candidate: String,
    },
    /// The requested peer is not registered yet; retry the call later.
    NoPeer,
    ProtocolError(String),
    Disconnected,
}

/// Commands from the orchestrator into the client task.
#[derive(Debug, Clone)]
pub enum SignalingCommand {
    /// Send `SESSION <peer_id>`.
    SetupCall,
    SendSdp { sdp_type: String, sdp: String },
    SendIce { mline_index: u32, candidate: String },
}

#[derive(Clone)]
pub struct SignalingClientConfig {
    /// WebSocket URL, e.g. `ws://127.0.0.1:8080/ws`.
    pub server_url: String,
    /// Our registration UID.
    pub id: String,
    /// The browser peer we call.
    pub peer_id: String,
    pub basic_auth: Option<(String, String)>,
    /// Optional certificate to pin for wss:// loopback connections.
    pub tls_cert_path: Option<String>,
}

/// Classify one text frame from the hub.
fn parse_server_message(text: &str, peer_id: &str) -> SignalingEvent {
    if text == "HELLO" {
        return SignalingEvent::Connected;
    }
    if let Some(rest) = text.strip_prefix("SESSION_OK") {
        let rest = rest.trim();
        let meta = if rest.is_empty() {
            None
        } else {
            decode_meta(rest)
        };
        return SignalingEvent::Session { meta };
    }
    if text.starts_with("ERROR") {
        if text == format!("ERROR peer '{peer_id}' not found") {
            return SignalingEvent::NoPeer;
        }
        return SignalingEvent::ProtocolError(text.to_string());
    }

    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            return SignalingEvent::ProtocolError(format!("error parsing message as JSON: {text}"));
        }
    };
    if let Some(sdp) = value.get("sdp") {
        let sdp_type = sdp.get("type").and_then(|v| v.as_str()).unwrap_or_default();
        let sdp_text = sdp.get("sdp").and_then(|v| v.as_str()).unwrap_or_default();
        if sdp_type.is_empty() {
            return SignalingEvent::ProtocolError("SDP envelope missing type".to_string());
        }
        return SignalingEvent::Sdp {
            sdp_type: sdp_type.to_string(),
            sdp: sdp_text.to_string(),
        };
    }
    if let Some(ice) = value.get("ice") {
        let mline_index = ice
            .get("sdpMLineIndex")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;
        let candidate = ice
            .get("candidate")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        return SignalingEvent::Ice {
            mline_index,
            candidate: candidate.to_string(),
        };
    }
    SignalingEvent::ProtocolError(format!("unhandled JSON message: {text}"))
}

fn decode_meta(b64: &str) -> Option<serde_json::Value> {
    let bytes = BASE64.decode(b64).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn build_tls_connector(tls_cert_path: Option<&str>) -> tokio_tungstenite::Connector {
    let mut root_store = rustls::RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
        warn!("Could not load a platform certificate: {error}");
    }
    for cert in native.certs {
        let _ = root_store.add(cert);
    }

    if let Some(cert_path) = tls_cert_path {
        match std::fs::read(cert_path) {
            Ok(pem_data) => {
                let certs: Vec<_> = rustls_pemfile::certs(&mut pem_data.as_slice())
                    .filter_map(|r| r.ok())
                    .collect();
                for cert in certs {
                    if let Err(e) = root_store.add(cert) {
                        warn!("Failed to add pinned cert to root store: {e}");
                    } else {
                        info!("Pinned signaling certificate from {cert_path}");
                    }
                }
            }
            Err(e) => {
                warn!("Failed to read TLS cert from {cert_path}: {e}, using system roots");
            }
        }
    }

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    tokio_tungstenite::Connector::Rustls(Arc::new(tls_config))
}

/// Run the signaling connection until the command channel closes.
/// Reconnects on every failure with the fixed 2-second interval.
pub async fn run_signaling_client(
    config: SignalingClientConfig,
    mut cmd_rx: mpsc::Receiver<SignalingCommand>,
    event_tx: mpsc::Sender<SignalingEvent>,
) {
    loop {
        info!(url = %config.server_url, id = %config.id, "Connecting to signaling hub");
        match connect_and_handle(&config, &mut cmd_rx, &event_tx).await {
            Ok(ConnectionEnd::CommandChannelClosed) => {
                info!("Signaling client stopping");
                return;
            }
            Ok(ConnectionEnd::SocketClosed) => {
                let _ = event_tx.send(SignalingEvent::Disconnected).await;
            }
            Err(e) => {
                debug!("Signaling connection error: {e:#}");
                let _ = event_tx.send(SignalingEvent::Disconnected).await;
            }
        }
        tokio::time::sleep(RETRY_INTERVAL).await;
    }
}

enum ConnectionEnd {
    SocketClosed,
    CommandChannelClosed,
}

async fn connect_and_handle(
    config: &SignalingClientConfig,
    cmd_rx: &mut mpsc::Receiver<SignalingCommand>,
    event_tx: &mpsc::Sender<SignalingEvent>,
) -> anyhow::Result<ConnectionEnd> {
    let mut request = config
        .server_url
        .as_str()
        .into_client_request()
        .context("Invalid signaling URL")?;
    if let Some((user, password)) = &config.basic_auth {
        let credentials = BASE64.encode(format!("{user}:{password}"));
        request.headers_mut().insert(
            "Authorization",
            format!("Basic {credentials}")
                .parse()
                .context("Invalid basic auth header")?,
        );
    }

    let connector = build_tls_connector(config.tls_cert_path.as_deref());
    let (ws_stream, _) = tokio_tungstenite::connect_async_tls_with_config(
        request,
        None,
        false,
        Some(connector),
    )
    .await
    .context("WebSocket connection failed")?;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    ws_tx
        .send(Message::Text(format!("HELLO {}", config.id).into()))
        .await
        .context("Failed to send HELLO")?;

    loop {
        tokio::select! {
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let event = parse_server_message(&text, &config.peer_id);
                    if matches!(event, SignalingEvent::ProtocolError(_)) {
                        warn!(%text, "Unhandled signaling message");
                    }
                    if event_tx.send(event).await.is_err() {
                        return Ok(ConnectionEnd::CommandChannelClosed);
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = ws_tx.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => return Ok(ConnectionEnd::SocketClosed),
                Some(Err(e)) => return Err(e.into()),
                _ => {}
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(SignalingCommand::SetupCall) => {
                    debug!(peer = %config.peer_id, "Setting up call");
                    ws_tx
                        .send(Message::Text(format!("SESSION {}", config.peer_id).into()))
                        .await?;
                }
                Some(SignalingCommand::SendSdp { sdp_type, sdp }) => {
                    info!(%sdp_type, "Sending SDP");
                    let msg = json!({ "sdp": { "type": sdp_type, "sdp": sdp } });
                    ws_tx.send(Message::Text(msg.to_string().into())).await?;
                }
                Some(SignalingCommand::SendIce { mline_index, candidate }) => {
                    debug!(mline_index, "Sending ICE candidate");
                    let msg = json!({
                        "ice": { "candidate": candidate, "sdpMLineIndex": mline_index }
                    });
                    ws_tx.send(Message::Text(msg.to_string().into())).await?;
                }
                None => return Ok(ConnectionEnd::CommandChannelClosed),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_is_connected() {
        assert_eq!(parse_server_message("HELLO", "1"), SignalingEvent::Connected);
    }

    #[test]
    fn session_ok_without_meta() {
        assert_eq!(
            parse_server_message("SESSION_OK", "1"),
            SignalingEvent::Session { meta: None }
        );
        // Trailing space form some hubs emit
        assert_eq!(
            parse_server_message("SESSION_OK ", "1"),
            SignalingEvent::Session { meta: None }
        );
    }

    #[test]
    fn session_ok_with_meta_decodes_json() {
        // base64 of {"res":"1920x1080"}
        let msg = "SESSION_OK eyJyZXMiOiIxOTIweDEwODAifQ==";
        match parse_server_message(msg, "1") {
            SignalingEvent::Session { meta: Some(meta) } => {
                assert_eq!(meta["res"], "1920x1080");
            }
            other => panic!("expected Session with meta, got {other:?}"),
        }
    }

    #[test]
    fn no_peer_error_is_typed() {
        assert_eq!(
            parse_server_message("ERROR peer '1' not found", "1"),
            SignalingEvent::NoPeer
        );
        assert!(matches!(
            parse_server_message("ERROR peer '2' not found", "1"),
            SignalingEvent::ProtocolError(_)
        ));
        assert!(matches!(
            parse_server_message("ERROR peer '1' busy", "1"),
            SignalingEvent::ProtocolError(_)
        ));
    }

    #[test]
    fn sdp_envelope_dispatches() {
        let msg = r#"{"sdp": {"type": "answer", "sdp": "v=0\r\n"}}"#;
        assert_eq!(
            parse_server_message(msg, "1"),
            SignalingEvent::Sdp {
                sdp_type: "answer".into(),
                sdp: "v=0\r\n".into(),
            }
        );
    }

    #[test]
    fn sdp_without_type_is_protocol_error() {
        let msg = r#"{"sdp": {"sdp": "v=0"}}"#;
        assert!(matches!(
            parse_server_message(msg, "1"),
            SignalingEvent::ProtocolError(_)
        ));
    }

    #[test]
    fn ice_envelope_dispatches() {
        let msg = r#"{"ice": {"sdpMLineIndex": 1, "candidate": "candidate:0 1 UDP"}}"#;
        assert_eq!(
            parse_server_message(msg, "1"),
            SignalingEvent::Ice {
                mline_index: 1,
                candidate: "candidate:0 1 UDP".into(),
            }
        );
    }

    #[test]
    fn junk_is_protocol_error() {
        assert!(matches!(
            parse_server_message("not json at all", "1"),
            SignalingEvent::ProtocolError(_)
        ));
        assert!(matches!(
            parse_server_message(r#"{"other": 1}"#, "1"),
            SignalingEvent::ProtocolError(_)
        ));
    }
}

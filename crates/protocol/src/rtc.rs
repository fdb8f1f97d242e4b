use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;

/// Credential lifetime for HMAC TURN credentials.
pub const CREDENTIAL_LIFETIME_SECS: u64 = 24 * 3600;

/// RTC configuration document served to browsers and fed to webrtcbin.
///
/// Matches the schema of Google's TURN REST responses:
/// `lifetimeDuration`, `iceTransportPolicy`, `blockStatus` plus an ordered
/// `iceServers` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcConfig {
    pub lifetime_duration: String,
    pub ice_transport_policy: String,
    pub block_status: String,
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RtcConfigError {
    #[error("RTC config data was empty")]
    Empty,
    #[error("malformed RTC config: {0}")]
    Malformed(String),
}

/// Parsed view of an [`RtcConfig`]: webrtcbin-ready URI lists plus the raw
/// JSON bytes for re-serving at `/turn`.
#[derive(Debug, Clone)]
pub struct ParsedRtcConfig {
    pub stun_uris: Vec<String>,
    pub turn_uris: Vec<String>,
    pub raw: String,
}

/// Build a time-limited TURN credential from a shared secret.
///
/// `username` is `<epoch_expiry>:<user>` with any `:` in the user replaced
/// by `-` (a raw colon would collide with the expiry separator), and the
/// credential is `base64(HMAC-SHA1(secret, username))`, the coturn
/// `use-auth-secret` scheme.
pub fn hmac_credential(secret: &str, user: &str, now_epoch: u64) -> (String, String) {
    let sanitized = user.replace(':', "-");
    let exp = now_epoch + CREDENTIAL_LIFETIME_SECS;
    let username = format!("{exp}:{sanitized}");

    let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| Hmac::<Sha1>::new_from_slice(&[]).unwrap());
    mac.update(username.as_bytes());
    let credential = BASE64.encode(mac.finalize().into_bytes());

    (username, credential)
}

fn now_epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Generate a complete RTC config JSON with fresh HMAC TURN credentials.
///
/// `protocol` is `udp` or `tcp`; `tls` switches the TURN URI scheme to
/// `turns:`. The first ice server carries the host STUN address plus the
/// Google fallback, the second the TURN relay with credentials.
pub fn make_rtc_config(
    host: &str,
    port: &str,
    secret: &str,
    user: &str,
    protocol: &str,
    tls: bool,
) -> String {
    make_rtc_config_at(host, port, secret, user, protocol, tls, now_epoch_seconds())
}

/// [`make_rtc_config`] with an explicit clock, so expiry is testable.
pub fn make_rtc_config_at(
    host: &str,
    port: &str,
    secret: &str,
    user: &str,
    protocol: &str,
    tls: bool,
    now_epoch: u64,
) -> String {
    let (username, credential) = hmac_credential(secret, user, now_epoch);
    let scheme = if tls { "turns" } else { "turn" };

    let config = RtcConfig {
        lifetime_duration: format!("{CREDENTIAL_LIFETIME_SECS}s"),
        ice_transport_policy: "all".into(),
        block_status: "NOT_BLOCKED".into(),
        ice_servers: vec![
            IceServer {
                urls: vec![
                    format!("stun:{host}:{port}"),
                    "stun:stun.l.google.com:19302".into(),
                ],
                username: None,
                credential: None,
            },
            IceServer {
                urls: vec![format!("{scheme}:{host}:{port}?transport={protocol}")],
                username: Some(username),
                credential: Some(credential),
            },
        ],
    };

    // RtcConfig serializes infallibly (no maps with non-string keys).
    serde_json::to_string_pretty(&config).unwrap_or_default()
}

/// Static RTC config for long-term (non-HMAC) TURN credentials.
pub fn make_static_rtc_config(
    host: &str,
    port: &str,
    username: &str,
    credential: &str,
    protocol: &str,
    tls: bool,
) -> String {
    let scheme = if tls { "turns" } else { "turn" };
    let config = RtcConfig {
        lifetime_duration: format!("{CREDENTIAL_LIFETIME_SECS}s"),
        ice_transport_policy: "all".into(),
        block_status: "NOT_BLOCKED".into(),
        ice_servers: vec![
            IceServer {
                urls: vec![
                    format!("stun:{host}:{port}"),
                    "stun:stun.l.google.com:19302".into(),
                ],
                username: None,
                credential: None,
            },
            IceServer {
                urls: vec![format!("{scheme}:{host}:{port}?transport={protocol}")],
                username: Some(username.to_string()),
                credential: Some(credential.to_string()),
            },
        ],
    };
    serde_json::to_string_pretty(&config).unwrap_or_default()
}

/// STUN-only fallback used when no TURN source is configured.
pub fn default_rtc_config() -> String {
    let config = RtcConfig {
        lifetime_duration: format!("{CREDENTIAL_LIFETIME_SECS}s"),
        ice_transport_policy: "all".into(),
        block_status: "NOT_BLOCKED".into(),
        ice_servers: vec![IceServer {
            urls: vec!["stun:stun.l.google.com:19302".into()],
            username: None,
            credential: None,
        }],
    };
    serde_json::to_string_pretty(&config).unwrap_or_default()
}

/// Parse an RTC config JSON into webrtcbin URI lists.
///
/// STUN entries become `stun://host:port` (query string dropped). TURN
/// entries become `{turn|turns}://user:credential@host:port` with user and
/// credential percent-escaped with an empty safe set (webrtcbin re-decodes them).
pub fn parse_rtc_config(data: &str) -> Result<ParsedRtcConfig, RtcConfigError> {
    if data.trim().is_empty() {
        return Err(RtcConfigError::Empty);
    }
    let config: RtcConfig =
        serde_json::from_str(data).map_err(|e| RtcConfigError::Malformed(e.to_string()))?;

    let mut stun_uris = Vec::new();
    let mut turn_uris = Vec::new();

    for server in &config.ice_servers {
        for url in &server.urls {
            if let Some(rest) = url.strip_prefix("stun:") {
                let (host, port) = split_host_port(rest)?;
                stun_uris.push(format!("stun://{host}:{port}"));
            } else if url.starts_with("turn:") || url.starts_with("turns:") {
                let (scheme, rest) = url
                    .split_once(':')
                    .ok_or_else(|| RtcConfigError::Malformed(format!("bad TURN url: {url}")))?;
                let (host, port) = split_host_port(rest)?;
                let user = server.username.as_deref().ok_or_else(|| {
                    RtcConfigError::Malformed("TURN server missing username".into())
                })?;
                let credential = server.credential.as_deref().ok_or_else(|| {
                    RtcConfigError::Malformed("TURN server missing credential".into())
                })?;
                turn_uris.push(format!(
                    "{scheme}://{}:{}@{host}:{port}",
                    urlencoding::encode(user),
                    urlencoding::encode(credential),
                ));
            }
        }
    }

    Ok(ParsedRtcConfig {
        stun_uris,
        turn_uris,
        raw: data.to_string(),
    })
}

fn split_host_port(rest: &str) -> Result<(&str, &str), RtcConfigError> {
    let (host, tail) = rest
        .split_once(':')
        .ok_or_else(|| RtcConfigError::Malformed(format!("missing port in: {rest}")))?;
    let port = tail.split('?').next().unwrap_or(tail);
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_credential_sanitizes_user_and_offsets_expiry() {
        let (username, _credential) = hmac_credential("s3cret", "alice:admin", 1_700_000_000);
        assert_eq!(username, "1700086400:alice-admin");
    }

    #[test]
    fn hmac_credential_is_deterministic() {
        let (u1, c1) = hmac_credential("s3cret", "alice:admin", 1_700_000_000);
        let (u2, c2) = hmac_credential("s3cret", "alice:admin", 1_700_000_000);
        assert_eq!(u1, u2);
        assert_eq!(c1, c2);
        // base64(SHA1 HMAC) is always 28 chars
        assert_eq!(c1.len(), 28);
    }

    #[test]
    fn hmac_expiry_parses_from_username_prefix() {
        let now = 1_700_000_000u64;
        let (username, _) = hmac_credential("secret", "user", now);
        let exp: u64 = username.split(':').next().unwrap().parse().unwrap();
        assert!(exp >= now && exp <= now + CREDENTIAL_LIFETIME_SECS + 1);
    }

    #[test]
    fn make_rtc_config_emits_expected_turn_uri() {
        let json = make_rtc_config_at(
            "turn.example",
            "3478",
            "s3cret",
            "alice:admin",
            "udp",
            false,
            1_700_000_000,
        );
        let config: RtcConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.lifetime_duration, "86400s");
        assert_eq!(config.ice_transport_policy, "all");
        assert_eq!(config.block_status, "NOT_BLOCKED");
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(
            config.ice_servers[0].urls,
            vec![
                "stun:turn.example:3478".to_string(),
                "stun:stun.l.google.com:19302".to_string()
            ]
        );
        assert_eq!(
            config.ice_servers[1].urls,
            vec!["turn:turn.example:3478?transport=udp".to_string()]
        );
        assert_eq!(
            config.ice_servers[1].username.as_deref(),
            Some("1700086400:alice-admin")
        );
    }

    #[test]
    fn make_rtc_config_tls_uses_turns_scheme() {
        let json =
            make_rtc_config_at("relay.example", "5349", "s", "u", "tcp", true, 1_700_000_000);
        assert!(json.contains("turns:relay.example:5349?transport=tcp"));
    }

    #[test]
    fn parse_extracts_stun_and_turn_uris() {
        let json = make_rtc_config_at(
            "turn.example",
            "3478",
            "s3cret",
            "alice",
            "udp",
            false,
            1_700_000_000,
        );
        let parsed = parse_rtc_config(&json).unwrap();
        assert_eq!(
            parsed.stun_uris,
            vec![
                "stun://turn.example:3478".to_string(),
                "stun://stun.l.google.com:19302".to_string()
            ]
        );
        assert_eq!(parsed.turn_uris.len(), 1);
        assert!(parsed.turn_uris[0].starts_with("turn://1700086400%3Aalice:"));
        assert!(parsed.turn_uris[0].ends_with("@turn.example:3478"));
    }

    #[test]
    fn parse_percent_escapes_credentials() {
        let json = make_static_rtc_config("h", "3478", "us/er", "p@ss/word", "udp", false);
        let parsed = parse_rtc_config(&json).unwrap();
        assert_eq!(parsed.turn_uris, vec![
            "turn://us%2Fer:p%40ss%2Fword@h:3478".to_string()
        ]);
    }

    #[test]
    fn parse_drops_stun_query_string() {
        let json = r#"{
            "lifetimeDuration": "86400s",
            "iceTransportPolicy": "all",
            "blockStatus": "NOT_BLOCKED",
            "iceServers": [{"urls": ["stun:example.org:3478?transport=udp"]}]
        }"#;
        let parsed = parse_rtc_config(json).unwrap();
        assert_eq!(parsed.stun_uris, vec!["stun://example.org:3478".to_string()]);
    }

    #[test]
    fn parse_roundtrip_is_stable() {
        let json = make_rtc_config_at("h", "3478", "s", "u", "tcp", false, 1_700_000_000);
        let first = parse_rtc_config(&json).unwrap();
        let second = parse_rtc_config(&first.raw).unwrap();
        assert_eq!(first.stun_uris, second.stun_uris);
        assert_eq!(first.turn_uris, second.turn_uris);
    }

    #[test]
    fn parse_rejects_empty() {
        assert!(matches!(parse_rtc_config(""), Err(RtcConfigError::Empty)));
        assert!(matches!(
            parse_rtc_config("   "),
            Err(RtcConfigError::Empty)
        ));
    }

    #[test]
    fn parse_rejects_missing_keys() {
        assert!(matches!(
            parse_rtc_config(r#"{"iceServers": []}"#),
            Err(RtcConfigError::Malformed(_))
        ));
        let no_cred = r#"{
            "lifetimeDuration": "86400s",
            "iceTransportPolicy": "all",
            "blockStatus": "NOT_BLOCKED",
            "iceServers": [{"urls": ["turn:h:3478?transport=udp"]}]
        }"#;
        assert!(matches!(
            parse_rtc_config(no_cred),
            Err(RtcConfigError::Malformed(_))
        ));
    }

    #[test]
    fn default_config_is_stun_only() {
        let parsed = parse_rtc_config(&default_rtc_config()).unwrap();
        assert_eq!(parsed.stun_uris.len(), 1);
        assert!(parsed.turn_uris.is_empty());
    }
}

use anyhow::{Context, Result, bail};
use serde_json::Value;

/// Streamer configuration. Every flag has a parallel `GLINT_*` environment
/// variable; the JSON overlay file re-applies a handful of keys on top so
/// client-requested changes survive restarts.
#[derive(Debug, Clone)]
pub struct Args {
    pub json_config: String,
    pub addr: String,
    pub port: u16,
    pub web_root: String,
    pub enable_https: bool,
    pub https_cert: Option<String>,
    pub https_key: Option<String>,
    pub enable_basic_auth: bool,
    pub basic_auth_user: String,
    pub basic_auth_password: String,
    pub turn_rest_uri: String,
    pub turn_rest_username: String,
    pub turn_rest_username_auth_header: String,
    pub turn_rest_protocol_header: String,
    pub turn_rest_tls_header: String,
    pub rtc_config_json: String,
    pub turn_host: String,
    pub turn_port: String,
    pub turn_protocol: String,
    pub turn_tls: bool,
    pub turn_shared_secret: String,
    pub turn_username: String,
    pub turn_password: String,
    pub uinput_mouse_socket: String,
    pub js_socket_path: String,
    pub encoder: String,
    pub gpu_id: u32,
    pub framerate: u32,
    /// Video bitrate in kbps.
    pub video_bitrate: u32,
    /// Seconds between keyframes; -1 keeps the GOP infinite.
    pub keyframe_distance: f64,
    pub congestion_control: bool,
    pub video_packetloss_percent: f64,
    /// Audio bitrate in bps.
    pub audio_bitrate: u32,
    pub audio_channels: u32,
    pub audio_packetloss_percent: f64,
    pub enable_audio: bool,
    /// Clipboard policy: `true`, `false`, `in`, or `out`.
    pub enable_clipboard: String,
    pub enable_resize: bool,
    pub enable_cursors: bool,
    pub cursor_size: i32,
    pub keepalive_timeout: u64,
    pub debug: bool,
}

fn env_default(name: &str, fallback: &str) -> String {
    std::env::var(format!("GLINT_{name}")).unwrap_or_else(|_| fallback.to_string())
}

fn env_flag(name: &str, fallback: bool) -> bool {
    std::env::var(format!("GLINT_{name}"))
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(fallback)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "host".to_string())
}

impl Default for Args {
    fn default() -> Self {
        Self {
            json_config: env_default("JSON_CONFIG", "/tmp/glint_config.json"),
            addr: env_default("ADDR", "0.0.0.0"),
            port: 8080,
            web_root: env_default("WEB_ROOT", "/opt/glint-web"),
            enable_https: env_flag("ENABLE_HTTPS", false),
            https_cert: std::env::var("GLINT_HTTPS_CERT").ok(),
            https_key: std::env::var("GLINT_HTTPS_KEY").ok(),
            enable_basic_auth: env_flag("ENABLE_BASIC_AUTH", false),
            basic_auth_user: env_default(
                "BASIC_AUTH_USER",
                &std::env::var("USER").unwrap_or_default(),
            ),
            basic_auth_password: env_default("BASIC_AUTH_PASSWORD", ""),
            turn_rest_uri: env_default("TURN_REST_URI", ""),
            turn_rest_username: env_default(
                "TURN_REST_USERNAME",
                &format!("glint-{}", hostname()),
            ),
            turn_rest_username_auth_header: env_default(
                "TURN_REST_USERNAME_AUTH_HEADER",
                "x-auth-user",
            ),
            turn_rest_protocol_header: env_default("TURN_REST_PROTOCOL_HEADER", "x-turn-protocol"),
            turn_rest_tls_header: env_default("TURN_REST_TLS_HEADER", "x-turn-tls"),
            rtc_config_json: env_default("RTC_CONFIG_JSON", "/tmp/rtc.json"),
            turn_host: env_default("TURN_HOST", ""),
            turn_port: env_default("TURN_PORT", ""),
            turn_protocol: env_default("TURN_PROTOCOL", "udp"),
            turn_tls: env_flag("TURN_TLS", false),
            turn_shared_secret: env_default("TURN_SHARED_SECRET", ""),
            turn_username: env_default("TURN_USERNAME", ""),
            turn_password: env_default("TURN_PASSWORD", ""),
            uinput_mouse_socket: env_default("UINPUT_MOUSE_SOCKET", ""),
            js_socket_path: env_default("JS_SOCKET_PATH", "/tmp"),
            encoder: env_default("ENCODER", "x264enc"),
            gpu_id: 0,
            framerate: 60,
            video_bitrate: 8000,
            keyframe_distance: -1.0,
            congestion_control: env_flag("CONGESTION_CONTROL", false),
            video_packetloss_percent: 0.0,
            audio_bitrate: 128_000,
            audio_channels: 2,
            audio_packetloss_percent: 0.0,
            enable_audio: env_flag("ENABLE_AUDIO", true),
            enable_clipboard: env_default("ENABLE_CLIPBOARD", "true"),
            enable_resize: env_flag("ENABLE_RESIZE", false),
            enable_cursors: env_flag("ENABLE_CURSORS", true),
            cursor_size: -1,
            keepalive_timeout: 30,
            debug: env_flag("DEBUG", false),
        }
    }
}

pub fn parse_args() -> Result<Args> {
    let mut parsed = Args::default();

    // Numeric env overrides parse here so bad values fail loudly.
    parsed.port = env_default("PORT", "8080").parse().context("Invalid GLINT_PORT")?;
    parsed.gpu_id = env_default("GPU_ID", "0").parse().context("Invalid GLINT_GPU_ID")?;
    parsed.framerate = env_default("FRAMERATE", "60")
        .parse()
        .context("Invalid GLINT_FRAMERATE")?;
    parsed.video_bitrate = env_default("VIDEO_BITRATE", "8000")
        .parse()
        .context("Invalid GLINT_VIDEO_BITRATE")?;
    parsed.keyframe_distance = env_default("KEYFRAME_DISTANCE", "-1")
        .parse()
        .context("Invalid GLINT_KEYFRAME_DISTANCE")?;
    parsed.video_packetloss_percent = env_default("VIDEO_PACKETLOSS_PERCENT", "0")
        .parse()
        .context("Invalid GLINT_VIDEO_PACKETLOSS_PERCENT")?;
    parsed.audio_bitrate = env_default("AUDIO_BITRATE", "128000")
        .parse()
        .context("Invalid GLINT_AUDIO_BITRATE")?;
    parsed.audio_channels = env_default("AUDIO_CHANNELS", "2")
        .parse()
        .context("Invalid GLINT_AUDIO_CHANNELS")?;
    parsed.audio_packetloss_percent = env_default("AUDIO_PACKETLOSS_PERCENT", "0")
        .parse()
        .context("Invalid GLINT_AUDIO_PACKETLOSS_PERCENT")?;
    parsed.cursor_size = env_default(
        "CURSOR_SIZE",
        &std::env::var("XCURSOR_SIZE").unwrap_or_else(|_| "-1".into()),
    )
    .parse()
    .context("Invalid GLINT_CURSOR_SIZE")?;
    parsed.keepalive_timeout = env_default("KEEPALIVE_TIMEOUT", "30")
        .parse()
        .context("Invalid GLINT_KEEPALIVE_TIMEOUT")?;

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
                println!("glint-streamer {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "--json-config" => parsed.json_config = value(&mut i)?,
            "--addr" => parsed.addr = value(&mut i)?,
            "--port" => parsed.port = value(&mut i)?.parse().context("Invalid --port")?,
            "--web-root" => parsed.web_root = value(&mut i)?,
            "--enable-https" => parsed.enable_https = true,
            "--https-cert" => parsed.https_cert = Some(value(&mut i)?),
            "--https-key" => parsed.https_key = Some(value(&mut i)?),
            "--enable-basic-auth" => parsed.enable_basic_auth = true,
            "--basic-auth-user" => parsed.basic_auth_user = value(&mut i)?,
            "--basic-auth-password" => parsed.basic_auth_password = value(&mut i)?,
            "--turn-rest-uri" => parsed.turn_rest_uri = value(&mut i)?,
            "--turn-rest-username" => parsed.turn_rest_username = value(&mut i)?,
            "--turn-rest-username-auth-header" => {
                parsed.turn_rest_username_auth_header = value(&mut i)?
            }
            "--turn-rest-protocol-header" => parsed.turn_rest_protocol_header = value(&mut i)?,
            "--turn-rest-tls-header" => parsed.turn_rest_tls_header = value(&mut i)?,
            "--rtc-config-json" => parsed.rtc_config_json = value(&mut i)?,
            "--turn-host" => parsed.turn_host = value(&mut i)?,
            "--turn-port" => parsed.turn_port = value(&mut i)?,
            "--turn-protocol" => parsed.turn_protocol = value(&mut i)?,
            "--enable-turn-tls" => parsed.turn_tls = true,
            "--turn-shared-secret" => parsed.turn_shared_secret = value(&mut i)?,
            "--turn-username" => parsed.turn_username = value(&mut i)?,
            "--turn-password" => parsed.turn_password = value(&mut i)?,
            "--uinput-mouse-socket" => parsed.uinput_mouse_socket = value(&mut i)?,
            "--js-socket-path" => parsed.js_socket_path = value(&mut i)?,
            "--encoder" => parsed.encoder = value(&mut i)?,
            "--gpu-id" => parsed.gpu_id = value(&mut i)?.parse().context("Invalid --gpu-id")?,
            "--framerate" => {
                parsed.framerate = value(&mut i)?.parse().context("Invalid --framerate")?
            }
            "--video-bitrate" => {
                parsed.video_bitrate =
                    value(&mut i)?.parse().context("Invalid --video-bitrate")?
            }
            "--keyframe-distance" => {
                parsed.keyframe_distance =
                    value(&mut i)?.parse().context("Invalid --keyframe-distance")?
            }
            "--congestion-control" => parsed.congestion_control = true,
            "--video-packetloss-percent" => {
                parsed.video_packetloss_percent = value(&mut i)?
                    .parse()
                    .context("Invalid --video-packetloss-percent")?
            }
            "--audio-bitrate" => {
                parsed.audio_bitrate =
                    value(&mut i)?.parse().context("Invalid --audio-bitrate")?
            }
            "--audio-channels" => {
                parsed.audio_channels =
                    value(&mut i)?.parse().context("Invalid --audio-channels")?
            }
            "--audio-packetloss-percent" => {
                parsed.audio_packetloss_percent = value(&mut i)?
                    .parse()
                    .context("Invalid --audio-packetloss-percent")?
            }
            "--disable-audio" => parsed.enable_audio = false,
            "--enable-clipboard" => parsed.enable_clipboard = value(&mut i)?,
            "--enable-resize" => parsed.enable_resize = true,
            "--disable-cursors" => parsed.enable_cursors = false,
            "--cursor-size" => {
                parsed.cursor_size = value(&mut i)?.parse().context("Invalid --cursor-size")?
            }
            "--keepalive-timeout" => {
                parsed.keepalive_timeout =
                    value(&mut i)?.parse().context("Invalid --keepalive-timeout")?
            }
            "--debug" => parsed.debug = true,
            other => bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    if parsed.turn_protocol != "tcp" {
        parsed.turn_protocol = "udp".to_string();
    }
    // The REST username feeds the exp:user credential; a raw colon would
    // corrupt the separator.
    parsed.turn_rest_username = parsed.turn_rest_username.replace(':', "-");

    if !parsed.turn_shared_secret.is_empty()
        && (parsed.turn_host.is_empty() || parsed.turn_port.is_empty())
    {
        bail!("--turn-host and --turn-port are required with --turn-shared-secret");
    }

    Ok(parsed)
}

fn print_help() {
    println!("glint-streamer - Glint remote desktop streaming host");
    println!();
    println!("USAGE:");
    println!("    glint-streamer [OPTIONS]");
    println!();
    println!("Each option reads its default from a GLINT_* environment variable.");
    println!();
    println!("OPTIONS:");
    println!("    --json-config <PATH>             Argument overlay file [default: /tmp/glint_config.json]");
    println!("    --addr <ADDR>                    Signaling/web listen address [default: 0.0.0.0]");
    println!("    --port <PORT>                    Signaling/web listen port [default: 8080]");
    println!("    --web-root <DIR>                 Web application directory");
    println!("    --enable-https                   Serve HTTPS/WSS");
    println!("    --https-cert <PATH>              TLS certificate path");
    println!("    --https-key <PATH>               TLS private key path");
    println!("    --enable-basic-auth              Require basic authentication");
    println!("    --basic-auth-user <USER>         Basic auth username [default: $USER]");
    println!("    --basic-auth-password <PASS>     Basic auth password");
    println!("    --turn-rest-uri <URI>            TURN REST API endpoint");
    println!("    --turn-rest-username <NAME>      TURN REST credential user");
    println!("    --rtc-config-json <PATH>         RTC config file, watched for changes");
    println!("    --turn-host <HOST>               TURN host for generated credentials");
    println!("    --turn-port <PORT>               TURN port for generated credentials");
    println!("    --turn-protocol <udp|tcp>        TURN transport [default: udp]");
    println!("    --enable-turn-tls                Use turns: URIs");
    println!("    --turn-shared-secret <SECRET>    HMAC shared secret");
    println!("    --turn-username <USER>           Long-term TURN username");
    println!("    --turn-password <PASS>           Long-term TURN password");
    println!("    --uinput-mouse-socket <PATH>     uinput broker socket for pointer events");
    println!("    --js-socket-path <DIR>           Gamepad socket directory [default: /tmp]");
    println!("    --encoder <NAME>                 Video encoder [default: x264enc]");
    println!("    --gpu-id <N>                     GPU index for hardware encoders");
    println!("    --framerate <FPS>                Capture framerate [default: 60]");
    println!("    --video-bitrate <KBPS>           Video bitrate [default: 8000]");
    println!("    --keyframe-distance <SECS>       Keyframe interval, -1 = infinite [default: -1]");
    println!("    --congestion-control             Enable bandwidth estimation");
    println!("    --video-packetloss-percent <P>   Expected video loss for FEC");
    println!("    --audio-bitrate <BPS>            Opus bitrate [default: 128000]");
    println!("    --audio-channels <N>             Audio channels [default: 2]");
    println!("    --audio-packetloss-percent <P>   Expected audio loss for FEC");
    println!("    --disable-audio                  Skip the audio pipeline");
    println!("    --enable-clipboard <POLICY>      true, false, in, or out [default: true]");
    println!("    --enable-resize                  Resize the display to the browser window");
    println!("    --disable-cursors                Skip cursor forwarding");
    println!("    --cursor-size <PX>               Remote cursor size, -1 = native");
    println!("    --keepalive-timeout <SECS>       Signaling keepalive [default: 30]");
    println!("    --debug                          Debug logging");
    println!("    -V, --version                    Print version and exit");
    println!("    -h, --help                       Print this help and exit");
}

/// Interpret an overlay value as a bool: JSON bools directly, strings by
/// case-insensitive comparison with "true".
pub fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => Some(s.eq_ignore_ascii_case("true")),
        _ => None,
    }
}

/// Interpret an overlay value as an integer, accepting numeric strings.
pub fn coerce_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().map(|v| v as u32),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Apply the JSON overlay file on top of parsed arguments. Only the keys a
/// client can change at runtime are honored, each with its own type.
pub fn apply_json_overlay(args: &mut Args, overlay: &Value) {
    let Some(map) = overlay.as_object() else {
        return;
    };
    for (key, value) in map {
        match key.as_str() {
            "framerate" => {
                if let Some(v) = coerce_u32(value) {
                    args.framerate = v;
                }
            }
            "video_bitrate" => {
                if let Some(v) = coerce_u32(value) {
                    args.video_bitrate = v;
                }
            }
            "audio_bitrate" => {
                if let Some(v) = coerce_u32(value) {
                    args.audio_bitrate = v;
                }
            }
            "enable_audio" => {
                if let Some(v) = coerce_bool(value) {
                    args.enable_audio = v;
                }
            }
            "enable_resize" => {
                if let Some(v) = coerce_bool(value) {
                    args.enable_resize = v;
                }
            }
            "encoder" => {
                if let Some(v) = value.as_str() {
                    args.encoder = v.to_lowercase();
                }
            }
            _ => {}
        }
    }
}

/// Persist one key into the overlay file, creating it when missing.
pub fn set_json_app_argument(path: &str, key: &str, value: Value) -> Result<()> {
    let mut doc: Value = match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|_| Value::Object(Default::default())),
        Err(_) => Value::Object(Default::default()),
    };
    if let Some(map) = doc.as_object_mut() {
        map.insert(key.to_string(), value);
    }
    std::fs::write(path, serde_json::to_string(&doc)?)
        .with_context(|| format!("failed to write {path}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn overlay_applies_typed_keys() {
        let mut args = Args::default();
        apply_json_overlay(
            &mut args,
            &json!({
                "framerate": 30,
                "video_bitrate": "4000",
                "audio_bitrate": 96000,
                "enable_resize": "True",
                "enable_audio": false,
            }),
        );
        assert_eq!(args.framerate, 30);
        assert_eq!(args.video_bitrate, 4000);
        assert_eq!(args.audio_bitrate, 96000);
        assert!(args.enable_resize);
        assert!(!args.enable_audio);
    }

    #[test]
    fn overlay_assigns_encoder_lowercased() {
        let mut args = Args::default();
        apply_json_overlay(&mut args, &json!({ "encoder": "NVH264ENC" }));
        assert_eq!(args.encoder, "nvh264enc");
    }

    #[test]
    fn overlay_ignores_unknown_and_mistyped_keys() {
        let mut args = Args::default();
        let before = args.framerate;
        apply_json_overlay(
            &mut args,
            &json!({
                "framerate": [60],
                "mystery": 1,
                "enable_resize": 5,
            }),
        );
        assert_eq!(args.framerate, before);
        assert!(!args.enable_resize);
    }

    #[test]
    fn bool_coercion() {
        assert_eq!(coerce_bool(&json!(true)), Some(true));
        assert_eq!(coerce_bool(&json!("true")), Some(true));
        assert_eq!(coerce_bool(&json!("TRUE")), Some(true));
        assert_eq!(coerce_bool(&json!("false")), Some(false));
        assert_eq!(coerce_bool(&json!("nope")), Some(false));
        assert_eq!(coerce_bool(&json!(1)), None);
    }

    #[test]
    fn set_json_argument_creates_and_merges() {
        let dir = std::env::temp_dir().join(format!("glint-cli-test-{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("overlay.json").to_string_lossy().to_string();

        set_json_app_argument(&path, "video_bitrate", json!(6000)).unwrap();
        set_json_app_argument(&path, "framerate", json!(30)).unwrap();

        let doc: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["video_bitrate"], 6000);
        assert_eq!(doc["framerate"], 30);

        let _ = std::fs::remove_dir_all(&dir);
    }
}

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Hard cap on the base64 clipboard payload. The data channel rejects
/// frames above ~65.5 KB, minus the JSON envelope around the content.
pub const CLIPBOARD_MAX_B64: usize = 65_400;

/// A command received from the browser over the `input` data channel.
///
/// Wire format is UTF-8, comma separated: `<cmd>,<arg1>,<arg2>,...`.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelCommand {
    /// Reply to a previously sent `ping`.
    Pong,
    /// X11 keysym press / release.
    KeyDown { keysym: u32 },
    KeyUp { keysym: u32 },
    /// Release the fixed set of commonly stuck keys.
    KeyboardReset,
    /// Pointer update. `relative` distinguishes `m2` from `m`.
    Mouse {
        x: i32,
        y: i32,
        button_mask: u8,
        scroll_magnitude: u8,
        relative: bool,
    },
    /// Toggle visibility of the captured cursor.
    PointerVisible(bool),
    /// Requested video encoder bitrate in bps.
    VideoBitrate(u32),
    /// Requested Opus bitrate in bps.
    AudioBitrate(u32),
    /// `js,c`: instantiate a virtual gamepad.
    GamepadConnect {
        index: u8,
        name: String,
        num_axes: u8,
        num_btns: u8,
    },
    /// `js,d`: destroy a virtual gamepad.
    GamepadDisconnect { index: u8 },
    /// `js,b`: button event, value in [0, 1].
    GamepadButton { index: u8, button: u16, value: f64 },
    /// `js,a`: axis event, value in [-1, 1].
    GamepadAxis { index: u8, axis: u8, value: f64 },
    /// Read the X clipboard and send it outbound (policy permitting).
    ClipboardRead,
    /// Write decoded text to the X clipboard (policy permitting).
    ClipboardWrite { data: String },
    /// Display resize request; dimensions already evened to multiples of 2.
    Resize { width: u32, height: u32 },
    /// DPI scaling ratio request.
    ScalingRatio(f64),
    /// `_arg_fps`: framerate change request.
    SetFps(u32),
    /// `_arg_resize`: toggle remote resize, with optional initial resolution.
    SetResizeEnabled {
        enabled: bool,
        resolution: Option<(u32, u32)>,
    },
    /// `_f`: client-reported FPS.
    ClientFps(u32),
    /// `_l`: client-reported latency in ms.
    ClientLatency(u32),
    /// `_stats_video` / `_stats_audio`: client WebRTC statistics JSON.
    ClientStats { kind: StatsKind, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsKind {
    Video,
    Audio,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ChannelParseError {
    #[error("unknown data channel command: {0}")]
    UnknownCommand(String),
    #[error("bad arguments for {cmd}: {reason}")]
    BadArguments { cmd: String, reason: String },
}

fn bad(cmd: &str, reason: impl Into<String>) -> ChannelParseError {
    ChannelParseError::BadArguments {
        cmd: cmd.to_string(),
        reason: reason.into(),
    }
}

fn arg<'a>(toks: &[&'a str], idx: usize, cmd: &str) -> Result<&'a str, ChannelParseError> {
    toks.get(idx)
        .copied()
        .ok_or_else(|| bad(cmd, format!("missing argument {idx}")))
}

fn int_arg<T: std::str::FromStr>(
    toks: &[&str],
    idx: usize,
    cmd: &str,
) -> Result<T, ChannelParseError> {
    arg(toks, idx, cmd)?
        .parse::<T>()
        .map_err(|_| bad(cmd, format!("argument {idx} is not a number")))
}

/// Parse a `WxH` resolution token, rounding both dimensions up to even.
/// Odd capture dimensions break 4:2:0 chroma subsampling.
pub fn parse_even_resolution(res: &str) -> Option<(u32, u32)> {
    let (w, h) = res.split_once('x')?;
    if w.is_empty() || h.is_empty() || !w.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !h.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let w: u32 = w.parse().ok()?;
    let h: u32 = h.parse().ok()?;
    Some((w + w % 2, h + h % 2))
}

impl ChannelCommand {
    pub fn parse(msg: &str) -> Result<Self, ChannelParseError> {
        let toks: Vec<&str> = msg.split(',').collect();
        match toks[0] {
            "pong" => Ok(Self::Pong),
            "kd" => Ok(Self::KeyDown {
                keysym: int_arg(&toks, 1, "kd")?,
            }),
            "ku" => Ok(Self::KeyUp {
                keysym: int_arg(&toks, 1, "ku")?,
            }),
            "kr" => Ok(Self::KeyboardReset),
            "m" | "m2" => {
                let cmd = toks[0];
                Ok(Self::Mouse {
                    x: int_arg(&toks, 1, cmd)?,
                    y: int_arg(&toks, 2, cmd)?,
                    button_mask: int_arg(&toks, 3, cmd)?,
                    scroll_magnitude: int_arg(&toks, 4, cmd)?,
                    relative: cmd == "m2",
                })
            }
            "p" => {
                let v: u8 = int_arg(&toks, 1, "p")?;
                Ok(Self::PointerVisible(v != 0))
            }
            "vb" => Ok(Self::VideoBitrate(int_arg(&toks, 1, "vb")?)),
            "ab" => Ok(Self::AudioBitrate(int_arg(&toks, 1, "ab")?)),
            "js" => Self::parse_gamepad(&toks),
            "cr" => Ok(Self::ClipboardRead),
            "cw" => {
                let b64 = arg(&toks, 1, "cw")?;
                let bytes = BASE64
                    .decode(b64)
                    .map_err(|_| bad("cw", "payload is not valid base64"))?;
                let data = String::from_utf8(bytes)
                    .map_err(|_| bad("cw", "payload is not valid UTF-8"))?;
                Ok(Self::ClipboardWrite { data })
            }
            "r" => {
                let res = arg(&toks, 1, "r")?;
                let (width, height) =
                    parse_even_resolution(res).ok_or_else(|| bad("r", "expected WxH"))?;
                Ok(Self::Resize { width, height })
            }
            "s" => {
                let raw = arg(&toks, 1, "s")?;
                let ok = !raw.is_empty()
                    && raw.bytes().all(|b| b.is_ascii_digit() || b == b'.')
                    && raw.bytes().filter(|&b| b == b'.').count() <= 1
                    && !raw.starts_with('.')
                    && !raw.ends_with('.');
                if !ok {
                    return Err(bad("s", "invalid scale ratio"));
                }
                let scale: f64 = raw.parse().map_err(|_| bad("s", "invalid scale ratio"))?;
                Ok(Self::ScalingRatio(scale))
            }
            "_arg_fps" => Ok(Self::SetFps(int_arg(&toks, 1, "_arg_fps")?)),
            "_arg_resize" => {
                if toks.len() != 3 {
                    return Err(bad("_arg_resize", "expected <enabled>,<resolution>"));
                }
                let enabled = toks[1].eq_ignore_ascii_case("true");
                // Invalid resolution disables the initial resize but not the toggle.
                let resolution = parse_even_resolution(toks[2]);
                Ok(Self::SetResizeEnabled {
                    enabled,
                    resolution,
                })
            }
            "_f" => Ok(Self::ClientFps(int_arg(&toks, 1, "_f")?)),
            "_l" => Ok(Self::ClientLatency(int_arg(&toks, 1, "_l")?)),
            "_stats_video" | "_stats_audio" => {
                let kind = if toks[0] == "_stats_video" {
                    StatsKind::Video
                } else {
                    StatsKind::Audio
                };
                // The JSON tail may itself contain commas; rejoin everything.
                let body = toks[1..].join(",");
                Ok(Self::ClientStats { kind, body })
            }
            other => Err(ChannelParseError::UnknownCommand(other.to_string())),
        }
    }

    fn parse_gamepad(toks: &[&str]) -> Result<Self, ChannelParseError> {
        match arg(toks, 1, "js")? {
            "c" => {
                let index: u8 = int_arg(toks, 2, "js,c")?;
                let name_b64 = arg(toks, 3, "js,c")?;
                let bytes = BASE64
                    .decode(name_b64)
                    .map_err(|_| bad("js,c", "name is not valid base64"))?;
                let mut name = String::from_utf8_lossy(&bytes).into_owned();
                if name.len() > 255 {
                    let mut end = 255;
                    while !name.is_char_boundary(end) {
                        end -= 1;
                    }
                    name.truncate(end);
                }
                Ok(Self::GamepadConnect {
                    index,
                    name,
                    num_axes: int_arg(toks, 4, "js,c")?,
                    num_btns: int_arg(toks, 5, "js,c")?,
                })
            }
            "d" => Ok(Self::GamepadDisconnect {
                index: int_arg(toks, 2, "js,d")?,
            }),
            "b" => Ok(Self::GamepadButton {
                index: int_arg(toks, 2, "js,b")?,
                button: int_arg(toks, 3, "js,b")?,
                value: arg(toks, 4, "js,b")?
                    .parse()
                    .map_err(|_| bad("js,b", "value is not a float"))?,
            }),
            "a" => Ok(Self::GamepadAxis {
                index: int_arg(toks, 2, "js,a")?,
                axis: int_arg(toks, 3, "js,a")?,
                value: arg(toks, 4, "js,a")?
                    .parse()
                    .map_err(|_| bad("js,a", "value is not a float"))?,
            }),
            other => Err(bad("js", format!("unknown subcommand: {other}"))),
        }
    }
}

/// Cursor payload dispatched when the X cursor changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorData {
    /// base64 PNG of the (optionally resized) cursor image.
    pub curdata: String,
    /// XFIXES cursor serial.
    pub handle: u64,
    /// `"none"` for an all-transparent cursor, otherwise null.
    #[serde(rename = "override")]
    pub override_css: Option<String>,
    pub hotspot: CursorHotspot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorHotspot {
    pub x: i32,
    pub y: i32,
}

/// A status message sent to the browser, serialized as
/// `{"type": <tag>, "data": <object>}`, one JSON document per send.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Pipeline { status: String },
    System { action: String },
    SystemStats {
        cpu_percent: f64,
        mem_total: u64,
        mem_used: u64,
    },
    GpuStats {
        load: f64,
        memory_total: f64,
        memory_used: f64,
    },
    Clipboard { content_b64: String },
    Cursor(CursorData),
    Ping { start_time: f64 },
    LatencyMeasurement { latency_ms: f64 },
}

impl OutboundMessage {
    /// Build a clipboard message from raw text, or `None` when the base64
    /// payload exceeds the data-channel frame budget.
    pub fn clipboard(text: &str) -> Option<Self> {
        let content_b64 = BASE64.encode(text.as_bytes());
        if content_b64.len() > CLIPBOARD_MAX_B64 {
            return None;
        }
        Some(Self::Clipboard { content_b64 })
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::Pipeline { .. } => "pipeline",
            Self::System { .. } => "system",
            Self::SystemStats { .. } => "system_stats",
            Self::GpuStats { .. } => "gpu_stats",
            Self::Clipboard { .. } => "clipboard",
            Self::Cursor(_) => "cursor",
            Self::Ping { .. } => "ping",
            Self::LatencyMeasurement { .. } => "latency_measurement",
        }
    }

    pub fn to_json(&self) -> String {
        let data = match self {
            Self::Pipeline { status } => json!({ "status": status }),
            Self::System { action } => json!({ "action": action }),
            Self::SystemStats {
                cpu_percent,
                mem_total,
                mem_used,
            } => json!({
                "cpu_percent": cpu_percent,
                "mem_total": mem_total,
                "mem_used": mem_used,
            }),
            Self::GpuStats {
                load,
                memory_total,
                memory_used,
            } => json!({
                "load": load,
                "memory_total": memory_total,
                "memory_used": memory_used,
            }),
            Self::Clipboard { content_b64 } => json!({ "content": content_b64 }),
            Self::Cursor(data) => serde_json::to_value(data).unwrap_or_default(),
            Self::Ping { start_time } => json!({ "start_time": start_time }),
            Self::LatencyMeasurement { latency_ms } => json!({ "latency_ms": latency_ms }),
        };
        json!({ "type": self.tag(), "data": data }).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_events() {
        assert_eq!(
            ChannelCommand::parse("kd,65507").unwrap(),
            ChannelCommand::KeyDown { keysym: 65507 }
        );
        assert_eq!(
            ChannelCommand::parse("ku,97").unwrap(),
            ChannelCommand::KeyUp { keysym: 97 }
        );
        assert_eq!(
            ChannelCommand::parse("kr").unwrap(),
            ChannelCommand::KeyboardReset
        );
    }

    #[test]
    fn parses_mouse_absolute_and_relative() {
        assert_eq!(
            ChannelCommand::parse("m,100,200,1,0").unwrap(),
            ChannelCommand::Mouse {
                x: 100,
                y: 200,
                button_mask: 1,
                scroll_magnitude: 0,
                relative: false,
            }
        );
        assert_eq!(
            ChannelCommand::parse("m2,-5,3,0,2").unwrap(),
            ChannelCommand::Mouse {
                x: -5,
                y: 3,
                button_mask: 0,
                scroll_magnitude: 2,
                relative: true,
            }
        );
    }

    #[test]
    fn mouse_rejects_garbage() {
        assert!(ChannelCommand::parse("m,a,b,c,d").is_err());
        assert!(ChannelCommand::parse("m,1,2").is_err());
    }

    #[test]
    fn resize_rounds_up_to_even() {
        assert_eq!(
            ChannelCommand::parse("r,1921x1081").unwrap(),
            ChannelCommand::Resize {
                width: 1922,
                height: 1082,
            }
        );
        assert_eq!(
            ChannelCommand::parse("r,1920x1080").unwrap(),
            ChannelCommand::Resize {
                width: 1920,
                height: 1080,
            }
        );
    }

    #[test]
    fn resize_rejects_invalid_format() {
        assert!(ChannelCommand::parse("r,1920").is_err());
        assert!(ChannelCommand::parse("r,axb").is_err());
        assert!(ChannelCommand::parse("r,1920x-1080").is_err());
    }

    #[test]
    fn scaling_accepts_decimals_only() {
        assert_eq!(
            ChannelCommand::parse("s,1.25").unwrap(),
            ChannelCommand::ScalingRatio(1.25)
        );
        assert_eq!(
            ChannelCommand::parse("s,2").unwrap(),
            ChannelCommand::ScalingRatio(2.0)
        );
        assert!(ChannelCommand::parse("s,-1").is_err());
        assert!(ChannelCommand::parse("s,1.2.3").is_err());
        assert!(ChannelCommand::parse("s,.5").is_err());
    }

    #[test]
    fn parses_gamepad_connect_with_base64_name() {
        // "R2xpbnQgUGFk" decodes to "Glint Pad"
        assert_eq!(
            ChannelCommand::parse("js,c,0,R2xpbnQgUGFk,8,11").unwrap(),
            ChannelCommand::GamepadConnect {
                index: 0,
                name: "Glint Pad".into(),
                num_axes: 8,
                num_btns: 11,
            }
        );
    }

    #[test]
    fn parses_gamepad_events() {
        assert_eq!(
            ChannelCommand::parse("js,b,0,6,1.0").unwrap(),
            ChannelCommand::GamepadButton {
                index: 0,
                button: 6,
                value: 1.0,
            }
        );
        assert_eq!(
            ChannelCommand::parse("js,a,1,3,-0.5").unwrap(),
            ChannelCommand::GamepadAxis {
                index: 1,
                axis: 3,
                value: -0.5,
            }
        );
        assert_eq!(
            ChannelCommand::parse("js,d,2").unwrap(),
            ChannelCommand::GamepadDisconnect { index: 2 }
        );
    }

    #[test]
    fn clipboard_write_decodes_base64() {
        assert_eq!(
            ChannelCommand::parse("cw,aGVsbG8=").unwrap(),
            ChannelCommand::ClipboardWrite {
                data: "hello".into()
            }
        );
        assert!(ChannelCommand::parse("cw,!!notb64!!").is_err());
    }

    #[test]
    fn arg_resize_tolerates_bad_resolution() {
        assert_eq!(
            ChannelCommand::parse("_arg_resize,true,1281x721").unwrap(),
            ChannelCommand::SetResizeEnabled {
                enabled: true,
                resolution: Some((1282, 722)),
            }
        );
        assert_eq!(
            ChannelCommand::parse("_arg_resize,false,junk").unwrap(),
            ChannelCommand::SetResizeEnabled {
                enabled: false,
                resolution: None,
            }
        );
        assert!(ChannelCommand::parse("_arg_resize,true").is_err());
    }

    #[test]
    fn stats_rejoin_comma_separated_json() {
        let raw = r#"_stats_video,{"a":1,"b":2}"#;
        match ChannelCommand::parse(raw).unwrap() {
            ChannelCommand::ClientStats { kind, body } => {
                assert_eq!(kind, StatsKind::Video);
                assert_eq!(body, r#"{"a":1,"b":2}"#);
            }
            other => panic!("expected ClientStats, got {other:?}"),
        }
    }

    #[test]
    fn unknown_command_is_typed_error() {
        assert_eq!(
            ChannelCommand::parse("bogus,1"),
            Err(ChannelParseError::UnknownCommand("bogus".into()))
        );
    }

    #[test]
    fn outbound_envelope_shape() {
        let msg = OutboundMessage::Pipeline {
            status: "Video bitrate set to: 4000".into(),
        };
        let parsed: serde_json::Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(parsed["type"], "pipeline");
        assert_eq!(parsed["data"]["status"], "Video bitrate set to: 4000");
    }

    #[test]
    fn cursor_envelope_carries_override_and_hotspot() {
        let msg = OutboundMessage::Cursor(CursorData {
            curdata: "abcd".into(),
            handle: 42,
            override_css: Some("none".into()),
            hotspot: CursorHotspot { x: 3, y: 4 },
        });
        let parsed: serde_json::Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(parsed["type"], "cursor");
        assert_eq!(parsed["data"]["handle"], 42);
        assert_eq!(parsed["data"]["override"], "none");
        assert_eq!(parsed["data"]["hotspot"]["x"], 3);
        assert_eq!(parsed["data"]["hotspot"]["y"], 4);
    }

    #[test]
    fn clipboard_respects_frame_budget() {
        assert!(OutboundMessage::clipboard("short").is_some());
        let huge = "x".repeat(CLIPBOARD_MAX_B64);
        assert!(OutboundMessage::clipboard(&huge).is_none());
    }

    #[test]
    fn ping_envelope() {
        let msg = OutboundMessage::Ping { start_time: 1234.567 };
        let parsed: serde_json::Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(parsed["type"], "ping");
        assert!((parsed["data"]["start_time"].as_f64().unwrap() - 1234.567).abs() < 1e-9);
    }
}

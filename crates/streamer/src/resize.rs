//! Display resize and DPI scaling via xrandr / xfconf.
//!
//! Resize requests from the browser land here: the requested resolution is
//! fitted under the output's maximum, snapped even, created as a mode when
//! the output lacks it, and applied. DPI requests scale the desktop font
//! DPI and cursor size through xfconf-query.

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::{info, warn};

/// Hardware scanout converters on DVI outputs top out well below the
/// 8K ceiling of virtual outputs.
const DVI_MAX: (u32, u32) = (2560, 1600);
const DEFAULT_MAX: (u32, u32) = (7680, 4320);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenInfo {
    pub output: String,
    pub current: Option<(u32, u32)>,
    pub modes: Vec<String>,
}

/// Parse `xrandr` query output: the connected output name, the current
/// resolution from the `Screen 0:` header, and the advertised mode list.
pub fn parse_xrandr(output: &str) -> Option<ScreenInfo> {
    let mut info = ScreenInfo {
        output: String::new(),
        current: None,
        modes: Vec::new(),
    };
    let mut found_output = false;
    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(pos) = trimmed.find(" connected") {
            info.output = trimmed[..pos].to_string();
            found_output = true;
            continue;
        }
        if let Some(pos) = trimmed.find("current ") {
            // "... current 1920 x 1080, maximum ..."
            let rest = &trimmed[pos + "current ".len()..];
            let dims: String = rest
                .chars()
                .take_while(|&c| c.is_ascii_digit() || c == ' ' || c == 'x')
                .collect();
            let parts: Vec<&str> = dims.split('x').map(str::trim).collect();
            if parts.len() == 2 {
                if let (Ok(w), Ok(h)) = (parts[0].parse(), parts[1].parse()) {
                    info.current = Some((w, h));
                }
            }
            continue;
        }
        if found_output {
            if let Some(mode) = trimmed.split_whitespace().next() {
                if mode.contains('x')
                    && mode
                        .chars()
                        .all(|c| c.is_ascii_digit() || c == 'x')
                {
                    info.modes.push(mode.to_string());
                }
            }
        }
    }
    found_output.then_some(info)
}

pub fn max_resolution_for_output(output: &str) -> (u32, u32) {
    if output.starts_with("DVI") {
        DVI_MAX
    } else {
        DEFAULT_MAX
    }
}

/// Shrink a requested resolution until it fits the maximum, preserving
/// aspect ratio, and snap both dimensions even.
pub fn fit_resolution(w: u32, h: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    if w < max_w && h < max_h {
        return (w, h);
    }
    let mut new_w = w as f64;
    let mut new_h = h as f64;
    while new_w > max_w as f64 || new_h > max_h as f64 {
        new_w *= 0.9999;
        new_h *= 0.9999;
    }
    let w = new_w as u32;
    let h = new_h as u32;
    (w + w % 2, h + h % 2)
}

/// Simplified CVT reduced-blanking modeline for the dummy/virtual output.
pub fn generate_modeline(width: u32, height: u32, refresh: u32) -> String {
    let pixel_clock = (width as f64 * height as f64 * refresh as f64) / 1_000_000.0 * 1.2;
    format!(
        "{:.2} {} {} {} {} {} {} {} {} +hsync +vsync",
        pixel_clock,
        width,
        width + 48,
        width + 48 + 32,
        width + 48 + 32 + 80,
        height,
        height + 3,
        height + 3 + 5,
        height + 3 + 5 + 25,
    )
}

async fn run_xrandr(display: Option<&str>, args: &[&str]) -> Result<std::process::Output> {
    let mut cmd = Command::new("xrandr");
    if let Some(display) = display {
        cmd.env("DISPLAY", display);
    }
    cmd.args(args)
        .output()
        .await
        .context("failed to run xrandr")
}

/// Apply a `WxH` resolution. Returns `Ok(false)` when the display already
/// has that resolution.
pub async fn resize_display(display: Option<&str>, width: u32, height: u32) -> Result<bool> {
    let query = run_xrandr(display, &[]).await?;
    let stdout = String::from_utf8_lossy(&query.stdout);
    let screen = parse_xrandr(&stdout).context("no connected output in xrandr output")?;

    let (max_w, max_h) = max_resolution_for_output(&screen.output);
    let (new_w, new_h) = fit_resolution(width, height, max_w, max_h);
    let mode = format!("{new_w}x{new_h}");

    if screen.current == Some((new_w, new_h)) {
        info!(%mode, "Already at target resolution, skipping resize");
        return Ok(false);
    }

    if !screen.modes.contains(&mode) {
        let modeline = generate_modeline(new_w, new_h, 60);
        info!(%mode, %modeline, "Creating xrandr mode");
        let mut args = vec!["--newmode", mode.as_str()];
        let modeline_parts: Vec<&str> = modeline.split_whitespace().collect();
        args.extend(&modeline_parts);
        let output = run_xrandr(display, &args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("already exists") {
                bail!("xrandr --newmode {mode} failed: {stderr}");
            }
        }

        let output = run_xrandr(display, &["--addmode", &screen.output, &mode]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("already exists") {
                bail!("xrandr --addmode {mode} failed: {stderr}");
            }
        }
    }

    info!(output = %screen.output, %mode, "Applying resolution");
    let output = run_xrandr(display, &["--output", &screen.output, "--mode", &mode]).await?;
    if !output.status.success() {
        bail!(
            "xrandr --mode {mode} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(true)
}

async fn xfconf_set(display: Option<&str>, channel: &str, property: &str, value: &str) -> Result<()> {
    let mut cmd = Command::new("xfconf-query");
    if let Some(display) = display {
        cmd.env("DISPLAY", display);
    }
    let output = cmd
        .args([
            "-c", channel, "-p", property, "-s", value, "--create", "-t", "int",
        ])
        .output()
        .await
        .context("failed to run xfconf-query")?;
    if !output.status.success() {
        bail!(
            "xfconf-query {property} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

/// Scaling bounds accepted from the client.
pub fn scale_in_bounds(scale: f64) -> bool {
    (0.75..=2.5).contains(&scale)
}

/// Apply a DPI scaling ratio: font DPI plus a proportional cursor size.
pub async fn apply_scaling(display: Option<&str>, scale: f64) -> Result<()> {
    if !scale_in_bounds(scale) {
        bail!("requested scale ratio out of bounds: {scale}");
    }
    let dpi = (96.0 * scale).round() as i32;
    info!(dpi, "Setting DPI");
    xfconf_set(display, "xsettings", "/Xft/DPI", &dpi.to_string()).await?;

    let cursor_size = (16.0 * scale).round() as i32;
    info!(cursor_size, "Setting cursor size");
    set_cursor_size(display, cursor_size).await
}

pub async fn set_cursor_size(display: Option<&str>, size: i32) -> Result<()> {
    if let Err(e) = xfconf_set(
        display,
        "xsettings",
        "/Gtk/CursorThemeSize",
        &size.to_string(),
    )
    .await
    {
        warn!("Could not set cursor size: {e:#}");
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const XRANDR_SAMPLE: &str = "\
Screen 0: minimum 320 x 200, current 1920 x 1080, maximum 8192 x 8192
VIRTUAL1 connected primary 1920x1080+0+0 0mm x 0mm
   1920x1080     60.00*+
   1280x720      60.00
   1024x768      60.00
VIRTUAL2 disconnected
";

    #[test]
    fn parses_output_current_and_modes() {
        let info = parse_xrandr(XRANDR_SAMPLE).unwrap();
        assert_eq!(info.output, "VIRTUAL1");
        assert_eq!(info.current, Some((1920, 1080)));
        assert_eq!(info.modes, vec!["1920x1080", "1280x720", "1024x768"]);
    }

    #[test]
    fn parse_requires_connected_output() {
        assert!(parse_xrandr("Screen 0: current 1 x 1").is_none());
    }

    #[test]
    fn fit_passes_through_when_smaller() {
        assert_eq!(fit_resolution(1920, 1080, 7680, 4320), (1920, 1080));
    }

    #[test]
    fn fit_shrinks_oversized_and_snaps_even() {
        let (w, h) = fit_resolution(8000, 4500, 7680, 4320);
        assert!(w <= 7680 && h <= 4320);
        assert_eq!(w % 2, 0);
        assert_eq!(h % 2, 0);
        // Aspect ratio held within a pixel's rounding.
        let ratio = w as f64 / h as f64;
        assert!((ratio - 8000.0 / 4500.0).abs() < 0.01);
    }

    #[test]
    fn dvi_outputs_have_lower_ceiling() {
        assert_eq!(max_resolution_for_output("DVI-D-0"), (2560, 1600));
        assert_eq!(max_resolution_for_output("VIRTUAL1"), (7680, 4320));
        assert_eq!(max_resolution_for_output("HDMI-1"), (7680, 4320));
    }

    #[test]
    fn modeline_shape() {
        let ml = generate_modeline(1920, 1080, 60);
        let parts: Vec<&str> = ml.split_whitespace().collect();
        assert_eq!(parts.len(), 11);
        let clock: f64 = parts[0].parse().unwrap();
        assert!(clock > 0.0);
        assert_eq!(parts[1], "1920");
        assert_eq!(parts[5], "1080");
        let h_total: u32 = parts[4].parse().unwrap();
        assert!(h_total > 1920);
        assert_eq!(parts[9], "+hsync");
        assert_eq!(parts[10], "+vsync");
    }

    #[test]
    fn scale_bounds() {
        assert!(scale_in_bounds(1.0));
        assert!(scale_in_bounds(0.75));
        assert!(scale_in_bounds(2.5));
        assert!(!scale_in_bounds(0.5));
        assert!(!scale_in_bounds(3.0));
    }
}

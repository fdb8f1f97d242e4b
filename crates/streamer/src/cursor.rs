//! XFIXES cursor monitor.
//!
//! Watches `DisplayCursorNotify` on the root window, converts cursor images
//! to base64 PNG messages, and caches them by cursor serial. The serial is
//! stable per cursor shape, so repeated shape changes are cache hits and the
//! browser sees byte-identical payloads.

use std::collections::HashMap;
use std::io::Cursor as IoCursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use glint_protocol::channel::{CursorData, CursorHotspot};
use image::RgbaImage;
use image::imageops::FilterType;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use x11rb::connection::Connection;
use x11rb::protocol::Event;
use x11rb::protocol::xfixes::{self, ConnectionExt as XfixesExt};
use x11rb::rust_connection::RustConnection;

/// Poll cadence when no X events are pending.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Sizing behavior for outgoing cursor images.
#[derive(Debug, Clone, Copy)]
pub struct CursorSizing {
    /// Fixed square size in pixels; `-1` keeps the native size.
    pub size: i32,
    /// Scale factor applied when `size` is -1.
    pub scale: f64,
}

impl Default for CursorSizing {
    fn default() -> Self {
        Self {
            size: -1,
            scale: 1.0,
        }
    }
}

/// Convert one XFIXES cursor image into the outbound message payload.
///
/// Pixels arrive as 32-bit ARGB words and are unpacked to `[R, G, B, A]`
/// bytes. An image whose pixels are all zero is the invisible cursor; it
/// still encodes to a valid PNG but carries `override = "none"`.
pub fn cursor_to_data(
    serial: u64,
    width: u16,
    height: u16,
    xhot: u16,
    yhot: u16,
    argb: &[u32],
    sizing: CursorSizing,
) -> Result<CursorData> {
    let (target_w, target_h, hotspot) = if sizing.size > -1 {
        let size = sizing.size as u32;
        (
            size,
            size,
            CursorHotspot {
                x: (sizing.size as f64 / width.max(1) as f64 * xhot as f64) as i32,
                y: (sizing.size as f64 / height.max(1) as f64 * yhot as f64) as i32,
            },
        )
    } else {
        (
            (width as f64 * sizing.scale) as u32,
            (height as f64 * sizing.scale) as u32,
            CursorHotspot {
                x: (xhot as f64 * sizing.scale) as i32,
                y: (yhot as f64 * sizing.scale) as i32,
            },
        )
    };

    let mut rgba = Vec::with_capacity(argb.len() * 4);
    for &pixel in argb {
        rgba.push((pixel >> 16) as u8);
        rgba.push((pixel >> 8) as u8);
        rgba.push(pixel as u8);
        rgba.push((pixel >> 24) as u8);
    }

    let image = RgbaImage::from_raw(width as u32, height as u32, rgba)
        .context("cursor image size mismatch")?;
    let image = if (target_w, target_h) != (width as u32, height as u32) && target_w > 0 && target_h > 0
    {
        image::imageops::resize(&image, target_w, target_h, FilterType::Triangle)
    } else {
        image
    };

    let mut png = Vec::new();
    image
        .write_to(&mut IoCursor::new(&mut png), image::ImageFormat::Png)
        .context("failed to encode cursor PNG")?;

    let invisible = argb.iter().all(|&p| p == 0);
    Ok(CursorData {
        curdata: BASE64.encode(&png),
        handle: serial,
        override_css: invisible.then(|| "none".to_string()),
        hotspot,
    })
}

/// Serial-keyed cache of converted cursor messages. Never evicts during a
/// session; distinct cursor shapes on a desktop number in the dozens.
#[derive(Default)]
pub struct CursorCache {
    entries: HashMap<u64, CursorData>,
}

impl CursorCache {
    pub fn get(&self, serial: u64) -> Option<&CursorData> {
        self.entries.get(&serial)
    }

    pub fn insert(&mut self, serial: u64, data: CursorData) -> &CursorData {
        self.entries.entry(serial).or_insert(data)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Spawn the cursor monitor on its own thread; messages arrive on the
/// returned channel. The thread stops when `stop` is set or the receiver
/// is dropped.
pub fn spawn_cursor_monitor(
    display: Option<String>,
    sizing: CursorSizing,
    stop: Arc<AtomicBool>,
) -> mpsc::Receiver<CursorData> {
    let (tx, rx) = mpsc::channel(8);
    std::thread::Builder::new()
        .name("cursor-monitor".into())
        .spawn(move || {
            if let Err(e) = cursor_monitor_loop(display.as_deref(), sizing, &stop, tx) {
                warn!("Cursor monitor exited: {e:#}");
            }
        })
        .ok();
    rx
}

fn cursor_monitor_loop(
    display: Option<&str>,
    sizing: CursorSizing,
    stop: &AtomicBool,
    tx: mpsc::Sender<CursorData>,
) -> Result<()> {
    let (conn, screen_num) =
        RustConnection::connect(display).context("X11 connect failed")?;
    let root = conn.setup().roots[screen_num].root;

    let version = conn.xfixes_query_version(5, 0)?.reply()?;
    if version.major_version < 1 {
        anyhow::bail!(
            "XFIXES {}.{} lacks cursor image support",
            version.major_version,
            version.minor_version
        );
    }

    conn.xfixes_select_cursor_input(root, xfixes::CursorNotifyMask::DISPLAY_CURSOR)?;
    conn.flush()?;
    info!("Watching for cursor changes");

    let mut cache = CursorCache::default();

    // Send the current cursor at startup so the client has one before the
    // first change event.
    if let Ok(reply) = conn.xfixes_get_cursor_image()?.reply() {
        let serial = reply.cursor_serial as u64;
        match cursor_to_data(
            serial,
            reply.width,
            reply.height,
            reply.xhot,
            reply.yhot,
            &reply.cursor_image,
            sizing,
        ) {
            Ok(data) => {
                let data = cache.insert(serial, data).clone();
                if tx.blocking_send(data).is_err() {
                    return Ok(());
                }
            }
            Err(e) => warn!("Failed to convert initial cursor: {e:#}"),
        }
    }

    while !stop.load(Ordering::Relaxed) {
        let event = match conn.poll_for_event()? {
            Some(event) => event,
            None => {
                std::thread::sleep(IDLE_POLL);
                continue;
            }
        };
        let Event::XfixesCursorNotify(notify) = event else {
            continue;
        };
        let serial = notify.cursor_serial as u64;

        let data = if let Some(cached) = cache.get(serial) {
            debug!(serial, "Cursor change served from cache");
            cached.clone()
        } else {
            let reply = match conn.xfixes_get_cursor_image()?.reply() {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("Failed to fetch cursor image: {e}");
                    continue;
                }
            };
            match cursor_to_data(
                serial,
                reply.width,
                reply.height,
                reply.xhot,
                reply.yhot,
                &reply.cursor_image,
                sizing,
            ) {
                Ok(data) => cache.insert(serial, data).clone(),
                Err(e) => {
                    warn!("Failed to convert cursor image: {e:#}");
                    continue;
                }
            }
        };

        if tx.blocking_send(data).is_err() {
            break;
        }
    }

    info!("Cursor monitor stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native() -> CursorSizing {
        CursorSizing::default()
    }

    #[test]
    fn pixel_unpack_order_is_rgba() {
        // One pixel: A=0x11 R=0x22 G=0x33 B=0x44.
        let data = cursor_to_data(1, 1, 1, 0, 0, &[0x11223344], native()).unwrap();
        let png = BASE64.decode(&data.curdata).unwrap();
        let decoded = image::load_from_memory(&png).unwrap().to_rgba8();
        assert_eq!(decoded.get_pixel(0, 0).0, [0x22, 0x33, 0x44, 0x11]);
    }

    #[test]
    fn invisible_cursor_sets_override_none() {
        let argb = vec![0u32; 16 * 16];
        let data = cursor_to_data(7, 16, 16, 3, 4, &argb, native()).unwrap();
        assert_eq!(data.override_css.as_deref(), Some("none"));
        // Still a well-formed PNG of the right dimensions.
        let png = BASE64.decode(&data.curdata).unwrap();
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!(decoded.width(), 16);
        assert_eq!(decoded.height(), 16);
    }

    #[test]
    fn visible_cursor_has_no_override() {
        let mut argb = vec![0u32; 4];
        argb[0] = 0xff000000;
        let data = cursor_to_data(8, 2, 2, 0, 0, &argb, native()).unwrap();
        assert_eq!(data.override_css, None);
    }

    #[test]
    fn fixed_size_resizes_and_scales_hotspot() {
        let argb = vec![0xffffffffu32; 32 * 32];
        let sizing = CursorSizing {
            size: 16,
            scale: 1.0,
        };
        let data = cursor_to_data(9, 32, 32, 8, 16, &argb, sizing).unwrap();
        assert_eq!(data.hotspot, CursorHotspot { x: 4, y: 8 });
        let png = BASE64.decode(&data.curdata).unwrap();
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!(decoded.width(), 16);
        assert_eq!(decoded.height(), 16);
    }

    #[test]
    fn scale_factor_applies_when_no_fixed_size() {
        let argb = vec![0xffffffffu32; 24 * 24];
        let sizing = CursorSizing {
            size: -1,
            scale: 2.0,
        };
        let data = cursor_to_data(10, 24, 24, 6, 6, &argb, sizing).unwrap();
        assert_eq!(data.hotspot, CursorHotspot { x: 12, y: 12 });
        let png = BASE64.decode(&data.curdata).unwrap();
        assert_eq!(image::load_from_memory(&png).unwrap().width(), 48);
    }

    #[test]
    fn cache_returns_identical_payload_for_same_serial() {
        let argb = vec![0xff102030u32; 8 * 8];
        let first = cursor_to_data(42, 8, 8, 1, 1, &argb, native()).unwrap();

        let mut cache = CursorCache::default();
        cache.insert(42, first.clone());

        // Second change event with the same serial never re-converts.
        let cached = cache.get(42).unwrap();
        assert_eq!(cached.curdata, first.curdata);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn mismatched_pixel_count_is_an_error() {
        assert!(cursor_to_data(1, 4, 4, 0, 0, &[0u32; 3], native()).is_err());
    }
}

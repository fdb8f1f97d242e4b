//! Keyboard and pointer injection into the X server.
//!
//! Keys and pointer motion go through XTest fake input. When the process
//! cannot open `/dev/uinput` itself, relative motion, buttons, and scroll
//! can instead be proxied as datagrams to a uinput broker socket.

use std::collections::HashMap;
use std::os::unix::net::UnixDatagram;

use anyhow::{Context, Result};
use bytes::{BufMut, BytesMut};
use tracing::{debug, info, warn};
use x11rb::connection::Connection;
use x11rb::protocol::xproto::{
    BUTTON_PRESS_EVENT, BUTTON_RELEASE_EVENT, ConnectionExt as XprotoExt, KEY_PRESS_EVENT,
    KEY_RELEASE_EVENT, MOTION_NOTIFY_EVENT, Window,
};
use x11rb::protocol::xtest::ConnectionExt as XtestExt;
use x11rb::rust_connection::RustConnection;

// Linux input codes used by the uinput broker protocol.
const EV_REL: u16 = 0x02;
const REL_X: u16 = 0x00;
const REL_Y: u16 = 0x01;
const REL_WHEEL: u16 = 0x08;
const EV_KEY: u16 = 0x01;
const BTN_LEFT: u16 = 0x110;
const BTN_RIGHT: u16 = 0x111;
const BTN_MIDDLE: u16 = 0x112;

/// Keysyms released at startup and on `kr`: every modifier plus the keys
/// that most often wedge when focus is lost mid-chord.
const STUCK_KEYSYMS: &[u32] = &[
    65507, // Control_L
    65505, // Shift_L
    65513, // Alt_L
    65508, // Control_R
    65506, // Shift_R
    65027, // ISO_Level3_Shift
    65511, // Meta_L
    65512, // Meta_R
    102,   // f
    70,    // F
    109,   // m
    77,    // M
    65307, // Escape
];

/// One pointer action derived from a button-mask change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseAction {
    Button { button: u8, press: bool },
    /// X button 4 clicks, repeated for scroll magnitude.
    ScrollUp { count: u8 },
    /// X button 5 clicks.
    ScrollDown { count: u8 },
}

/// Diff two button masks into the press/release/scroll actions to inject.
/// Bit 0 is left, 1 middle, 2 right; bits 3 and 4 are the wheel and fire
/// `scroll_magnitude` clicks on their press edge.
pub fn diff_button_mask(prev: u8, new: u8, scroll_magnitude: u8) -> Vec<MouseAction> {
    let mut actions = Vec::new();
    let count = scroll_magnitude.max(1);
    for bit in 0..5u8 {
        if (prev ^ new) & (1 << bit) == 0 {
            continue;
        }
        let press = new & (1 << bit) != 0;
        match bit {
            3 => {
                if press {
                    actions.push(MouseAction::ScrollUp { count });
                }
            }
            4 => {
                if press {
                    actions.push(MouseAction::ScrollDown { count });
                }
            }
            _ => actions.push(MouseAction::Button {
                button: bit + 1,
                press,
            }),
        }
    }
    actions
}

/// The `<` key fix: the Generic 105-key layout binds keysym 60 (`<`) to
/// keycode 94, where Shift turns it into `>`. Injecting the comma keysym
/// instead produces the expected character.
pub fn effective_keysym(keysym: u32, keycode_for: impl Fn(u32) -> Option<u8>) -> u32 {
    if keysym == 60 && keycode_for(60) == Some(94) {
        44
    } else {
        keysym
    }
}

/// Pack one broker datagram: event type, code, value, and a flag byte
/// where bit 0 defers the `EV_SYN` until the next frame.
pub fn pack_broker_frame(event_type: u16, code: u16, value: i32, defer_syn: bool) -> [u8; 9] {
    let mut buf = BytesMut::with_capacity(9);
    buf.put_u16_le(event_type);
    buf.put_u16_le(code);
    buf.put_i32_le(value);
    buf.put_u8(defer_syn as u8);
    let mut frame = [0u8; 9];
    frame.copy_from_slice(&buf);
    frame
}

struct UinputBroker {
    socket: UnixDatagram,
    path: String,
}

impl UinputBroker {
    fn send(&self, event_type: u16, code: u16, value: i32, defer_syn: bool) {
        let frame = pack_broker_frame(event_type, code, value, defer_syn);
        if let Err(e) = self.socket.send_to(&frame, &self.path) {
            debug!(path = %self.path, "uinput broker send failed: {e}");
        }
    }
}

pub struct InputInjector {
    conn: RustConnection,
    root: Window,
    keysym_to_keycode: HashMap<u32, u8>,
    button_mask: u8,
    broker: Option<UinputBroker>,
}

impl InputInjector {
    /// Connect to the X display from `DISPLAY` (or an explicit name) and
    /// optionally to a uinput broker socket for pointer events.
    pub fn new(display: Option<&str>, uinput_broker_path: Option<&str>) -> Result<Self> {
        let (conn, screen_num) =
            RustConnection::connect(display).context("Failed to connect to X display")?;
        let root = conn.setup().roots[screen_num].root;
        let keysym_to_keycode = build_keymap(&conn)?;

        let broker = match uinput_broker_path {
            Some(path) if !path.is_empty() => {
                info!(path, "Proxying pointer events to uinput broker");
                let socket =
                    UnixDatagram::unbound().context("Failed to create broker socket")?;
                Some(UinputBroker {
                    socket,
                    path: path.to_string(),
                })
            }
            _ => None,
        };

        let mut injector = Self {
            conn,
            root,
            keysym_to_keycode,
            button_mask: 0,
            broker,
        };
        // Fresh sessions inherit whatever the previous client left pressed.
        injector.reset_keyboard();
        Ok(injector)
    }

    fn keycode_for(&self, keysym: u32) -> Option<u8> {
        self.keysym_to_keycode.get(&keysym).copied()
    }

    pub fn send_key(&mut self, keysym: u32, down: bool) {
        let keysym = effective_keysym(keysym, |k| self.keycode_for(k));
        let Some(keycode) = self.keycode_for(keysym) else {
            warn!(keysym, "No keycode mapped for keysym");
            return;
        };
        let event_type = if down { KEY_PRESS_EVENT } else { KEY_RELEASE_EVENT };
        if let Err(e) = self
            .conn
            .xtest_fake_input(event_type, keycode, 0, self.root, 0, 0, 0)
        {
            warn!(keysym, "Failed to inject key: {e}");
        }
        let _ = self.conn.flush();
    }

    /// Release the fixed stuck-key list.
    pub fn reset_keyboard(&mut self) {
        info!("Resetting keyboard modifiers");
        for &keysym in STUCK_KEYSYMS {
            self.send_key(keysym, false);
        }
    }

    /// Pointer update: position or delta, then the button-mask diff.
    pub fn send_mouse(
        &mut self,
        x: i32,
        y: i32,
        button_mask: u8,
        scroll_magnitude: u8,
        relative: bool,
    ) {
        if relative {
            self.move_relative(x, y);
        } else {
            self.move_absolute(x, y);
        }

        for action in diff_button_mask(self.button_mask, button_mask, scroll_magnitude) {
            match action {
                MouseAction::Button { button, press } => self.inject_button(button, press),
                MouseAction::ScrollUp { count } => {
                    for _ in 0..count {
                        self.click_scroll(4, 1);
                    }
                }
                MouseAction::ScrollDown { count } => {
                    for _ in 0..count {
                        self.click_scroll(5, -1);
                    }
                }
            }
        }
        self.button_mask = button_mask;

        if !relative {
            let _ = self.conn.flush();
        }
    }

    fn move_absolute(&self, x: i32, y: i32) {
        if let Err(e) = self
            .conn
            .warp_pointer(x11rb::NONE, self.root, 0, 0, 0, 0, x as i16, y as i16)
        {
            warn!("Failed to warp pointer: {e}");
        }
    }

    fn move_relative(&self, dx: i32, dy: i32) {
        if let Some(broker) = &self.broker {
            // Defer the syn so both axes apply as one motion.
            broker.send(EV_REL, REL_X, dx, true);
            broker.send(EV_REL, REL_Y, dy, false);
            return;
        }
        // detail != 0 selects delta mode; a position-tracking helper would
        // drift because it cannot observe motion from the real user.
        if let Err(e) = self.conn.xtest_fake_input(
            MOTION_NOTIFY_EVENT,
            1,
            0,
            x11rb::NONE,
            dx as i16,
            dy as i16,
            0,
        ) {
            warn!("Failed to inject relative motion: {e}");
        }
        let _ = self.conn.flush();
    }

    fn inject_button(&self, button: u8, press: bool) {
        if let Some(broker) = &self.broker {
            let code = match button {
                1 => BTN_LEFT,
                2 => BTN_MIDDLE,
                3 => BTN_RIGHT,
                _ => return,
            };
            broker.send(EV_KEY, code, press as i32, false);
            return;
        }
        let event_type = if press { BUTTON_PRESS_EVENT } else { BUTTON_RELEASE_EVENT };
        if let Err(e) = self
            .conn
            .xtest_fake_input(event_type, button, 0, self.root, 0, 0, 0)
        {
            warn!(button, "Failed to inject button: {e}");
        }
        let _ = self.conn.flush();
    }

    /// One scroll notch: an X button 4/5 click, or a wheel unit over the
    /// broker.
    fn click_scroll(&self, x_button: u8, wheel_value: i32) {
        if let Some(broker) = &self.broker {
            broker.send(EV_REL, REL_WHEEL, wheel_value, false);
            return;
        }
        self.inject_button(x_button, true);
        self.inject_button(x_button, false);
    }
}

fn build_keymap(conn: &RustConnection) -> Result<HashMap<u32, u8>> {
    let setup = conn.setup();
    let min_keycode = setup.min_keycode;
    let max_keycode = setup.max_keycode;
    let reply = conn
        .get_keyboard_mapping(min_keycode, max_keycode - min_keycode + 1)?
        .reply()
        .context("Failed to fetch keyboard mapping")?;

    let per_keycode = reply.keysyms_per_keycode as usize;
    let mut map = HashMap::new();
    for (index, chunk) in reply.keysyms.chunks(per_keycode).enumerate() {
        let keycode = min_keycode + index as u8;
        for &keysym in chunk {
            if keysym != 0 {
                map.entry(keysym).or_insert(keycode);
            }
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn press_and_release_edges() {
        assert_eq!(
            diff_button_mask(0b000, 0b001, 0),
            vec![MouseAction::Button {
                button: 1,
                press: true,
            }]
        );
        assert_eq!(
            diff_button_mask(0b001, 0b000, 0),
            vec![MouseAction::Button {
                button: 1,
                press: false,
            }]
        );
    }

    #[test]
    fn middle_and_right_buttons_remap() {
        assert_eq!(
            diff_button_mask(0, 0b010, 0),
            vec![MouseAction::Button {
                button: 2,
                press: true,
            }]
        );
        assert_eq!(
            diff_button_mask(0, 0b100, 0),
            vec![MouseAction::Button {
                button: 3,
                press: true,
            }]
        );
    }

    #[test]
    fn unchanged_mask_is_noop() {
        assert!(diff_button_mask(0b101, 0b101, 3).is_empty());
    }

    #[test]
    fn scroll_bits_use_magnitude() {
        assert_eq!(
            diff_button_mask(0, 0b01000, 3),
            vec![MouseAction::ScrollUp { count: 3 }]
        );
        assert_eq!(
            diff_button_mask(0, 0b10000, 2),
            vec![MouseAction::ScrollDown { count: 2 }]
        );
    }

    #[test]
    fn scroll_magnitude_zero_still_scrolls_once() {
        assert_eq!(
            diff_button_mask(0, 0b01000, 0),
            vec![MouseAction::ScrollUp { count: 1 }]
        );
    }

    #[test]
    fn scroll_release_edge_is_silent() {
        assert!(diff_button_mask(0b01000, 0, 2).is_empty());
        assert!(diff_button_mask(0b10000, 0, 2).is_empty());
    }

    #[test]
    fn multiple_buttons_in_one_update() {
        let actions = diff_button_mask(0b001, 0b110, 0);
        assert_eq!(actions.len(), 3);
        assert!(actions.contains(&MouseAction::Button {
            button: 1,
            press: false,
        }));
        assert!(actions.contains(&MouseAction::Button {
            button: 2,
            press: true,
        }));
        assert!(actions.contains(&MouseAction::Button {
            button: 3,
            press: true,
        }));
    }

    #[test]
    fn less_than_keysym_remapped_when_bound_to_keycode_94() {
        assert_eq!(effective_keysym(60, |_| Some(94)), 44);
        assert_eq!(effective_keysym(60, |_| Some(59)), 60);
        assert_eq!(effective_keysym(97, |_| Some(94)), 97);
    }

    #[test]
    fn broker_frame_layout() {
        let frame = pack_broker_frame(EV_REL, REL_X, -7, true);
        assert_eq!(u16::from_le_bytes([frame[0], frame[1]]), EV_REL);
        assert_eq!(u16::from_le_bytes([frame[2], frame[3]]), REL_X);
        assert_eq!(
            i32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]),
            -7
        );
        assert_eq!(frame[8], 1);

        let frame = pack_broker_frame(EV_KEY, BTN_LEFT, 1, false);
        assert_eq!(u16::from_le_bytes([frame[2], frame[3]]), BTN_LEFT);
        assert_eq!(frame[8], 0);
    }
}

//! Wire codec for the virtual gamepad sockets.
//!
//! Two socket flavors exist per pad: the legacy joystick API ("JS") and
//! evdev ("EV"). Both share the same fixed-size config record; events differ.
//! The interposer library loaded by the game reports its pointer word size
//! as a single byte after the config record, and every subsequent event is
//! packed for that width: `struct input_event` carries a `timeval` whose
//! fields are 32-bit on 32-bit processes and 64-bit on 64-bit ones.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};

// Linux input event types (input-event-codes.h).
pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;
pub const EV_ABS: u16 = 0x03;
pub const SYN_REPORT: u16 = 0x00;

// Gamepad button codes.
pub const BTN_A: u16 = 0x130;
pub const BTN_B: u16 = 0x131;
pub const BTN_X: u16 = 0x133;
pub const BTN_Y: u16 = 0x134;
pub const BTN_TL: u16 = 0x136;
pub const BTN_TR: u16 = 0x137;
pub const BTN_SELECT: u16 = 0x13a;
pub const BTN_START: u16 = 0x13b;
pub const BTN_MODE: u16 = 0x13c;
pub const BTN_THUMBL: u16 = 0x13d;
pub const BTN_THUMBR: u16 = 0x13e;

// Absolute axis codes.
pub const ABS_X: u8 = 0x00;
pub const ABS_Y: u8 = 0x01;
pub const ABS_Z: u8 = 0x02;
pub const ABS_RX: u8 = 0x03;
pub const ABS_RY: u8 = 0x04;
pub const ABS_RZ: u8 = 0x05;
pub const ABS_HAT0X: u8 = 0x10;
pub const ABS_HAT0Y: u8 = 0x11;

// joystick.h event types.
pub const JS_EVENT_BUTTON: u8 = 0x01;
pub const JS_EVENT_AXIS: u8 = 0x02;

pub const MAX_BTNS: usize = 512;
pub const MAX_AXES: usize = 64;

pub const ABS_MIN: i32 = -32767;
pub const ABS_MAX: i32 = 32767;

/// Size of the config record sent to every new client:
/// 255-byte name + vendor/product/version/num_btns/num_axes (u16 each)
/// + 512 u16 button codes + 64 u8 axis codes, no padding.
pub const CONFIG_RECORD_SIZE: usize = 255 + 2 * 5 + MAX_BTNS * 2 + MAX_AXES;

/// Pointer word size reported by the interposer in the one-byte handshake.
/// This byte is the only 32/64-bit discriminator; nothing else is inferred
/// from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordSize {
    Four,
    Eight,
}

impl WordSize {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x04 => Some(Self::Four),
            0x08 => Some(Self::Eight),
            _ => None,
        }
    }
}

/// Map one browser axis to one or two browser buttons. The two-button form
/// produces signed axis values (first button positive, second negative).
#[derive(Debug, Clone)]
pub enum AxisButtons {
    One(u16),
    Two(u16, u16),
}

/// Browser-to-device remap table.
#[derive(Debug, Clone, Default)]
pub struct RemapTable {
    /// Device axis → browser button(s) driving it.
    pub axes_to_btn: BTreeMap<u8, AxisButtons>,
    /// Browser axis index → device axis index.
    pub axes: BTreeMap<u8, u8>,
    /// Browser button index → device button index.
    pub btns: BTreeMap<u16, u16>,
    /// Device axes with full unipolar range (analog triggers).
    pub trigger_axes: Vec<u8>,
}

/// A virtual gamepad's identity and capability tables.
#[derive(Debug, Clone)]
pub struct GamepadConfig {
    pub name: String,
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
    /// Device button index → evdev key code.
    pub btn_map: Vec<u16>,
    /// Device axis index → evdev absolute axis code.
    pub axes_map: Vec<u8>,
    pub mapping: RemapTable,
}

impl GamepadConfig {
    /// The Xbox-class profile every virtual pad uses: the browser Standard
    /// Gamepad layout (17 buttons, 4 axes) remapped onto the Linux xpad
    /// driver's 11 buttons and 8 axes.
    pub fn standard(name: &str) -> Self {
        let mut mapping = RemapTable::default();
        // Triggers become axes, the dpad becomes the hat pair.
        mapping.axes_to_btn.insert(2, AxisButtons::One(6)); // ABS_Z from L2
        mapping.axes_to_btn.insert(5, AxisButtons::One(7)); // ABS_RZ from R2
        mapping.axes_to_btn.insert(6, AxisButtons::Two(15, 14)); // ABS_HAT0X from DPad Right/Left
        mapping.axes_to_btn.insert(7, AxisButtons::Two(13, 12)); // ABS_HAT0Y from DPad Down/Up
        mapping.axes.insert(2, 3); // right stick X → ABS_RX
        mapping.axes.insert(3, 4); // right stick Y → ABS_RY
        mapping.btns.insert(8, 6); // Select → BTN_SELECT
        mapping.btns.insert(9, 7); // Start → BTN_START
        mapping.btns.insert(10, 9); // L3 → BTN_THUMBL
        mapping.btns.insert(11, 10); // R3 → BTN_THUMBR
        mapping.btns.insert(16, 8); // Guide → BTN_MODE
        mapping.trigger_axes = vec![2, 5];

        Self {
            name: name.to_string(),
            vendor: 0x045e,
            product: 0x028e,
            version: 1,
            btn_map: vec![
                BTN_A, BTN_B, BTN_X, BTN_Y, BTN_TL, BTN_TR, BTN_SELECT, BTN_START, BTN_MODE,
                BTN_THUMBL, BTN_THUMBR,
            ],
            axes_map: vec![
                ABS_X, ABS_Y, ABS_Z, ABS_RX, ABS_RY, ABS_RZ, ABS_HAT0X, ABS_HAT0Y,
            ],
            mapping,
        }
    }

    /// Pack the fixed-size config record. The length never depends on the
    /// active button/axis counts: code tables are zero-padded to capacity.
    pub fn config_record(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CONFIG_RECORD_SIZE);

        // ASCII name, truncated to 254 bytes plus a terminating null,
        // padded out to the full 255-byte field.
        let mut name: Vec<u8> = self
            .name
            .bytes()
            .filter(u8::is_ascii)
            .take(254)
            .collect();
        name.push(0);
        name.resize(255, 0);
        buf.put_slice(&name);

        buf.put_u16_le(self.vendor);
        buf.put_u16_le(self.product);
        buf.put_u16_le(self.version);
        buf.put_u16_le(self.btn_map.len() as u16);
        buf.put_u16_le(self.axes_map.len() as u16);

        for i in 0..MAX_BTNS {
            buf.put_u16_le(self.btn_map.get(i).copied().unwrap_or(0));
        }
        for i in 0..MAX_AXES {
            buf.put_u8(self.axes_map.get(i).copied().unwrap_or(0));
        }

        debug_assert_eq!(buf.len(), CONFIG_RECORD_SIZE);
        buf.freeze()
    }

    /// Map a browser button event to a device event.
    ///
    /// Buttons listed in `axes_to_btn` drive an axis instead: trigger axes
    /// scale the raw 0..1 value over the full unipolar range, dpad pairs
    /// produce `±ABS_MAX` with the sign given by pair position. Everything
    /// else goes through the button table; out-of-range targets are
    /// rejected.
    pub fn map_button(&self, btn_num: u16, btn_val: f64) -> Option<MappedEvent> {
        for (&axis, buttons) in &self.mapping.axes_to_btn {
            let sign = match *buttons {
                AxisButtons::One(b) if b == btn_num => 1.0,
                AxisButtons::Two(first, _) if first == btn_num => 1.0,
                AxisButtons::Two(_, second) if second == btn_num => -1.0,
                _ => continue,
            };
            let value = if self.mapping.trigger_axes.contains(&axis) {
                normalize_trigger(btn_val)
            } else {
                normalize_axis(btn_val * sign)
            };
            return Some(MappedEvent::Axis {
                number: axis,
                value,
            });
        }

        let mapped = self.mapping.btns.get(&btn_num).copied().unwrap_or(btn_num);
        if mapped as usize >= self.btn_map.len() {
            return None;
        }
        Some(MappedEvent::Button {
            number: mapped,
            value: btn_val as i32,
        })
    }

    /// Map a browser axis event to a device axis event, normalizing the
    /// [-1, 1] input to [`ABS_MIN`, `ABS_MAX`].
    pub fn map_axis(&self, axis_num: u8, axis_val: f64) -> Option<MappedEvent> {
        let mapped = self.mapping.axes.get(&axis_num).copied().unwrap_or(axis_num);
        if mapped as usize >= self.axes_map.len() {
            return None;
        }
        Some(MappedEvent::Axis {
            number: mapped,
            value: normalize_axis(axis_val),
        })
    }
}

/// A device-level event after remapping, before wire packing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappedEvent {
    Button { number: u16, value: i32 },
    Axis { number: u8, value: i32 },
}

/// Normalize a bipolar [-1, 1] value to [`ABS_MIN`, `ABS_MAX`].
pub fn normalize_axis(val: f64) -> i32 {
    (ABS_MIN as f64 + ((val + 1.0) * (ABS_MAX - ABS_MIN) as f64) / 2.0).round() as i32
}

/// Normalize a unipolar [0, 1] trigger value over the full axis range.
pub fn normalize_trigger(val: f64) -> i32 {
    (val * (ABS_MAX - ABS_MIN) as f64).round() as i32 + ABS_MIN
}

/// Pack a `struct js_event` (`__u32 time; __s16 value; __u8 type; __u8
/// number`). Identical on 32- and 64-bit clients: 8 bytes.
pub fn pack_js_event(event: &MappedEvent, time_ms: u32) -> Bytes {
    let (event_type, number, value) = match *event {
        MappedEvent::Button { number, value } => (JS_EVENT_BUTTON, number as u8, value),
        MappedEvent::Axis { number, value } => (JS_EVENT_AXIS, number, value),
    };
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32_le(time_ms);
    buf.put_i16_le(value.clamp(i16::MIN as i32, i16::MAX as i32) as i16);
    buf.put_u8(event_type);
    buf.put_u8(number);
    buf.freeze()
}

/// Pack an `input_event` pair: the payload record followed by an
/// `EV_SYN`/`SYN_REPORT` record. The `timeval` fields follow the client's
/// negotiated word size: 48 bytes for 64-bit clients, 32 for 32-bit.
pub fn pack_ev_event(
    config: &GamepadConfig,
    event: &MappedEvent,
    ts_sec: i64,
    ts_usec: i64,
    word: WordSize,
) -> Option<Bytes> {
    let (event_type, code, value) = match *event {
        MappedEvent::Button { number, value } => {
            let code = config.btn_map.get(number as usize).copied()?;
            (EV_KEY, code, value)
        }
        MappedEvent::Axis { number, value } => {
            let code = config.axes_map.get(number as usize).copied()? as u16;
            (EV_ABS, code, value)
        }
    };

    let mut buf = BytesMut::with_capacity(48);
    let mut put_record = |etype: u16, ecode: u16, evalue: i32| match word {
        WordSize::Eight => {
            buf.put_i64_le(ts_sec);
            buf.put_i64_le(ts_usec);
            buf.put_u16_le(etype);
            buf.put_u16_le(ecode);
            buf.put_i32_le(evalue);
        }
        WordSize::Four => {
            buf.put_i32_le(ts_sec as i32);
            buf.put_i32_le(ts_usec as i32);
            buf.put_u16_le(etype);
            buf.put_u16_le(ecode);
            buf.put_i32_le(evalue);
        }
    };
    put_record(event_type, code, value);
    put_record(EV_SYN, SYN_REPORT, 0);
    Some(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GamepadConfig {
        GamepadConfig::standard("Glint Controller 1")
    }

    #[test]
    fn config_record_has_fixed_size() {
        assert_eq!(CONFIG_RECORD_SIZE, 1353);
        assert_eq!(config().config_record().len(), CONFIG_RECORD_SIZE);
        // Size must not depend on the active code counts.
        let mut small = config();
        small.btn_map.truncate(2);
        small.axes_map.truncate(1);
        assert_eq!(small.config_record().len(), CONFIG_RECORD_SIZE);
    }

    #[test]
    fn config_record_layout() {
        let record = config().config_record();
        // Name is null-terminated within the 255-byte field.
        assert_eq!(&record[..18], b"Glint Controller 1");
        assert_eq!(record[18], 0);
        // vendor/product/version/num_btns/num_axes, little endian
        assert_eq!(u16::from_le_bytes([record[255], record[256]]), 0x045e);
        assert_eq!(u16::from_le_bytes([record[257], record[258]]), 0x028e);
        assert_eq!(u16::from_le_bytes([record[259], record[260]]), 1);
        assert_eq!(u16::from_le_bytes([record[261], record[262]]), 11);
        assert_eq!(u16::from_le_bytes([record[263], record[264]]), 8);
        // First button code is BTN_A, first axis code ABS_X.
        assert_eq!(u16::from_le_bytes([record[265], record[266]]), BTN_A);
        assert_eq!(record[265 + MAX_BTNS * 2], ABS_X);
    }

    #[test]
    fn long_name_is_truncated_with_null() {
        let mut cfg = config();
        cfg.name = "x".repeat(400);
        let record = cfg.config_record();
        assert_eq!(record.len(), CONFIG_RECORD_SIZE);
        assert_eq!(record[253], b'x');
        assert_eq!(record[254], 0);
    }

    #[test]
    fn word_size_handshake_byte() {
        assert_eq!(WordSize::from_byte(0x04), Some(WordSize::Four));
        assert_eq!(WordSize::from_byte(0x08), Some(WordSize::Eight));
        assert_eq!(WordSize::from_byte(0x02), None);
    }

    #[test]
    fn trigger_button_maps_to_full_range_axis() {
        // Browser button 6 (L2) drives trigger axis 2 (ABS_Z).
        let event = config().map_button(6, 1.0).unwrap();
        assert_eq!(
            event,
            MappedEvent::Axis {
                number: 2,
                value: ABS_MAX,
            }
        );
        let released = config().map_button(6, 0.0).unwrap();
        assert_eq!(
            released,
            MappedEvent::Axis {
                number: 2,
                value: ABS_MIN,
            }
        );
    }

    #[test]
    fn dpad_pair_produces_signed_extremes() {
        // axes_to_btn[6] = (15, 14): DPad Right is positive, Left negative.
        assert_eq!(
            config().map_button(15, 1.0).unwrap(),
            MappedEvent::Axis {
                number: 6,
                value: ABS_MAX,
            }
        );
        assert_eq!(
            config().map_button(14, 1.0).unwrap(),
            MappedEvent::Axis {
                number: 6,
                value: ABS_MIN,
            }
        );
    }

    #[test]
    fn plain_buttons_remap_through_table() {
        assert_eq!(
            config().map_button(8, 1.0).unwrap(),
            MappedEvent::Button {
                number: 6,
                value: 1,
            }
        );
        // Unmapped buttons pass through by index.
        assert_eq!(
            config().map_button(0, 1.0).unwrap(),
            MappedEvent::Button {
                number: 0,
                value: 1,
            }
        );
    }

    #[test]
    fn out_of_range_button_rejected() {
        assert_eq!(config().map_button(20, 1.0), None);
    }

    #[test]
    fn axis_remap_and_normalization() {
        // Browser axis 2 (right stick X) lands on device axis 3 (ABS_RX).
        assert_eq!(
            config().map_axis(2, 1.0).unwrap(),
            MappedEvent::Axis {
                number: 3,
                value: ABS_MAX,
            }
        );
        assert_eq!(
            config().map_axis(0, 0.0).unwrap(),
            MappedEvent::Axis {
                number: 0,
                value: 0,
            }
        );
        assert_eq!(config().map_axis(60, 0.0), None);
    }

    #[test]
    fn normalize_axis_roundtrip_within_one_unit() {
        for &v in &[-1.0, -0.5, -0.123, 0.0, 0.337, 0.5, 1.0] {
            let n = normalize_axis(v);
            let back = (n - ABS_MIN) as f64 * 2.0 / (ABS_MAX - ABS_MIN) as f64 - 1.0;
            let unit = 2.0 / (ABS_MAX - ABS_MIN) as f64;
            assert!(
                (back - v).abs() <= unit,
                "normalize({v}) = {n} inverted to {back}"
            );
        }
    }

    #[test]
    fn js_event_is_eight_bytes_for_both_word_sizes() {
        let event = MappedEvent::Axis {
            number: 2,
            value: ABS_MAX,
        };
        let packed = pack_js_event(&event, 12345);
        assert_eq!(packed.len(), 8);
        assert_eq!(u32::from_le_bytes([packed[0], packed[1], packed[2], packed[3]]), 12345);
        assert_eq!(i16::from_le_bytes([packed[4], packed[5]]), 32767);
        assert_eq!(packed[6], JS_EVENT_AXIS);
        assert_eq!(packed[7], 2);
    }

    #[test]
    fn js_button_event_layout() {
        let event = MappedEvent::Button {
            number: 3,
            value: 1,
        };
        let packed = pack_js_event(&event, 0);
        assert_eq!(packed[6], JS_EVENT_BUTTON);
        assert_eq!(packed[7], 3);
        assert_eq!(i16::from_le_bytes([packed[4], packed[5]]), 1);
    }

    #[test]
    fn ev_event_lengths_follow_word_size() {
        let cfg = config();
        let event = MappedEvent::Axis {
            number: 2,
            value: ABS_MAX,
        };
        let wide = pack_ev_event(&cfg, &event, 1, 2, WordSize::Eight).unwrap();
        assert_eq!(wide.len(), 48);
        let narrow = pack_ev_event(&cfg, &event, 1, 2, WordSize::Four).unwrap();
        assert_eq!(narrow.len(), 32);
    }

    #[test]
    fn ev_trigger_event_carries_abs_z_then_syn_report() {
        let cfg = config();
        let event = cfg.map_button(6, 1.0).unwrap();
        let packed = pack_ev_event(&cfg, &event, 100, 200, WordSize::Eight).unwrap();

        // First record: EV_ABS / ABS_Z / 32767 after the 16-byte timeval.
        assert_eq!(u16::from_le_bytes([packed[16], packed[17]]), EV_ABS);
        assert_eq!(u16::from_le_bytes([packed[18], packed[19]]), ABS_Z as u16);
        assert_eq!(
            i32::from_le_bytes([packed[20], packed[21], packed[22], packed[23]]),
            32767
        );
        // Second record: EV_SYN / SYN_REPORT / 0.
        assert_eq!(u16::from_le_bytes([packed[40], packed[41]]), EV_SYN);
        assert_eq!(u16::from_le_bytes([packed[42], packed[43]]), SYN_REPORT);
        assert_eq!(
            i32::from_le_bytes([packed[44], packed[45], packed[46], packed[47]]),
            0
        );
    }

    #[test]
    fn ev_button_event_uses_key_codes() {
        let cfg = config();
        let event = cfg.map_button(0, 1.0).unwrap();
        let packed = pack_ev_event(&cfg, &event, 0, 0, WordSize::Four).unwrap();
        // 32-bit timeval is 8 bytes.
        assert_eq!(u16::from_le_bytes([packed[8], packed[9]]), EV_KEY);
        assert_eq!(u16::from_le_bytes([packed[10], packed[11]]), BTN_A);
    }
}

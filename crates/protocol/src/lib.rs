pub mod channel;
pub mod gamepad;
pub mod rtc;

pub use channel::{ChannelCommand, OutboundMessage};
pub use rtc::{RtcConfig, RtcConfigError};

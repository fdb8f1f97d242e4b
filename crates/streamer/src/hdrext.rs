//! Playout-delay RTP header extension.
//!
//! Chrome honors `http://www.webrtc.org/experiments/rtp-hdrext/playout-delay`
//! to shrink its render queue. GStreamer ships no writer for it, so this is
//! a minimal [`RTPHeaderExtension`] subclass emitting the 3-byte form with
//! `min=0, max=0` on every packet: render immediately, never buffer.

use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use gstreamer_rtp as gst_rtp;

/// Extension payload: 12-bit minimum and 12-bit maximum delay, both zero.
const PLAYOUT_DELAY_SIZE: usize = 3;

mod imp {
    use super::*;
    use gst::subclass::prelude::*;
    use gst_rtp::subclass::prelude::*;

    #[derive(Default)]
    pub struct PlayoutDelayExt;

    #[glib::object_subclass]
    impl ObjectSubclass for PlayoutDelayExt {
        const NAME: &'static str = "GlintRTPHeaderExtensionPlayoutDelay";
        type Type = super::PlayoutDelayExt;
        type ParentType = gst_rtp::RTPHeaderExtension;
    }

    impl ObjectImpl for PlayoutDelayExt {}
    impl GstObjectImpl for PlayoutDelayExt {}

    impl ElementImpl for PlayoutDelayExt {
        fn metadata() -> Option<&'static gst::subclass::ElementMetadata> {
            static ELEMENT_METADATA: std::sync::OnceLock<gst::subclass::ElementMetadata> =
                std::sync::OnceLock::new();
            Some(ELEMENT_METADATA.get_or_init(|| {
                gst::subclass::ElementMetadata::new(
                    "Playout delay RTP header extension",
                    "Network/Extension/RTPHeader",
                    "Requests zero playout delay from the receiver",
                    "Glint Contributors",
                )
            }))
        }
    }

    impl RTPHeaderExtensionImpl for PlayoutDelayExt {
        const URI: &'static str = "http://www.webrtc.org/experiments/rtp-hdrext/playout-delay";

        fn supported_flags(&self) -> gst_rtp::RTPHeaderExtensionFlags {
            gst_rtp::RTPHeaderExtensionFlags::ONE_BYTE
                | gst_rtp::RTPHeaderExtensionFlags::TWO_BYTE
        }

        fn max_size(&self, _input: &gst::BufferRef) -> usize {
            PLAYOUT_DELAY_SIZE
        }

        fn write(
            &self,
            _input: &gst::BufferRef,
            _write_flags: gst_rtp::RTPHeaderExtensionFlags,
            _output: &mut gst::BufferRef,
            output_data: &mut [u8],
        ) -> Result<usize, gst::LoggableError> {
            output_data[..PLAYOUT_DELAY_SIZE].fill(0);
            Ok(PLAYOUT_DELAY_SIZE)
        }

        fn read(
            &self,
            _read_flags: gst_rtp::RTPHeaderExtensionFlags,
            _input_data: &[u8],
            _output: &mut gst::BufferRef,
        ) -> Result<(), gst::LoggableError> {
            Ok(())
        }
    }
}

glib::wrapper! {
    pub struct PlayoutDelayExt(ObjectSubclass<imp::PlayoutDelayExt>)
        @extends gst_rtp::RTPHeaderExtension, gst::Element, gst::Object;
}

/// Instantiate the extension, ready for `add-extension` on a payloader.
pub fn playout_delay_extension() -> gst_rtp::RTPHeaderExtension {
    glib::Object::new::<PlayoutDelayExt>().upcast()
}

//! GStreamer webrtcbin pipeline controller.
//!
//! Owns the capture → convert → encode → payload → webrtcbin graph, the
//! `input` data channel, and every dynamic encoder knob. All other
//! components request changes through the orchestrator; this module is the
//! only place that touches element properties.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_rtp as gst_rtp;
use gstreamer_rtp::prelude::*;
use gstreamer_sdp as gst_sdp;
use gstreamer_webrtc as gst_webrtc;
use gstreamer_webrtc::{WebRTCDataChannel, WebRTCSessionDescription};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::hdrext;
use crate::sdp;

/// URI of the transport-wide congestion control RTP header extension.
const TWCC_EXT_URI: &str =
    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";

/// Opus frame size we configure, in milliseconds. Frames under 10 ms get an
/// explicit `a=ptime:10` in the offer.
const OPUS_FRAME_MS: f64 = 10.0;

// ---------------------------------------------------------------------------
// Encoder table

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264,
    H265,
    Vp8,
    Vp9,
    Av1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderFamily {
    /// NVENC via the CUDA plugin (`nvcudah264enc` and friends).
    NvCuda,
    /// Legacy NVENC elements (`nvh264enc`).
    NvLegacy,
    /// VA-API (`vah264enc`, `vah264lpenc`, `vah265enc`).
    VaApi,
    /// CPU encoders (`x264enc`).
    Software,
    /// libvpx (`vp8enc`, `vp9enc`).
    Vpx,
    /// rav1e AV1 software encoder.
    Rav1e,
}

#[derive(Debug, Clone, Copy)]
pub struct EncoderInfo {
    pub id: &'static str,
    pub family: EncoderFamily,
    pub codec: Codec,
    /// GStreamer plugin that must be present.
    pub plugin: &'static str,
}

pub const ENCODERS: &[EncoderInfo] = &[
    EncoderInfo { id: "nvcudah264enc", family: EncoderFamily::NvCuda, codec: Codec::H264, plugin: "nvcodec" },
    EncoderInfo { id: "nvh264enc", family: EncoderFamily::NvLegacy, codec: Codec::H264, plugin: "nvcodec" },
    EncoderInfo { id: "nvcudah265enc", family: EncoderFamily::NvCuda, codec: Codec::H265, plugin: "nvcodec" },
    EncoderInfo { id: "nvh265enc", family: EncoderFamily::NvLegacy, codec: Codec::H265, plugin: "nvcodec" },
    EncoderInfo { id: "nvav1enc", family: EncoderFamily::NvCuda, codec: Codec::Av1, plugin: "nvcodec" },
    EncoderInfo { id: "vah264enc", family: EncoderFamily::VaApi, codec: Codec::H264, plugin: "va" },
    EncoderInfo { id: "vah264lpenc", family: EncoderFamily::VaApi, codec: Codec::H264, plugin: "va" },
    EncoderInfo { id: "vah265enc", family: EncoderFamily::VaApi, codec: Codec::H265, plugin: "va" },
    EncoderInfo { id: "x264enc", family: EncoderFamily::Software, codec: Codec::H264, plugin: "x264" },
    EncoderInfo { id: "vp8enc", family: EncoderFamily::Vpx, codec: Codec::Vp8, plugin: "vpx" },
    EncoderInfo { id: "vp9enc", family: EncoderFamily::Vpx, codec: Codec::Vp9, plugin: "vpx" },
    EncoderInfo { id: "rav1enc", family: EncoderFamily::Rav1e, codec: Codec::Av1, plugin: "rav1e" },
];

pub fn lookup_encoder(id: &str) -> Option<EncoderInfo> {
    ENCODERS.iter().find(|e| e.id == id).copied()
}

impl EncoderInfo {
    pub fn is_h26x(&self) -> bool {
        matches!(self.codec, Codec::H264 | Codec::H265)
    }
}

// ---------------------------------------------------------------------------
// Derived parameters

/// Frames between keyframes: `-1` keeps the GOP infinite, otherwise at
/// least 60 frames so periodic IDRs never dominate bandwidth.
pub fn keyframe_frame_distance(framerate: u32, keyframe_distance_secs: f64) -> i32 {
    if keyframe_distance_secs == -1.0 {
        -1
    } else {
        (framerate as f64 * keyframe_distance_secs).round().max(60.0) as i32
    }
}

/// Video bitrate handed to the encoder after reserving FEC overhead, so the
/// on-wire rate stays within the configured budget.
pub fn fec_video_bitrate(video_bitrate_kbps: u32, video_loss_pct: f64) -> u32 {
    (video_bitrate_kbps as f64 / (1.0 + video_loss_pct / 100.0)).round() as u32
}

/// Audio bitrate is grown instead: Opus FEC steals payload bits, so the
/// nominal input rises to keep the decoded quality at the target.
pub fn fec_audio_bitrate(audio_bitrate_bps: u32, audio_loss_pct: f64) -> u32 {
    (audio_bitrate_bps as f64 * (1.0 + audio_loss_pct / 100.0)).round() as u32
}

/// VBV/HRD buffer multiplier by encoder family and GOP mode. Hardware
/// encoders get more slack, and an infinite GOP more again, because a
/// single oversized frame cannot be recovered by the next IDR.
pub fn vbv_multiplier(family: EncoderFamily, infinite_gop: bool) -> f64 {
    match (family, infinite_gop) {
        (EncoderFamily::NvCuda | EncoderFamily::NvLegacy, false) => 2.0,
        (EncoderFamily::NvCuda | EncoderFamily::NvLegacy, true) => 3.0,
        (EncoderFamily::VaApi, false) => 1.5,
        (EncoderFamily::VaApi, true) => 2.0,
        (EncoderFamily::Software, false) => 1.0,
        (EncoderFamily::Software, true) => 1.5,
        (EncoderFamily::Vpx | EncoderFamily::Rav1e, _) => 1.0,
    }
}

/// VBV buffer size in kbit: one frame's worth of the FEC-adjusted bitrate,
/// scaled by the family multiplier.
pub fn vbv_buffer_size(fec_video_kbps: u32, framerate: u32, family: EncoderFamily, infinite_gop: bool) -> u32 {
    let per_frame = (fec_video_kbps as f64 / framerate.max(1) as f64).ceil();
    (per_frame * vbv_multiplier(family, infinite_gop)).round() as u32
}

/// Congestion-control band floor: never below 100 kbps of video plus the
/// audio share, and at least 10% of the configured rate.
pub fn cc_min_bitrate(video_bps: u64, fec_audio_bps: u64) -> u64 {
    (100_000 + fec_audio_bps).max((video_bps as f64 * 0.1) as u64 + fec_audio_bps)
}

pub fn cc_max_bitrate(video_bps: u64, fec_audio_bps: u64) -> u64 {
    video_bps + fec_audio_bps
}

/// Lowest positive extension id not already in use on a payloader.
pub fn lowest_free_ext_id(used: &[u32]) -> u32 {
    let mut id = 1;
    while used.contains(&id) {
        id += 1;
    }
    id
}

// ---------------------------------------------------------------------------
// Controller

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Stopped,
    Building,
    Playing,
    Stopping,
}

/// Construction-time settings; dynamic fields are updated through setters.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub encoder: EncoderInfo,
    pub gpu_id: u32,
    pub framerate: u32,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_bps: u32,
    pub audio_channels: u32,
    pub keyframe_distance_secs: f64,
    pub congestion_control: bool,
    pub video_packetloss_pct: f64,
    pub audio_packetloss_pct: f64,
    pub enable_audio: bool,
    pub stun_uris: Vec<String>,
    pub turn_uris: Vec<String>,
}

/// Events emitted toward the orchestrator.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Offer { sdp: String },
    IceCandidate { mline_index: u32, candidate: String },
    DataChannelOpen,
    DataChannelClose,
    DataChannelError(String),
    DataChannelMessage(String),
    /// Estimated bitrate (bps) from the congestion-control element.
    CongestionBitrate(u32),
    Eos,
    Error(String),
}

struct Inner {
    state: PipelineState,
    pipeline: Option<gst::Pipeline>,
    webrtcbin: Option<gst::Element>,
    ximagesrc: Option<gst::Element>,
    ximagesrc_capsfilter: Option<gst::Element>,
    video_encoder: Option<gst::Element>,
    opusenc: Option<gst::Element>,
    data_channel: Option<WebRTCDataChannel>,
    congestion_element: Option<gst::Element>,
}

pub struct PipelineController {
    settings: Mutex<PipelineSettings>,
    inner: Mutex<Inner>,
    events: UnboundedSender<PipelineEvent>,
    /// Set while applying a congestion-triggered bitrate so the CC bands
    /// are not reprogrammed from their own feedback.
    applying_cc_estimate: AtomicBool,
}

impl PipelineController {
    pub fn new(settings: PipelineSettings, events: UnboundedSender<PipelineEvent>) -> Arc<Self> {
        Arc::new(Self {
            settings: Mutex::new(settings),
            inner: Mutex::new(Inner {
                state: PipelineState::Stopped,
                pipeline: None,
                webrtcbin: None,
                ximagesrc: None,
                ximagesrc_capsfilter: None,
                video_encoder: None,
                opusenc: None,
                data_channel: None,
                congestion_element: None,
            }),
            events,
            applying_cc_estimate: AtomicBool::new(false),
        })
    }

    fn settings(&self) -> PipelineSettings {
        self.settings.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn state(&self) -> PipelineState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    /// Verify every required GStreamer plugin is present. Missing plugins
    /// are a configuration error and fatal at startup.
    pub fn check_plugins(encoder: &EncoderInfo) -> Result<()> {
        let mut required = vec![
            "opus", "nice", "webrtc", "dtls", "srtp", "rtp", "sctp", "rtpmanager", "ximagesrc",
        ];
        required.push(encoder.plugin);
        let registry = gst::Registry::get();
        let missing: Vec<&str> = required
            .into_iter()
            .filter(|name| registry.find_plugin(name).is_none())
            .collect();
        if !missing.is_empty() {
            bail!("missing GStreamer plugins: {}", missing.join(", "));
        }
        Ok(())
    }

    /// Build the full graph and take it to `Playing`, then open the
    /// `input` data channel.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.state != PipelineState::Stopped {
                bail!("pipeline already running (state {:?})", inner.state);
            }
            inner.state = PipelineState::Building;
        }
        info!("Starting media pipeline");

        let settings = self.settings();
        let result = self.build_and_play(&settings);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match result {
            Ok(built) => {
                inner.pipeline = Some(built.pipeline);
                inner.webrtcbin = Some(built.webrtcbin);
                inner.ximagesrc = Some(built.ximagesrc);
                inner.ximagesrc_capsfilter = Some(built.ximagesrc_capsfilter);
                inner.video_encoder = Some(built.video_encoder);
                inner.opusenc = built.opusenc;
                inner.data_channel = Some(built.data_channel);
                inner.state = PipelineState::Playing;
                info!("Media pipeline playing");
                Ok(())
            }
            Err(e) => {
                inner.state = PipelineState::Stopped;
                Err(e)
            }
        }
    }

    fn build_and_play(self: &Arc<Self>, settings: &PipelineSettings) -> Result<BuiltPipeline> {
        let pipeline = gst::Pipeline::new();
        let webrtcbin = self.build_webrtcbin(settings, &pipeline)?;
        let (ximagesrc, ximagesrc_capsfilter, video_encoder) =
            self.build_video_chain(settings, &pipeline, &webrtcbin)?;
        let opusenc = if settings.enable_audio {
            Some(build_audio_chain(settings, &pipeline, &webrtcbin)?)
        } else {
            None
        };

        pipeline
            .set_state(gst::State::Playing)
            .context("Failed to transition pipeline to PLAYING")?;

        // The data channel must be created after the transition so SCTP is
        // negotiated into the offer.
        let data_channel = self.create_data_channel(&webrtcbin)?;

        // NACK retransmission on the video transceiver prevents long
        // freezes on packet loss.
        let transceiver = webrtcbin
            .emit_by_name::<Option<gst_webrtc::WebRTCRTPTransceiver>>("get-transceiver", &[&0i32]);
        if let Some(transceiver) = transceiver {
            transceiver.set_property("do-nack", true);
        }

        Ok(BuiltPipeline {
            pipeline,
            webrtcbin,
            ximagesrc,
            ximagesrc_capsfilter,
            video_encoder,
            opusenc,
            data_channel,
        })
    }

    fn build_webrtcbin(
        self: &Arc<Self>,
        settings: &PipelineSettings,
        pipeline: &gst::Pipeline,
    ) -> Result<gst::Element> {
        let webrtcbin = gst::ElementFactory::make("webrtcbin")
            .name("app")
            .build()
            .context("Failed to create webrtcbin")?;

        // Separate audio and video tracks for the browser.
        webrtcbin.set_property_from_str("bundle-policy", "max-compat");
        // Jitter buffer at the floor for interactive latency.
        webrtcbin.set_property("latency", 1u32);

        if let Some(stun) = settings.stun_uris.first() {
            webrtcbin.set_property("stun-server", stun);
        }
        for turn_uri in &settings.turn_uris {
            info!(uri = %turn_uri, "Adding TURN server");
            let added = webrtcbin.emit_by_name::<bool>("add-turn-server", &[turn_uri]);
            if !added {
                warn!(uri = %turn_uri, "webrtcbin rejected TURN server");
            }
        }

        let controller = Arc::clone(self);
        webrtcbin.connect("on-negotiation-needed", false, move |values| {
            let webrtcbin = values[0].get::<gst::Element>().ok()?;
            controller.on_negotiation_needed(&webrtcbin);
            None
        });

        let events = self.events.clone();
        webrtcbin.connect("on-ice-candidate", false, move |values| {
            let mline_index = values[1].get::<u32>().ok()?;
            let candidate = values[2].get::<String>().ok()?;
            let _ = events.send(PipelineEvent::IceCandidate {
                mline_index,
                candidate,
            });
            None
        });

        if settings.congestion_control {
            let controller = Arc::clone(self);
            webrtcbin.connect("request-aux-sender", false, move |_values| {
                match controller.make_congestion_element() {
                    Some(element) => Some(element.to_value()),
                    None => None,
                }
            });
        }

        pipeline
            .add(&webrtcbin)
            .context("Failed to add webrtcbin to pipeline")?;
        Ok(webrtcbin)
    }

    /// Build the Google congestion-control bandwidth estimator and wire its
    /// estimate back through the orchestrator.
    fn make_congestion_element(self: &Arc<Self>) -> Option<gst::Element> {
        let settings = self.settings();
        let bwe = match gst::ElementFactory::make("rtpgccbwe").build() {
            Ok(e) => e,
            Err(e) => {
                warn!("Congestion control requested but rtpgccbwe is unavailable: {e}");
                return None;
            }
        };
        let video_bps = settings.video_bitrate_kbps as u64 * 1000;
        let fec_audio =
            fec_audio_bitrate(settings.audio_bitrate_bps, settings.audio_packetloss_pct) as u64;
        bwe.set_property("min-bitrate", cc_min_bitrate(video_bps, fec_audio) as u32);
        bwe.set_property("max-bitrate", cc_max_bitrate(video_bps, fec_audio) as u32);
        bwe.set_property("estimated-bitrate", video_bps as u32 + fec_audio as u32);

        let events = self.events.clone();
        let controller = Arc::downgrade(self);
        bwe.connect_notify(Some("estimated-bitrate"), move |bwe, _| {
            // Our own band reprogramming also fires this notify; only the
            // estimator's opinion feeds back into the bitrate.
            if let Some(controller) = controller.upgrade() {
                if controller.applying_cc_estimate.load(Ordering::Relaxed) {
                    return;
                }
            }
            let estimate = bwe.property::<u32>("estimated-bitrate");
            let _ = events.send(PipelineEvent::CongestionBitrate(estimate));
        });

        info!("Congestion control element attached");
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .congestion_element = Some(bwe.clone());
        Some(bwe)
    }

    fn on_negotiation_needed(self: &Arc<Self>, webrtcbin: &gst::Element) {
        info!("Negotiation needed, creating offer");
        let controller = Arc::clone(self);
        let bin = webrtcbin.clone();
        let promise = gst::Promise::with_change_func(move |reply| {
            let reply = match reply {
                Ok(Some(reply)) => reply,
                Ok(None) => {
                    warn!("Offer promise interrupted");
                    return;
                }
                Err(e) => {
                    warn!("Offer creation failed: {e:?}");
                    return;
                }
            };
            let offer = match reply.get::<WebRTCSessionDescription>("offer") {
                Ok(offer) => offer,
                Err(e) => {
                    warn!("Offer promise reply carried no offer: {e}");
                    return;
                }
            };
            bin.emit_by_name::<()>("set-local-description", &[&offer, &None::<gst::Promise>]);

            let sdp_text = match offer.sdp().as_text() {
                Ok(text) => text,
                Err(e) => {
                    warn!("Offer SDP was not valid text: {e}");
                    return;
                }
            };
            let settings = controller.settings();
            let munged = sdp::munge_offer(&sdp_text, settings.encoder.is_h26x(), OPUS_FRAME_MS);
            let _ = controller.events.send(PipelineEvent::Offer { sdp: munged });
        });
        webrtcbin.emit_by_name::<()>("create-offer", &[&None::<gst::Structure>, &promise]);
    }

    fn build_video_chain(
        self: &Arc<Self>,
        settings: &PipelineSettings,
        pipeline: &gst::Pipeline,
        webrtcbin: &gst::Element,
    ) -> Result<(gst::Element, gst::Element, gst::Element)> {
        let encoder_info = settings.encoder;
        let fec_kbps = fec_video_bitrate(settings.video_bitrate_kbps, settings.video_packetloss_pct);
        let kf_dist = keyframe_frame_distance(settings.framerate, settings.keyframe_distance_secs);

        // X11 capture. XDamage is disabled: partial damage regions starve
        // H.264 streams of motion vectors and recovery takes seconds.
        let ximagesrc = gst::ElementFactory::make("ximagesrc")
            .name("x11")
            .property("show-pointer", false)
            .property("remote", true)
            .property("blocksize", 16384u32)
            .property("use-damage", false)
            .build()
            .context("Failed to create ximagesrc")?;

        let caps = gst::Caps::builder("video/x-raw")
            .field("framerate", gst::Fraction::new(settings.framerate as i32, 1))
            .build();
        let ximagesrc_capsfilter = gst::ElementFactory::make("capsfilter")
            .property("caps", &caps)
            .build()
            .context("Failed to create ximagesrc capsfilter")?;

        let mut chain: Vec<gst::Element> = vec![ximagesrc.clone(), ximagesrc_capsfilter.clone()];

        // Colorspace conversion lives next to its encoder: CUDA encoders
        // convert on the GPU, VA-API through vapostproc, CPU encoders with
        // videoconvert.
        let encoder = match encoder_info.family {
            EncoderFamily::NvCuda | EncoderFamily::NvLegacy => {
                let cudaupload = gst::ElementFactory::make("cudaupload")
                    .build()
                    .context("Failed to create cudaupload")?;
                cudaupload.set_property("cuda-device-id", settings.gpu_id);
                let cudaconvert = gst::ElementFactory::make("cudaconvert")
                    .build()
                    .context("Failed to create cudaconvert")?;
                let convert_caps: gst::Caps = "video/x-raw(memory:CUDAMemory), format=NV12"
                    .parse()
                    .context("Bad CUDA caps")?;
                let convert_capsfilter = gst::ElementFactory::make("capsfilter")
                    .property("caps", &convert_caps)
                    .build()?;
                let encoder = build_nv_encoder(&encoder_info, settings, fec_kbps, kf_dist)?;
                chain.extend([cudaupload, cudaconvert, convert_capsfilter, encoder.clone()]);
                encoder
            }
            EncoderFamily::VaApi => {
                let vapostproc = gst::ElementFactory::make("vapostproc")
                    .build()
                    .context("Failed to create vapostproc")?;
                let convert_caps: gst::Caps = "video/x-raw(memory:VAMemory), format=NV12"
                    .parse()
                    .context("Bad VA caps")?;
                let convert_capsfilter = gst::ElementFactory::make("capsfilter")
                    .property("caps", &convert_caps)
                    .build()?;
                let encoder = build_va_encoder(&encoder_info, fec_kbps, kf_dist)?;
                chain.extend([vapostproc, convert_capsfilter, encoder.clone()]);
                encoder
            }
            EncoderFamily::Software => {
                let videoconvert = gst::ElementFactory::make("videoconvert").build()?;
                let convert_caps = gst::Caps::builder("video/x-raw")
                    .field("format", "NV12")
                    .build();
                let convert_capsfilter = gst::ElementFactory::make("capsfilter")
                    .property("caps", &convert_caps)
                    .build()?;
                let encoder = build_x264_encoder(settings, fec_kbps, kf_dist)?;
                chain.extend([videoconvert, convert_capsfilter, encoder.clone()]);
                encoder
            }
            EncoderFamily::Vpx | EncoderFamily::Rav1e => {
                let videoconvert = gst::ElementFactory::make("videoconvert").build()?;
                let convert_caps = gst::Caps::builder("video/x-raw")
                    .field("format", "I420")
                    .build();
                let convert_capsfilter = gst::ElementFactory::make("capsfilter")
                    .property("caps", &convert_caps)
                    .build()?;
                let encoder = if encoder_info.family == EncoderFamily::Vpx {
                    build_vpx_encoder(&encoder_info, fec_kbps, kf_dist)?
                } else {
                    build_rav1e_encoder(fec_kbps, kf_dist)?
                };
                chain.extend([videoconvert, convert_capsfilter, encoder.clone()]);
                encoder
            }
        };

        // Codec caps + payloader.
        let (codec_capsfilter, payloader, pay_capsfilter) = build_payload_stage(&encoder_info)?;
        add_rtp_header_extensions(&payloader, settings.congestion_control);
        chain.extend([codec_capsfilter, payloader, pay_capsfilter]);

        for element in &chain {
            pipeline
                .add(element)
                .with_context(|| format!("Failed to add {} to pipeline", element.name()))?;
        }
        let mut linked: Vec<&gst::Element> = chain.iter().collect();
        linked.push(webrtcbin);
        gst::Element::link_many(linked.iter().copied())
            .context("Failed to link video pipeline elements")?;

        Ok((ximagesrc, ximagesrc_capsfilter, encoder))
    }

    fn create_data_channel(self: &Arc<Self>, webrtcbin: &gst::Element) -> Result<WebRTCDataChannel> {
        let options = gst::Structure::builder("application/data-channel")
            .field("ordered", true)
            .field("max-retransmits", 0i32)
            .build();
        let channel = webrtcbin
            .emit_by_name::<Option<WebRTCDataChannel>>(
                "create-data-channel",
                &[&"input", &options],
            )
            .context("webrtcbin refused to create the data channel")?;

        let events = self.events.clone();
        channel.connect_on_open(move |_| {
            let _ = events.send(PipelineEvent::DataChannelOpen);
        });
        let events = self.events.clone();
        channel.connect_on_close(move |_| {
            let _ = events.send(PipelineEvent::DataChannelClose);
        });
        let events = self.events.clone();
        channel.connect_on_error(move |_, error| {
            let _ = events.send(PipelineEvent::DataChannelError(error.to_string()));
        });
        let events = self.events.clone();
        channel.connect_on_message_string(move |_, msg| {
            if let Some(msg) = msg {
                let _ = events.send(PipelineEvent::DataChannelMessage(msg.to_string()));
            }
        });
        Ok(channel)
    }

    /// Apply the browser's SDP answer.
    pub fn set_sdp(&self, sdp_type: &str, sdp_text: &str) -> Result<()> {
        if sdp_type != "answer" {
            bail!("unexpected SDP type '{sdp_type}', this side initiates the call");
        }
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let webrtcbin = inner
            .webrtcbin
            .as_ref()
            .context("received SDP before the session started")?;
        let message = gst_sdp::SDPMessage::parse_buffer(sdp_text.as_bytes())
            .context("Failed to parse SDP answer")?;
        let answer =
            WebRTCSessionDescription::new(gst_webrtc::WebRTCSDPType::Answer, message);
        webrtcbin.emit_by_name::<()>("set-remote-description", &[&answer, &None::<gst::Promise>]);
        Ok(())
    }

    /// Feed a remote ICE candidate into webrtcbin.
    pub fn set_ice(&self, mline_index: u32, candidate: &str) -> Result<()> {
        debug!(mline_index, candidate, "Adding remote ICE candidate");
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let webrtcbin = inner
            .webrtcbin
            .as_ref()
            .context("received ICE before the session started")?;
        webrtcbin.emit_by_name::<()>("add-ice-candidate", &[&mline_index, &candidate]);
        Ok(())
    }

    /// Update capture framerate, GOP length, and the VBV buffer.
    pub fn set_framerate(&self, framerate: u32) {
        {
            let mut settings = self.settings.lock().unwrap_or_else(|e| e.into_inner());
            settings.framerate = framerate;
        }
        let settings = self.settings();
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(capsfilter) = &inner.ximagesrc_capsfilter {
            let caps = gst::Caps::builder("video/x-raw")
                .field("framerate", gst::Fraction::new(framerate as i32, 1))
                .build();
            capsfilter.set_property("caps", &caps);
        }
        if let Some(encoder) = &inner.video_encoder {
            let kf_dist = keyframe_frame_distance(framerate, settings.keyframe_distance_secs);
            let fec_kbps =
                fec_video_bitrate(settings.video_bitrate_kbps, settings.video_packetloss_pct);
            apply_gop(encoder, settings.encoder, kf_dist);
            apply_vbv(encoder, settings.encoder, fec_kbps, framerate, kf_dist == -1);
        }
        info!(framerate, "Framerate updated");
    }

    /// Update the video encoder bitrate (kbps). `from_cc` marks calls made
    /// from the congestion-control estimate, which must not feed back into
    /// the CC bands or resize the VBV window.
    pub fn set_video_bitrate(&self, bitrate_kbps: u32, from_cc: bool) {
        {
            let mut settings = self.settings.lock().unwrap_or_else(|e| e.into_inner());
            settings.video_bitrate_kbps = bitrate_kbps;
        }
        let settings = self.settings();
        let fec_kbps = fec_video_bitrate(bitrate_kbps, settings.video_packetloss_pct);
        let kf_dist =
            keyframe_frame_distance(settings.framerate, settings.keyframe_distance_secs);

        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(encoder) = &inner.video_encoder {
            apply_bitrate(encoder, settings.encoder, fec_kbps);
            if !from_cc {
                apply_vbv(
                    encoder,
                    settings.encoder,
                    fec_kbps,
                    settings.framerate,
                    kf_dist == -1,
                );
            }
        }
        if !from_cc {
            if let Some(bwe) = &inner.congestion_element {
                let video_bps = bitrate_kbps as u64 * 1000;
                let fec_audio = fec_audio_bitrate(
                    settings.audio_bitrate_bps,
                    settings.audio_packetloss_pct,
                ) as u64;
                self.applying_cc_estimate.store(true, Ordering::Relaxed);
                bwe.set_property("min-bitrate", cc_min_bitrate(video_bps, fec_audio) as u32);
                bwe.set_property("max-bitrate", cc_max_bitrate(video_bps, fec_audio) as u32);
                bwe.set_property("estimated-bitrate", (video_bps + fec_audio) as u32);
                self.applying_cc_estimate.store(false, Ordering::Relaxed);
            }
            info!(bitrate_kbps, "Video bitrate updated");
        }
    }

    /// Update the Opus bitrate (bps) and the congestion-control ceiling.
    pub fn set_audio_bitrate(&self, bitrate_bps: u32) {
        {
            let mut settings = self.settings.lock().unwrap_or_else(|e| e.into_inner());
            settings.audio_bitrate_bps = bitrate_bps;
        }
        let settings = self.settings();
        let fec_audio =
            fec_audio_bitrate(bitrate_bps, settings.audio_packetloss_pct) as u64;
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(opusenc) = &inner.opusenc {
            opusenc.set_property("bitrate", fec_audio as i32);
        }
        if let Some(bwe) = &inner.congestion_element {
            let video_bps = settings.video_bitrate_kbps as u64 * 1000;
            self.applying_cc_estimate.store(true, Ordering::Relaxed);
            bwe.set_property("min-bitrate", cc_min_bitrate(video_bps, fec_audio) as u32);
            bwe.set_property("max-bitrate", cc_max_bitrate(video_bps, fec_audio) as u32);
            self.applying_cc_estimate.store(false, Ordering::Relaxed);
        }
        info!(bitrate_bps, "Audio bitrate updated");
    }

    /// Re-point webrtcbin at refreshed STUN/TURN servers (credential
    /// rotation from the TURN monitors). Also updates the settings used
    /// for any later rebuild.
    pub fn update_ice_servers(&self, stun_uris: &[String], turn_uris: &[String]) {
        {
            let mut settings = self.settings.lock().unwrap_or_else(|e| e.into_inner());
            settings.stun_uris = stun_uris.to_vec();
            settings.turn_uris = turn_uris.to_vec();
        }
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(webrtcbin) = inner.webrtcbin.as_ref() else {
            return;
        };
        if let Some(stun) = stun_uris.first() {
            info!("Updating STUN server");
            webrtcbin.set_property("stun-server", stun);
        }
        for (index, turn_uri) in turn_uris.iter().enumerate() {
            info!("Updating TURN server");
            if index == 0 {
                webrtcbin.set_property("turn-server", turn_uri);
            } else {
                let _ = webrtcbin.emit_by_name::<bool>("add-turn-server", &[turn_uri]);
            }
        }
    }

    /// Toggle XFIXES pointer rendering inside the captured frames.
    pub fn set_pointer_visible(&self, visible: bool) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(ximagesrc) = &inner.ximagesrc {
            ximagesrc.set_property("show-pointer", visible);
        }
    }

    pub fn is_data_channel_open(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .data_channel
            .as_ref()
            .map(|dc| dc.ready_state() == gst_webrtc::WebRTCDataChannelState::Open)
            .unwrap_or(false)
    }

    /// Send one outbound envelope; silently dropped unless the channel is
    /// open.
    pub fn send_channel_message(&self, msg: &glint_protocol::OutboundMessage) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(dc) = inner.data_channel.as_ref() else {
            return;
        };
        if dc.ready_state() != gst_webrtc::WebRTCDataChannelState::Open {
            debug!(tag = msg.tag(), "Dropping message, data channel not open");
            return;
        }
        dc.emit_by_name::<()>("send-string", &[&msg.to_json()]);
    }

    /// Drain bus messages every 100 ms; returns when the pipeline ends.
    pub async fn run_bus_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let bus = {
                let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                match (&inner.pipeline, inner.state) {
                    (Some(pipeline), PipelineState::Playing) => pipeline.bus(),
                    (_, PipelineState::Stopped) => return,
                    _ => None,
                }
            };
            let Some(bus) = bus else { continue };
            while let Some(message) = bus.pop() {
                use gst::MessageView;
                match message.view() {
                    MessageView::Eos(_) => {
                        warn!("Pipeline end-of-stream");
                        let _ = self.events.send(PipelineEvent::Eos);
                        return;
                    }
                    MessageView::Error(err) => {
                        let _ = self.events.send(PipelineEvent::Error(format!(
                            "{}: {:?}",
                            err.error(),
                            err.debug()
                        )));
                        return;
                    }
                    MessageView::Latency(_) => {
                        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                        if let Some(pipeline) = &inner.pipeline {
                            if let Err(e) = pipeline.recalculate_latency() {
                                warn!("Failed to recalculate latency: {e}");
                            }
                        }
                    }
                    MessageView::StateChanged(change) => {
                        if change
                            .src()
                            .map(|s| s.is::<gst::Pipeline>())
                            .unwrap_or(false)
                        {
                            debug!(
                                old = ?change.old(),
                                new = ?change.current(),
                                "Pipeline state changed"
                            );
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    /// Tear everything down and release element handles.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state == PipelineState::Stopped {
            return;
        }
        inner.state = PipelineState::Stopping;
        info!("Stopping media pipeline");
        if let Some(dc) = inner.data_channel.take() {
            dc.close();
        }
        if let Some(pipeline) = inner.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
        }
        if let Some(webrtcbin) = inner.webrtcbin.take() {
            let _ = webrtcbin.set_state(gst::State::Null);
        }
        inner.ximagesrc = None;
        inner.ximagesrc_capsfilter = None;
        inner.video_encoder = None;
        inner.opusenc = None;
        inner.congestion_element = None;
        inner.state = PipelineState::Stopped;
        info!("Media pipeline stopped");
    }
}

struct BuiltPipeline {
    pipeline: gst::Pipeline,
    webrtcbin: gst::Element,
    ximagesrc: gst::Element,
    ximagesrc_capsfilter: gst::Element,
    video_encoder: gst::Element,
    opusenc: Option<gst::Element>,
    data_channel: WebRTCDataChannel,
}

// ---------------------------------------------------------------------------
// Element construction helpers

fn build_nv_encoder(
    info: &EncoderInfo,
    settings: &PipelineSettings,
    fec_kbps: u32,
    kf_dist: i32,
) -> Result<gst::Element> {
    let encoder = gst::ElementFactory::make(info.id)
        .name("venc")
        .build()
        .with_context(|| format!("Failed to create {}", info.id))?;
    encoder.set_property("bitrate", fec_kbps);
    encoder.set_property("gop-size", kf_dist);
    encoder.set_property("qos", true);
    if matches!(info.codec, Codec::H264 | Codec::H265) {
        encoder.set_property("aud", true);
    }
    encoder.set_property("rc-lookahead", 0u32);
    encoder.set_property(
        "vbv-buffer-size",
        vbv_buffer_size(fec_kbps, settings.framerate, info.family, kf_dist == -1),
    );
    match info.family {
        EncoderFamily::NvCuda => {
            encoder.set_property_from_str("rate-control", "cbr");
            encoder.set_property("b-frames", 0u32);
            encoder.set_property_from_str("preset", "p4");
            encoder.set_property_from_str("tune", "ultra-low-latency");
            encoder.set_property("zero-reorder-delay", true);
            encoder.set_property("b-adapt", false);
        }
        _ => {
            encoder.set_property_from_str("rc-mode", "cbr");
            encoder.set_property("bframes", 0u32);
            encoder.set_property_from_str("preset", "low-latency-hq");
            encoder.set_property("zerolatency", true);
        }
    }
    Ok(encoder)
}

fn build_va_encoder(info: &EncoderInfo, fec_kbps: u32, kf_dist: i32) -> Result<gst::Element> {
    let encoder = gst::ElementFactory::make(info.id)
        .name("venc")
        .build()
        .with_context(|| format!("Failed to create {}", info.id))?;
    encoder.set_property("aud", true);
    encoder.set_property("b-frames", 0u32);
    if info.codec == Codec::H264 {
        encoder.set_property("dct8x8", false);
    }
    encoder.set_property("key-int-max", if kf_dist == -1 { 0u32 } else { kf_dist as u32 });
    encoder.set_property_from_str("rate-control", "cbr");
    encoder.set_property("target-usage", 6u32);
    encoder.set_property("qos", true);
    encoder.set_property("bitrate", fec_kbps);
    Ok(encoder)
}

fn build_x264_encoder(
    settings: &PipelineSettings,
    fec_kbps: u32,
    kf_dist: i32,
) -> Result<gst::Element> {
    let encoder = gst::ElementFactory::make("x264enc")
        .name("venc")
        .build()
        .context("Failed to create x264enc")?;
    let threads = std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1).max(1))
        .unwrap_or(1) as u32;
    encoder.set_property("threads", threads);
    encoder.set_property("aud", true);
    encoder.set_property("b-adapt", false);
    encoder.set_property("bframes", 0u32);
    encoder.set_property("key-int-max", if kf_dist == -1 { 0u32 } else { kf_dist as u32 });
    encoder.set_property("rc-lookahead", 0i32);
    encoder.set_property("sliced-threads", true);
    encoder.set_property("byte-stream", true);
    encoder.set_property_from_str("pass", "cbr");
    encoder.set_property_from_str("speed-preset", "veryfast");
    encoder.set_property_from_str("tune", "zerolatency");
    encoder.set_property("qos", true);
    encoder.set_property("bitrate", fec_kbps);
    encoder.set_property(
        "vbv-buf-capacity",
        vbv_buffer_size(fec_kbps, settings.framerate, EncoderFamily::Software, kf_dist == -1)
            .max(1),
    );
    Ok(encoder)
}

fn build_vpx_encoder(info: &EncoderInfo, fec_kbps: u32, kf_dist: i32) -> Result<gst::Element> {
    let encoder = gst::ElementFactory::make(info.id)
        .name("venc")
        .build()
        .with_context(|| format!("Failed to create {}", info.id))?;
    let threads = std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1).max(1))
        .unwrap_or(1) as i32;
    encoder.set_property("threads", threads);
    encoder.set_property("auto-alt-ref", true);
    encoder.set_property("cpu-used", 4i32);
    encoder.set_property("deadline", 1i64);
    encoder.set_property_from_str("end-usage", "cbr");
    encoder.set_property_from_str("error-resilient", "partitions");
    encoder.set_property(
        "keyframe-max-dist",
        if kf_dist == -1 { i32::MAX } else { kf_dist },
    );
    encoder.set_property("static-threshold", 100i32);
    encoder.set_property("qos", true);
    encoder.set_property("target-bitrate", fec_kbps as i32 * 1000);
    if info.id == "vp9enc" {
        encoder.set_property("frame-parallel-decoding", true);
        encoder.set_property("row-mt", true);
    }
    Ok(encoder)
}

fn build_rav1e_encoder(fec_kbps: u32, kf_dist: i32) -> Result<gst::Element> {
    let encoder = gst::ElementFactory::make("rav1enc")
        .name("venc")
        .build()
        .context("Failed to create rav1enc")?;
    encoder.set_property("bitrate", fec_kbps as i32 * 1000);
    encoder.set_property("low-latency", true);
    encoder.set_property("speed-preset", 10u32);
    encoder.set_property(
        "max-key-frame-interval",
        if kf_dist == -1 { u64::MAX } else { kf_dist as u64 },
    );
    Ok(encoder)
}

/// Codec capsfilter, RTP payloader, and payloader capsfilter for the
/// encoder's codec.
fn build_payload_stage(info: &EncoderInfo) -> Result<(gst::Element, gst::Element, gst::Element)> {
    let (codec_caps_name, encoding_name, pay_name) = match info.codec {
        Codec::H264 => ("video/x-h264", "H264", "rtph264pay"),
        Codec::H265 => ("video/x-h265", "H265", "rtph265pay"),
        Codec::Vp8 => ("video/x-vp8", "VP8", "rtpvp8pay"),
        Codec::Vp9 => ("video/x-vp9", "VP9", "rtpvp9pay"),
        Codec::Av1 => ("video/x-av1", "AV1", "rtpav1pay"),
    };

    let mut codec_caps = gst::Caps::builder(codec_caps_name);
    if matches!(info.codec, Codec::H264 | Codec::H265) {
        codec_caps = codec_caps
            .field("profile", if info.codec == Codec::H264 { "high" } else { "main" })
            .field("stream-format", "byte-stream");
    }
    let codec_capsfilter = gst::ElementFactory::make("capsfilter")
        .property("caps", &codec_caps.build())
        .build()?;

    let payloader = gst::ElementFactory::make(pay_name)
        .name("vpay")
        .build()
        .with_context(|| format!("Failed to create {pay_name}"))?;
    if matches!(info.codec, Codec::H264 | Codec::H265) {
        payloader.set_property_from_str("aggregate-mode", "zero-latency");
    }

    let pay_caps = gst::Caps::builder("application/x-rtp")
        .field("media", "video")
        .field("encoding-name", encoding_name)
        .field("payload", 123i32)
        .field("rtcp-fb-nack-pli", true)
        .field("rtcp-fb-ccm-fir", true)
        .field("rtcp-fb-x-gstreamer-fir-as-repair", true)
        .build();
    let pay_capsfilter = gst::ElementFactory::make("capsfilter")
        .property("caps", &pay_caps)
        .build()?;

    Ok((codec_capsfilter, payloader, pay_capsfilter))
}

/// Attach the transport-wide-cc (when congestion control is on) and
/// playout-delay header extensions, using the lowest free extension ids.
fn add_rtp_header_extensions(payloader: &gst::Element, congestion_control: bool) {
    let mut used: Vec<u32> = Vec::new();
    if congestion_control {
        match gst_rtp::RTPHeaderExtension::create_from_uri(TWCC_EXT_URI) {
            Some(ext) => {
                let id = lowest_free_ext_id(&used);
                ext.set_id(id);
                used.push(id);
                payloader.emit_by_name::<()>("add-extension", &[&ext]);
            }
            None => warn!("transport-wide-cc header extension unavailable"),
        }
    }
    let playout = hdrext::playout_delay_extension();
    let id = lowest_free_ext_id(&used);
    playout.set_id(id);
    payloader.emit_by_name::<()>("add-extension", &[&playout]);
}

fn build_audio_chain(
    settings: &PipelineSettings,
    pipeline: &gst::Pipeline,
    webrtcbin: &gst::Element,
) -> Result<gst::Element> {
    // Pulseaudio provides the pipeline clock so NetEQ on the far side does
    // not chase a skewed audio timeline.
    let pulsesrc = gst::ElementFactory::make("pulsesrc")
        .name("pulsesrc")
        .property("provide-clock", true)
        .build()
        .context("Failed to create pulsesrc")?;

    let src_caps = gst::Caps::builder("audio/x-raw")
        .field("channels", settings.audio_channels as i32)
        .build();
    let src_capsfilter = gst::ElementFactory::make("capsfilter")
        .property("caps", &src_caps)
        .build()?;

    let fec_bps = fec_audio_bitrate(settings.audio_bitrate_bps, settings.audio_packetloss_pct);
    let opusenc = gst::ElementFactory::make("opusenc")
        .name("aenc")
        .build()
        .context("Failed to create opusenc")?;
    opusenc.set_property_from_str("bandwidth", "fullband");
    opusenc.set_property_from_str("audio-type", "generic");
    opusenc.set_property_from_str("bitrate-type", "cbr");
    opusenc.set_property_from_str("frame-size", "10");
    opusenc.set_property("inband-fec", settings.audio_packetloss_pct > 0.0);
    opusenc.set_property(
        "packet-loss-percentage",
        settings.audio_packetloss_pct as i32,
    );
    opusenc.set_property("max-payload-size", 4000u32);
    opusenc.set_property("bitrate", fec_bps as i32);

    let rtpopuspay = gst::ElementFactory::make("rtpopuspay")
        .build()
        .context("Failed to create rtpopuspay")?;

    // Leaky queue: if the pipeline stalls, drop audio rather than grow an
    // unbounded latency bubble.
    let queue = gst::ElementFactory::make("queue")
        .name("apay_queue")
        .build()?;
    queue.set_property_from_str("leaky", "downstream");
    queue.set_property("flush-on-eos", true);
    queue.set_property("max-size-time", 16_000_000u64);
    queue.set_property("max-size-buffers", 0u32);
    queue.set_property("max-size-bytes", 0u32);

    let encoding_name = if settings.audio_channels <= 2 {
        "OPUS"
    } else {
        "MULTIOPUS"
    };
    let pay_caps = gst::Caps::builder("application/x-rtp")
        .field("media", "audio")
        .field("encoding-name", encoding_name)
        .field("payload", 96i32)
        .field("clock-rate", 48000i32)
        .build();
    let pay_capsfilter = gst::ElementFactory::make("capsfilter")
        .property("caps", &pay_caps)
        .build()?;

    let chain = [
        &pulsesrc,
        &src_capsfilter,
        &opusenc,
        &rtpopuspay,
        &queue,
        &pay_capsfilter,
    ];
    for element in chain {
        pipeline.add(element)?;
    }
    let mut linked: Vec<&gst::Element> = chain.to_vec();
    linked.push(webrtcbin);
    gst::Element::link_many(linked.iter().copied())
        .context("Failed to link audio pipeline elements")?;

    Ok(opusenc)
}

// ---------------------------------------------------------------------------
// Dynamic property application

fn apply_bitrate(encoder: &gst::Element, info: EncoderInfo, fec_kbps: u32) {
    match info.family {
        EncoderFamily::Vpx | EncoderFamily::Rav1e => {
            encoder.set_property("target-bitrate", fec_kbps as i32 * 1000);
        }
        _ => encoder.set_property("bitrate", fec_kbps),
    }
}

fn apply_gop(encoder: &gst::Element, info: EncoderInfo, kf_dist: i32) {
    match info.family {
        EncoderFamily::NvCuda | EncoderFamily::NvLegacy => {
            encoder.set_property("gop-size", kf_dist);
        }
        EncoderFamily::VaApi | EncoderFamily::Software => {
            encoder.set_property("key-int-max", if kf_dist == -1 { 0u32 } else { kf_dist as u32 });
        }
        EncoderFamily::Vpx => {
            encoder.set_property(
                "keyframe-max-dist",
                if kf_dist == -1 { i32::MAX } else { kf_dist },
            );
        }
        EncoderFamily::Rav1e => {
            encoder.set_property(
                "max-key-frame-interval",
                if kf_dist == -1 { u64::MAX } else { kf_dist as u64 },
            );
        }
    }
}

fn apply_vbv(
    encoder: &gst::Element,
    info: EncoderInfo,
    fec_kbps: u32,
    framerate: u32,
    infinite_gop: bool,
) {
    let size = vbv_buffer_size(fec_kbps, framerate, info.family, infinite_gop);
    match info.family {
        EncoderFamily::NvCuda | EncoderFamily::NvLegacy => {
            encoder.set_property("vbv-buffer-size", size);
        }
        EncoderFamily::Software => {
            encoder.set_property("vbv-buf-capacity", size.max(1));
        }
        // VA-API and the VPX/AV1 encoders size their own rate window.
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_table_lookup() {
        assert_eq!(lookup_encoder("x264enc").unwrap().codec, Codec::H264);
        assert_eq!(lookup_encoder("vp9enc").unwrap().family, EncoderFamily::Vpx);
        assert_eq!(lookup_encoder("nvh265enc").unwrap().codec, Codec::H265);
        assert!(lookup_encoder("mystery-enc").is_none());
    }

    #[test]
    fn h26x_detection() {
        assert!(lookup_encoder("nvh264enc").unwrap().is_h26x());
        assert!(lookup_encoder("vah265enc").unwrap().is_h26x());
        assert!(!lookup_encoder("vp8enc").unwrap().is_h26x());
        assert!(!lookup_encoder("rav1enc").unwrap().is_h26x());
    }

    #[test]
    fn keyframe_distance_infinite() {
        assert_eq!(keyframe_frame_distance(60, -1.0), -1);
    }

    #[test]
    fn keyframe_distance_has_sixty_frame_floor() {
        assert_eq!(keyframe_frame_distance(30, 1.0), 60);
        assert_eq!(keyframe_frame_distance(60, 0.5), 60);
        assert_eq!(keyframe_frame_distance(60, 2.0), 120);
        assert_eq!(keyframe_frame_distance(24, 3.0), 72);
    }

    #[test]
    fn fec_video_backs_off_link_rate() {
        assert_eq!(fec_video_bitrate(8000, 0.0), 8000);
        assert_eq!(fec_video_bitrate(8000, 10.0), 7273);
        assert_eq!(fec_video_bitrate(2000, 25.0), 1600);
    }

    #[test]
    fn fec_audio_grows_nominal_rate() {
        assert_eq!(fec_audio_bitrate(128_000, 0.0), 128_000);
        assert_eq!(fec_audio_bitrate(128_000, 10.0), 140_800);
        assert_eq!(fec_audio_bitrate(64_000, 5.0), 67_200);
    }

    #[test]
    fn vbv_multiplier_table() {
        assert_eq!(vbv_multiplier(EncoderFamily::Software, false), 1.0);
        assert_eq!(vbv_multiplier(EncoderFamily::Software, true), 1.5);
        assert_eq!(vbv_multiplier(EncoderFamily::VaApi, false), 1.5);
        assert_eq!(vbv_multiplier(EncoderFamily::VaApi, true), 2.0);
        assert_eq!(vbv_multiplier(EncoderFamily::NvCuda, false), 2.0);
        assert_eq!(vbv_multiplier(EncoderFamily::NvLegacy, true), 3.0);
        assert_eq!(vbv_multiplier(EncoderFamily::Vpx, true), 1.0);
    }

    #[test]
    fn vbv_buffer_scales_per_frame_budget() {
        // 6000 kbps at 60 fps = 100 kbit/frame.
        assert_eq!(vbv_buffer_size(6000, 60, EncoderFamily::Software, false), 100);
        assert_eq!(vbv_buffer_size(6000, 60, EncoderFamily::NvCuda, true), 300);
        // ceil() applies before the multiplier.
        assert_eq!(vbv_buffer_size(1000, 60, EncoderFamily::Software, false), 17);
    }

    #[test]
    fn cc_bands() {
        let fec_audio = 128_000u64;
        // Low target: the 100 kbps floor wins.
        assert_eq!(cc_min_bitrate(500_000, fec_audio), 228_000);
        // High target: the 10% share wins.
        assert_eq!(cc_min_bitrate(8_000_000, fec_audio), 928_000);
        assert_eq!(cc_max_bitrate(8_000_000, fec_audio), 8_128_000);
    }

    #[test]
    fn ext_id_allocation_picks_lowest_free() {
        assert_eq!(lowest_free_ext_id(&[]), 1);
        assert_eq!(lowest_free_ext_id(&[1]), 2);
        assert_eq!(lowest_free_ext_id(&[2, 3]), 1);
        assert_eq!(lowest_free_ext_id(&[1, 2, 4]), 3);
    }
}

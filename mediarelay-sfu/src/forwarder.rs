//! Per-subscriber forwarding decisions
//!
//! A `Forwarder` decides, for one (publisher track, subscriber) pair, which
//! spatial/temporal layer is forwarded and how every forwarded packet is
//! renumbered. Allocation calls come from an external bandwidth allocator;
//! translation calls come from the down track's packet path. Both operate on
//! the same state under a single lock so layer decisions and munging never
//! interleave.
//!
//! ## Layer switching
//!
//! - `target_layers` is what allocation wants, `current_layers` what is
//!   actually forwarded.
//! - A spatial switch commits only on a key frame of the target layer; a PLI
//!   is requested while waiting.
//! - A target below both the current and the max layer drops the current
//!   layer right away.
//! - Temporal layers catch up on the first packet at or below the target.

use crate::buffer::{ExtPacket, Vp8};
use crate::error::{Error, Result};
use crate::rtp_munger::{RtpMunger, RtpMungerParams, SnTs, TranslationParamsRtp};
use crate::types::{
    Bitrates, ForwardingStatus, TrackKind, VideoAllocationResult, VideoAllocationState,
    VideoLayers, CHANNEL_CAPACITY_INFINITY, DEFAULT_MAX_SPATIAL_LAYER, DEFAULT_MAX_TEMPORAL_LAYER,
    INVALID_LAYERS,
};
use crate::vp8_munger::{TranslationParamsVp8, Vp8Munger};
use parking_lot::Mutex;
use std::time::Instant;
use tracing::{debug, Span};
use webrtc::api::media_engine::MIME_TYPE_VP8;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

/// Frames written when flushing a subscriber's decoder on close.
pub const RTP_BLANK_FRAMES_MAX: usize = 6;

const BLANK_FRAME_RATE: u32 = 30;

/// Whether allocation started or stopped the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoStreamingChange {
    #[default]
    None,
    Pausing,
    Resuming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LayerDirection {
    LowToHigh,
    HighToLow,
}

/// What to do with one incoming packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslationParams {
    pub should_drop: bool,
    pub should_send_pli: bool,
    pub rtp: Option<TranslationParamsRtp>,
    pub vp8: Option<TranslationParamsVp8>,
}

impl TranslationParams {
    fn drop_packet() -> Self {
        Self {
            should_drop: true,
            ..Self::default()
        }
    }
}

struct ForwarderState {
    muted: bool,

    started: bool,
    last_ssrc: u32,
    last_arrival: Option<Instant>,

    max_layers: VideoLayers,
    current_layers: VideoLayers,
    target_layers: VideoLayers,
    /// target spatial layer a key frame has already been requested for
    pli_requested_for: Option<i32>,

    last_allocation_state: VideoAllocationState,
    last_allocation_request_bps: i64,
    last_streaming_change: VideoStreamingChange,

    available_layers: Vec<i32>,

    rtp_munger: RtpMunger,
    vp8_munger: Option<Vp8Munger>,
}

pub struct Forwarder {
    codec: RTCRtpCodecCapability,
    kind: TrackKind,
    state: Mutex<ForwarderState>,
    span: Span,
}

impl Forwarder {
    #[must_use]
    pub fn new(codec: RTCRtpCodecCapability, kind: TrackKind, span: Span) -> Self {
        let vp8_munger = codec
            .mime_type
            .eq_ignore_ascii_case(MIME_TYPE_VP8)
            .then(Vp8Munger::new);

        let max_layers = match kind {
            TrackKind::Video => {
                VideoLayers::new(DEFAULT_MAX_SPATIAL_LAYER, DEFAULT_MAX_TEMPORAL_LAYER)
            }
            TrackKind::Audio => INVALID_LAYERS,
        };

        Self {
            codec,
            kind,
            state: Mutex::new(ForwarderState {
                muted: false,
                started: false,
                last_ssrc: 0,
                last_arrival: None,
                max_layers,
                // start off with nothing, allocation sets things
                current_layers: INVALID_LAYERS,
                target_layers: INVALID_LAYERS,
                pli_requested_for: None,
                last_allocation_state: VideoAllocationState::None,
                last_allocation_request_bps: 0,
                last_streaming_change: VideoStreamingChange::None,
                available_layers: Vec::new(),
                rtp_munger: RtpMunger::new(),
                vp8_munger,
            }),
            span,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> TrackKind {
        self.kind
    }

    #[must_use]
    pub fn codec(&self) -> &RTCRtpCodecCapability {
        &self.codec
    }

    /// Returns whether the mute state changed.
    pub fn mute(&self, muted: bool) -> bool {
        let mut state = self.state.lock();
        if state.muted == muted {
            return false;
        }
        state.muted = muted;
        true
    }

    #[must_use]
    pub fn muted(&self) -> bool {
        self.state.lock().muted
    }

    /// Returns whether the max changed, and the new max layers.
    pub fn set_max_spatial_layer(&self, spatial: i32) -> (bool, VideoLayers) {
        let spatial = spatial.clamp(0, DEFAULT_MAX_SPATIAL_LAYER);
        let mut state = self.state.lock();
        if self.kind == TrackKind::Audio || state.max_layers.spatial == spatial {
            return (false, INVALID_LAYERS);
        }
        state.max_layers.spatial = spatial;
        (true, state.max_layers)
    }

    pub fn set_max_temporal_layer(&self, temporal: i32) -> (bool, VideoLayers) {
        let temporal = temporal.clamp(0, DEFAULT_MAX_TEMPORAL_LAYER);
        let mut state = self.state.lock();
        if self.kind == TrackKind::Audio || state.max_layers.temporal == temporal {
            return (false, INVALID_LAYERS);
        }
        state.max_layers.temporal = temporal;
        (true, state.max_layers)
    }

    #[must_use]
    pub fn max_layers(&self) -> VideoLayers {
        self.state.lock().max_layers
    }

    #[must_use]
    pub fn current_layers(&self) -> VideoLayers {
        self.state.lock().current_layers
    }

    #[must_use]
    pub fn target_layers(&self) -> VideoLayers {
        self.state.lock().target_layers
    }

    #[must_use]
    pub fn forwarding_status(&self) -> ForwardingStatus {
        let state = self.state.lock();
        if state.target_layers == INVALID_LAYERS {
            ForwardingStatus::Off
        } else if state.target_layers.spatial < state.max_layers.spatial {
            ForwardingStatus::Partial
        } else {
            ForwardingStatus::Optimal
        }
    }

    /// Replace the set of spatial layers the publisher is currently sending.
    pub fn uptrack_layers_change(&self, available_layers: &[i32]) {
        self.state.lock().available_layers = available_layers.to_vec();
    }

    #[must_use]
    pub fn allocation_state(&self) -> VideoAllocationState {
        self.state.lock().last_allocation_state
    }

    #[must_use]
    pub fn allocation_bandwidth(&self) -> i64 {
        self.state.lock().last_allocation_request_bps
    }

    #[must_use]
    pub fn last_streaming_change(&self) -> VideoStreamingChange {
        self.state.lock().last_streaming_change
    }

    #[must_use]
    pub fn is_deficient(&self) -> bool {
        self.state.lock().last_allocation_state == VideoAllocationState::Deficient
    }

    /// Bitrate of the best measured layer within the max layers.
    #[must_use]
    pub fn bandwidth_needed(&self, brs: &Bitrates) -> i64 {
        self.state.lock().optimal_bandwidth_needed(brs)
    }

    pub fn allocate(&self, available_channel_capacity: i64, brs: &Bitrates) -> VideoAllocationResult {
        let mut state = self.state.lock();
        let result = self.allocate_locked(&mut state, available_channel_capacity, true, brs);
        self.log_allocation("allocate", &state, &result);
        result
    }

    /// Allocate within what is already in use plus `additional_channel_capacity`,
    /// never pausing a stream that is flowing.
    pub fn try_allocate(
        &self,
        additional_channel_capacity: i64,
        brs: &Bitrates,
    ) -> VideoAllocationResult {
        let mut state = self.state.lock();
        let capacity = state
            .last_allocation_request_bps
            .saturating_add(additional_channel_capacity);
        let result = self.allocate_locked(&mut state, capacity, false, brs);
        self.log_allocation("try allocate", &state, &result);
        result
    }

    /// Settle an allocation that was waiting for bitrate measurements.
    pub fn finalize_allocate(&self, brs: &Bitrates) {
        let mut state = self.state.lock();
        if state.last_allocation_state != VideoAllocationState::AwaitingMeasurement {
            return;
        }

        let optimal = state.optimal_bandwidth_needed(brs);
        if optimal == 0 {
            if state.available_layers.is_empty() {
                state.last_allocation_state = VideoAllocationState::FeedDry;
                state.last_allocation_request_bps = 0;
            }
            // still awaiting measurement
            return;
        }

        let max_layers = state.max_layers;
        state.find_best_layers(
            VideoLayers::new(0, 0),
            max_layers,
            brs,
            optimal,
            LayerDirection::HighToLow,
            CHANNEL_CAPACITY_INFINITY,
            false,
        );
    }

    /// Propose the next layer up for a deficient stream.
    ///
    /// Capacity is not checked; the caller decides whether the returned
    /// bandwidth can be afforded.
    pub fn allocate_next_higher(&self, brs: &Bitrates) -> VideoAllocationResult {
        let mut state = self.state.lock();
        if self.kind == TrackKind::Audio
            || state.last_allocation_state != VideoAllocationState::Deficient
        {
            return VideoAllocationResult::default();
        }

        // a switch is still in flight
        if state.target_layers != INVALID_LAYERS && state.target_layers != state.current_layers {
            return VideoAllocationResult::default();
        }

        let optimal = state.optimal_bandwidth_needed(brs);
        if optimal == 0 {
            // feed dry or awaiting measurement, nothing to hunt for
            return VideoAllocationResult::default();
        }

        let max_layers = state.max_layers;
        let target = state.target_layers;

        if target != INVALID_LAYERS {
            let result = state.find_best_layers(
                VideoLayers::new(target.spatial, target.temporal + 1),
                VideoLayers::new(target.spatial, max_layers.temporal),
                brs,
                optimal,
                LayerDirection::LowToHigh,
                CHANNEL_CAPACITY_INFINITY,
                false,
            );
            if result.layers_changed {
                self.log_allocation("next higher temporal", &state, &result);
                return result;
            }
        }

        let result = state.find_best_layers(
            VideoLayers::new(target.spatial + 1, 0),
            max_layers,
            brs,
            optimal,
            LayerDirection::LowToHigh,
            CHANNEL_CAPACITY_INFINITY,
            false,
        );
        self.log_allocation("next higher spatial", &state, &result);
        result
    }

    fn allocate_locked(
        &self,
        state: &mut ForwarderState,
        available_channel_capacity: i64,
        can_pause: bool,
        brs: &Bitrates,
    ) -> VideoAllocationResult {
        if self.kind == TrackKind::Audio {
            return VideoAllocationResult::default();
        }

        if state.muted {
            return state.commit(VideoAllocationResult {
                state: VideoAllocationState::Muted,
                ..VideoAllocationResult::default()
            });
        }

        let optimal = state.optimal_bandwidth_needed(brs);
        if optimal != 0 {
            let max_layers = state.max_layers;
            return state.find_best_layers(
                VideoLayers::new(0, 0),
                max_layers,
                brs,
                optimal,
                LayerDirection::HighToLow,
                available_channel_capacity,
                can_pause,
            );
        }

        let Some(&highest_available) = state.available_layers.last() else {
            return state.commit(VideoAllocationResult {
                state: VideoAllocationState::FeedDry,
                ..VideoAllocationResult::default()
            });
        };

        // layers are flowing but their bitrates are not measured yet
        let mut result = VideoAllocationResult {
            state: VideoAllocationState::AwaitingMeasurement,
            ..VideoAllocationResult::default()
        };

        if available_channel_capacity == CHANNEL_CAPACITY_INFINITY {
            // free pass: resume at the highest available layer within max
            if state.target_layers == INVALID_LAYERS {
                state.last_streaming_change = VideoStreamingChange::Resuming;
            }
            let target = VideoLayers::new(
                highest_available.min(state.max_layers.spatial),
                state.max_layers.temporal.max(0),
            );
            result.layers_changed = target != state.target_layers;
            state.set_target_layers(target);
            return state.commit(result);
        }

        if state.target_layers == INVALID_LAYERS {
            // not optimistically started, nothing to stop
            return state.commit(result);
        }

        if can_pause {
            // unknown stream size may not fit, so pause it
            state.last_streaming_change = VideoStreamingChange::Pausing;
            result.state = VideoAllocationState::Deficient;
            result.layers_changed = true;
            state.disable();
            return state.commit(result);
        }

        // keep what is flowing without re-estimating it
        result.bandwidth_requested = state.last_allocation_request_bps;
        state.commit(result)
    }

    fn log_allocation(&self, op: &str, state: &ForwarderState, result: &VideoAllocationResult) {
        if result.layers_changed {
            self.span.in_scope(|| {
                debug!(
                    op,
                    allocation_state = %result.state,
                    requested = result.bandwidth_requested,
                    delta = result.bandwidth_delta,
                    target = %state.target_layers,
                    current = %state.current_layers,
                    "allocation changed layers"
                );
            });
        }
    }

    /// Decide whether `ext`, received on spatial `layer`, is forwarded and how.
    pub fn get_translation_params(&self, ext: &ExtPacket, layer: i32) -> Result<TranslationParams> {
        let mut state = self.state.lock();
        if state.muted {
            return Ok(TranslationParams::drop_packet());
        }

        match self.kind {
            TrackKind::Audio => state.translation_params_audio(ext),
            TrackKind::Video => self.translation_params_video(&mut state, ext, layer),
        }
    }

    fn translation_params_video(
        &self,
        state: &mut ForwarderState,
        ext: &ExtPacket,
        layer: i32,
    ) -> Result<TranslationParams> {
        if state.target_layers == INVALID_LAYERS {
            // paused by allocation
            return Ok(TranslationParams::drop_packet());
        }

        let mut tp = TranslationParams::default();
        if state.target_layers.spatial != state.current_layers.spatial
            && state.target_layers.spatial == layer
        {
            if ext.key_frame {
                state.current_layers.spatial = state.target_layers.spatial;
                state.pli_requested_for = None;
                self.span.in_scope(|| {
                    debug!(layer, sn = ext.packet.header.sequence_number, "locked to target layer")
                });
            } else if state.pli_requested_for != Some(layer) {
                state.pli_requested_for = Some(layer);
                tp.should_send_pli = true;
            }
        }

        if state.current_layers.spatial != layer {
            tp.should_drop = true;
            return Ok(tp);
        }

        if state.target_layers.spatial < state.current_layers.spatial
            && state.target_layers.spatial < state.max_layers.spatial
        {
            // switched down for bandwidth: sending the bigger layer until
            // the switch point only adds congestion
            tp.should_drop = true;
            return Ok(tp);
        }

        if state.last_ssrc != ext.packet.header.ssrc {
            if state.started {
                // carry the timestamp forward by the wall-clock time between sources
                let diff_ms = state
                    .last_arrival
                    .map_or(0, |last| ext.arrival.saturating_duration_since(last).as_millis());
                let td = u32::try_from(diff_ms * u128::from(self.codec.clock_rate) / 1000)
                    .unwrap_or(u32::MAX)
                    .max(1);
                state.rtp_munger.update_sn_ts_offsets(ext, 1, td);
                if let Some(vp8_munger) = state.vp8_munger.as_mut() {
                    vp8_munger.update_offsets(ext);
                }
            } else {
                state.started = true;
                state.rtp_munger.set_last_sn_ts(ext);
                if let Some(vp8_munger) = state.vp8_munger.as_mut() {
                    vp8_munger.set_last(ext);
                }
            }
            state.last_ssrc = ext.packet.header.ssrc;
        }
        state.last_arrival = Some(ext.arrival);

        let tp_rtp = match state.rtp_munger.update_and_get_sn_ts(ext) {
            Ok(tp_rtp) => tp_rtp,
            Err(e) if e.is_stream_state() => {
                tp.should_drop = true;
                return Ok(tp);
            }
            Err(e) => return Err(e),
        };

        let target_temporal = state.target_layers.temporal;
        let ForwarderState {
            vp8_munger,
            rtp_munger,
            current_layers,
            ..
        } = state;

        let Some(vp8_munger) = vp8_munger.as_mut() else {
            // no temporal signalling to wait for
            current_layers.temporal = target_temporal;
            tp.rtp = Some(tp_rtp);
            return Ok(tp);
        };

        if current_layers.temporal != target_temporal {
            if let Some(vp8) = &ext.vp8 {
                if !vp8.tid_present || i32::from(vp8.tid) <= target_temporal {
                    current_layers.temporal = target_temporal;
                }
            }
        }

        match vp8_munger.update_and_get(ext, tp_rtp.sn_ordering, current_layers.temporal) {
            Ok(tp_vp8) => {
                tp.rtp = Some(tp_rtp);
                tp.vp8 = Some(tp_vp8);
                Ok(tp)
            }
            Err(Error::FilteredVp8TemporalLayer) => {
                // keep subscriber sequence numbers free of holes
                rtp_munger.packet_dropped(ext);
                tp.should_drop = true;
                Ok(tp)
            }
            Err(Error::OutOfOrderVp8PictureIdCacheMiss) => {
                tp.should_drop = true;
                Ok(tp)
            }
            Err(e) => Err(e),
        }
    }

    /// Sequence numbers for `num` padding packets.
    ///
    /// A paused stream gets a forced frame end; it restarts on a key frame.
    pub fn get_sn_ts_for_padding(&self, num: usize) -> Result<Vec<SnTs>> {
        let mut state = self.state.lock();
        let force_marker = state.target_layers == INVALID_LAYERS;
        state
            .rtp_munger
            .update_and_get_padding_sn_ts(num, 0, 0, force_marker)
    }

    /// Sequence numbers and timestamps for blank frames, and whether the
    /// first one has to close a frame in flight.
    pub fn get_sn_ts_for_blank_frames(&self) -> Result<(Vec<SnTs>, bool)> {
        let mut state = self.state.lock();
        let frame_end_needed = !state.rtp_munger.is_on_frame_boundary();
        let num = RTP_BLANK_FRAMES_MAX + usize::from(frame_end_needed);
        let snts = state.rtp_munger.update_and_get_padding_sn_ts(
            num,
            self.codec.clock_rate,
            BLANK_FRAME_RATE,
            frame_end_needed,
        )?;
        Ok((snts, frame_end_needed))
    }

    /// VP8 descriptor for a generated frame, `None` for other codecs.
    pub fn get_padding_vp8(&self, frame_end_needed: bool) -> Option<Vp8> {
        self.state
            .lock()
            .vp8_munger
            .as_mut()
            .map(|munger| munger.update_and_get_padding(!frame_end_needed))
    }

    #[must_use]
    pub fn get_rtp_munger_params(&self) -> RtpMungerParams {
        self.state.lock().rtp_munger.params()
    }
}

impl ForwarderState {
    fn disable(&mut self) {
        self.current_layers = INVALID_LAYERS;
        self.set_target_layers(INVALID_LAYERS);
    }

    /// A new target needs its own key frame, so any earlier PLI no longer counts.
    fn set_target_layers(&mut self, target: VideoLayers) {
        if self.target_layers != target {
            self.target_layers = target;
            self.pli_requested_for = None;
        }
    }

    /// Record a result as the last allocation, filling in its delta.
    fn commit(&mut self, mut result: VideoAllocationResult) -> VideoAllocationResult {
        result.bandwidth_delta = result.bandwidth_requested - self.last_allocation_request_bps;
        self.last_allocation_state = result.state;
        self.last_allocation_request_bps = result.bandwidth_requested;
        result
    }

    /// Highest measured layer within max, scanning down from the top.
    fn optimal_bandwidth_needed(&self, brs: &Bitrates) -> i64 {
        if !self.max_layers.is_valid() {
            return 0;
        }
        for s in (0..=self.max_layers.spatial as usize).rev() {
            for t in (0..=self.max_layers.temporal as usize).rev() {
                if brs[s][t] != 0 {
                    return brs[s][t];
                }
            }
        }
        0
    }

    #[allow(clippy::too_many_arguments)]
    fn find_best_layers(
        &mut self,
        min_layers: VideoLayers,
        max_layers: VideoLayers,
        brs: &Bitrates,
        optimal_bandwidth_needed: i64,
        direction: LayerDirection,
        available_channel_capacity: i64,
        can_pause: bool,
    ) -> VideoAllocationResult {
        let spatial: Vec<i32> = (min_layers.spatial.max(0)..=max_layers.spatial).collect();
        let temporal: Vec<i32> = (min_layers.temporal.max(0)..=max_layers.temporal).collect();
        let fits = |s: i32, t: i32| {
            let br = brs[s as usize][t as usize];
            br != 0 && br < available_channel_capacity
        };

        // spatial preference: the outer loop walks spatial layers
        let target = match direction {
            LayerDirection::LowToHigh => spatial.iter().find_map(|&s| {
                temporal
                    .iter()
                    .find(|&&t| fits(s, t))
                    .map(|&t| VideoLayers::new(s, t))
            }),
            LayerDirection::HighToLow => spatial.iter().rev().find_map(|&s| {
                temporal
                    .iter()
                    .rev()
                    .find(|&&t| fits(s, t))
                    .map(|&t| VideoLayers::new(s, t))
            }),
        }
        .unwrap_or(INVALID_LAYERS);

        if target == INVALID_LAYERS && !can_pause {
            // Keep what is streaming even if it no longer fits; its rate may
            // have changed, but a fresh allocation will catch up.
            let result = VideoAllocationResult {
                state: self.last_allocation_state,
                bandwidth_requested: self.last_allocation_request_bps,
                ..VideoAllocationResult::default()
            };
            return self.commit(result);
        }

        if self.target_layers != INVALID_LAYERS && target == INVALID_LAYERS {
            self.last_streaming_change = VideoStreamingChange::Pausing;
        } else if self.target_layers == INVALID_LAYERS && target != INVALID_LAYERS {
            self.last_streaming_change = VideoStreamingChange::Resuming;
        }

        let bandwidth_requested = if target == INVALID_LAYERS {
            0
        } else {
            brs[target.spatial as usize][target.temporal as usize]
        };
        let state = if bandwidth_requested == optimal_bandwidth_needed {
            VideoAllocationState::Optimal
        } else {
            VideoAllocationState::Deficient
        };
        let layers_changed = self.target_layers != target;

        let result = self.commit(VideoAllocationResult {
            state,
            bandwidth_requested,
            bandwidth_delta: 0,
            layers_changed,
        });
        if layers_changed {
            self.set_target_layers(target);
        }
        result
    }

    fn translation_params_audio(&mut self, ext: &ExtPacket) -> Result<TranslationParams> {
        if self.last_ssrc != ext.packet.header.ssrc {
            if self.started {
                // packetization of the new source is unknown, advance minimally
                self.rtp_munger.update_sn_ts_offsets(ext, 1, 1);
            } else {
                self.started = true;
                self.rtp_munger.set_last_sn_ts(ext);
            }
            self.last_ssrc = ext.packet.header.ssrc;
        }

        match self.rtp_munger.update_and_get_sn_ts(ext) {
            Ok(tp_rtp) => Ok(TranslationParams {
                rtp: Some(tp_rtp),
                ..TranslationParams::default()
            }),
            Err(e) if e.is_stream_state() => Ok(TranslationParams::drop_packet()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::rtp_munger::tests::ext_packet;
    use std::time::Duration;
    use webrtc::api::media_engine::MIME_TYPE_OPUS;

    pub(crate) fn vp8_codec() -> RTCRtpCodecCapability {
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90000,
            ..Default::default()
        }
    }

    fn opus_codec() -> RTCRtpCodecCapability {
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        }
    }

    fn new_video_forwarder() -> Forwarder {
        Forwarder::new(vp8_codec(), TrackKind::Video, Span::none())
    }

    /// VP8 packet with a 7-bit picture id and a temporal layer index.
    pub(crate) fn vp8_ext(
        ssrc: u32,
        sn: u16,
        ts: u32,
        picture_id: u16,
        tid: u8,
        key_frame: bool,
    ) -> ExtPacket {
        let mut ext = ext_packet(sn, ts, &[0x90, 0xa0, picture_id as u8 & 0x7f, tid << 6, 0x00], true);
        ext.packet.header.ssrc = ssrc;
        ext.key_frame = key_frame;
        ext.vp8 = Some(Vp8 {
            first_byte: 0x90,
            picture_id_present: true,
            picture_id: picture_id & 0x7f,
            tid_present: true,
            tid,
            header_size: 4,
            is_key_frame: key_frame,
            ..Vp8::default()
        });
        ext
    }

    fn bitrates() -> Bitrates {
        [
            [100_000, 150_000, 200_000, 0],
            [300_000, 400_000, 500_000, 0],
            [800_000, 1_000_000, 1_200_000, 0],
        ]
    }

    #[test]
    fn test_mute() {
        let f = new_video_forwarder();
        assert!(!f.muted());
        assert!(f.mute(true));
        assert!(!f.mute(true));
        assert!(f.muted());
    }

    #[test]
    fn test_max_layers() {
        let f = new_video_forwarder();
        assert_eq!(f.max_layers(), VideoLayers::new(2, 3));

        let (changed, layers) = f.set_max_spatial_layer(1);
        assert!(changed);
        assert_eq!(layers, VideoLayers::new(1, 3));
        assert!(!f.set_max_spatial_layer(1).0);

        let (changed, layers) = f.set_max_temporal_layer(9);
        assert!(!changed, "clamped to the current max");
        assert_eq!(layers, INVALID_LAYERS);

        let audio = Forwarder::new(opus_codec(), TrackKind::Audio, Span::none());
        assert!(!audio.set_max_spatial_layer(0).0);
    }

    #[test]
    fn test_allocate_optimal_and_deficient() {
        let f = new_video_forwarder();
        f.uptrack_layers_change(&[0, 1, 2]);

        let result = f.allocate(CHANNEL_CAPACITY_INFINITY, &bitrates());
        assert_eq!(result.state, VideoAllocationState::Optimal);
        assert_eq!(result.bandwidth_requested, 1_200_000);
        assert!(result.layers_changed);
        assert_eq!(f.target_layers(), VideoLayers::new(2, 2));
        assert_eq!(f.forwarding_status(), ForwardingStatus::Optimal);

        let result = f.allocate(450_000, &bitrates());
        assert_eq!(result.state, VideoAllocationState::Deficient);
        assert_eq!(result.bandwidth_requested, 400_000);
        assert_eq!(result.bandwidth_delta, 400_000 - 1_200_000);
        assert_eq!(f.target_layers(), VideoLayers::new(1, 1));
        assert_eq!(f.forwarding_status(), ForwardingStatus::Partial);
        assert!(f.is_deficient());
    }

    #[test]
    fn test_allocate_capacity_is_strict_upper_bound() {
        let f = new_video_forwarder();
        f.uptrack_layers_change(&[0]);
        let result = f.allocate(100_000, &bitrates());
        // nothing strictly below 100k, so the stream pauses
        assert_eq!(result.bandwidth_requested, 0);
        assert_eq!(f.target_layers(), INVALID_LAYERS);
        assert_eq!(f.forwarding_status(), ForwardingStatus::Off);
    }

    #[test]
    fn test_allocate_muted_and_feed_dry() {
        let f = new_video_forwarder();
        f.uptrack_layers_change(&[0]);
        f.allocate(CHANNEL_CAPACITY_INFINITY, &bitrates());

        f.mute(true);
        let result = f.allocate(CHANNEL_CAPACITY_INFINITY, &bitrates());
        assert_eq!(result.state, VideoAllocationState::Muted);
        assert_eq!(result.bandwidth_delta, -1_200_000);

        f.mute(false);
        f.uptrack_layers_change(&[]);
        let result = f.allocate(CHANNEL_CAPACITY_INFINITY, &[[0; 4]; 3]);
        assert_eq!(result.state, VideoAllocationState::FeedDry);
        assert_eq!(result.bandwidth_requested, 0);
    }

    #[test]
    fn test_allocate_awaiting_measurement() {
        let f = new_video_forwarder();
        f.set_max_spatial_layer(1);
        f.uptrack_layers_change(&[0, 1, 2]);
        let unmeasured = [[0; 4]; 3];

        // with no constraint, resume optimistically at the best layer within max
        let result = f.allocate(CHANNEL_CAPACITY_INFINITY, &unmeasured);
        assert_eq!(result.state, VideoAllocationState::AwaitingMeasurement);
        assert_eq!(f.target_layers(), VideoLayers::new(1, 3));
        assert_eq!(f.last_streaming_change(), VideoStreamingChange::Resuming);

        // probing must not stop it
        let result = f.try_allocate(1000, &unmeasured);
        assert_eq!(result.state, VideoAllocationState::AwaitingMeasurement);
        assert_eq!(f.target_layers(), VideoLayers::new(1, 3));

        // a constrained allocation pauses a stream of unknown size
        let result = f.allocate(500_000, &unmeasured);
        assert_eq!(result.state, VideoAllocationState::Deficient);
        assert_eq!(f.target_layers(), INVALID_LAYERS);
        assert_eq!(f.last_streaming_change(), VideoStreamingChange::Pausing);
    }

    #[test]
    fn test_finalize_allocate() {
        let f = new_video_forwarder();
        f.uptrack_layers_change(&[0, 1]);
        f.allocate(CHANNEL_CAPACITY_INFINITY, &[[0; 4]; 3]);
        assert_eq!(f.allocation_state(), VideoAllocationState::AwaitingMeasurement);

        // still nothing measured
        f.finalize_allocate(&[[0; 4]; 3]);
        assert_eq!(f.allocation_state(), VideoAllocationState::AwaitingMeasurement);

        let mut brs = [[0; 4]; 3];
        brs[0] = [100_000, 200_000, 0, 0];
        brs[1] = [300_000, 500_000, 0, 0];
        f.finalize_allocate(&brs);
        assert_eq!(f.allocation_state(), VideoAllocationState::Optimal);
        assert_eq!(f.target_layers(), VideoLayers::new(1, 1));
        assert_eq!(f.allocation_bandwidth(), 500_000);
    }

    #[test]
    fn test_try_allocate_uses_headroom() {
        let f = new_video_forwarder();
        f.uptrack_layers_change(&[0, 1, 2]);
        f.allocate(160_000, &bitrates());
        assert_eq!(f.target_layers(), VideoLayers::new(0, 1));

        let result = f.try_allocate(300_000, &bitrates());
        assert_eq!(result.bandwidth_requested, 400_000);
        assert_eq!(result.bandwidth_delta, 250_000);
        assert_eq!(f.target_layers(), VideoLayers::new(1, 1));

        // nothing fits in the headroom: keep the current allocation
        let before = f.target_layers();
        let result = f.try_allocate(-400_000, &bitrates());
        assert!(!result.layers_changed);
        assert_eq!(result.bandwidth_delta, 0);
        assert_eq!(f.target_layers(), before);
    }

    #[test]
    fn test_bandwidth_accounting_holds_over_any_sequence() {
        let f = new_video_forwarder();
        f.uptrack_layers_change(&[0, 1, 2]);
        let unmeasured = [[0; 4]; 3];

        let steps: Vec<Box<dyn Fn(&Forwarder) -> VideoAllocationResult>> = vec![
            Box::new(|f: &Forwarder| f.allocate(CHANNEL_CAPACITY_INFINITY, &bitrates())),
            Box::new(|f: &Forwarder| f.allocate(350_000, &bitrates())),
            Box::new(|f: &Forwarder| f.try_allocate(500_000, &bitrates())),
            Box::new(move |f: &Forwarder| f.allocate(CHANNEL_CAPACITY_INFINITY, &unmeasured)),
            Box::new(move |f: &Forwarder| f.try_allocate(10, &unmeasured)),
            Box::new(move |f: &Forwarder| f.allocate(1000, &unmeasured)),
            Box::new(|f: &Forwarder| f.allocate(50_000, &bitrates())),
            Box::new(|f: &Forwarder| f.try_allocate(0, &bitrates())),
            Box::new(|f: &Forwarder| {
                f.mute(true);
                f.allocate(CHANNEL_CAPACITY_INFINITY, &bitrates())
            }),
            Box::new(|f: &Forwarder| {
                f.mute(false);
                f.allocate(900_000, &bitrates())
            }),
        ];

        for step in steps {
            let before = f.allocation_bandwidth();
            let result = step(&f);
            assert_eq!(result.bandwidth_delta, result.bandwidth_requested - before);
            assert_eq!(f.allocation_bandwidth(), result.bandwidth_requested);
        }
    }

    #[test]
    fn test_allocate_next_higher() {
        let f = new_video_forwarder();
        f.uptrack_layers_change(&[0, 1, 2]);
        f.allocate(120_000, &bitrates());
        assert_eq!(f.target_layers(), VideoLayers::new(0, 0));

        // a switch is pending until packets flow
        assert!(!f.allocate_next_higher(&bitrates()).layers_changed);

        f.get_translation_params(&vp8_ext(1, 1, 0, 1, 0, true), 0)
            .unwrap();
        assert_eq!(f.current_layers(), VideoLayers::new(0, 0));

        let result = f.allocate_next_higher(&bitrates());
        assert!(result.layers_changed);
        assert_eq!(f.target_layers(), VideoLayers::new(0, 1));
        assert_eq!(result.bandwidth_requested, 150_000);

        // temporal exhausted on spatial 0 moves to spatial 1
        let mut brs = bitrates();
        brs[0] = [100_000, 150_000, 0, 0];
        f.get_translation_params(&vp8_ext(1, 2, 3000, 2, 0, false), 0)
            .unwrap();
        assert_eq!(f.current_layers(), VideoLayers::new(0, 1));
        let result = f.allocate_next_higher(&brs);
        assert_eq!(f.target_layers(), VideoLayers::new(1, 0));
        assert_eq!(result.bandwidth_requested, 300_000);
    }

    #[test]
    fn test_layer_switch_waits_for_key_frame() {
        let f = new_video_forwarder();
        f.uptrack_layers_change(&[0, 1]);
        f.allocate(350_000, &bitrates());
        assert_eq!(f.target_layers(), VideoLayers::new(1, 0));

        // layer 0 is not the target, its packets are dropped
        let tp = f
            .get_translation_params(&vp8_ext(10, 1, 0, 1, 0, true), 0)
            .unwrap();
        assert!(tp.should_drop);

        // target layer without a key frame: PLI once, drop
        let tp = f
            .get_translation_params(&vp8_ext(11, 100, 0, 5, 0, false), 1)
            .unwrap();
        assert!(tp.should_drop);
        assert!(tp.should_send_pli);
        let tp = f
            .get_translation_params(&vp8_ext(11, 101, 0, 5, 0, false), 1)
            .unwrap();
        assert!(tp.should_drop);
        assert!(!tp.should_send_pli);
        assert_eq!(f.current_layers(), INVALID_LAYERS);

        let tp = f
            .get_translation_params(&vp8_ext(11, 102, 3000, 6, 0, true), 1)
            .unwrap();
        assert!(!tp.should_drop);
        assert_eq!(f.current_layers(), VideoLayers::new(1, 0));

        // old layer packets are dropped after the switch
        let tp = f
            .get_translation_params(&vp8_ext(10, 2, 3000, 2, 0, false), 0)
            .unwrap();
        assert!(tp.should_drop);
    }

    #[test]
    fn test_pli_sent_again_after_pause_and_resume() {
        let f = new_video_forwarder();
        f.uptrack_layers_change(&[0, 1]);
        f.allocate(350_000, &bitrates());
        assert_eq!(f.target_layers(), VideoLayers::new(1, 0));

        let tp = f
            .get_translation_params(&vp8_ext(11, 100, 0, 5, 0, false), 1)
            .unwrap();
        assert!(tp.should_send_pli);

        f.allocate(50_000, &bitrates());
        assert_eq!(f.target_layers(), INVALID_LAYERS);
        f.allocate(350_000, &bitrates());
        assert_eq!(f.target_layers(), VideoLayers::new(1, 0));

        // the resumed target still has no key frame, so ask again
        let tp = f
            .get_translation_params(&vp8_ext(11, 101, 0, 5, 0, false), 1)
            .unwrap();
        assert!(tp.should_drop);
        assert!(tp.should_send_pli);
    }

    #[test]
    fn test_downward_switch_drops_immediately() {
        let f = new_video_forwarder();
        f.uptrack_layers_change(&[0, 1, 2]);
        f.allocate(CHANNEL_CAPACITY_INFINITY, &bitrates());
        f.get_translation_params(&vp8_ext(20, 1, 0, 1, 0, true), 2)
            .unwrap();
        assert_eq!(f.current_layers().spatial, 2);

        f.allocate(350_000, &bitrates());
        assert_eq!(f.target_layers().spatial, 1);

        let tp = f
            .get_translation_params(&vp8_ext(20, 2, 3000, 2, 0, false), 2)
            .unwrap();
        assert!(tp.should_drop);
    }

    #[test]
    fn test_contiguous_across_ssrc_switch() {
        let f = new_video_forwarder();
        f.uptrack_layers_change(&[0, 1]);
        f.allocate(250_000, &bitrates());

        let start = Instant::now();
        let mut out = Vec::new();
        for i in 0..5u16 {
            let mut ext = vp8_ext(1, 1000 + i, 3000 * u32::from(i), i + 1, 0, i == 0);
            ext.arrival = start + Duration::from_millis(33 * u64::from(i));
            let tp = f.get_translation_params(&ext, 0).unwrap();
            out.push(tp.rtp.unwrap());
        }

        // publisher restarts the layer with a new ssrc and numbering
        for i in 0..5u16 {
            let mut ext = vp8_ext(2, 40_000 + i, 777_000 + 3000 * u32::from(i), 90 + i, 0, i == 0);
            ext.arrival = start + Duration::from_millis(200 + 33 * u64::from(i));
            let tp = f.get_translation_params(&ext, 0).unwrap();
            assert!(!tp.should_drop);
            out.push(tp.rtp.unwrap());
        }

        for pair in out.windows(2) {
            assert_eq!(pair[1].sequence_number, pair[0].sequence_number.wrapping_add(1));
            assert!(pair[1].timestamp > pair[0].timestamp);
        }
        // 68ms of wall clock at 90kHz between the two sources
        assert_eq!(out[5].timestamp - out[4].timestamp, 68 * 90);
    }

    #[test]
    fn test_filtered_temporal_layer_keeps_contiguity() {
        let f = new_video_forwarder();
        f.uptrack_layers_change(&[0]);
        f.allocate(120_000, &bitrates());
        assert_eq!(f.target_layers(), VideoLayers::new(0, 0));

        let tids = [0u8, 1, 0, 1, 0];
        let mut forwarded = Vec::new();
        for (i, tid) in tids.iter().enumerate() {
            let i = i as u16;
            let tp = f
                .get_translation_params(&vp8_ext(1, 500 + i, 3000 * u32::from(i), 10 + i, *tid, i == 0), 0)
                .unwrap();
            if !tp.should_drop {
                forwarded.push(tp);
            }
        }

        let sns: Vec<u16> = forwarded.iter().map(|tp| tp.rtp.unwrap().sequence_number).collect();
        assert_eq!(sns, vec![500, 501, 502]);
        let pids: Vec<u16> = forwarded
            .iter()
            .map(|tp| tp.vp8.unwrap().header.picture_id)
            .collect();
        assert_eq!(pids, vec![10, 11, 12]);
    }

    #[test]
    fn test_single_layer_run_keeps_constant_offset() {
        let f = new_video_forwarder();
        f.set_max_spatial_layer(0);
        f.uptrack_layers_change(&[0]);
        f.allocate(CHANNEL_CAPACITY_INFINITY, &bitrates());
        assert_eq!(f.max_layers(), VideoLayers::new(0, 3));

        let mut offsets = Vec::new();
        for sn in 100u16..=110 {
            let ext = vp8_ext(7, sn, u32::from(sn) * 3000, sn, 0, sn == 100);
            let tp = f.get_translation_params(&ext, 0).unwrap();
            assert!(!tp.should_drop);
            offsets.push(tp.rtp.unwrap().sequence_number.wrapping_sub(sn));
        }
        assert!(offsets.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_paused_and_muted_drop() {
        let f = new_video_forwarder();
        let tp = f
            .get_translation_params(&vp8_ext(1, 1, 0, 1, 0, true), 0)
            .unwrap();
        assert!(tp.should_drop);

        f.uptrack_layers_change(&[0]);
        f.allocate(CHANNEL_CAPACITY_INFINITY, &bitrates());
        f.mute(true);
        let tp = f
            .get_translation_params(&vp8_ext(1, 2, 0, 1, 0, true), 0)
            .unwrap();
        assert!(tp.should_drop);
    }

    #[test]
    fn test_audio_translation() {
        let f = Forwarder::new(opus_codec(), TrackKind::Audio, Span::none());
        let mut first = ext_packet(10, 960, &[1, 2, 3], true);
        first.packet.header.ssrc = 5;
        let tp = f.get_translation_params(&first, 0).unwrap();
        assert_eq!(tp.rtp.unwrap().sequence_number, 10);

        let dup = f.get_translation_params(&first, 0).unwrap();
        assert!(dup.should_drop);

        let mut switched = ext_packet(3000, 48_000, &[1], true);
        switched.packet.header.ssrc = 6;
        let tp = f.get_translation_params(&switched, 0).unwrap();
        assert_eq!(tp.rtp.unwrap().sequence_number, 11);
        assert_eq!(tp.rtp.unwrap().timestamp, 961);

        assert_eq!(
            f.allocate(CHANNEL_CAPACITY_INFINITY, &bitrates()),
            VideoAllocationResult::default()
        );
    }

    #[test]
    fn test_blank_frames_and_padding() {
        let f = new_video_forwarder();
        f.set_max_spatial_layer(0);
        f.uptrack_layers_change(&[0]);
        f.allocate(CHANNEL_CAPACITY_INFINITY, &bitrates());
        let ext = vp8_ext(1, 50, 9000, 3, 0, true);
        f.get_translation_params(&ext, 0).unwrap();

        // last packet had no marker: padding would split a frame
        assert!(matches!(
            f.get_sn_ts_for_padding(2),
            Err(Error::PaddingNotOnFrameBoundary)
        ));

        let (snts, frame_end_needed) = f.get_sn_ts_for_blank_frames().unwrap();
        assert!(frame_end_needed);
        assert_eq!(snts.len(), RTP_BLANK_FRAMES_MAX + 1);
        assert_eq!(snts[0].sequence_number, 51);
        assert_eq!(snts[0].timestamp, 9000);
        assert_eq!(snts[1].timestamp, 9000 + 3000);

        let vp8 = f.get_padding_vp8(frame_end_needed).unwrap();
        assert_eq!(vp8.picture_id, 3);

        // blank frames leave the stream on a frame boundary
        let padding = f.get_sn_ts_for_padding(2).unwrap();
        assert_eq!(padding[0].sequence_number, snts[snts.len() - 1].sequence_number + 1);
        assert_eq!(f.get_rtp_munger_params().last_sn, padding[1].sequence_number);
    }
}

//! Publisher side of a forwarded track
//!
//! A [`WebRtcReceiver`] owns the per-layer buffers of one published track and
//! fans every received packet out to the subscribers' [`TrackSender`]s. Each
//! spatial layer runs its own forwarding task, so packets of one layer reach
//! every down track in arrival order.
//!
//! The down track list is copy-on-write: fan-out works on a snapshot taken
//! under a short read lock, and removal only clears a slot so concurrent
//! fan-out never sees entries move. Freed slots are reused before the list
//! grows.

use crate::buffer::{Buffer, ExtPacket, SenderReportData};
use crate::config::{ReceiverConfig, StreamTrackerConfig};
use crate::error::{Error, Result};
use crate::stream_tracker::StreamTracker;
use crate::stream_tracker_manager::{AvailableLayersListener, StreamTrackerManager};
use crate::track::{TrackReceiver, TrackSender};
use crate::types::{rid_to_layer, Bitrates, PeerId, TrackId, TrackKind, DEFAULT_MAX_SPATIAL_LAYER};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::RuntimeFlavor;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, info_span, trace, warn, Instrument, Span};
use webrtc::rtcp;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

const NUM_SPATIAL_LAYERS: usize = DEFAULT_MAX_SPATIAL_LAYER as usize + 1;

/// Down tracks written per claim during parallel fan-out.
const FAN_OUT_STEP: usize = 2;

pub type RtcpPackets = Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>;

pub trait ReceiverListener: Send + Sync {
    /// The receiver closed and released all of its down tracks.
    fn on_close(&self) {}
}

#[derive(Debug, Default)]
pub struct NoopReceiverListener;

impl ReceiverListener for NoopReceiverListener {}

struct UpTrack {
    rid: String,
    ssrc: u32,
    buffer: Arc<Buffer>,
}

type Slots = Arc<Vec<Option<Arc<dyn TrackSender>>>>;

#[derive(Default)]
struct DownTracks {
    slots: Slots,
    index: IndexMap<PeerId, usize>,
    free: Vec<usize>,
}

pub struct WebRtcReceiver {
    track_id: TrackId,
    stream_id: String,
    peer_id: PeerId,
    kind: TrackKind,
    codec: RTCRtpCodecCapability,
    is_simulcast: bool,

    pli_throttle: Duration,
    load_balance_threshold: usize,
    use_stream_trackers: bool,
    num_workers: usize,

    listener: Arc<dyn ReceiverListener>,
    trackers: Arc<StreamTrackerManager>,
    closed: AtomicBool,

    up_tracks: RwLock<[Option<UpTrack>; NUM_SPATIAL_LAYERS]>,
    down_tracks: RwLock<DownTracks>,

    rtcp_tx: Mutex<Option<mpsc::Sender<RtcpPackets>>>,
    last_pli: Mutex<[Option<Instant>; NUM_SPATIAL_LAYERS]>,

    span: Span,
}

pub struct ReceiverBuilder {
    track_id: TrackId,
    stream_id: String,
    peer_id: PeerId,
    codec: RTCRtpCodecCapability,
    kind: TrackKind,
    is_simulcast: bool,
    pli_throttle: Duration,
    load_balance_threshold: usize,
    use_stream_trackers: bool,
    tracker_config: StreamTrackerConfig,
    max_expected_spatial_layer: i32,
    listener: Arc<dyn ReceiverListener>,
    span: Span,
}

impl ReceiverBuilder {
    /// Take PLI throttle, load balancing and stream tracker use from `config`.
    #[must_use]
    pub fn config(mut self, config: &ReceiverConfig) -> Self {
        self.pli_throttle = config.pli_throttle();
        self.load_balance_threshold = config.load_balance_threshold;
        self.use_stream_trackers = config.use_stream_trackers;
        self
    }

    #[must_use]
    pub fn simulcast(mut self, is_simulcast: bool) -> Self {
        self.is_simulcast = is_simulcast;
        self
    }

    #[must_use]
    pub fn pli_throttle(mut self, throttle: Duration) -> Self {
        self.pli_throttle = throttle;
        self
    }

    /// Fan out in parallel from this many subscribers on; 0 never does.
    #[must_use]
    pub fn load_balance_threshold(mut self, threshold: usize) -> Self {
        self.load_balance_threshold = threshold;
        self
    }

    #[must_use]
    pub fn stream_trackers(mut self, enabled: bool) -> Self {
        self.use_stream_trackers = enabled;
        self
    }

    #[must_use]
    pub fn stream_tracker_config(mut self, config: StreamTrackerConfig) -> Self {
        self.tracker_config = config;
        self
    }

    #[must_use]
    pub fn max_expected_spatial_layer(mut self, layer: i32) -> Self {
        self.max_expected_spatial_layer = layer;
        self
    }

    #[must_use]
    pub fn listener(mut self, listener: Arc<dyn ReceiverListener>) -> Self {
        self.listener = listener;
        self
    }

    #[must_use]
    pub fn span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<WebRtcReceiver> {
        let num_workers = std::thread::available_parallelism()
            .map_or(1, std::num::NonZeroUsize::get)
            .min(rayon::current_num_threads())
            .max(1);

        Arc::new_cyclic(|receiver| {
            let trackers = StreamTrackerManager::new(
                self.tracker_config,
                Arc::new(LayersSink {
                    receiver: Weak::clone(receiver),
                }),
                self.span.clone(),
            );
            trackers.set_max_expected_spatial_layer(self.max_expected_spatial_layer);

            WebRtcReceiver {
                track_id: self.track_id,
                stream_id: self.stream_id,
                peer_id: self.peer_id,
                kind: self.kind,
                codec: self.codec,
                is_simulcast: self.is_simulcast,
                pli_throttle: self.pli_throttle,
                load_balance_threshold: self.load_balance_threshold,
                use_stream_trackers: self.use_stream_trackers,
                num_workers,
                listener: self.listener,
                trackers,
                closed: AtomicBool::new(false),
                up_tracks: RwLock::new(Default::default()),
                down_tracks: RwLock::new(DownTracks::default()),
                rtcp_tx: Mutex::new(None),
                last_pli: Mutex::new([None; NUM_SPATIAL_LAYERS]),
                span: self.span,
            }
        })
    }
}

/// Routes layer availability from the tracker manager to the receiver.
struct LayersSink {
    receiver: Weak<WebRtcReceiver>,
}

impl AvailableLayersListener for LayersSink {
    fn on_available_layers_changed(&self, available_layers: &[i32]) {
        if let Some(receiver) = self.receiver.upgrade() {
            receiver.down_track_layer_change(available_layers);
        }
    }
}

fn layer_index(layer: i32) -> Option<usize> {
    usize::try_from(layer).ok().filter(|&l| l < NUM_SPATIAL_LAYERS)
}

impl WebRtcReceiver {
    pub fn builder(
        track_id: TrackId,
        stream_id: impl Into<String>,
        peer_id: PeerId,
        codec: RTCRtpCodecCapability,
        kind: TrackKind,
    ) -> ReceiverBuilder {
        let defaults = ReceiverConfig::default();
        ReceiverBuilder {
            track_id,
            stream_id: stream_id.into(),
            peer_id,
            codec,
            kind,
            is_simulcast: false,
            pli_throttle: defaults.pli_throttle(),
            load_balance_threshold: defaults.load_balance_threshold,
            use_stream_trackers: defaults.use_stream_trackers,
            tracker_config: StreamTrackerConfig::default(),
            max_expected_spatial_layer: DEFAULT_MAX_SPATIAL_LAYER,
            listener: Arc::new(NoopReceiverListener),
            span: Span::none(),
        }
    }

    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    #[must_use]
    pub const fn is_simulcast(&self) -> bool {
        self.is_simulcast
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// SSRC of the up track on `layer`, 0 when there is none.
    #[must_use]
    pub fn ssrc(&self, layer: i32) -> u32 {
        layer_index(layer)
            .and_then(|idx| self.up_tracks.read()[idx].as_ref().map(|up| up.ssrc))
            .unwrap_or_default()
    }

    fn buffer(&self, layer: usize) -> Option<Arc<Buffer>> {
        self.up_tracks
            .read()
            .get(layer)?
            .as_ref()
            .map(|up| Arc::clone(&up.buffer))
    }

    /// Start forwarding the simulcast layer named by `rid` from `buffer`.
    pub fn add_up_track(self: &Arc<Self>, rid: &str, buffer: Arc<Buffer>) {
        if self.is_closed() {
            return;
        }

        let layer = rid_to_layer(rid);
        let Some(idx) = layer_index(layer) else {
            return;
        };
        let previous = self.up_tracks.write()[idx].replace(UpTrack {
            rid: rid.to_string(),
            ssrc: buffer.ssrc(),
            buffer: Arc::clone(&buffer),
        });
        if let Some(previous) = previous {
            previous.buffer.close();
        }

        let tracker = if self.kind == TrackKind::Video && self.use_stream_trackers {
            self.trackers.add_tracker(layer)
        } else {
            // nothing watches liveness: the layer counts as flowing while present
            self.trackers.add_available_layer(layer);
            None
        };

        self.span.in_scope(|| {
            info!(layer, rid, ssrc = buffer.ssrc(), "up track added");
        });
        tokio::spawn(
            Arc::clone(self)
                .forward_rtp(layer, buffer, tracker)
                .instrument(info_span!(parent: &self.span, "forward_rtp", layer)),
        );
    }

    async fn forward_rtp(
        self: Arc<Self>,
        layer: i32,
        buffer: Arc<Buffer>,
        tracker: Option<Arc<StreamTracker>>,
    ) {
        while let Some(ext) = buffer.read_extended().await {
            if let Some(tracker) = &tracker {
                tracker.observe(ext.packet.header.sequence_number);
            }

            let (slots, active) = {
                let down_tracks = self.down_tracks.read();
                (Arc::clone(&down_tracks.slots), down_tracks.index.len())
            };
            if self.load_balance_threshold == 0 || active < self.load_balance_threshold {
                for down_track in slots.iter().flatten() {
                    self.write_rtp(layer, down_track, &ext);
                }
            } else {
                self.fan_out_parallel(layer, &slots, &ext);
            }
        }

        debug!("layer reached end of stream");
        self.remove_up_track(layer, &buffer);
    }

    /// Workers claim `FAN_OUT_STEP` slots at a time until the list is done.
    fn fan_out_parallel(
        &self,
        layer: i32,
        slots: &[Option<Arc<dyn TrackSender>>],
        ext: &ExtPacket,
    ) {
        let next = AtomicUsize::new(0);
        let end = slots.len();
        let fan_out = || rayon::scope(|s| {
            for _ in 0..self.num_workers {
                s.spawn(|_| loop {
                    let start = next.fetch_add(FAN_OUT_STEP, Ordering::Relaxed);
                    if start >= end {
                        return;
                    }
                    let stop = (start + FAN_OUT_STEP).min(end);
                    for down_track in slots[start..stop].iter().flatten() {
                        self.write_rtp(layer, down_track, ext);
                    }
                });
            }
        });

        // the scope parks this thread until every worker is done
        match tokio::runtime::Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(fan_out);
            }
            _ => fan_out(),
        }
    }

    fn write_rtp(&self, layer: i32, down_track: &Arc<dyn TrackSender>, ext: &ExtPacket) {
        if let Err(e) = down_track.write_rtp(ext, layer) {
            if e.is_stream_state() {
                trace!(peer_id = %down_track.peer_id(), error = %e, "packet dropped");
            } else {
                warn!(peer_id = %down_track.peer_id(), error = %e, "failed to write to down track");
            }
        }
    }

    /// Forget a finished layer; the last one to go closes the receiver.
    fn remove_up_track(&self, layer: i32, buffer: &Arc<Buffer>) {
        let Some(idx) = layer_index(layer) else {
            return;
        };
        let remaining = {
            let mut up_tracks = self.up_tracks.write();
            // a replacement may already own the slot
            if !up_tracks[idx]
                .as_ref()
                .is_some_and(|up| Arc::ptr_eq(&up.buffer, buffer))
            {
                return;
            }
            up_tracks[idx] = None;
            up_tracks.iter().flatten().count()
        };

        self.trackers.remove_tracker(layer);
        self.trackers.remove_available_layer(layer);

        if remaining == 0 {
            self.close();
        }
    }

    /// Subscribe `track`. A peer that is already subscribed is left alone.
    pub fn add_down_track(&self, track: Arc<dyn TrackSender>) {
        if self.is_closed() || self.down_tracks.read().index.contains_key(track.peer_id()) {
            return;
        }

        track.set_track_type(self.is_simulcast);
        if self.kind == TrackKind::Video {
            // no need to wait a detection cycle to learn what is flowing
            let layers = self.trackers.available_layers();
            if !layers.is_empty() {
                track.uptrack_layers_change(&layers);
            }
        }

        let mut down_tracks = self.down_tracks.write();
        // close() may have emptied the list since the check above
        if self.is_closed() || down_tracks.index.contains_key(track.peer_id()) {
            return;
        }
        let peer_id = track.peer_id().clone();
        let idx = match down_tracks.free.pop() {
            Some(idx) => {
                Arc::make_mut(&mut down_tracks.slots)[idx] = Some(track);
                idx
            }
            None => {
                let slots = Arc::make_mut(&mut down_tracks.slots);
                slots.push(Some(track));
                slots.len() - 1
            }
        };
        down_tracks.index.insert(peer_id.clone(), idx);
        drop(down_tracks);

        self.span
            .in_scope(|| debug!(peer_id = %peer_id, slot = idx, "down track added"));
    }

    /// Unsubscribe `peer_id`. The slot is kept for reuse.
    pub fn delete_down_track(&self, peer_id: &PeerId) {
        if self.is_closed() {
            return;
        }

        let mut down_tracks = self.down_tracks.write();
        let Some(idx) = down_tracks.index.shift_remove(peer_id) else {
            return;
        };
        Arc::make_mut(&mut down_tracks.slots)[idx] = None;
        down_tracks.free.push(idx);
        drop(down_tracks);

        self.span
            .in_scope(|| debug!(peer_id = %peer_id, slot = idx, "down track removed"));
    }

    #[must_use]
    pub fn down_track_count(&self) -> usize {
        self.down_tracks.read().index.len()
    }

    fn down_track_layer_change(&self, available_layers: &[i32]) {
        let slots = Arc::clone(&self.down_tracks.read().slots);
        for down_track in slots.iter().flatten() {
            down_track.uptrack_layers_change(available_layers);
        }
    }

    /// Close every down track and stop all layers. Only the first call acts.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.trackers.stop();
        let down_tracks = std::mem::take(&mut *self.down_tracks.write());
        for down_track in down_tracks.slots.iter().flatten() {
            down_track.close();
        }
        let up_tracks = std::mem::take(&mut *self.up_tracks.write());
        for up in up_tracks.into_iter().flatten() {
            up.buffer.close();
        }

        self.span.in_scope(|| {
            info!(
                track_id = %self.track_id,
                down_tracks = down_tracks.index.len(),
                "receiver closed"
            );
        });
        self.listener.on_close();
    }

    /// Where PLIs for the publisher go.
    pub fn set_rtcp_channel(&self, tx: mpsc::Sender<RtcpPackets>) {
        *self.rtcp_tx.lock() = Some(tx);
    }

    fn send_rtcp(&self, packets: RtcpPackets) {
        let Some(tx) = self.rtcp_tx.lock().clone() else {
            return;
        };
        if let Err(e) = tx.try_send(packets) {
            self.span
                .in_scope(|| debug!(error = %e, "dropping RTCP for publisher"));
        }
    }

    /// Request a key frame on `layer`, at most once per throttle period.
    pub fn send_pli(&self, layer: i32) {
        let Some(idx) = layer_index(layer) else {
            return;
        };
        let ssrc = self.ssrc(layer);
        if ssrc == 0 {
            return;
        }

        {
            let mut last_pli = self.last_pli.lock();
            let now = Instant::now();
            if last_pli[idx].is_some_and(|last| now.duration_since(last) < self.pli_throttle) {
                return;
            }
            last_pli[idx] = Some(now);
        }

        self.span.in_scope(|| trace!(layer, ssrc, "sending PLI"));
        self.send_rtcp(vec![Box::new(PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc: ssrc,
        })]);
    }

    pub fn read_rtp(&self, buf: &mut [u8], layer: u8, sn: u16) -> Result<usize> {
        let buffer = self
            .buffer(usize::from(layer))
            .ok_or(Error::BufferNotFound(i32::from(layer)))?;
        buffer.get_packet(buf, sn)
    }

    /// Cumulative bitrates per layer. Layers that are not flowing read zero
    /// even if their buffer still holds a measurement.
    #[must_use]
    pub fn bitrate_temporal_cumulative(&self) -> Bitrates {
        let mut brs: Bitrates = [[0; 4]; 3];
        let available = self.trackers.available_layers();
        let up_tracks = self.up_tracks.read();
        for (idx, up) in up_tracks.iter().enumerate() {
            let Some(up) = up else {
                continue;
            };
            if available.contains(&(idx as i32)) {
                brs[idx] = up.buffer.bitrate_temporal_cumulative();
            }
        }
        brs
    }

    #[must_use]
    pub fn sender_report_time(&self, layer: i32) -> Option<SenderReportData> {
        self.buffer(layer_index(layer)?)?.sender_report_data()
    }

    /// The publisher muted: keep the layers from being declared dead.
    pub fn set_up_track_paused(&self, paused: bool) {
        self.trackers.set_paused(paused);
    }

    pub fn set_max_expected_spatial_layer(&self, layer: i32) {
        self.trackers.set_max_expected_spatial_layer(layer);
    }

    #[must_use]
    pub fn num_available_spatial_layers(&self) -> usize {
        self.trackers.available_layers().len()
    }

    #[must_use]
    pub fn available_layers(&self) -> Vec<i32> {
        self.trackers.available_layers()
    }

    #[must_use]
    pub fn debug_info(&self) -> serde_json::Value {
        let up_tracks: Vec<_> = self
            .up_tracks
            .read()
            .iter()
            .enumerate()
            .filter_map(|(layer, up)| {
                up.as_ref().map(|up| {
                    serde_json::json!({
                        "layer": layer,
                        "rid": up.rid,
                        "ssrc": up.ssrc,
                    })
                })
            })
            .collect();
        let subscribers: Vec<String> = self
            .down_tracks
            .read()
            .index
            .keys()
            .map(ToString::to_string)
            .collect();

        serde_json::json!({
            "track_id": self.track_id,
            "stream_id": self.stream_id,
            "kind": self.kind,
            "simulcast": self.is_simulcast,
            "closed": self.is_closed(),
            "available_layers": self.available_layers(),
            "up_tracks": up_tracks,
            "down_tracks": subscribers,
        })
    }
}

impl TrackReceiver for WebRtcReceiver {
    fn track_id(&self) -> &TrackId {
        &self.track_id
    }

    fn stream_id(&self) -> &str {
        &self.stream_id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn codec(&self) -> &RTCRtpCodecCapability {
        &self.codec
    }

    fn read_rtp(&self, buf: &mut [u8], layer: u8, sn: u16) -> Result<usize> {
        Self::read_rtp(self, buf, layer, sn)
    }

    fn send_pli(&self, layer: i32) {
        Self::send_pli(self, layer);
    }

    fn bitrate_temporal_cumulative(&self) -> Bitrates {
        Self::bitrate_temporal_cumulative(self)
    }

    fn sender_report_time(&self, layer: i32) -> Option<SenderReportData> {
        Self::sender_report_time(self, layer)
    }

    fn delete_down_track(&self, peer_id: &PeerId) {
        Self::delete_down_track(self, peer_id);
    }
}

//! `MediaRelay` SFU forwarding core
//!
//! Receives RTP from publishers, tracks which simulcast layers are flowing
//! and forwards a gap-free, per-subscriber rewrite of the stream to every
//! subscriber.
//!
//! ## Architecture
//!
//! - **`Buffer`**: per-SSRC packet store, sender report and bitrate bookkeeping
//! - **`StreamTracker`** / **`StreamTrackerManager`**: decide which spatial layers are live
//! - **`WebRtcReceiver`**: publisher side; fans packets out to subscribers
//! - **`DownTrack`**: subscriber side; owns a `Forwarder` and hands packets to a `Pacer`
//! - **`Forwarder`**: layer selection plus `RtpMunger`/`Vp8Munger` rewriting
//! - **`QualityScorer`**: windowed connection quality with hysteresis
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mediarelay_sfu::{SfuConfig, WebRtcReceiver, DownTrack, NoQueue};
//!
//! let config = SfuConfig::load(Some("mediarelay.toml"))?;
//! mediarelay_sfu::logging::init_logging(&config.logging)?;
//! let receiver = WebRtcReceiver::builder(track_id, stream_id, peer_id, codec, kind)
//!     .config(&config.receiver)
//!     .simulcast(true)
//!     .build();
//! receiver.add_up_track("f", buffer);
//!
//! let pacer = Arc::new(NoQueue::new(tracing::Span::current()));
//! let down_track = DownTrack::new(codec, receiver.clone(), subscriber, pacer, listener, &config.down_track, span)?;
//! receiver.add_down_track(down_track.clone());
//! ```

pub mod buffer;
pub mod config;
pub mod connection_quality;
pub mod down_track;
pub mod error;
pub mod forwarder;
pub mod logging;
pub mod pacer;
pub mod receiver;
pub mod rtp_munger;
pub mod sequencer;
pub mod stream_tracker;
pub mod stream_tracker_manager;
pub mod track;
pub mod types;
pub mod vp8_munger;

mod ops_queue;

pub use buffer::{Buffer, ExtPacket};
pub use config::SfuConfig;
pub use connection_quality::{ConnectionQuality, QualityScorer, WindowStat};
pub use down_track::{BindContext, DownTrack, DownTrackListener};
pub use error::{Error, Result};
pub use forwarder::Forwarder;
pub use pacer::{NoQueue, Pacer, RtpWriter};
pub use receiver::{ReceiverListener, WebRtcReceiver};
pub use stream_tracker::{StreamStatus, StreamTracker};
pub use stream_tracker_manager::StreamTrackerManager;
pub use track::{TrackReceiver, TrackSender};
pub use types::{PeerId, TrackId, TrackKind, VideoLayers};

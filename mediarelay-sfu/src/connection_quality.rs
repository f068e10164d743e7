//! Windowed connection quality scoring
//!
//! Each analysis window yields a score out of 100 from its loss, RTT and
//! jitter. Drops in quality are reported at once; improvements are only
//! reported after the new quality has held for a while, using the median of
//! the retained windows.

use crate::config::QualityConfig;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, Span};

pub const MAX_MOS: f32 = 4.5;

const MAX_SCORE: f64 = 100.0;
const POOR_SCORE: f64 = 50.0;

const WAIT_FOR_QUALITY_POOR: Duration = Duration::from_secs(25);
const WAIT_FOR_QUALITY_GOOD: Duration = Duration::from_secs(15);

const UNMUTE_TIME_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Poor,
    Good,
    Excellent,
}

impl fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Poor => write!(f, "POOR"),
            Self::Good => write!(f, "GOOD"),
            Self::Excellent => write!(f, "EXCELLENT"),
        }
    }
}

#[must_use]
pub fn score_to_connection_quality(score: f64) -> ConnectionQuality {
    if score > 80.0 {
        ConnectionQuality::Excellent
    } else if score > 60.0 {
        ConnectionQuality::Good
    } else {
        ConnectionQuality::Poor
    }
}

/// Map a score onto the 1.0..=4.5 mean opinion score scale.
#[must_use]
pub fn score_to_mos(score: f64) -> f32 {
    if score <= 0.0 {
        return 1.0;
    }
    if score >= MAX_SCORE {
        return MAX_MOS;
    }

    (1.0 + 0.035 * score + 0.000_007 * score * (score - 60.0) * (100.0 - score)) as f32
}

/// Measurements of one analysis window.
#[derive(Debug, Clone, Copy)]
pub struct WindowStat {
    pub start_time: Instant,
    pub duration: Duration,
    pub packets_expected: u32,
    pub packets_lost: u32,
    /// Milliseconds
    pub rtt_max: u32,
    /// Microseconds
    pub jitter_max: f64,
}

impl WindowStat {
    /// `100 - delay effect - loss effect`, before clamping.
    #[must_use]
    pub fn score(&self, packet_loss_weight: f64) -> f64 {
        let effective_delay = f64::from(self.rtt_max) / 2.0 + (self.jitter_max * 2.0) / 1000.0;
        let delay_effect = if effective_delay > 160.0 {
            (effective_delay - 120.0) / 10.0
        } else {
            effective_delay / 40.0
        };

        let loss_effect = if self.packets_expected > 0 {
            f64::from(self.packets_lost) * 100.0 / f64::from(self.packets_expected)
        } else {
            0.0
        };

        MAX_SCORE - delay_effect - loss_effect * packet_loss_weight
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowScore {
    start_time: Instant,
    score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScorerState {
    Stable,
    Recovering,
}

#[derive(Debug)]
struct ScorerInner {
    last_update_at: Option<Instant>,
    score: f64,
    state: ScorerState,
    windows: Vec<WindowScore>,
    muted_at: Option<Instant>,
    unmuted_at: Option<Instant>,
    max_pps: f64,
}

/// Turns a stream of [`WindowStat`]s into a reported score and quality.
pub struct QualityScorer {
    packet_loss_weight: f64,
    inner: RwLock<ScorerInner>,
    span: Span,
}

impl QualityScorer {
    #[must_use]
    pub fn new(config: &QualityConfig, span: Span) -> Self {
        Self {
            packet_loss_weight: config.packet_loss_weight,
            inner: RwLock::new(ScorerInner {
                last_update_at: None,
                score: MAX_SCORE,
                state: ScorerState::Stable,
                windows: Vec::new(),
                muted_at: None,
                unmuted_at: None,
                max_pps: 0.0,
            }),
            span,
        }
    }

    pub fn start(&self, at: Instant) {
        self.inner.write().last_update_at = Some(at);
    }

    /// A mute reports Excellent straight away; an unmute only takes effect
    /// once the unmuted part of a window dominates it.
    pub fn update_mute(&self, muted: bool, at: Instant) {
        let mut inner = self.inner.write();
        if muted {
            inner.muted_at = Some(at);
            inner.state = ScorerState::Stable;
            inner.windows.clear();
            inner.score = MAX_SCORE;
        } else {
            inner.unmuted_at = Some(at);
        }
    }

    /// Feed the window ending at `at`. `None` means no statistics arrived
    /// and counts as a poor window.
    pub fn update(&self, stat: Option<&WindowStat>, at: Instant) {
        let mut inner = self.inner.write();

        // An unmute -> mute -> unmute inside one window still uses the whole
        // window, including the part before the mute.
        if inner.is_muted() || !inner.is_unmuted_enough(at) {
            inner.last_update_at = Some(at);
            return;
        }

        let window = match stat {
            None => WindowScore {
                start_time: inner.last_update_at.unwrap_or(at),
                score: POOR_SCORE,
            },
            Some(stat) if stat.packets_expected == 0 => WindowScore {
                start_time: stat.start_time,
                score: POOR_SCORE,
            },
            Some(stat) => {
                let weight = inner.packet_loss_weight(stat, self.packet_loss_weight);
                WindowScore {
                    start_time: stat.start_time,
                    score: stat.score(weight),
                }
            }
        };
        let quality = score_to_connection_quality(window.score);

        inner.last_update_at = Some(at);

        if score_to_connection_quality(inner.score) > quality {
            debug!(
                parent: &self.span,
                from = %score_to_connection_quality(inner.score),
                to = %quality,
                score = window.score,
                "connection quality dropped"
            );
            inner.windows = vec![window];
            inner.state = ScorerState::Recovering;
            inner.score = window.score;
            return;
        }

        if inner.state == ScorerState::Stable && quality == ConnectionQuality::Excellent {
            inner.score = window.score;
            return;
        }

        inner.windows.push(window);
        if !inner.prune(at) {
            return;
        }

        inner.windows.sort_by(|a, b| a.score.total_cmp(&b.score));
        let mid = (inner.windows.len() + 1) / 2 - 1;
        inner.score = inner.windows[mid].score;
        if score_to_connection_quality(inner.score) == ConnectionQuality::Excellent {
            debug!(parent: &self.span, score = inner.score, "connection quality recovered");
            inner.state = ScorerState::Stable;
            inner.windows.clear();
        }
    }

    #[must_use]
    pub fn score(&self) -> f64 {
        self.inner.read().score
    }

    #[must_use]
    pub fn quality(&self) -> ConnectionQuality {
        score_to_connection_quality(self.inner.read().score)
    }

    #[must_use]
    pub fn mos_and_quality(&self) -> (f32, ConnectionQuality) {
        let score = self.inner.read().score;
        (score_to_mos(score), score_to_connection_quality(score))
    }
}

impl ScorerInner {
    fn is_muted(&self) -> bool {
        match (self.muted_at, self.unmuted_at) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(muted), Some(unmuted)) => muted > unmuted,
        }
    }

    fn is_unmuted_enough(&self, at: Instant) -> bool {
        let Some(unmuted_at) = self.unmuted_at else {
            return true;
        };
        let Some(last_update_at) = self.last_update_at else {
            return true;
        };

        let since_last_update = at.saturating_duration_since(last_update_at).as_secs_f64();
        if since_last_update == 0.0 {
            return false;
        }
        let since_unmute = at.saturating_duration_since(unmuted_at).as_secs_f64();
        since_unmute / since_last_update > UNMUTE_TIME_THRESHOLD
    }

    /// Loss matters less on streams running well below their peak packet
    /// rate; DTX audio at 5% of full rate gets about 22% of the weight.
    fn packet_loss_weight(&mut self, stat: &WindowStat, configured: f64) -> f64 {
        let secs = stat.duration.as_secs_f64();
        if secs <= 0.0 {
            return configured;
        }

        let pps = f64::from(stat.packets_expected) / secs;
        if pps > self.max_pps {
            self.max_pps = pps;
        }
        (pps / self.max_pps).sqrt() * configured
    }

    /// Drop windows older than the wait for the current quality and report
    /// whether the oldest window of that quality has been held long enough.
    fn prune(&mut self, at: Instant) -> bool {
        let quality = score_to_connection_quality(self.score);
        let wait = if quality == ConnectionQuality::Poor {
            WAIT_FOR_QUALITY_POOR
        } else {
            WAIT_FOR_QUALITY_GOOD
        };

        self.windows.sort_by_key(|w| w.start_time);
        if let Some(threshold) = at.checked_sub(wait) {
            if let Some(first) = self.windows.iter().position(|w| w.start_time >= threshold) {
                self.windows.drain(..first);
            }
        }

        self.windows
            .iter()
            .find(|w| score_to_connection_quality(w.score) == quality)
            .is_some_and(|w| at.saturating_duration_since(w.start_time) >= wait)
    }
}

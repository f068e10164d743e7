//! Availability of a publisher's spatial layers
//!
//! Owns one [`StreamTracker`] per spatial layer and keeps the sorted list of
//! layers currently flowing. Listeners hear about membership changes only.

use crate::config::StreamTrackerConfig;
use crate::stream_tracker::{StreamStatus, StreamStatusListener, StreamTracker};
use crate::types::DEFAULT_MAX_SPATIAL_LAYER;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tracing::{debug, info_span, Span};

const NUM_SPATIAL_LAYERS: usize = DEFAULT_MAX_SPATIAL_LAYER as usize + 1;

/// Notified with the full sorted list whenever a layer appears or disappears.
pub trait AvailableLayersListener: Send + Sync {
    fn on_available_layers_changed(&self, available_layers: &[i32]);
}

struct ManagerState {
    trackers: [Option<Arc<StreamTracker>>; NUM_SPATIAL_LAYERS],
    available_layers: Vec<i32>,
    max_expected_layer: i32,
}

pub struct StreamTrackerManager {
    config: StreamTrackerConfig,
    listener: Arc<dyn AvailableLayersListener>,
    state: RwLock<ManagerState>,
    span: Span,
}

/// Routes one tracker's status back to its manager.
struct LayerStatusSink {
    manager: Weak<StreamTrackerManager>,
    layer: i32,
}

impl StreamStatusListener for LayerStatusSink {
    fn on_status_changed(&self, status: StreamStatus) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        match status {
            StreamStatus::Active => manager.add_available_layer(self.layer),
            StreamStatus::Stopped => manager.remove_available_layer(self.layer),
        }
    }
}

fn layer_index(layer: i32) -> Option<usize> {
    usize::try_from(layer).ok().filter(|&l| l < NUM_SPATIAL_LAYERS)
}

impl StreamTrackerManager {
    #[must_use]
    pub fn new(
        config: StreamTrackerConfig,
        listener: Arc<dyn AvailableLayersListener>,
        span: Span,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            listener,
            state: RwLock::new(ManagerState {
                trackers: Default::default(),
                available_layers: Vec::with_capacity(NUM_SPATIAL_LAYERS),
                max_expected_layer: DEFAULT_MAX_SPATIAL_LAYER,
            }),
            span,
        })
    }

    /// Install a tracker for `layer`, replacing and stopping any previous one.
    pub fn add_tracker(self: &Arc<Self>, layer: i32) -> Option<Arc<StreamTracker>> {
        let idx = layer_index(layer)?;

        let tracker = StreamTracker::new(
            self.config.thresholds_for(layer),
            self.config.cycle_duration(),
            Arc::new(LayerStatusSink {
                manager: Arc::downgrade(self),
                layer,
            }),
            info_span!(parent: &self.span, "stream_tracker", layer),
        );

        let previous = self.state.write().trackers[idx].replace(Arc::clone(&tracker));
        if let Some(previous) = previous {
            previous.stop();
        }
        Some(tracker)
    }

    pub fn remove_tracker(&self, layer: i32) {
        let Some(idx) = layer_index(layer) else {
            return;
        };
        let tracker = self.state.write().trackers[idx].take();
        if let Some(tracker) = tracker {
            tracker.stop();
        }
    }

    #[must_use]
    pub fn get_tracker(&self, layer: i32) -> Option<Arc<StreamTracker>> {
        let idx = layer_index(layer)?;
        self.state.read().trackers[idx].clone()
    }

    pub fn set_paused(&self, paused: bool) {
        let trackers = self.state.read().trackers.clone();
        for tracker in trackers.iter().flatten() {
            tracker.set_paused(paused);
        }
    }

    #[must_use]
    pub fn max_expected_spatial_layer(&self) -> i32 {
        self.state.read().max_expected_layer
    }

    /// Lowering is bookkeeping only. Raising re-arms the trackers of newly
    /// expected layers that are not flowing, since a stopped tracker only
    /// re-arms itself through a reset.
    pub fn set_max_expected_spatial_layer(&self, layer: i32) {
        let to_reset: Vec<Arc<StreamTracker>> = {
            let mut state = self.state.write();
            if layer <= state.max_expected_layer {
                state.max_expected_layer = layer;
                return;
            }

            // A layer may stop right after this check; it then just takes
            // another detection cycle to come back.
            let to_reset = ((state.max_expected_layer + 1)..=layer)
                .filter(|l| !state.available_layers.contains(l))
                .filter_map(|l| layer_index(l).and_then(|idx| state.trackers[idx].clone()))
                .collect();
            state.max_expected_layer = layer;
            to_reset
        };

        for tracker in to_reset {
            tracker.reset();
        }
    }

    #[must_use]
    pub fn available_layers(&self) -> Vec<i32> {
        self.state.read().available_layers.clone()
    }

    #[must_use]
    pub fn has_spatial_layer(&self, layer: i32) -> bool {
        self.state.read().available_layers.contains(&layer)
    }

    pub(crate) fn add_available_layer(&self, layer: i32) {
        let layers = {
            let mut state = self.state.write();
            if state.available_layers.contains(&layer) {
                return;
            }
            state.available_layers.push(layer);
            state.available_layers.sort_unstable();
            state.available_layers.clone()
        };

        self.span
            .in_scope(|| debug!(layer, ?layers, "layer became available"));
        self.listener.on_available_layers_changed(&layers);
    }

    pub(crate) fn remove_available_layer(&self, layer: i32) {
        let layers = {
            let mut state = self.state.write();
            let before = state.available_layers.len();
            state.available_layers.retain(|&l| l != layer);
            if state.available_layers.len() == before {
                return;
            }
            state.available_layers.clone()
        };

        // unavailable layers have to be switched off right away
        self.span
            .in_scope(|| debug!(layer, ?layers, "layer became unavailable"));
        self.listener.on_available_layers_changed(&layers);
    }

    /// Stop every tracker.
    pub fn stop(&self) {
        let trackers = std::mem::take(&mut self.state.write().trackers);
        for tracker in trackers.into_iter().flatten() {
            tracker.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerThresholds;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct ChannelListener(mpsc::UnboundedSender<Vec<i32>>);

    impl AvailableLayersListener for ChannelListener {
        fn on_available_layers_changed(&self, available_layers: &[i32]) {
            let _ = self.0.send(available_layers.to_vec());
        }
    }

    fn new_manager() -> (Arc<StreamTrackerManager>, mpsc::UnboundedReceiver<Vec<i32>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = StreamTrackerConfig {
            base_layer: TrackerThresholds {
                samples_required: 1,
                cycles_required: 2,
            },
            higher_layers: TrackerThresholds {
                samples_required: 1,
                cycles_required: 2,
            },
            cycle_duration_ms: 100,
        };
        (
            StreamTrackerManager::new(config, Arc::new(ChannelListener(tx)), Span::none()),
            rx,
        )
    }

    #[test]
    fn test_membership_changes_only() {
        let (manager, mut rx) = new_manager();

        manager.add_available_layer(2);
        manager.add_available_layer(0);
        manager.add_available_layer(2);
        assert_eq!(rx.try_recv().unwrap(), vec![2]);
        assert_eq!(rx.try_recv().unwrap(), vec![0, 2]);
        assert!(rx.try_recv().is_err());

        manager.remove_available_layer(1);
        assert!(rx.try_recv().is_err());
        manager.remove_available_layer(2);
        assert_eq!(rx.try_recv().unwrap(), vec![0]);
        assert!(manager.has_spatial_layer(0));
        assert!(!manager.has_spatial_layer(2));
    }

    #[test]
    fn test_lowering_max_expected_is_bookkeeping() {
        let (manager, _rx) = new_manager();
        assert_eq!(manager.max_expected_spatial_layer(), 2);
        manager.set_max_expected_spatial_layer(0);
        assert_eq!(manager.max_expected_spatial_layer(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracker_drives_available_layers() {
        let (manager, mut rx) = new_manager();
        let tracker = manager.add_tracker(1).unwrap();
        assert!(manager.add_tracker(3).is_none());

        tracker.observe(10);
        assert_eq!(rx.recv().await.unwrap(), vec![1]);

        // no packets: stopped at the next cycle
        assert_eq!(rx.recv().await.unwrap(), Vec::<i32>::new());
        assert!(manager.available_layers().is_empty());
        manager.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume_without_packets_drops_layer() {
        let (manager, mut rx) = new_manager();
        let tracker = manager.add_tracker(0).unwrap();

        tracker.observe(1);
        assert_eq!(rx.recv().await.unwrap(), vec![0]);

        manager.set_paused(true);
        manager.set_paused(false);
        assert_eq!(rx.recv().await.unwrap(), Vec::<i32>::new());
        assert!(manager.available_layers().is_empty());
        assert_eq!(tracker.status(), StreamStatus::Stopped);
        manager.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_raising_max_expected_resets_stopped_trackers() {
        let (manager, mut rx) = new_manager();
        let tracker = manager.add_tracker(2).unwrap();

        tracker.observe(1);
        assert_eq!(rx.recv().await.unwrap(), vec![2]);
        assert_eq!(rx.recv().await.unwrap(), Vec::<i32>::new());

        manager.set_max_expected_spatial_layer(1);
        // a stopped, initialized tracker needs full cycles to come back
        tracker.observe(2);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(rx.try_recv().is_err());

        // re-armed: the next packet makes it available at once
        manager.set_max_expected_spatial_layer(2);
        tracker.observe(3);
        assert_eq!(rx.recv().await.unwrap(), vec![2]);
        manager.stop();
    }
}

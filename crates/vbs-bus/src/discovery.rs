//! CAN bitrate discovery
//!
//! While the bitrate is unknown the link listens on each candidate for one
//! window. Any received frame ends discovery (see [`DiscoveryController::mark_discovered`]);
//! otherwise the window timer hops to the next candidate until the window cap
//! is reached, after which the link stays parked on the last candidate.
//!
//! With candidates `[250000, 500000]` and a cap of 3 windows the link runs
//! at 250000, 500000, 250000 and ends where it started.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};
use vbs_core::{FlowControlRecord, HardwareFilter};

use crate::config::DiscoveryConfig;
use crate::dispatcher::TimerHandle;
use crate::manager::{BusCallback, BusResourceManager, CHARACTERISTICS_OWNER};
use crate::state::{PersistenceGateway, StateKey};

/// Discovery progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryStage {
    Off,
    /// Listening on the candidate at this index
    Candidate(usize),
}

#[derive(Debug)]
struct DiscoveryState {
    stage: DiscoveryStage,
    window_count: u32,
    timer: Option<TimerHandle>,
}

impl DiscoveryState {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

pub struct DiscoveryController {
    manager: Arc<BusResourceManager>,
    persistence: Arc<dyn PersistenceGateway>,
    config: DiscoveryConfig,
    state: Mutex<DiscoveryState>,
    this: Weak<DiscoveryController>,
}

impl DiscoveryController {
    pub fn new(
        manager: Arc<BusResourceManager>,
        persistence: Arc<dyn PersistenceGateway>,
        config: DiscoveryConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            manager,
            persistence,
            config,
            state: Mutex::new(DiscoveryState {
                stage: DiscoveryStage::Off,
                window_count: 0,
                timer: None,
            }),
            this: this.clone(),
        })
    }

    /// Start listening on the first candidate and arm the window timer
    ///
    /// Discovery starts on `initial_bitrate` when it is one of the
    /// candidates, otherwise on the first candidate.
    pub fn start_discovery(
        &self,
        initial_bitrate: u32,
        filters: Vec<HardwareFilter>,
        flow_controls: Vec<FlowControlRecord>,
        ready: BusCallback,
        terminated: Option<BusCallback>,
    ) -> bool {
        let index = self
            .config
            .candidates
            .iter()
            .position(|&b| b == initial_bitrate)
            .unwrap_or(0);
        let Some(&bitrate) = self.config.candidates.get(index) else {
            return false;
        };

        {
            let mut state = self.state.lock();
            state.cancel_timer();
            state.stage = DiscoveryStage::Candidate(index);
            state.window_count = 0;
        }

        info!(bitrate, windows = self.config.max_windows, "Starting CAN bitrate discovery");
        self.manager
            .set_characteristics(true, bitrate, filters, flow_controls);
        let started = self
            .manager
            .start(CHARACTERISTICS_OWNER, Some(ready), terminated);

        let mut state = self.state.lock();
        if state.stage != DiscoveryStage::Off {
            state.timer = Some(self.arm());
        }
        started
    }

    /// End discovery because a frame was received at `observed_bitrate`
    ///
    /// Persists the bitrate and clears the auto-detect flag. Returns false
    /// (and does nothing) when discovery is not running.
    pub fn mark_discovered(&self, observed_bitrate: u32) -> bool {
        let mut state = self.state.lock();
        state.cancel_timer();
        if state.stage == DiscoveryStage::Off {
            return false;
        }
        state.stage = DiscoveryStage::Off;

        self.persistence
            .put_int(StateKey::CanBitrate, i64::from(observed_bitrate));
        self.persistence.put_int(StateKey::CanAutoDetect, 0);

        info!(
            bitrate = observed_bitrate,
            windows = state.window_count,
            "Discovered CAN bitrate"
        );
        true
    }

    /// Abort discovery and stop the link; no-op when not discovering
    pub fn stop_discovery(&self) {
        if self.reset() {
            info!("Aborting CAN bitrate discovery");
            self.manager.stop(CHARACTERISTICS_OWNER);
        }
    }

    /// Forget any discovery in progress without touching the link
    ///
    /// Returns whether discovery was running.
    pub fn reset(&self) -> bool {
        let mut state = self.state.lock();
        state.cancel_timer();
        let was_running = state.stage != DiscoveryStage::Off;
        state.stage = DiscoveryStage::Off;
        state.window_count = 0;
        was_running
    }

    pub fn stage(&self) -> DiscoveryStage {
        self.state.lock().stage
    }

    pub fn is_in_discovery(&self) -> bool {
        self.stage() != DiscoveryStage::Off
    }

    pub fn window_count(&self) -> u32 {
        self.state.lock().window_count
    }

    /// Whether a window timer is pending
    pub fn is_armed(&self) -> bool {
        self.state.lock().timer.is_some()
    }

    fn arm(&self) -> TimerHandle {
        let this = self.this.clone();
        self.manager
            .dispatcher()
            .post_delayed(self.config.window(), move || {
                if let Some(this) = this.upgrade() {
                    this.on_window_expired();
                }
            })
    }

    /// Runs on the dispatcher; the restart's settle delay pauses it
    fn on_window_expired(&self) {
        // Held across the restart so a concurrent confirmation waits for the
        // hop to finish and then sees the final stage
        let mut state = self.state.lock();
        state.timer = None;
        let DiscoveryStage::Candidate(index) = state.stage else {
            return;
        };

        state.window_count += 1;
        if state.window_count >= self.config.max_windows {
            info!(
                windows = state.window_count,
                bitrate = self.config.candidates[index],
                "Max discovery windows reached, staying on bitrate"
            );
            return;
        }

        let next = (index + 1) % self.config.candidates.len();
        let bitrate = self.config.candidates[next];
        state.stage = DiscoveryStage::Candidate(next);
        debug!(window = state.window_count, bitrate, "Discovery window expired, switching bitrate");

        self.manager.set_bitrate(bitrate);
        self.manager.restart(None, None, None);
        state.timer = Some(self.arm());
    }
}

impl Drop for DiscoveryController {
    fn drop(&mut self) {
        self.state.get_mut().cancel_timer();
    }
}

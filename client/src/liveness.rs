//! Periodic no-op probes that keep an idle persistent connection alive
//!
//! The monitor only observes the channel. It never closes or reopens it, and
//! a failed probe is logged and otherwise ignored.

use crate::network::{ConnectionState, StreamChannel};
use log::{debug, warn};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(20);

pub struct LivenessMonitor {
    handle: JoinHandle<u64>,
}

impl LivenessMonitor {
    /// Spawns a monitor for `channel`.
    ///
    /// It waits for the pending connect to settle, probes every `period`
    /// while the channel is `Open`, and exits as soon as it leaves `Open`.
    pub fn spawn(channel: StreamChannel, period: Duration) -> Self {
        let handle = tokio::spawn(async move { run_probes(channel, period).await });
        Self { handle }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the monitor to exit and returns how many probes it sent.
    pub async fn join(self) -> u64 {
        self.handle.await.unwrap_or(0)
    }
}

async fn run_probes(channel: StreamChannel, period: Duration) -> u64 {
    let mut state = channel.subscribe();

    let opened = match state
        .wait_for(|s| !matches!(s, ConnectionState::Idle | ConnectionState::Connecting))
        .await
    {
        Ok(settled) => settled.is_open(),
        Err(_) => false,
    };
    if !opened {
        debug!("{}: not open, liveness monitor exiting", channel.label());
        return 0;
    }

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Skip the first tick since it fires immediately
    ticker.tick().await;

    let mut probes = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match channel.ping() {
                    Ok(()) => {
                        probes += 1;
                        debug!("{}: liveness probe #{}", channel.label(), probes);
                    }
                    Err(e) => warn!("{}: liveness probe failed: {}", channel.label(), e),
                }
            }
            changed = state.changed() => {
                if changed.is_err() || !state.borrow().is_open() {
                    debug!("{}: left Open, liveness monitor exiting", channel.label());
                    break;
                }
            }
        }
    }

    probes
}

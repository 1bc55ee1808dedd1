use tokio::task::JoinHandle;
use tracing::debug;

use super::coordinator::UsageMonitor;

/// Drives refresh cycles until the monitor stops
pub struct Poller {
    monitor: UsageMonitor,
}

impl Poller {
    pub fn new(monitor: UsageMonitor) -> Self {
        Self { monitor }
    }

    /// Start polling in a background task
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Run the polling loop
    async fn run(self) {
        let wake = self.monitor.wake_handle();
        let mut cycles: u64 = 0;

        loop {
            if !self.monitor.is_running() {
                break;
            }

            self.monitor.refresh_cycle(true).await;
            cycles = cycles.wrapping_add(1);

            if !self.monitor.is_running() {
                break;
            }

            // Recomputed every cycle: visibility, power and urgency all move.
            let interval = self.monitor.current_interval();
            debug!("Poll cycle {} done, next in {:?}", cycles, interval);

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = wake.notified() => {
                    debug!("Poll loop woken early");
                }
            }
        }
        debug!("Poll loop exited after {} cycle(s)", cycles);
    }
}

use std::time::Duration;

use nyamodbus::{Handler, Listener, Master, Slave, Transport};
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Anything driven by the poll/tick loop
pub trait Node {
    fn poll(&mut self);

    fn tick(&mut self, elapsed_us: u32);
}

impl<T: Transport, L: Listener> Node for Master<T, L> {
    fn poll(&mut self) {
        Master::poll(self)
    }

    fn tick(&mut self, elapsed_us: u32) {
        Master::tick(self, elapsed_us)
    }
}

impl<T: Transport, H: Handler> Node for Slave<T, H> {
    fn poll(&mut self) {
        Slave::poll(self)
    }

    fn tick(&mut self, elapsed_us: u32) {
        Slave::tick(self, elapsed_us)
    }
}

/// Polls a node at a fixed period and feeds it the time that really elapsed.
pub struct Driver {
    interval: Interval,
    last: Instant,
}

impl Driver {
    pub fn new(period: Duration) -> Self {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval,
            last: Instant::now(),
        }
    }

    pub async fn step<N: Node>(&mut self, node: &mut N) {
        self.interval.tick().await;

        let now = Instant::now();
        let elapsed = now.duration_since(self.last);
        self.last = now;

        node.poll();
        node.tick(u32::try_from(elapsed.as_micros()).unwrap_or(u32::MAX));
    }

    /// Drives `node` until `token` is cancelled.
    pub async fn run<N: Node>(&mut self, node: &mut N, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Cancellation token received, shutting down");
                    return;
                }
                _ = self.step(node) => {}
            }
        }
    }

    /// Drives a master until its outstanding command is answered or times out.
    pub async fn complete<T: Transport, L: Listener>(&mut self, master: &mut Master<T, L>) {
        while master.is_busy() {
            self.step(master).await;
        }
    }
}

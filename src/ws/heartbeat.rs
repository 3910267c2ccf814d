use std::future;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};

use super::types::Envelope;

/// Periodic liveness probe with round-trip latency sampling.
///
/// Only runs while connected. It never declares the connection dead; missed
/// acknowledgements are left to the transport's own disconnect signalling.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    period: Duration,
    interval: Option<Interval>,
    next_id: u64,
    /// Probe awaiting its `pong`: id and send time
    pending: Option<(u64, Instant)>,
    latency: Option<Duration>,
}

impl HeartbeatMonitor {
    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            interval: None,
            next_id: 0,
            pending: None,
            latency: None,
        }
    }

    /// Start probing; the first probe is due one period from now.
    pub fn start(&mut self) {
        let mut interval = interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = Some(interval);
        self.pending = None;
    }

    /// Stop probing immediately. An unanswered probe is forgotten.
    pub fn stop(&mut self) {
        self.interval = None;
        self.pending = None;
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    /// Wait until the next probe is due. Never completes while stopped.
    pub async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => future::pending::<()>().await,
        }
    }

    /// Build the next probe and remember when it was sent.
    pub fn probe(&mut self) -> Envelope {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.pending = Some((id, Instant::now()));
        Envelope::ping(id, Utc::now().timestamp_millis())
    }

    /// Match an acknowledgement against the outstanding probe.
    ///
    /// Returns the round-trip time when it answers the latest probe. A pong without an
    /// `id` is matched against whatever probe is outstanding.
    pub fn on_pong(&mut self, data: &Value) -> Option<Duration> {
        let (pending_id, sent_at) = self.pending?;
        if let Some(id) = data.get("id").and_then(Value::as_u64)
            && id != pending_id
        {
            return None;
        }

        self.pending = None;
        let rtt = sent_at.elapsed();
        self.latency = Some(rtt);
        Some(rtt)
    }

    /// Most recent round-trip time.
    #[must_use]
    pub const fn latency(&self) -> Option<Duration> {
        self.latency
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::time::{advance, timeout};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_probe_is_due_after_one_period() {
        let mut heartbeat = HeartbeatMonitor::new(Duration::from_secs(30));
        heartbeat.start();

        let early = timeout(Duration::from_secs(29), heartbeat.tick()).await;
        assert!(early.is_err(), "probe fired before the interval elapsed");

        timeout(Duration::from_secs(2), heartbeat.tick())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_monitor_never_ticks() {
        let mut heartbeat = HeartbeatMonitor::new(Duration::from_secs(1));
        heartbeat.start();
        heartbeat.stop();

        let result = timeout(Duration::from_secs(10), heartbeat.tick()).await;
        assert!(result.is_err(), "stopped heartbeat must not tick");
        assert!(!heartbeat.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn pong_yields_round_trip_latency() {
        let mut heartbeat = HeartbeatMonitor::new(Duration::from_secs(30));
        heartbeat.start();

        let probe = heartbeat.probe();
        advance(Duration::from_millis(40)).await;

        let rtt = heartbeat.on_pong(&probe.data).unwrap();
        assert_eq!(rtt, Duration::from_millis(40));
        assert_eq!(heartbeat.latency(), Some(Duration::from_millis(40)));

        // The same probe cannot be acknowledged twice.
        assert!(heartbeat.on_pong(&probe.data).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_pong_is_ignored() {
        let mut heartbeat = HeartbeatMonitor::new(Duration::from_secs(30));
        heartbeat.start();

        let first = heartbeat.probe();
        let _second = heartbeat.probe();

        assert!(heartbeat.on_pong(&first.data).is_none());
        assert!(heartbeat.on_pong(&json!({ "id": 1 })).is_some());
    }

    #[test]
    fn pong_after_stop_is_ignored() {
        let mut heartbeat = HeartbeatMonitor::new(Duration::from_secs(30));
        let probe = heartbeat.probe();
        heartbeat.stop();

        assert!(heartbeat.on_pong(&probe.data).is_none());
        assert!(heartbeat.latency().is_none());
    }
}

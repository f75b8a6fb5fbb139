//! Heartbeats and key refresh for online sessions.
//!
//! Both run as background activities of a handler in `Ok`. A heartbeat that
//! goes unanswered fails its activity, which closes the handler and lets the
//! selector reconnect.

use crate::components::{BackgroundActivity, HeartbeatScheduler, KeyRefreshProcessor};
use crate::error::LinkError;
use crate::listener::Exchange;
use async_trait::async_trait;
use bytes::Bytes;
use chatlink_wire::Packet;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Periodic `heartbeat.alive` request
#[derive(Debug, Clone)]
pub struct PingHeartbeat {
    interval: Duration,
    timeout: Duration,
}

impl PingHeartbeat {
    /// Ping every `interval`, failing if a ping is not answered within `timeout`
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

#[async_trait]
impl BackgroundActivity for PingHeartbeat {
    fn name(&self) -> &str {
        "heartbeat"
    }

    async fn run(&self, exchange: Exchange) -> Result<(), LinkError> {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let started = Instant::now();
            let ping = Packet::request("heartbeat.alive", exchange.next_sequence(), Bytes::new());
            exchange.send_and_expect(ping, self.timeout).await?;
            trace!("Heartbeat answered in {:?}", started.elapsed());
        }
    }
}

/// Fixed set of background activities started on every online handler
#[derive(Clone, Default)]
pub struct KeepaliveScheduler {
    activities: Vec<Arc<dyn BackgroundActivity>>,
}

impl KeepaliveScheduler {
    /// Scheduler running a [`PingHeartbeat`]
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self::default().with(Arc::new(PingHeartbeat::new(interval, timeout)))
    }

    /// Add another activity
    pub fn with(mut self, activity: Arc<dyn BackgroundActivity>) -> Self {
        self.activities.push(activity);
        self
    }
}

impl HeartbeatScheduler for KeepaliveScheduler {
    fn activities(&self) -> Vec<Arc<dyn BackgroundActivity>> {
        self.activities.clone()
    }
}

#[derive(Debug, Default, Deserialize)]
struct KeyRefreshResponse {
    /// Seconds until the new key expires
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Periodic `key.refresh` request.
///
/// The server may shorten the wait by answering with `expires_in`; the next
/// refresh then happens at half the remaining lifetime.
#[derive(Debug, Clone)]
pub struct TimedKeyRefresh {
    interval: Duration,
    timeout: Duration,
}

impl TimedKeyRefresh {
    /// Refresh at most every `interval`
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    fn next_wait(&self, response: &Packet) -> Duration {
        let parsed: KeyRefreshResponse = serde_json::from_slice(&response.body).unwrap_or_default();
        match parsed.expires_in {
            Some(secs) => self.interval.min(Duration::from_secs(secs) / 2),
            None => self.interval,
        }
    }
}

#[async_trait]
impl KeyRefreshProcessor for TimedKeyRefresh {
    async fn key_refresh_loop(&self, exchange: Exchange) -> Result<(), LinkError> {
        let mut wait = self.interval;
        loop {
            tokio::time::sleep(wait).await;
            let request = Packet::request("key.refresh", exchange.next_sequence(), Bytes::new());
            let response = exchange.send_and_expect(request, self.timeout).await?;
            wait = self.next_wait(&response);
            debug!("Session key refreshed, next refresh in {:?}", wait);
        }
    }
}

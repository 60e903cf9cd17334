//! Rendezvous server health monitor
//!
//! Periodically probes the server's health endpoint and reports online/offline
//! transitions. Notifications are edge-triggered: subscribers hear about each
//! transition exactly once, not about every probe.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use playlink_core::{now_millis, MonitorConfig};

/// A single health check
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> Result<(), String>;
}

/// HTTP GET expecting 200
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(format!("playlink/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self) -> Result<(), String> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if response.status() == reqwest::StatusCode::OK {
            Ok(())
        } else {
            Err(format!("health check returned {}", response.status()))
        }
    }
}

/// Reported server status transitions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Online,
    Offline,
}

/// Snapshot of monitor state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStatus {
    pub online: bool,
    /// Unix millis of the last completed probe
    pub last_check: Option<u64>,
    pub failure_count: u32,
}

impl Default for MonitorStatus {
    fn default() -> Self {
        Self {
            online: true,
            last_check: None,
            failure_count: 0,
        }
    }
}

/// Health monitor for the rendezvous server
pub struct ConnectionMonitor {
    config: MonitorConfig,
    status: Mutex<MonitorStatus>,
    events_tx: broadcast::Sender<ServerStatus>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let (events_tx, _) = broadcast::channel(16);
        Self {
            config,
            status: Mutex::new(MonitorStatus::default()),
            events_tx,
            task: Mutex::new(None),
        }
    }

    /// Start probing: once immediately, then every interval
    ///
    /// Restarting replaces any running probe loop.
    pub fn start(self: &Arc<Self>, probe: Arc<dyn HealthProbe>) {
        let monitor = Arc::downgrade(self);
        let interval = self.config.interval();
        let probe_timeout = self.config.probe_timeout();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let ok = match timeout(probe_timeout, probe.probe()).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        debug!("Health probe failed: {}", e);
                        false
                    }
                    Err(_) => {
                        debug!("Health probe timed out after {:?}", probe_timeout);
                        false
                    }
                };

                let Some(monitor) = monitor.upgrade() else {
                    return;
                };
                monitor.handle_probe_result(ok);
            }
        });

        if let Some(old) = self.task.lock().replace(handle) {
            old.abort();
        }
        info!(interval_secs = interval.as_secs(), "Connection monitor started");
    }

    /// Stop probing; status is kept
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
            info!("Connection monitor stopped");
        }
    }

    /// Forget failures and assume online
    pub fn reset(&self) {
        let mut status = self.status.lock();
        status.online = true;
        status.failure_count = 0;
    }

    /// Fold one probe result into the state, returning the transition if any
    pub fn handle_probe_result(&self, ok: bool) -> Option<ServerStatus> {
        let transition = {
            let mut status = self.status.lock();
            status.last_check = Some(now_millis());

            if ok {
                status.failure_count = 0;
                if status.online {
                    None
                } else {
                    status.online = true;
                    Some(ServerStatus::Online)
                }
            } else {
                status.failure_count = status.failure_count.saturating_add(1);
                if status.online && status.failure_count >= self.config.failure_threshold.max(1) {
                    status.online = false;
                    Some(ServerStatus::Offline)
                } else {
                    None
                }
            }
        };

        match transition {
            Some(ServerStatus::Offline) => warn!("Rendezvous server is offline"),
            Some(ServerStatus::Online) => info!("Rendezvous server is back online"),
            None => {}
        }
        if let Some(t) = transition {
            let _ = self.events_tx.send(t);
        }
        transition
    }

    pub fn status(&self) -> MonitorStatus {
        *self.status.lock()
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Subscribe to online/offline transitions
    pub fn subscribe(&self) -> broadcast::Receiver<ServerStatus> {
        self.events_tx.subscribe()
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Replays scripted results, then keeps succeeding
    struct ScriptedProbe {
        results: Mutex<VecDeque<bool>>,
        calls: AtomicU32,
    }

    impl ScriptedProbe {
        fn new(results: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.iter().copied().collect()),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.results.lock().pop_front() {
                Some(false) => Err("down".into()),
                _ => Ok(()),
            }
        }
    }

    /// Never answers
    struct HangingProbe;

    #[async_trait]
    impl HealthProbe for HangingProbe {
        async fn probe(&self) -> Result<(), String> {
            std::future::pending().await
        }
    }

    #[test]
    fn test_offline_once_after_threshold() {
        let monitor = ConnectionMonitor::new(MonitorConfig::default());

        assert_eq!(monitor.handle_probe_result(false), None);
        assert_eq!(monitor.handle_probe_result(false), None);
        assert_eq!(monitor.handle_probe_result(false), Some(ServerStatus::Offline));
        // Further failures do not notify again
        assert_eq!(monitor.handle_probe_result(false), None);

        let status = monitor.status();
        assert!(!status.online);
        assert_eq!(status.failure_count, 4);
        assert!(status.last_check.is_some());

        assert_eq!(monitor.handle_probe_result(true), Some(ServerStatus::Online));
        assert_eq!(monitor.handle_probe_result(true), None);
        assert_eq!(monitor.status().failure_count, 0);
    }

    #[test]
    fn test_success_resets_count() {
        let monitor = ConnectionMonitor::new(MonitorConfig::default());

        monitor.handle_probe_result(false);
        monitor.handle_probe_result(false);
        monitor.handle_probe_result(true);
        monitor.handle_probe_result(false);
        monitor.handle_probe_result(false);

        assert!(monitor.status().online);
        assert_eq!(monitor.status().failure_count, 2);
    }

    #[test]
    fn test_reset() {
        let monitor = ConnectionMonitor::new(MonitorConfig::default());
        for _ in 0..3 {
            monitor.handle_probe_result(false);
        }
        assert!(!monitor.status().online);

        monitor.reset();
        let status = monitor.status();
        assert!(status.online);
        assert_eq!(status.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_probing_notifies_per_edge() {
        let monitor = Arc::new(ConnectionMonitor::new(MonitorConfig::default()));
        let mut events = monitor.subscribe();
        let probe = ScriptedProbe::new(&[false, false, false, false, true]);

        monitor.start(probe.clone());
        assert!(monitor.is_running());

        assert_eq!(events.recv().await.unwrap(), ServerStatus::Offline);
        assert_eq!(events.recv().await.unwrap(), ServerStatus::Online);
        // Offline after the third probe, online on the fifth
        assert_eq!(probe.calls.load(Ordering::SeqCst), 5);

        monitor.stop();
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_counts_as_failure() {
        let monitor = Arc::new(ConnectionMonitor::new(MonitorConfig::default()));
        let mut events = monitor.subscribe();

        monitor.start(Arc::new(HangingProbe));
        assert_eq!(events.recv().await.unwrap(), ServerStatus::Offline);
        assert_eq!(monitor.status().failure_count, 3);
    }

    #[tokio::test]
    async fn test_http_probe_against_unreachable_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let probe =
            HttpHealthProbe::new(format!("http://{}/health", addr), Duration::from_secs(2)).unwrap();
        assert!(probe.probe().await.is_err());
    }
}

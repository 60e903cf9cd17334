//! Link and runtime quality monitoring
//!
//! Latency samples feed a rolling average from which the [`QualityTier`] is
//! derived. FPS and memory pressure are sampled on timers. Threshold
//! crossings raise alerts kept in a short history and broadcast to
//! subscribers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use playlink_core::{now_millis, QualityConfig, QualityMetrics, QualityTier, StreamProfile};

/// Alert severity
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

/// What an alert is about
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertKind {
    LowFps,
    Memory,
    Latency,
    QualityDegraded,
    QualityRecovered,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QualityAlert {
    pub level: AlertLevel,
    pub kind: AlertKind,
    pub message: String,
    /// Unix millis
    pub timestamp: u64,
}

/// Source of memory pressure readings
pub trait MemorySource: Send + Sync {
    /// Used memory as a percentage of the limit, if known
    fn usage_percent(&self) -> Option<f64>;
}

/// Shared frame counter for FPS accounting
#[derive(Clone, Debug, Default)]
pub struct FrameCounter(Arc<AtomicU64>);

impl FrameCounter {
    pub fn record(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Return the count since the last call and reset it
    pub fn take(&self) -> u64 {
        self.0.swap(0, Ordering::Relaxed)
    }
}

struct QualityState {
    latencies: VecDeque<f64>,
    alerts: VecDeque<QualityAlert>,
    metrics: QualityMetrics,
    last_fps_sample: Instant,
}

/// Samples quality signals and derives the tier
pub struct QualityMonitor {
    config: QualityConfig,
    state: Mutex<QualityState>,
    frames: FrameCounter,
    alert_tx: broadcast::Sender<QualityAlert>,
    metrics_tx: watch::Sender<QualityMetrics>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl QualityMonitor {
    pub fn new(config: QualityConfig) -> Self {
        let (alert_tx, _) = broadcast::channel(32);
        let (metrics_tx, _) = watch::channel(QualityMetrics::default());
        Self {
            config,
            state: Mutex::new(QualityState {
                latencies: VecDeque::new(),
                alerts: VecDeque::new(),
                metrics: QualityMetrics::default(),
                last_fps_sample: Instant::now(),
            }),
            frames: FrameCounter::default(),
            alert_tx,
            metrics_tx,
            task: Mutex::new(None),
        }
    }

    /// Counter that frame producers and consumers increment
    pub fn frame_counter(&self) -> FrameCounter {
        self.frames.clone()
    }

    /// Count one rendered or captured frame
    pub fn record_frame(&self) {
        self.frames.record();
    }

    /// Add a network latency sample (ms)
    pub fn record_latency(&self, latency_ms: f64) {
        let latency_ms = latency_ms.max(0.0);
        self.update(|state, alerts| {
            state.latencies.push_back(latency_ms);
            while state.latencies.len() > self.config.latency_window.max(1) {
                state.latencies.pop_front();
            }
            let average = state.latencies.iter().sum::<f64>() / state.latencies.len() as f64;

            let previous = state.metrics.tier;
            let tier = QualityTier::from_latency(average);
            state.metrics.latency_ms = latency_ms;
            state.metrics.average_latency_ms = average;
            state.metrics.tier = tier;

            if latency_ms > self.config.latency_critical_ms {
                alerts.push((
                    AlertLevel::Critical,
                    AlertKind::Latency,
                    format!("Critical latency: {:.0}ms", latency_ms),
                ));
            } else if latency_ms > self.config.latency_warning_ms {
                alerts.push((
                    AlertLevel::Warning,
                    AlertKind::Latency,
                    format!("High latency: {:.0}ms", latency_ms),
                ));
            }

            if tier != previous {
                debug!(from = %previous, to = %tier, average_ms = average, "Quality tier changed");
                if tier == QualityTier::Low {
                    alerts.push((
                        AlertLevel::Critical,
                        AlertKind::QualityDegraded,
                        format!("Connection quality dropped to {} ({:.0}ms)", tier, average),
                    ));
                } else if previous == QualityTier::Low {
                    alerts.push((
                        AlertLevel::Info,
                        AlertKind::QualityRecovered,
                        format!("Connection quality recovered to {}", tier),
                    ));
                }
            }
        });
    }

    /// Record a frames-per-second reading
    pub fn record_fps(&self, fps: u32) {
        self.update(|state, alerts| {
            state.metrics.fps = fps;
            if fps > 0 && fps < self.config.min_fps {
                alerts.push((
                    AlertLevel::Warning,
                    AlertKind::LowFps,
                    format!("Low FPS: {} (expected at least {})", fps, self.config.min_fps),
                ));
            }
        });
    }

    /// Turn the frame counter into an FPS reading
    pub fn sample_fps(&self) -> u32 {
        let frames = self.frames.take();
        let elapsed = {
            let mut state = self.state.lock();
            let elapsed = state.last_fps_sample.elapsed();
            state.last_fps_sample = Instant::now();
            elapsed
        };
        let millis = elapsed.as_millis().max(1) as u64;
        let fps = (frames * 1000 / millis) as u32;
        self.record_fps(fps);
        fps
    }

    /// Record a memory usage reading (percent of limit)
    pub fn record_memory(&self, percent: f64) {
        self.update(|state, alerts| {
            state.metrics.memory_percent = Some(percent);
            if percent > self.config.memory_critical_percent {
                alerts.push((
                    AlertLevel::Critical,
                    AlertKind::Memory,
                    format!("Critical memory usage: {:.0}%", percent),
                ));
            } else if percent > self.config.memory_warning_percent {
                alerts.push((
                    AlertLevel::Warning,
                    AlertKind::Memory,
                    format!("High memory usage: {:.0}%", percent),
                ));
            }
        });
    }

    /// Record packet counters and derive the loss percentage
    pub fn record_packets(&self, sent: u64, lost: u64) {
        self.update(|state, _| {
            state.metrics.packet_loss = if sent == 0 {
                0.0
            } else {
                (lost.min(sent) as f64 / sent as f64) * 100.0
            };
        });
    }

    /// Record a bandwidth estimate in bytes per second
    pub fn record_bandwidth(&self, bytes_per_sec: u64) {
        self.update(|state, _| state.metrics.bandwidth = bytes_per_sec);
    }

    /// Record the number of inputs waiting to be delivered
    pub fn set_input_queue(&self, depth: usize) {
        self.update(|state, _| state.metrics.input_queue = depth);
    }

    pub fn metrics(&self) -> QualityMetrics {
        self.state.lock().metrics.clone()
    }

    pub fn tier(&self) -> QualityTier {
        self.state.lock().metrics.tier
    }

    /// Capture settings suited to the current tier
    pub fn recommended_profile(&self) -> StreamProfile {
        StreamProfile::for_tier(self.tier())
    }

    /// Recent alerts, oldest first
    pub fn alerts(&self) -> Vec<QualityAlert> {
        self.state.lock().alerts.iter().cloned().collect()
    }

    pub fn clear_alerts(&self) {
        self.state.lock().alerts.clear();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QualityAlert> {
        self.alert_tx.subscribe()
    }

    pub fn watch_metrics(&self) -> watch::Receiver<QualityMetrics> {
        self.metrics_tx.subscribe()
    }

    /// Start periodic FPS and memory sampling
    pub fn start(self: &Arc<Self>, memory: Option<Arc<dyn MemorySource>>) {
        let monitor = Arc::downgrade(self);
        let fps_period = std::time::Duration::from_millis(self.config.fps_sample_ms.max(1));
        let memory_period = std::time::Duration::from_millis(self.config.memory_sample_ms.max(1));

        let handle = tokio::spawn(async move {
            let mut fps_tick = tokio::time::interval(fps_period);
            let mut memory_tick = tokio::time::interval(memory_period);
            fps_tick.tick().await;

            loop {
                tokio::select! {
                    _ = fps_tick.tick() => {
                        let Some(monitor) = monitor.upgrade() else { break };
                        monitor.sample_fps();
                    }
                    _ = memory_tick.tick() => {
                        let Some(monitor) = monitor.upgrade() else { break };
                        if let Some(percent) = memory.as_ref().and_then(|m| m.usage_percent()) {
                            monitor.record_memory(percent);
                        }
                    }
                }
            }
        });

        if let Some(old) = self.task.lock().replace(handle) {
            old.abort();
        }
        info!("Quality monitor started");
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut QualityState, &mut Vec<(AlertLevel, AlertKind, String)>),
    {
        let mut raised = Vec::new();
        let (metrics, new_alerts) = {
            let mut state = self.state.lock();
            f(&mut *state, &mut raised);

            let mut new_alerts = Vec::with_capacity(raised.len());
            for (level, kind, message) in raised {
                let alert = QualityAlert {
                    level,
                    kind,
                    message,
                    timestamp: now_millis(),
                };
                state.alerts.push_back(alert.clone());
                while state.alerts.len() > self.config.alert_history.max(1) {
                    state.alerts.pop_front();
                }
                new_alerts.push(alert);
            }
            (state.metrics.clone(), new_alerts)
        };

        self.metrics_tx.send_replace(metrics);
        for alert in new_alerts {
            match alert.level {
                AlertLevel::Critical | AlertLevel::Warning => warn!("{}", alert.message),
                AlertLevel::Info => info!("{}", alert.message),
            }
            let _ = self.alert_tx.send(alert);
        }
    }
}

impl Drop for QualityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

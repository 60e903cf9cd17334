//! Per-process client wiring
//!
//! Builds the session client, monitors and peer managers once, sharing the
//! retry manager, the peer latch and the frame counter between them.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use playlink_core::{Config, ConnectionState, CorrelationId, RetryManager, SessionError, StreamProfile};

use crate::monitor::{ConnectionMonitor, HttpHealthProbe};
use crate::peer::{PeerBackend, PeerConnectionManager, PeerLatch};
use crate::quality::{MemorySource, QualityMonitor};
use crate::session::SessionClient;
use crate::transport::{RendezvousConnector, WsConnector};

/// Shared client services
pub struct ClientContext {
    config: Config,
    correlation_id: CorrelationId,
    retry: Arc<RetryManager>,
    latch: PeerLatch,
    quality: Arc<QualityMonitor>,
    monitor: Arc<ConnectionMonitor>,
    session: Arc<SessionClient>,
    /// Latency and state forwarders, replaced on each `start`
    forwarders: Mutex<Vec<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientContext {
    /// Context talking WebSocket to the configured rendezvous URL
    pub fn new(config: Config, correlation_id: CorrelationId) -> Self {
        let connector = Arc::new(WsConnector::new(config.client.rendezvous_url.clone()));
        Self::with_connector(config, correlation_id, connector)
    }

    pub fn with_connector(
        config: Config,
        correlation_id: CorrelationId,
        connector: Arc<dyn RendezvousConnector>,
    ) -> Self {
        let retry = Arc::new(RetryManager::new());
        let session = Arc::new(SessionClient::new(
            config.client.clone(),
            connector,
            retry.clone(),
            correlation_id.clone(),
        ));

        Self {
            quality: Arc::new(QualityMonitor::new(config.quality.clone())),
            monitor: Arc::new(ConnectionMonitor::new(config.monitor.clone())),
            latch: PeerLatch::new(),
            config,
            correlation_id,
            retry,
            session,
            forwarders: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start health probing, quality sampling and latency forwarding
    ///
    /// Calling it again restarts all three.
    pub fn start(&self, memory: Option<Arc<dyn MemorySource>>) -> Result<(), SessionError> {
        let probe = HttpHealthProbe::new(self.config.health_url(), self.config.monitor.probe_timeout())
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        info!(url = %probe.url(), "Monitoring rendezvous health");

        self.monitor.start(Arc::new(probe));
        self.quality.start(memory);
        self.spawn_forwarders();
        Ok(())
    }

    /// Feed heartbeat round trips into the quality monitor and clear the
    /// health monitor whenever the link comes back
    fn spawn_forwarders(&self) {
        let mut latency = self.session.watch_latency();
        let quality = Arc::downgrade(&self.quality);
        let latency_task = tokio::spawn(async move {
            while latency.changed().await.is_ok() {
                let sample = *latency.borrow_and_update();
                let (Some(rtt), Some(quality)) = (sample, quality.upgrade()) else {
                    continue;
                };
                quality.record_latency(rtt.as_secs_f64() * 1000.0);
            }
        });

        let mut state = self.session.watch_state();
        let monitor = Arc::downgrade(&self.monitor);
        let state_task = tokio::spawn(async move {
            while state.changed().await.is_ok() {
                let current = *state.borrow_and_update();
                if current != ConnectionState::Connected {
                    continue;
                }
                let Some(monitor) = monitor.upgrade() else {
                    return;
                };
                debug!("Rendezvous connected, resetting health monitor");
                monitor.reset();
            }
        });

        let mut forwarders = self.forwarders.lock();
        for task in forwarders.drain(..) {
            task.abort();
        }
        forwarders.extend([latency_task, state_task]);
    }

    /// Build a peer manager sharing this process's latch and frame counter
    pub fn peer_manager(&self, backend: Arc<dyn PeerBackend>) -> Arc<PeerConnectionManager> {
        Arc::new(PeerConnectionManager::new(
            self.config.peer.clone(),
            backend,
            self.latch.clone(),
            self.quality.frame_counter(),
        ))
    }

    /// Keep `manager`'s stream profile in line with the measured tier
    pub fn auto_tune(&self, manager: &Arc<PeerConnectionManager>) {
        let mut metrics = self.quality.watch_metrics();
        let mut current = StreamProfile::for_tier(metrics.borrow_and_update().tier);
        manager.set_profile(current);

        let manager = Arc::downgrade(manager);
        let task = tokio::spawn(async move {
            while metrics.changed().await.is_ok() {
                let profile = StreamProfile::for_tier(metrics.borrow_and_update().tier);
                if profile == current {
                    continue;
                }
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                current = profile;
                manager.set_profile(profile);
            }
        });
        self.tasks.lock().push(task);
    }

    /// Stop background work and leave the rendezvous server
    pub async fn shutdown(&self) {
        self.abort_tasks();
        self.monitor.stop();
        self.quality.stop();
        self.session.leave();
        self.session.disconnect().await;
    }

    fn abort_tasks(&self) {
        let forwarders = self.forwarders.lock().drain(..).collect::<Vec<_>>();
        let tasks = self.tasks.lock().drain(..).collect::<Vec<_>>();
        for task in forwarders.into_iter().chain(tasks) {
            task.abort();
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn retry(&self) -> &Arc<RetryManager> {
        &self.retry
    }

    pub fn latch(&self) -> &PeerLatch {
        &self.latch
    }

    pub fn quality(&self) -> &Arc<QualityMonitor> {
        &self.quality
    }

    pub fn monitor(&self) -> &Arc<ConnectionMonitor> {
        &self.monitor
    }

    pub fn session(&self) -> &Arc<SessionClient> {
        &self.session
    }
}

impl Drop for ClientContext {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::{mpsc, oneshot};

    use playlink_core::{EncodeQuality, PeerState, QualityTier, SignalingEndpoint};

    use crate::peer::{FrameSource, MediaFrame, PeerError, PeerEvent, PeerNotice, PeerSession};
    use crate::transport::RendezvousLink;

    struct NoConnector;

    #[async_trait]
    impl RendezvousConnector for NoConnector {
        async fn connect(&self) -> Result<Box<dyn RendezvousLink>, SessionError> {
            Err(SessionError::Transport("offline".into()))
        }
    }

    struct DeadBackend;

    #[async_trait]
    impl PeerBackend for DeadBackend {
        async fn open(
            &self,
            endpoint: &playlink_core::SignalingEndpoint,
            _peer_id: &str,
        ) -> Result<Box<dyn PeerSession>, PeerError> {
            Err(PeerError::Network(format!("{} down", endpoint.host)))
        }
    }

    /// Host session that records the quality of every frame sent
    struct StreamSession {
        events: mpsc::UnboundedReceiver<PeerEvent>,
        frames: Arc<Mutex<Vec<EncodeQuality>>>,
    }

    #[async_trait]
    impl PeerSession for StreamSession {
        fn id(&self) -> &str {
            "host"
        }

        async fn next_event(&mut self) -> Option<PeerEvent> {
            self.events.recv().await
        }

        async fn connect_data(&mut self, _remote: &str) -> Result<(), PeerError> {
            Ok(())
        }

        async fn send_data(&mut self, _remote: &str, _payload: Bytes) -> Result<(), PeerError> {
            Ok(())
        }

        async fn call(&mut self, _remote: &str) -> Result<(), PeerError> {
            Ok(())
        }

        async fn answer(&mut self, _remote: &str) -> Result<(), PeerError> {
            Ok(())
        }

        async fn hang_up(&mut self, _remote: &str) {}

        async fn send_frame(&mut self, _remote: &str, frame: &MediaFrame) -> Result<(), PeerError> {
            self.frames.lock().push(frame.quality);
            Ok(())
        }

        async fn reconnect(&mut self) -> Result<(), PeerError> {
            Ok(())
        }

        fn close(&mut self) {}
    }

    /// Hands out a single `StreamSession`
    struct StreamBackend(Mutex<Option<StreamSession>>);

    #[async_trait]
    impl PeerBackend for StreamBackend {
        async fn open(
            &self,
            _endpoint: &SignalingEndpoint,
            _peer_id: &str,
        ) -> Result<Box<dyn PeerSession>, PeerError> {
            match self.0.lock().take() {
                Some(session) => Ok(Box::new(session)),
                None => Err(PeerError::Server("session already open".into())),
            }
        }
    }

    struct BlankSource;

    impl FrameSource for BlankSource {
        fn capture(&mut self, _quality: EncodeQuality) -> Option<Bytes> {
            Some(Bytes::from_static(&[0]))
        }
    }

    /// Host manager streaming to player `p1`, with the frames it sends
    async fn streaming_host(
        ctx: &ClientContext,
    ) -> (Arc<PeerConnectionManager>, Arc<Mutex<Vec<EncodeQuality>>>, mpsc::UnboundedSender<PeerEvent>) {
        let (event_tx, events) = mpsc::unbounded_channel();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let backend = StreamBackend(Mutex::new(Some(StreamSession {
            events,
            frames: frames.clone(),
        })));
        let manager = ctx.peer_manager(Arc::new(backend));
        let mut notices = manager.subscribe();

        manager.start_host("room", "alice").await.unwrap();
        event_tx
            .send(PeerEvent::DataOpened {
                remote: "p1".into(),
            })
            .unwrap();
        assert_eq!(
            notices.recv().await.unwrap(),
            PeerNotice::DataConnected {
                remote: "p1".into()
            }
        );
        assert!(manager.start_streaming(Box::new(BlankSource)));
        (manager, frames, event_tx)
    }

    fn context() -> ClientContext {
        ClientContext::with_connector(Config::default(), CorrelationId::new(), Arc::new(NoConnector))
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_managers_share_latch() {
        let ctx = context();
        let first = ctx.peer_manager(Arc::new(DeadBackend));
        let second = ctx.peer_manager(Arc::new(DeadBackend));

        assert_eq!(
            first.start_host("room", "alice").await.unwrap_err(),
            SessionError::PeerPermanentlyDisabled
        );
        assert!(ctx.latch().is_disabled());
        assert!(second.is_disabled());
        assert_eq!(
            second.start_player("room", "bob", "host-x").await.unwrap_err(),
            SessionError::PeerPermanentlyDisabled
        );
        assert_eq!(second.state(), PeerState::Idle);
    }

    #[tokio::test]
    async fn test_peer_frames_feed_quality_counter() {
        let ctx = context();
        let manager = ctx.peer_manager(Arc::new(DeadBackend));

        manager.record_frame();
        manager.record_frame();
        assert_eq!(ctx.quality().frame_counter().take(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_tune_applies_current_tier() {
        let ctx = context();
        ctx.quality().record_latency(400.0);
        assert_eq!(ctx.quality().tier(), QualityTier::Low);

        let (manager, frames, _events) = streaming_host(&ctx).await;
        ctx.auto_tune(&manager);
        tokio::time::sleep(Duration::from_millis(1001)).await;

        // Low tier streams 5 low-quality frames a second
        let sent = frames.lock().clone();
        assert_eq!(sent.len(), 5);
        assert!(sent.iter().all(|q| *q == EncodeQuality::Low));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_tune_follows_tier_change() {
        let ctx = context();
        let (manager, frames, _events) = streaming_host(&ctx).await;
        ctx.auto_tune(&manager);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(frames.lock().iter().all(|q| *q == EncodeQuality::High));
        assert!(!frames.lock().is_empty());

        ctx.quality().record_latency(400.0);
        frames.lock().clear();
        tokio::time::sleep(Duration::from_millis(1001)).await;

        let sent = frames.lock().clone();
        assert_eq!(sent.len(), 5);
        assert!(sent.iter().all(|q| *q == EncodeQuality::Low));
    }

    #[tokio::test]
    async fn test_restart_replaces_forwarders() {
        let mut config = Config::default();
        config.client.rendezvous_url = "ws://127.0.0.1:9".into();
        let ctx = ClientContext::with_connector(config, CorrelationId::new(), Arc::new(NoConnector));
        ctx.start(None).unwrap();

        // Stand-in forwarder whose abort is observable
        let (alive_tx, alive_rx) = oneshot::channel::<()>();
        ctx.forwarders.lock().push(tokio::spawn(async move {
            let _alive = alive_tx;
            std::future::pending::<()>().await
        }));

        ctx.start(None).unwrap();
        assert!(alive_rx.await.is_err());
        assert_eq!(ctx.forwarders.lock().len(), 2);

        ctx.shutdown().await;
        assert!(ctx.forwarders.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_without_connection() {
        let ctx = context();
        assert!(ctx.session().connect().await.is_err());
        ctx.shutdown().await;
        assert_eq!(ctx.session().state(), ConnectionState::Idle);
        assert!(!ctx.monitor().is_running());
    }
}

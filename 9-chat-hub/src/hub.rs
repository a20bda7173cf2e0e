use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    binding::BinaryCorrelator,
    broadcast::Broadcaster,
    config::{HubConfig, ReclaimPolicy},
    message::ServerEvent,
    pool::{ShutdownReport, TaskPool},
    registry::{ConnectionId, ConnectionRegistry, PeerLink},
    router::Router,
    upload::UploadManager,
};

/// Owns the registry and every per-connection store, and drives the
/// connection lifecycle for whatever transport sits in front of it.
pub struct Hub {
    config: HubConfig,
    registry: Arc<ConnectionRegistry>,
    correlator: Arc<BinaryCorrelator>,
    uploads: Arc<UploadManager>,
    pool: Arc<TaskPool>,
    broadcaster: Broadcaster,
    router: Router,
    sweeper: CancellationToken,
}

impl Hub {
    /// Must be called inside a tokio runtime: the task pool and the upload
    /// sweeper are spawned here.
    pub fn new(config: HubConfig) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        let correlator = Arc::new(BinaryCorrelator::new());
        let uploads = Arc::new(UploadManager::new(config.upload_dir.clone()));
        let pool = Arc::new(TaskPool::new(config.workers));
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let router = Router::new(
            broadcaster.clone(),
            Arc::clone(&correlator),
            Arc::clone(&uploads),
            Arc::clone(&pool),
            config.pdf_delay,
        );

        let sweeper = CancellationToken::new();
        if let ReclaimPolicy::Sweep { interval, grace } = config.reclaim {
            tokio::spawn(sweep_abandoned_uploads(
                Arc::clone(&registry),
                Arc::clone(&uploads),
                interval,
                grace,
                sweeper.clone(),
            ));
        }

        Arc::new(Self {
            config,
            registry,
            correlator,
            uploads,
            pool,
            broadcaster,
            router,
            sweeper,
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn uploads(&self) -> &UploadManager {
        &self.uploads
    }

    pub fn pool(&self) -> &TaskPool {
        &self.pool
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_connected(&self, conn: ConnectionId) -> bool {
        self.registry.contains(conn)
    }

    /// Registers a new peer. The caller writes the frames arriving on the
    /// link's outbox and stops once the link's `closed` token fires. After
    /// shutdown has begun the link comes back already closed.
    pub fn connect(&self) -> PeerLink {
        let link = self.registry.open(self.config.peer_queue);
        if link.closed.is_cancelled() {
            warn!(conn = %link.id, "refusing connection, hub is shutting down");
        } else {
            info!(conn = %link.id, total = self.registry.len(), "client connected");
        }
        link
    }

    pub fn is_shutting_down(&self) -> bool {
        self.registry.is_closed()
    }

    pub async fn handle_text(&self, conn: ConnectionId, raw: &str) {
        self.router.route_text(conn, raw).await;
    }

    pub async fn handle_binary(&self, conn: ConnectionId, bytes: &[u8]) {
        self.router.route_binary(conn, bytes).await;
    }

    pub fn broadcast(&self, event: &ServerEvent) -> usize {
        self.broadcaster.broadcast(event)
    }

    /// Idempotent. Uploads the connection owned are left for the reclamation
    /// policy unless it says to drop them right away.
    pub async fn disconnect(&self, conn: ConnectionId) {
        if let Some(peer) = self.registry.unregister(conn) {
            peer.close();
            info!(%conn, total = self.registry.len(), "client disconnected");
        }
        self.correlator.release(conn);

        if self.config.reclaim == ReclaimPolicy::OnDisconnect {
            let reclaimed = self.uploads.reclaim_owned_by(conn).await;
            if reclaimed > 0 {
                info!(%conn, reclaimed, "dropped uploads of closed connection");
            }
        }
    }

    /// Runs one reclamation pass regardless of the configured trigger.
    pub async fn reclaim_abandoned(&self, grace: Duration) -> usize {
        let registry = &self.registry;
        self.uploads
            .reclaim_orphans(|owner| registry.contains(owner), grace)
            .await
    }

    /// Stops admitting peers, drains background work within the configured
    /// grace period, stops the sweeper, then closes every peer. Partial
    /// uploads cannot be resumed after this, so their scratch files go too.
    pub async fn shutdown(&self) -> ShutdownReport {
        info!("hub shutting down");
        self.registry.close();
        let report = self.pool.shutdown(self.config.shutdown_grace).await;
        self.sweeper.cancel();

        for peer in self.registry.drain() {
            self.correlator.release(peer.id());
            peer.close();
        }
        let dropped_uploads = self.uploads.abort_all().await;
        info!(
            drained = report.drained,
            cancelled = report.cancelled,
            discarded = report.discarded,
            dropped_uploads,
            "hub stopped"
        );
        report
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

async fn sweep_abandoned_uploads(
    registry: Arc<ConnectionRegistry>,
    uploads: Arc<UploadManager>,
    interval: Duration,
    grace: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval.max(MIN_SWEEP_INTERVAL));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let reclaimed = uploads
                    .reclaim_orphans(|owner| registry.contains(owner), grace)
                    .await;
                debug!(reclaimed, pending = uploads.len(), "upload sweep finished");
            }
        }
    }
}

use std::{path::PathBuf, time::Duration};

/// How uploads left behind by a closed connection get cleaned up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimPolicy {
    /// Reclaim a connection's uploads as soon as it closes.
    OnDisconnect,
    /// Every `interval`, reclaim uploads whose owner is gone and that have
    /// been idle for at least `grace`.
    Sweep { interval: Duration, grace: Duration },
}

impl Default for ReclaimPolicy {
    fn default() -> Self {
        ReclaimPolicy::Sweep {
            interval: Duration::from_secs(30),
            grace: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Directory that receives one scratch file per upload.
    pub upload_dir: PathBuf,
    /// Maximum number of background tasks running at once.
    pub workers: usize,
    /// Simulated document rendering time.
    pub pdf_delay: Duration,
    /// How long shutdown waits for background tasks before cancelling them.
    pub shutdown_grace: Duration,
    /// Outbound frames buffered per peer before it is treated as dead.
    pub peer_queue: usize,
    pub reclaim: ReclaimPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            upload_dir: std::env::temp_dir(),
            workers: 4,
            pdf_delay: Duration::from_secs(3),
            shutdown_grace: Duration::from_secs(3),
            peer_queue: 256,
            reclaim: ReclaimPolicy::default(),
        }
    }
}

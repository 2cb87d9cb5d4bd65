//! Background heartbeat and timeout-detection loops for the local node.
//!
//! [`Membership`] itself owns no timers; this monitor supplies them. On
//! [`start`](HeartbeatMonitor::start) it joins the local node, then runs
//! two tokio loops until shutdown:
//!
//! - a heartbeat loop every `heartbeat_interval`,
//! - a detection loop every `heartbeat_timeout / 2` invoking
//!   [`Membership::detect_timeouts`].
//!
//! Failures inside either loop are logged and the loop keeps going; a
//! node that cannot reach the store simply stops refreshing its record and
//! is suspected by its peers. [`shutdown`](HeartbeatMonitor::shutdown)
//! stops both loops and deregisters the node via `leave`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::store::StoreResult;

use super::membership::{ClusterNode, Membership};

/// Drives join/heartbeat/detection for one local node.
pub struct HeartbeatMonitor {
    membership: Arc<Membership>,
    node: ClusterNode,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl HeartbeatMonitor {
    /// Create a monitor for the given local node.
    pub fn new(membership: Arc<Membership>, node: ClusterNode) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            membership,
            node,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Join the cluster and start the background loops.
    ///
    /// Idempotent: a second call while running is a no-op.
    pub async fn start(&self) -> StoreResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(error) = self.membership.join(self.node.clone()).await {
            self.running.store(false, Ordering::SeqCst);
            return Err(error);
        }

        let heartbeat_task = self.spawn_loop(
            "heartbeat",
            self.membership.config().heartbeat_interval(),
            {
                let membership = Arc::clone(&self.membership);
                let node_id = self.node.node_id.clone();
                move || {
                    let membership = Arc::clone(&membership);
                    let node_id = node_id.clone();
                    async move {
                        if let Err(error) = membership.heartbeat(&node_id).await {
                            warn!(%node_id, %error, "Heartbeat failed");
                        }
                    }
                }
            },
        );

        let detection_task = self.spawn_loop(
            "timeout-detection",
            self.membership.config().heartbeat_timeout() / 2,
            {
                let membership = Arc::clone(&self.membership);
                move || {
                    let membership = Arc::clone(&membership);
                    async move {
                        if let Err(error) = membership.detect_timeouts().await {
                            warn!(%error, "Timeout detection sweep failed");
                        }
                    }
                }
            },
        );

        let mut tasks = self.tasks.lock().expect("task registry poisoned");
        tasks.push(heartbeat_task);
        tasks.push(detection_task);
        Ok(())
    }

    /// Stop the loops and deregister the local node.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let _ = self.shutdown.send(());
        let handles: Vec<_> = {
            let mut tasks = self.tasks.lock().expect("task registry poisoned");
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }

        if let Err(error) = self.membership.leave(&self.node.node_id).await {
            warn!(node_id = %self.node.node_id, %error, "Leave failed during shutdown");
        }
    }

    /// Whether the loops are currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn spawn_loop<F, Fut>(
        &self,
        name: &'static str,
        period: std::time::Duration,
        mut tick: F,
    ) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so the loop waits a
            // full period after join.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => tick().await,
                    _ = shutdown.recv() => {
                        debug!(task = name, "Loop received shutdown signal");
                        break;
                    }
                }
            }
        })
    }
}

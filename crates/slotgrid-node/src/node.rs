//! Node — claims slots in the coordination store and keeps them alive.
//!
//! Placement follows a hesitate-then-volunteer protocol:
//!
//! 1. Wait a contention-scaled delay while watching the slot key. Any
//!    event on the key means someone else is already on it ("stolen").
//! 2. Otherwise try an atomic create-if-absent with a TTL of three
//!    heartbeat intervals. Losing that race drops the request.
//! 3. On success register the slot locally; the heartbeat loop renews
//!    every registered slot until the node stops or loses it.
//!
//! No failure here is fatal. A dropped request is retried when the slot
//! is next deleted or expires and the resurrector resubmits it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use slotgrid_store::{CoordinationStore, NodeId, SlotClaim};

use crate::error::NodeResult;
use crate::fault::{FaultPolicy, NeverFail};
use crate::hesitation::Hesitation;
use crate::instance::Instance;
use crate::registry::Registry;

/// Node construction parameters.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Interval between lease renewals. Zero disables heartbeats and
    /// writes claims without a TTL.
    pub heartbeat_interval: Duration,
    pub hesitation: Hesitation,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            hesitation: Hesitation::default(),
        }
    }
}

impl NodeConfig {
    /// TTL attached to every claim: three heartbeat intervals.
    pub fn lease_ttl(&self) -> Option<Duration> {
        (!self.heartbeat_interval.is_zero()).then(|| self.heartbeat_interval * 3)
    }
}

/// Outcome of a single placement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// This node now owns the slot.
    Claimed,
    /// Activity on the slot key was seen while hesitating.
    Stolen,
    /// The slot already existed when we volunteered.
    Contended,
    /// The store could not be reached.
    Failed,
}

/// Result of one heartbeat tick.
#[derive(Debug, Default, Clone)]
pub struct HeartbeatReport {
    pub renewed: usize,
    /// Slots whose key vanished or changed owner; dropped from the registry.
    pub lost: Vec<Instance>,
    /// Renewals that hit a store error and will be retried next tick.
    pub failed: usize,
}

/// Lease state shared between the node and its background tasks.
struct Claims {
    node_id: NodeId,
    /// Encoded `SlotClaim` written under every slot we own.
    value: String,
    ttl: Option<Duration>,
    store: Arc<dyn CoordinationStore>,
    registry: Arc<Registry>,
    /// Serializes claim+register against renew+unregister.
    write_lock: tokio::sync::Mutex<()>,
}

impl Claims {
    async fn renew_all(&self) -> HeartbeatReport {
        let mut report = HeartbeatReport::default();

        for instance in self.registry.all_instances() {
            let key = instance.store_key();
            let _guard = self.write_lock.lock().await;
            match self.store.renew(&key, &self.value, self.ttl).await {
                Ok(true) => report.renewed += 1,
                Ok(false) => {
                    self.registry.unregister(&instance.app, instance.index);
                    warn!(node_id = %self.node_id, %instance, "lease lost");
                    report.lost.push(instance);
                }
                Err(e) => {
                    warn!(node_id = %self.node_id, %instance, error = %e, "lease renewal failed");
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Forget `instance` and delete its key if it still carries our claim.
    async fn release(&self, instance: &Instance) {
        self.registry.unregister(&instance.app, instance.index);
        match self.store.delete_if(&instance.store_key(), &self.value).await {
            Ok(deleted) => {
                info!(node_id = %self.node_id, %instance, deleted, "slot released")
            }
            Err(e) => {
                warn!(node_id = %self.node_id, %instance, error = %e, "failed to delete slot; lease will lapse")
            }
        }
    }
}

/// A fleet member that claims and heartbeats slots.
pub struct Node {
    config: NodeConfig,
    claims: Arc<Claims>,
    fault_policy: Arc<dyn FaultPolicy>,
    shutdown_tx: watch::Sender<bool>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    /// Timers for instances doomed by the fault policy.
    reapers: Mutex<JoinSet<()>>,
}

impl Node {
    /// Create a node with a fresh random identity.
    pub fn new(store: Arc<dyn CoordinationStore>, config: NodeConfig) -> NodeResult<Self> {
        let node_id = uuid::Uuid::new_v4().to_string();
        let value = SlotClaim::new(node_id.clone()).encode()?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            claims: Arc::new(Claims {
                node_id,
                value,
                ttl: config.lease_ttl(),
                store,
                registry: Arc::new(Registry::new()),
                write_lock: tokio::sync::Mutex::new(()),
            }),
            config,
            fault_policy: Arc::new(NeverFail),
            shutdown_tx,
            heartbeat: Mutex::new(None),
            reapers: Mutex::new(JoinSet::new()),
        })
    }

    /// Replace the fault-injection policy.
    pub fn with_fault_policy(mut self, policy: Arc<dyn FaultPolicy>) -> Self {
        self.fault_policy = policy;
        self
    }

    /// Spawn the heartbeat loop (if enabled) and share the node.
    pub fn start(self) -> Arc<Self> {
        let node = Arc::new(self);
        let interval = node.config.heartbeat_interval;

        if !interval.is_zero() {
            let claims = node.claims.clone();
            let shutdown = node.shutdown_tx.subscribe();
            let handle = tokio::spawn(run_heartbeat(claims, interval, shutdown));
            *node.heartbeat.lock() = Some(handle);
        }

        info!(
            node_id = %node.id(),
            heartbeat_interval = ?interval,
            lease_ttl = ?node.claims.ttl,
            "node started"
        );
        node
    }

    pub fn id(&self) -> &str {
        &self.claims.node_id
    }

    pub fn registry(&self) -> &Registry {
        &self.claims.registry
    }

    pub fn lease_ttl(&self) -> Option<Duration> {
        self.claims.ttl
    }

    /// Try to take ownership of `instance`'s slot.
    pub async fn start_instance(&self, mut instance: Instance) -> Placement {
        let node_id = self.id();
        let key = instance.store_key();

        match self.hesitate(&instance, &key).await {
            Ok(false) => {}
            Ok(true) => {
                info!(%node_id, %instance, "slot taken while hesitating");
                return Placement::Stolen;
            }
            Err(e) => {
                warn!(%node_id, %instance, error = %e, "could not watch slot");
                return Placement::Failed;
            }
        }

        let guard = self.claims.write_lock.lock().await;
        match self
            .claims
            .store
            .create_if_absent(&key, &self.claims.value, self.claims.ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(%node_id, %instance, "slot already claimed; dropped");
                return Placement::Contended;
            }
            Err(e) => {
                warn!(%node_id, %instance, error = %e, "claim failed");
                return Placement::Failed;
            }
        }

        let doom = self.fault_policy.doom(&instance);
        instance.marked_for_death = doom.is_some();
        self.claims.registry.register(instance.clone());
        drop(guard);

        info!(%node_id, %instance, doomed = doom.is_some(), "slot claimed");

        if let Some(delay) = doom {
            self.schedule_death(instance, delay);
        }
        Placement::Claimed
    }

    /// Give up a slot: forget it locally and delete its key if we still
    /// hold it.
    pub async fn stop_instance(&self, instance: &Instance) {
        self.claims.release(instance).await;
    }

    /// Run one lease-renewal pass immediately.
    pub async fn heartbeat(&self) -> HeartbeatReport {
        self.claims.renew_all().await
    }

    /// Render the registry as one glyph per instance, doomed ones in a
    /// shorter block.
    pub fn render_registry(&self) -> String {
        let mut instances = self.claims.registry.all_instances();
        instances.sort_by(|a, b| (&a.app, a.index).cmp(&(&b.app, b.index)));
        instances
            .iter()
            .map(|i| if i.marked_for_death { '▆' } else { '▇' })
            .collect()
    }

    pub fn log_registry(&self) {
        let registry = &self.claims.registry;
        info!(
            node_id = %self.id(),
            pid = std::process::id(),
            running = registry.len(),
            apps = ?registry.counts(),
            "running {}",
            self.render_registry()
        );
    }

    /// Stop heartbeating and cancel pending deaths. Claims lapse by TTL.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.heartbeat.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.reapers.lock().abort_all();
        info!(node_id = %self.id(), "node stopped");
    }

    /// Wait out the hesitation delay, racing it against any event on the
    /// slot key. Returns `true` if the slot was touched first.
    async fn hesitate(&self, instance: &Instance, key: &str) -> NodeResult<bool> {
        let count = self.claims.registry.instances_of(&instance.app).len();
        let delay = self.config.hesitation.delay_for(count);
        debug!(node_id = %self.id(), %instance, count, ?delay, "hesitating");

        let now = Instant::now();
        let deadline = now
            .checked_add(delay)
            .unwrap_or_else(|| now + Hesitation::MAX_DELAY);
        let mut watch = self.claims.store.watch(key, None).await?;

        let stolen = tokio::select! {
            biased;
            event = watch.next() => match event {
                Ok(event) => {
                    debug!(node_id = %self.id(), %instance, action = %event.action, "slot activity");
                    true
                }
                Err(e) => {
                    debug!(node_id = %self.id(), %instance, error = %e, "slot watch ended early");
                    tokio::time::sleep_until(deadline).await;
                    false
                }
            },
            _ = tokio::time::sleep_until(deadline) => false,
        };

        Ok(stolen)
    }

    fn schedule_death(&self, instance: Instance, delay: Duration) {
        let claims = self.claims.clone();
        let mut reapers = self.reapers.lock();
        while reapers.try_join_next().is_some() {}
        reapers.spawn(async move {
            tokio::time::sleep(delay).await;
            if !claims.registry.contains(&instance.app, instance.index) {
                debug!(node_id = %claims.node_id, %instance, "doomed instance already gone");
                return;
            }
            warn!(node_id = %claims.node_id, %instance, "doomed instance crashing");
            claims.release(&instance).await;
        });
    }
}

async fn run_heartbeat(claims: Arc<Claims>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    debug!(node_id = %claims.node_id, ?interval, "heartbeat loop starting");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let report = claims.renew_all().await;
                debug!(
                    node_id = %claims.node_id,
                    renewed = report.renewed,
                    lost = report.lost.len(),
                    failed = report.failed,
                    "heartbeat"
                );
            }
            _ = shutdown.changed() => {
                debug!(node_id = %claims.node_id, "heartbeat loop shutting down");
                break;
            }
        }
    }
}

//! Starter — serializes start requests per app.
//!
//! Every app gets its own pipeline: a capacity-one channel served by a
//! single dispatcher task that hands one instance at a time to the
//! [`Placer`] and waits for it to finish before pulling the next. A burst
//! of starts for one app therefore trickles into the claim protocol
//! instead of hitting it all at once, while different apps proceed in
//! parallel.
//!
//! A dispatcher that sees no request for `idle_timeout` retires and
//! removes its pipeline; the next `start` for that app creates a new one.
//! Creation, lookup, and removal all happen under one lock. Enqueueing
//! happens outside it, but a sender registers itself as pending while
//! still holding the lock, and a dispatcher only retires when nothing is
//! pending or buffered.
//!
//! `start` returns once its request is buffered in the channel, not when
//! the dispatcher picks it up. With capacity one a caller still waits for
//! the previous request to be taken, so at most one request per app sits
//! between a caller and the dispatcher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use slotgrid_node::Instance;

use crate::placer::{Placer, StartSink};

/// Starter construction parameters.
#[derive(Debug, Clone)]
pub struct StarterConfig {
    /// How long a pipeline may sit idle before it is torn down.
    pub idle_timeout: Duration,
}

impl Default for StarterConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10),
        }
    }
}

/// One app's queue and its dispatcher.
struct Pipeline {
    generation: u64,
    tx: mpsc::Sender<Instance>,
    /// Senders that looked this pipeline up and have not finished sending.
    pending: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct PipelineTable {
    pipelines: HashMap<String, Pipeline>,
    next_generation: u64,
    closed: bool,
}

/// Decrements a pipeline's pending count when the send completes or is
/// abandoned.
struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

enum IdleOutcome {
    Retired,
    Resume(Option<Instance>),
}

/// Per-app start request serializer.
pub struct Starter {
    placer: Arc<dyn Placer>,
    idle_timeout: Duration,
    table: Arc<Mutex<PipelineTable>>,
}

impl Starter {
    pub fn new(placer: Arc<dyn Placer>, config: StarterConfig) -> Self {
        Self {
            placer,
            idle_timeout: config.idle_timeout,
            table: Arc::new(Mutex::new(PipelineTable::default())),
        }
    }

    /// Queue a start for `app`/`index`.
    ///
    /// Suspends until the app's dispatcher accepts the request. Requests
    /// made after [`shutdown`](Self::shutdown) are dropped.
    pub async fn start(&self, app: &str, index: u32) {
        let mut instance = Instance::new(app, index);

        loop {
            let Some((tx, _pending)) = self.acquire(app) else {
                warn!(%app, index, "starter shut down; start request dropped");
                return;
            };

            match tx.send(instance).await {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    debug!(%app, index, "pipeline closed mid-send; retrying");
                    instance = returned;
                }
            }
        }
    }

    /// Apps that currently have a live pipeline, sorted.
    pub fn active_pipelines(&self) -> Vec<String> {
        let table = self.table.lock();
        let mut apps: Vec<String> = table.pipelines.keys().cloned().collect();
        apps.sort();
        apps
    }

    pub fn has_pipeline(&self, app: &str) -> bool {
        self.table.lock().pipelines.contains_key(app)
    }

    /// Close every pipeline and wait for the dispatchers to drain.
    pub async fn shutdown(&self) {
        let pipelines: Vec<(String, Pipeline)> = {
            let mut table = self.table.lock();
            table.closed = true;
            table.pipelines.drain().collect()
        };

        for (app, pipeline) in pipelines {
            let Pipeline { tx, handle, .. } = pipeline;
            drop(tx);
            if let Err(e) = handle.await {
                warn!(%app, error = %e, "pipeline dispatcher ended abnormally");
            }
        }
        info!("starter stopped");
    }

    /// Look up (or create) the pipeline for `app` and mark a send pending.
    fn acquire(&self, app: &str) -> Option<(mpsc::Sender<Instance>, PendingGuard)> {
        let mut table = self.table.lock();
        if table.closed {
            return None;
        }

        // A dispatcher that died without retiring leaves a closed channel.
        let stale = table
            .pipelines
            .get(app)
            .is_some_and(|p| p.tx.is_closed());
        if stale {
            warn!(%app, "replacing dead pipeline");
            table.pipelines.remove(app);
        }

        if !table.pipelines.contains_key(app) {
            let generation = table.next_generation;
            table.next_generation += 1;
            let pipeline = self.spawn_pipeline(app, generation);
            table.pipelines.insert(app.to_string(), pipeline);
            info!(%app, generation, "pipeline created");
        }

        let pipeline = table.pipelines.get(app)?;
        pipeline.pending.fetch_add(1, Ordering::SeqCst);
        Some((pipeline.tx.clone(), PendingGuard(pipeline.pending.clone())))
    }

    fn spawn_pipeline(&self, app: &str, generation: u64) -> Pipeline {
        let (tx, rx) = mpsc::channel(1);
        let pending = Arc::new(AtomicUsize::new(0));

        let handle = tokio::spawn(run_dispatcher(
            app.to_string(),
            generation,
            rx,
            self.placer.clone(),
            self.table.clone(),
            self.idle_timeout,
        ));

        Pipeline {
            generation,
            tx,
            pending,
            handle,
        }
    }
}

#[async_trait]
impl StartSink for Starter {
    async fn start(&self, app: &str, index: u32) {
        Starter::start(self, app, index).await;
    }
}

/// Serve one app's pipeline until it idles out or the starter closes.
async fn run_dispatcher(
    app: String,
    generation: u64,
    mut rx: mpsc::Receiver<Instance>,
    placer: Arc<dyn Placer>,
    table: Arc<Mutex<PipelineTable>>,
    idle_timeout: Duration,
) {
    debug!(%app, generation, "dispatcher starting");

    loop {
        let instance = match tokio::time::timeout(idle_timeout, rx.recv()).await {
            Ok(Some(instance)) => instance,
            Ok(None) => {
                debug!(%app, generation, "pipeline closed");
                break;
            }
            Err(_) => match try_retire(&table, &app, generation, &mut rx) {
                IdleOutcome::Retired => {
                    info!(%app, generation, "pipeline expired");
                    break;
                }
                IdleOutcome::Resume(Some(instance)) => instance,
                IdleOutcome::Resume(None) => continue,
            },
        };

        debug!(%app, index = instance.index, "dispatching start");
        let placement = placer.place(instance).await;
        debug!(%app, ?placement, "start dispatched");
    }
}

/// Decide, under the table lock, whether an idle dispatcher may retire.
fn try_retire(
    table: &Mutex<PipelineTable>,
    app: &str,
    generation: u64,
    rx: &mut mpsc::Receiver<Instance>,
) -> IdleOutcome {
    let mut table = table.lock();

    let current = table
        .pipelines
        .get(app)
        .filter(|p| p.generation == generation);
    let Some(pipeline) = current else {
        // Already removed by shutdown or replaced.
        return IdleOutcome::Retired;
    };

    if pipeline.pending.load(Ordering::SeqCst) > 0 {
        return IdleOutcome::Resume(None);
    }
    if let Ok(instance) = rx.try_recv() {
        return IdleOutcome::Resume(Some(instance));
    }

    table.pipelines.remove(app);
    IdleOutcome::Retired
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use slotgrid_node::Placement;

    use super::*;

    /// Records every placement and the peak number in flight per app.
    #[derive(Default)]
    struct RecordingPlacer {
        seen: Mutex<Vec<Instance>>,
        in_flight: Mutex<HashMap<String, usize>>,
        peak: AtomicUsize,
        delay: Duration,
        slow_app: Option<(String, Duration)>,
    }

    impl RecordingPlacer {
        fn with_delay(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                ..Default::default()
            })
        }

        fn indices(&self, app: &str) -> Vec<u32> {
            self.seen
                .lock()
                .iter()
                .filter(|i| i.app == app)
                .map(|i| i.index)
                .collect()
        }
    }

    #[async_trait]
    impl Placer for RecordingPlacer {
        async fn place(&self, instance: Instance) -> Placement {
            {
                let mut in_flight = self.in_flight.lock();
                let n = in_flight.entry(instance.app.clone()).or_default();
                *n += 1;
                self.peak.fetch_max(*n, Ordering::SeqCst);
            }

            let delay = match &self.slow_app {
                Some((app, d)) if *app == instance.app => *d,
                _ => self.delay,
            };
            tokio::time::sleep(delay).await;

            *self.in_flight.lock().get_mut(&instance.app).unwrap() -= 1;
            self.seen.lock().push(instance);
            Placement::Claimed
        }
    }

    fn starter(placer: Arc<RecordingPlacer>, idle_timeout: Duration) -> Arc<Starter> {
        Arc::new(Starter::new(placer, StarterConfig { idle_timeout }))
    }

    async fn wait_for(placer: &RecordingPlacer, count: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while placer.seen.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("placements did not arrive");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn single_caller_preserves_order() {
        let placer = RecordingPlacer::with_delay(Duration::from_millis(1));
        let starter = starter(placer.clone(), Duration::from_secs(10));

        for i in 0..50 {
            starter.start("app1", i).await;
        }
        wait_for(&placer, 50).await;

        assert_eq!(placer.indices("app1"), (0..50).collect::<Vec<_>>());
        assert_eq!(placer.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_callers_are_serialized() {
        let placer = RecordingPlacer::with_delay(Duration::from_millis(1));
        let starter = starter(placer.clone(), Duration::from_secs(10));

        let callers: Vec<_> = (0..5u32)
            .map(|caller| {
                let starter = starter.clone();
                tokio::spawn(async move {
                    for i in (caller..50).step_by(5) {
                        starter.start("app1", i).await;
                    }
                })
            })
            .collect();
        for caller in callers {
            caller.await.unwrap();
        }
        wait_for(&placer, 50).await;

        let seen = placer.indices("app1");
        assert_eq!(seen.len(), 50);
        assert_eq!(placer.peak.load(Ordering::SeqCst), 1);

        // Each caller's own requests arrive in the order it sent them.
        for caller in 0..5u32 {
            let mine: Vec<u32> = seen.iter().copied().filter(|i| i % 5 == caller).collect();
            let expected: Vec<u32> = (caller..50).step_by(5).collect();
            assert_eq!(mine, expected);
        }
        assert_eq!(starter.active_pipelines(), vec!["app1".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn apps_run_in_parallel() {
        let placer = Arc::new(RecordingPlacer {
            slow_app: Some(("slow".to_string(), Duration::from_millis(500))),
            ..Default::default()
        });
        let starter = starter(placer.clone(), Duration::from_secs(10));

        starter.start("slow", 0).await;
        starter.start("fast", 0).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(placer.indices("fast"), vec![0]);
        assert!(placer.indices("slow").is_empty());
        assert_eq!(starter.active_pipelines(), vec!["fast", "slow"]);
    }

    #[tokio::test]
    async fn idle_pipeline_is_torn_down_and_recreated() {
        let placer = RecordingPlacer::with_delay(Duration::ZERO);
        let starter = starter(placer.clone(), Duration::from_millis(100));

        starter.start("app1", 0).await;
        assert!(starter.has_pipeline("app1"));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!starter.has_pipeline("app1"));

        starter.start("app1", 1).await;
        assert!(starter.has_pipeline("app1"));
        wait_for(&placer, 2).await;
        assert_eq!(placer.indices("app1"), vec![0, 1]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn retirement_never_loses_or_doubles_requests() {
        let placer = RecordingPlacer::with_delay(Duration::ZERO);
        let starter = starter(placer.clone(), Duration::from_millis(1));

        let callers: Vec<_> = (0..4u32)
            .map(|caller| {
                let starter = starter.clone();
                tokio::spawn(async move {
                    for i in 0..25u32 {
                        starter.start("app1", caller * 100 + i).await;
                        if i % 3 == 0 {
                            tokio::time::sleep(Duration::from_millis(2)).await;
                        }
                    }
                })
            })
            .collect();
        for caller in callers {
            caller.await.unwrap();
        }
        wait_for(&placer, 100).await;

        let mut seen = placer.indices("app1");
        assert_eq!(seen.len(), 100);
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 100);
        assert_eq!(placer.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_drops_later_requests() {
        let placer = RecordingPlacer::with_delay(Duration::ZERO);
        let starter = starter(placer.clone(), Duration::from_secs(10));

        starter.start("app1", 0).await;
        starter.shutdown().await;
        assert!(starter.active_pipelines().is_empty());
        assert_eq!(placer.indices("app1"), vec![0]);

        starter.start("app1", 1).await;
        assert!(!starter.has_pipeline("app1"));
        assert_eq!(placer.indices("app1"), vec![0]);
    }
}

//! Fleet assembly.
//!
//! An [`Agent`] is everything one fleet member runs: a [`Node`] that claims
//! slots, a [`Starter`] that serializes start requests per app, a
//! [`Resurrector`] that resubmits lost slots, and a bus listener that feeds
//! incoming requests to the starter. A [`Fleet`] is a set of agents sharing
//! one store and one bus.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use slotgrid_hero::{Resurrector, ResurrectorConfig};
use slotgrid_node::{FaultPolicy, NeverFail, Node, NodeConfig, SLOT_PREFIX};
use slotgrid_starter::{Placer, StartSink, Starter, StarterConfig};
use slotgrid_store::{CoordinationStore, SlotClaim};

use crate::config::{SlotdConfig, DEFAULT_TOPIC};
use crate::ingress::{self, LocalBus};

/// Settings shared by every agent of a fleet.
#[derive(Clone)]
pub struct FleetConfig {
    pub node: NodeConfig,
    pub starter: StarterConfig,
    pub resurrector: ResurrectorConfig,
    pub fault_policy: Arc<dyn FaultPolicy>,
    pub topic: String,
    /// How often each agent logs its registry; `None` disables it.
    pub log_interval: Option<Duration>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            starter: StarterConfig::default(),
            resurrector: ResurrectorConfig::default(),
            fault_policy: Arc::new(NeverFail),
            topic: DEFAULT_TOPIC.to_string(),
            log_interval: Some(Duration::from_secs(1)),
        }
    }
}

impl FleetConfig {
    pub fn from_config(config: &SlotdConfig) -> anyhow::Result<Self> {
        Ok(Self {
            node: config.node_config()?,
            starter: config.starter_config()?,
            resurrector: config.resurrector_config()?,
            fault_policy: config.fault_policy()?,
            topic: config.topic(),
            ..Self::default()
        })
    }
}

/// One fleet member.
pub struct Agent {
    node: Arc<Node>,
    starter: Arc<Starter>,
    shutdown_tx: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl Agent {
    /// Start a node and everything around it.
    ///
    /// The bus subscription and the resurrector's watch cursor are both
    /// taken before this returns, so requests published and slots lost
    /// afterwards are never missed.
    pub async fn launch(
        store: Arc<dyn CoordinationStore>,
        bus: &LocalBus,
        config: &FleetConfig,
    ) -> anyhow::Result<Self> {
        let node = Node::new(store.clone(), config.node.clone())?
            .with_fault_policy(config.fault_policy.clone())
            .start();

        let placer: Arc<dyn Placer> = node.clone();
        let starter = Arc::new(Starter::new(placer, config.starter.clone()));
        let sink: Arc<dyn StartSink> = starter.clone();

        let mut resurrector_config = config.resurrector.clone();
        if resurrector_config.from_cursor.is_none() {
            resurrector_config.from_cursor = Some(store.current_cursor().await?);
        }
        let resurrector = Resurrector::new(store, sink.clone(), resurrector_config);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        let resurrector_shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            resurrector.run(resurrector_shutdown).await;
        });

        tasks.spawn(ingress::listen(
            bus.subscribe(&config.topic),
            sink,
            shutdown_rx.clone(),
        ));

        if let Some(period) = config.log_interval {
            tasks.spawn(log_registry(node.clone(), period, shutdown_rx));
        }

        info!(node_id = %node.id(), topic = %config.topic, "agent launched");

        Ok(Self {
            node,
            starter,
            shutdown_tx,
            tasks,
        })
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn starter(&self) -> &Arc<Starter> {
        &self.starter
    }

    /// Stop listening and resurrecting, drain the starter, then stop the
    /// node. Claimed slots are left to lapse.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                warn!(node_id = %self.node.id(), error = %e, "agent task failed");
            }
        }
        self.starter.shutdown().await;
        self.node.shutdown().await;
    }
}

async fn log_registry(node: Arc<Node>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => node.log_registry(),
            _ = shutdown.changed() => break,
        }
    }
}

/// A set of agents sharing one store and one bus.
pub struct Fleet {
    store: Arc<dyn CoordinationStore>,
    bus: LocalBus,
    agents: Vec<Agent>,
}

impl Fleet {
    pub async fn launch(
        size: usize,
        store: Arc<dyn CoordinationStore>,
        bus: LocalBus,
        config: &FleetConfig,
    ) -> anyhow::Result<Self> {
        let mut agents = Vec::with_capacity(size);
        for _ in 0..size {
            agents.push(Agent::launch(store.clone(), &bus, config).await?);
        }
        info!(size, "fleet launched");

        Ok(Self { store, bus, agents })
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn bus(&self) -> &LocalBus {
        &self.bus
    }

    /// Count live slot claims per owning node, as recorded in the store.
    pub async fn ownership(&self) -> anyhow::Result<BTreeMap<String, usize>> {
        let mut owners = BTreeMap::new();
        for (key, value) in self.store.list(SLOT_PREFIX).await? {
            match SlotClaim::decode(&value) {
                Ok(claim) => *owners.entry(claim.node_id).or_insert(0) += 1,
                Err(e) => warn!(%key, error = %e, "unreadable slot claim"),
            }
        }
        Ok(owners)
    }

    pub async fn shutdown(self) {
        for agent in self.agents {
            agent.shutdown().await;
        }
        info!("fleet stopped");
    }
}

//! Load generator.
//!
//! Publishes a start request for every missing slot of one app, then polls
//! the store until all of them are claimed and reports how long it took.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use anyhow::bail;
use tracing::{info, warn};

use slotgrid_node::{decode_slot_key, SLOT_PREFIX};
use slotgrid_store::CoordinationStore;

use crate::config::DEFAULT_TOPIC;
use crate::ingress::{LocalBus, StartRequest};

#[derive(Debug, Clone)]
pub struct SpamConfig {
    pub app: String,
    pub instances: u32,
    pub topic: String,
    pub poll_interval: Duration,
    /// Give up if the slots are not all claimed within this long.
    pub deadline: Option<Duration>,
}

impl SpamConfig {
    /// Defaults to a random app id and 100 instances.
    pub fn new(app: Option<String>, instances: u32) -> Self {
        Self {
            app: app.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            instances,
            topic: DEFAULT_TOPIC.to_string(),
            poll_interval: Duration::from_secs(1),
            deadline: None,
        }
    }
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self::new(None, 100)
    }
}

/// Run the load generator, returning the time until every slot existed.
pub async fn spam(
    store: &dyn CoordinationStore,
    bus: &LocalBus,
    config: &SpamConfig,
) -> anyhow::Result<Duration> {
    let started = Instant::now();
    let prefix = format!("{SLOT_PREFIX}/{}", config.app);

    let existing = claimed_indexes(store, &prefix).await?;
    let mut published = 0usize;
    for index in (0..config.instances).filter(|i| !existing.contains(i)) {
        bus.publish_start(&config.topic, &StartRequest::new(config.app.clone(), index))?;
        published += 1;
    }
    info!(
        app = %config.app,
        instances = config.instances,
        existing = existing.len(),
        published,
        "start requests published"
    );

    loop {
        match store.list(&prefix).await {
            Ok(entries) => {
                info!(app = %config.app, entries = entries.len(), "entries");
                if entries.len() >= config.instances as usize {
                    break;
                }
            }
            Err(e) => warn!(app = %config.app, error = %e, "failed to count entries"),
        }

        if let Some(deadline) = config.deadline {
            if started.elapsed() >= deadline {
                bail!(
                    "{} did not reach {} instances within {:?}",
                    config.app,
                    config.instances,
                    deadline
                );
            }
        }
        tokio::time::sleep(config.poll_interval).await;
    }

    let took = started.elapsed();
    info!(app = %config.app, ?took, "took");
    Ok(took)
}

async fn claimed_indexes(store: &dyn CoordinationStore, prefix: &str) -> anyhow::Result<BTreeSet<u32>> {
    let mut indexes = BTreeSet::new();
    for (key, _) in store.list(prefix).await? {
        match decode_slot_key(&key) {
            Ok((_, index)) => {
                indexes.insert(index);
            }
            Err(e) => warn!(%key, error = %e, "ignoring malformed slot key"),
        }
    }
    Ok(indexes)
}

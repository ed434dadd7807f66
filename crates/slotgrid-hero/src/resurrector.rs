//! Resurrector — turns lost slots back into start requests.
//!
//! Watches the slot namespace and, for every key that is deleted or
//! expires, submits a start for the same `(app, index)`. Whichever node
//! wins the subsequent claim race becomes the new owner; duplicate
//! events just lose that race and are dropped.
//!
//! The subscription survives store hiccups: on failure the resurrector
//! rests for `retry_backoff` and resubscribes from the cursor after the
//! last event it saw, so nothing is skipped unless the store has already
//! compacted those events, in which case the gap is logged.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use slotgrid_node::{decode_slot_key, KeyError, SLOT_PREFIX};
use slotgrid_starter::StartSink;
use slotgrid_store::{CoordinationStore, Cursor, StoreError, Watch, WatchEvent};

/// Resurrector construction parameters.
#[derive(Debug, Clone)]
pub struct ResurrectorConfig {
    /// Namespace to watch.
    pub prefix: String,
    /// Pause before resubscribing after a watch failure.
    pub retry_backoff: Duration,
    /// First cursor to read; `None` starts at the store's current cursor.
    pub from_cursor: Option<Cursor>,
}

impl Default for ResurrectorConfig {
    fn default() -> Self {
        Self {
            prefix: SLOT_PREFIX.to_string(),
            retry_backoff: Duration::from_secs(1),
            from_cursor: None,
        }
    }
}

/// Watch-driven self-healing loop.
pub struct Resurrector {
    store: Arc<dyn CoordinationStore>,
    sink: Arc<dyn StartSink>,
    config: ResurrectorConfig,
}

impl Resurrector {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        sink: Arc<dyn StartSink>,
        config: ResurrectorConfig,
    ) -> Self {
        Self {
            store,
            sink,
            config,
        }
    }

    /// Submit a start for the slot stored at `key`.
    pub async fn resurrect(&self, key: &str) -> Result<(), KeyError> {
        let (app, index) = decode_slot_key(key)?;
        self.sink.start(&app, index).await;
        Ok(())
    }

    /// Watch until `shutdown` fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let prefix = self.config.prefix.as_str();
        let mut cursor = self.config.from_cursor;
        let mut revivals = JoinSet::new();

        info!(%prefix, ?cursor, "resurrector starting");

        'subscribe: while !*shutdown.borrow() {
            let mut feed = match self.subscribe(&mut cursor).await {
                Ok(feed) => feed,
                Err(e) => {
                    self.log_failure(&e, "slot watch failed; resting up");
                    if !self.rest(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            loop {
                tokio::select! {
                    event = feed.next() => match event {
                        Ok(event) => {
                            cursor = Some(event.cursor + 1);
                            self.observe(&event, &mut revivals);
                        }
                        Err(e) => {
                            self.log_failure(&e, "slot watch interrupted; resting up");
                            break;
                        }
                    },
                    Some(joined) = revivals.join_next(), if !revivals.is_empty() => {
                        if let Err(e) = joined {
                            warn!(error = %e, "resurrection task failed");
                        }
                    }
                    _ = shutdown.changed() => break 'subscribe,
                }
            }

            if !self.rest(&mut shutdown).await {
                break;
            }
        }

        revivals.abort_all();
        info!("resurrector stopped");
    }

    /// Open the change feed at `cursor`, pinning it first if unset.
    ///
    /// A compacted cursor is moved forward to the oldest retained event.
    async fn subscribe(&self, cursor: &mut Option<Cursor>) -> Result<Watch, StoreError> {
        let prefix = self.config.prefix.as_str();
        loop {
            let from = match *cursor {
                Some(from) => from,
                None => self.store.current_cursor().await?,
            };
            *cursor = Some(from);

            match self.store.watch(prefix, Some(from)).await {
                Ok(feed) => {
                    debug!(%prefix, from, "slot watch subscribed");
                    return Ok(feed);
                }
                Err(StoreError::CursorCompacted { requested, oldest }) => {
                    warn!(
                        %prefix,
                        requested,
                        oldest,
                        skipped = oldest.saturating_sub(requested),
                        "change feed compacted; resuming from oldest retained event"
                    );
                    *cursor = Some(oldest);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn observe(&self, event: &WatchEvent, revivals: &mut JoinSet<()>) {
        if !event.action.is_removal() {
            return;
        }

        match decode_slot_key(&event.key) {
            Ok((app, index)) => {
                info!(%app, index, action = %event.action, cursor = event.cursor, "slot lost; resurrecting");
                let sink = self.sink.clone();
                revivals.spawn(async move {
                    sink.start(&app, index).await;
                });
            }
            Err(e) => {
                warn!(key = %event.key, error = %e, "ignoring malformed slot key");
            }
        }
    }

    /// Sleep for the retry backoff. Returns `false` if shut down meanwhile.
    async fn rest(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.config.retry_backoff) => true,
            _ = shutdown.changed() => false,
        }
    }

    fn log_failure(&self, e: &StoreError, msg: &str) {
        if e.is_transient() {
            warn!(error = %e, "{msg}");
        } else {
            error!(error = %e, "{msg}");
        }
    }
}

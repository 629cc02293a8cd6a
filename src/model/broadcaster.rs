//! Model broadcaster
//!
//! Keeps the in-memory active risk model current by consuming the model
//! collection's change feed, and fans every collection change out to
//! external subscribers. The cache is swapped as a whole object; readers see
//! either the old or the new model, never a partial update.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::core::config::BroadcasterConfig;
use crate::core::errors::Result;
use crate::model::{ModelStatus, RiskModelDocument};
use crate::store::{ChangeOperation, ModelChange, ModelKey, ModelRepository};

/// Connection state of the change feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcasterHealth {
    Connected,
    Reconnecting,
}

/// Event delivered to fan-out subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModelEvent {
    /// A model collection change, tagged with its operation type
    Change {
        operation: ChangeOperation,
        /// Full affected document for non-delete operations
        document: Option<RiskModelDocument>,
        document_key: Option<ModelKey>,
        at: DateTime<Utc>,
    },
    /// Periodic liveness signal so subscribers can tell idle from
    /// disconnected
    Heartbeat { at: DateTime<Utc> },
}

/// Propagates model changes from the store to live evaluators
pub struct ModelBroadcaster {
    repo: Arc<dyn ModelRepository>,
    active: RwLock<Option<Arc<RiskModelDocument>>>,
    events: broadcast::Sender<ModelEvent>,
    health: RwLock<BroadcasterHealth>,
    config: BroadcasterConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ModelBroadcaster {
    pub fn new(repo: Arc<dyn ModelRepository>, config: BroadcasterConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.fanout_capacity);
        Arc::new(Self {
            repo,
            active: RwLock::new(None),
            events,
            health: RwLock::new(BroadcasterHealth::Reconnecting),
            config,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Load the active model and start the feed and heartbeat tasks.
    ///
    /// The first feed subscription is established before this returns so no
    /// change between startup and the first poll of the spawned task is lost.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.refresh_active().await?;

        let initial = match self.repo.watch_models().await {
            Ok(feed) => {
                *self.health.write() = BroadcasterHealth::Connected;
                Some(feed)
            }
            Err(e) => {
                warn!(error = %e, "initial change feed subscription failed, will retry");
                None
            }
        };

        let feed = {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.feed_loop(initial).await })
        };
        let heartbeat = {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.heartbeat_loop().await })
        };

        let mut tasks = self.tasks.lock();
        tasks.push(feed);
        tasks.push(heartbeat);

        info!("model broadcaster started");
        Ok(())
    }

    /// Stop background tasks
    pub fn stop(&self) {
        let mut tasks = self.tasks.lock();
        for task in tasks.drain(..) {
            task.abort();
        }
        *self.health.write() = BroadcasterHealth::Reconnecting;
        info!("model broadcaster stopped");
    }

    /// Snapshot of the active model, if one is resolvable
    pub fn active_model(&self) -> Option<Arc<RiskModelDocument>> {
        self.active.read().clone()
    }

    /// Subscribe to the fan-out.
    ///
    /// The channel is bounded; slow subscribers lose the oldest events
    /// rather than blocking the feed.
    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.events.subscribe()
    }

    pub fn health(&self) -> BroadcasterHealth {
        *self.health.read()
    }

    /// Re-resolve the active model from the store and swap the cache.
    ///
    /// When several model ids carry an active version, the most recently
    /// updated one is the live scoring model.
    pub async fn refresh_active(&self) -> Result<()> {
        let active = self
            .repo
            .list_models(Some(ModelStatus::Active), 0, usize::MAX)
            .await?;
        let resolved = active.into_iter().max_by_key(|m| m.updated_at);

        let mut cache = self.active.write();
        match (&resolved, cache.as_ref()) {
            (Some(new), Some(old))
                if new.model_id == old.model_id
                    && new.version == old.version
                    && new.updated_at == old.updated_at =>
            {
                // Unchanged
            }
            (Some(new), _) => {
                info!(
                    model_id = %new.model_id,
                    version = new.version,
                    "active risk model cache updated"
                );
                *cache = Some(Arc::new(new.clone()));
            }
            (None, Some(_)) => {
                warn!("no active risk model resolvable, clearing cache");
                *cache = None;
            }
            (None, None) => {}
        }
        Ok(())
    }

    /// Whether a change event can affect the cached active model
    fn concerns_active(&self, change: &ModelChange) -> bool {
        let cached = self.active.read();
        let Some(cached) = cached.as_ref() else {
            // Nothing cached yet: any change may introduce an active version
            return true;
        };

        if let Some(doc) = &change.document {
            if doc.status == ModelStatus::Active {
                return true;
            }
            return doc.model_id == cached.model_id && doc.version == cached.version;
        }
        if let Some(key) = &change.document_key {
            return key.model_id == cached.model_id && key.version == cached.version;
        }
        // Opaque event: treat as relevant and re-resolve
        true
    }

    async fn feed_loop(self: Arc<Self>, initial: Option<broadcast::Receiver<ModelChange>>) {
        let base = Duration::from_millis(self.config.reconnect_base_ms.max(1));
        let max = Duration::from_millis(self.config.reconnect_max_ms.max(1));
        let mut delay = base;
        let mut pending = initial;

        loop {
            let feed = match pending.take() {
                Some(feed) => Ok(feed),
                None => self.repo.watch_models().await,
            };
            match feed {
                Ok(mut feed) => {
                    *self.health.write() = BroadcasterHealth::Connected;
                    delay = base;
                    debug!("model change feed connected");

                    loop {
                        match feed.recv().await {
                            Ok(change) => {
                                let relevant = self.concerns_active(&change);
                                let _ = self.events.send(ModelEvent::Change {
                                    operation: change.operation,
                                    document: change.document.clone(),
                                    document_key: change.document_key.clone(),
                                    at: change.at,
                                });
                                if relevant {
                                    if let Err(e) = self.refresh_active().await {
                                        warn!(error = %e, "failed to refresh active model");
                                    }
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "change feed lagged, re-resolving active model");
                                if let Err(e) = self.refresh_active().await {
                                    warn!(error = %e, "failed to refresh active model");
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                warn!("model change feed closed");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to open model change feed");
                }
            }

            *self.health.write() = BroadcasterHealth::Reconnecting;
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(max);
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let period = Duration::from_secs(self.config.heartbeat_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            let _ = self.events.send(ModelEvent::Heartbeat { at: Utc::now() });
        }
    }
}

impl Drop for ModelBroadcaster {
    fn drop(&mut self) {
        let mut tasks = self.tasks.lock();
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

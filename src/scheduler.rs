//! Background Scheduler
//!
//! Drives the periodic work: drain the extraction queue, deliver due
//! notifications, and when a user's queue is empty, spend the idle tick
//! on one autonomous enrichment search. A slower daily sweep runs the
//! entity cleaner and backfills missing embeddings.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cleaner::Cleaner;
use crate::enrich::Enricher;
use crate::extract::Pipeline;
use crate::notify::{BackoffGovernor, Notifier};
use crate::store::SharedStore;

const BACKFILL_BATCH: usize = 32;

pub struct Scheduler {
    store: SharedStore,
    pipeline: Arc<Pipeline>,
    enricher: Arc<Enricher>,
    cleaner: Arc<Cleaner>,
    governor: Arc<BackoffGovernor>,
    notifier: Arc<dyn Notifier>,
}

impl Scheduler {
    pub fn new(
        store: SharedStore,
        pipeline: Arc<Pipeline>,
        enricher: Arc<Enricher>,
        cleaner: Arc<Cleaner>,
        governor: Arc<BackoffGovernor>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            pipeline,
            enricher,
            cleaner,
            governor,
            notifier,
        }
    }

    /// One pass over every user: extraction first, then notification
    /// delivery, and an enrichment search only if the queue is empty.
    pub async fn tick(&self) -> Result<()> {
        let user_ids = self.store.lock().user_ids()?;
        for user_id in user_ids {
            if let Err(e) = self.tick_user(user_id).await {
                warn!("Tick failed for user {}: {}", user_id, e);
            }
        }
        Ok(())
    }

    async fn tick_user(&self, user_id: i64) -> Result<()> {
        let processed = self.pipeline.drain(user_id).await?;
        if processed > 0 {
            debug!("Processed {} pending item(s) for user {}", processed, user_id);
        }

        self.deliver_due(user_id).await;

        if self.pipeline.is_drained(user_id)? {
            if let Some(record_id) = self.enricher.run_once(user_id).await? {
                debug!("Enrichment search {} queued for user {}", record_id, user_id);
            }
        }
        Ok(())
    }

    async fn deliver_due(&self, user_id: i64) {
        let due = self
            .governor
            .release_due(user_id, chrono::Utc::now().timestamp());
        for notification in due {
            if let Err(e) = self.notifier.deliver(&notification).await {
                warn!(
                    "Failed to deliver notification about {} to user {}: {}",
                    notification.entity_name, user_id, e
                );
            }
        }
    }

    /// The slow sweep: merge duplicate entities, drop duplicate facts,
    /// and fill in embeddings that earlier passes degraded to NULL.
    pub async fn daily(&self) -> Result<()> {
        let user_ids = self.store.lock().user_ids()?;
        for user_id in user_ids {
            if let Err(e) = self.cleaner.run(user_id).await {
                warn!("Cleaner failed for user {}: {}", user_id, e);
            }
            if let Err(e) = self.pipeline.backfill_embeddings(user_id, BACKFILL_BATCH).await {
                warn!("Embedding backfill failed for user {}: {}", user_id, e);
            }
        }
        Ok(())
    }

    /// Run forever. Callers spawn this on its own task.
    pub async fn run(self: Arc<Self>, tick_interval: Duration, daily_interval: Duration) {
        let mut tick = tokio::time::interval(tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut daily = tokio::time::interval(daily_interval);
        daily.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first interval fire is immediate; skip the daily one so
        // startup does not begin with a cleaning pass.
        daily.tick().await;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!("Scheduler tick failed: {}", e);
                    }
                }
                _ = daily.tick() => {
                    if let Err(e) = self.daily().await {
                        warn!("Daily sweep failed: {}", e);
                    }
                }
            }
        }
    }
}

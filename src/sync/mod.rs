//! Catalog refresh from the remote bulk feed.

pub mod feed;
pub mod stream;

use crate::{
    jobs::{JobContext, JobError, JobHandler},
    metrics,
    models::CatalogCard,
    store::Store,
};
use async_trait::async_trait;
use chrono::Utc;
use feed::{CatalogFeed, FeedCard};
use futures::StreamExt;
use std::{sync::Arc, time::Instant};
use stream::ArraySplitter;
use tracing::{debug, info, warn};

pub const LAST_SYNC_SETTING: &str = "scryfall_last_sync";

/// Streams the feed, decoding one record at a time, and upserts the catalog in
/// fixed-size transactional batches. Re-running against an unchanged feed
/// rewrites identical rows.
pub struct SyncHandler {
    feed: Arc<dyn CatalogFeed>,
    batch_size: usize,
}

impl SyncHandler {
    pub fn new(feed: Arc<dyn CatalogFeed>, batch_size: usize) -> Self {
        Self {
            feed,
            batch_size: batch_size.max(1),
        }
    }

    async fn commit(
        &self,
        store: &dyn Store,
        job_id: &str,
        batch: &mut Vec<CatalogCard>,
        synced: u64,
    ) -> Result<(), JobError> {
        let started = Instant::now();
        store
            .upsert_cards(batch)
            .await
            .map_err(|err| JobError::setup("commit catalog batch", err))?;
        metrics::batch_committed(batch.len(), started.elapsed().as_millis());
        debug!(target = "cardbulk.sync", job_id = %job_id, records = batch.len(), synced, "batch committed");
        batch.clear();
        if let Err(err) = store.update_job_progress(job_id, synced as i64, 0).await {
            warn!(target = "cardbulk.sync", job_id = %job_id, error = %err, "progress update failed");
        }
        Ok(())
    }
}

fn decode(element: &[u8]) -> Result<CatalogCard, String> {
    let card: FeedCard = serde_json::from_slice(element).map_err(|err| err.to_string())?;
    if card.id.is_empty() {
        return Err("record has an empty id".into());
    }
    Ok(card.into())
}

#[async_trait]
impl JobHandler for SyncHandler {
    async fn run(&self, ctx: JobContext) -> Result<String, JobError> {
        let job_id = ctx.job.id.as_str();
        let store = ctx.store.as_ref();
        let mut stream = self
            .feed
            .open()
            .await
            .map_err(|err| JobError::setup("open catalog feed", err))?;

        let mut splitter = ArraySplitter::new();
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut synced = 0u64;
        let mut skipped = 0u64;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(JobError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk.map_err(|err| JobError::setup("download catalog feed", err))?;
            let elements = splitter
                .push(&chunk)
                .map_err(|err| JobError::setup("read catalog feed", err))?;

            for element in elements {
                if ctx.cancel.is_cancelled() {
                    return Err(JobError::Cancelled);
                }
                match decode(&element) {
                    Ok(card) => batch.push(card),
                    Err(err) => {
                        skipped += 1;
                        warn!(target = "cardbulk.sync", job_id = %job_id, error = %err, "skipping undecodable catalog record");
                        continue;
                    }
                }
                synced += 1;
                if batch.len() >= self.batch_size {
                    self.commit(store, job_id, &mut batch, synced).await?;
                }
            }
        }
        splitter
            .finish()
            .map_err(|err| JobError::setup("read catalog feed", err))?;
        if !batch.is_empty() {
            self.commit(store, job_id, &mut batch, synced).await?;
        }

        let stamp = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        if let Err(err) = store.set_setting(LAST_SYNC_SETTING, &stamp).await {
            warn!(target = "cardbulk.sync", job_id = %job_id, error = %err, "failed to record last sync time");
        }
        info!(target = "cardbulk.sync", job_id = %job_id, synced, skipped, "catalog sync finished");
        Ok(format!("Successfully synced {synced} cards"))
    }
}

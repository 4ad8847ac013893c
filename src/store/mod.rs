//! Durable state behind the job subsystem.
//!
//! Everything the dispatcher, the import pipeline and the catalog sync need
//! from the database goes through [`Store`]. Reads are safe to issue from many
//! tasks at once; writers are serialized by SQLite itself, bounded by the
//! configured busy timeout.

mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

#[cfg(test)]
pub(crate) use sqlite::testing;

use crate::models::{
    CatalogCard, InventoryItem, InventoryRecord, Job, JobStatus, NewReviewItem, ReviewItem,
};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
    #[error("job `{id}` cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Catalog entries with the given set code (case-insensitive) and exact
    /// collector number.
    async fn find_cards_by_set_number(
        &self,
        set_code: &str,
        collector_number: &str,
    ) -> Result<Vec<CatalogCard>, StoreError>;

    /// Catalog entries whose name matches case-insensitively, optionally
    /// restricted to one set.
    async fn find_cards_by_name(
        &self,
        name: &str,
        set_code: Option<&str>,
    ) -> Result<Vec<CatalogCard>, StoreError>;

    async fn get_card(&self, scryfall_id: &str) -> Result<Option<CatalogCard>, StoreError>;

    async fn search_cards(
        &self,
        query: &str,
        preferred_set: &str,
    ) -> Result<Vec<CatalogCard>, StoreError>;

    /// Insert-or-replace keyed by catalog identifier, in one transaction.
    async fn upsert_cards(&self, cards: &[CatalogCard]) -> Result<(), StoreError>;

    async fn count_cards(&self) -> Result<i64, StoreError>;

    /// Adds to the quantity of an existing (card, condition, foil, language)
    /// row, or inserts a new one.
    async fn add_inventory(&self, item: &InventoryItem) -> Result<(), StoreError>;

    async fn list_inventory(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<InventoryRecord>, StoreError>;

    async fn create_job(&self, job: &Job) -> Result<(), StoreError>;

    async fn get_job(&self, id: &str) -> Result<Job, StoreError>;

    async fn list_jobs(&self, limit: i64) -> Result<Vec<Job>, StoreError>;

    async fn update_job_status(&self, id: &str, status: JobStatus) -> Result<(), StoreError>;

    /// Never lowers the stored current count.
    async fn update_job_progress(&self, id: &str, current: i64, total: i64)
    -> Result<(), StoreError>;

    async fn complete_job(&self, id: &str, summary: &str) -> Result<(), StoreError>;

    async fn fail_job(&self, id: &str, error: &str) -> Result<(), StoreError>;

    async fn add_review_item(&self, item: &NewReviewItem) -> Result<i64, StoreError>;

    async fn list_review_items(&self) -> Result<Vec<ReviewItem>, StoreError>;

    async fn list_review_items_for_job(&self, job_id: &str)
    -> Result<Vec<ReviewItem>, StoreError>;

    async fn get_review_item(&self, id: i64) -> Result<ReviewItem, StoreError>;

    async fn delete_review_item(&self, id: i64) -> Result<(), StoreError>;

    async fn count_review_items(&self) -> Result<i64, StoreError>;

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

use super::{Store, StoreError, schema};
use crate::config::Settings;
use crate::models::{
    CatalogCard, InventoryItem, InventoryRecord, Job, JobKind, JobStatus, NewReviewItem,
    ProposedValues, ReviewIssue, ReviewItem,
};
use async_trait::async_trait;
use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
};
use std::{collections::BTreeMap, path::Path, time::Duration};
use tracing::info;

const CARD_COLUMNS: &str = "scryfall_id, name, set_code, collector_number, image_uri";
const JOB_COLUMNS: &str =
    "id, kind, status, progress_current, progress_total, result_summary, created_at";
const REVIEW_COLUMNS: &str = "id, job_id, issue, raw_data, proposed_values, note";

/// SQLite-backed [`Store`]. Cloning shares the underlying pool.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(
        path: &Path,
        max_connections: u32,
        busy_timeout: Duration,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let newly_created = !path.exists();

        // WAL lets the resolver workers keep reading while a collector writes.
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(busy_timeout);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        schema::apply(&pool).await?;

        info!(
            target = "cardbulk.store",
            path = %path.display(),
            newly_created,
            max_connections,
            "database ready"
        );
        Ok(Self { pool })
    }

    pub async fn from_settings(settings: &Settings) -> Result<Self, StoreError> {
        Self::open(
            &settings.database_path,
            settings.db_max_connections,
            settings.db_busy_timeout,
        )
        .await
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn current_status(&self, id: &str) -> Result<Option<JobStatus>, StoreError> {
        let row = sqlx::query("SELECT status FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let raw: String = row.try_get("status")?;
                Ok(Some(parse_status(&raw)?))
            }
            None => Ok(None),
        }
    }

    /// Applies a status change only when the stored status is a legal
    /// predecessor of `to`; otherwise reports what the job actually holds.
    async fn transition(
        &self,
        id: &str,
        to: JobStatus,
        summary: Option<&str>,
    ) -> Result<(), StoreError> {
        let allowed = to.predecessors();
        if !allowed.is_empty() {
            let assignments = match to {
                JobStatus::Completed => {
                    "status = ?, result_summary = COALESCE(?, result_summary), \
                     progress_total = MAX(progress_total, progress_current), \
                     progress_current = MAX(progress_total, progress_current)"
                }
                _ => "status = ?, result_summary = COALESCE(?, result_summary)",
            };
            let placeholders = vec!["?"; allowed.len()].join(", ");
            let sql =
                format!("UPDATE jobs SET {assignments} WHERE id = ? AND status IN ({placeholders})");
            let mut query = sqlx::query(&sql).bind(to.as_str()).bind(summary).bind(id);
            for status in allowed {
                query = query.bind(status.as_str());
            }
            if query.execute(&self.pool).await?.rows_affected() > 0 {
                return Ok(());
            }
        }

        match self.current_status(id).await? {
            Some(from) => Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from,
                to,
            }),
            None => Err(StoreError::not_found("job", id)),
        }
    }

    async fn fetch_review_items(
        &self,
        job_id: Option<&str>,
    ) -> Result<Vec<ReviewItem>, StoreError> {
        let rows = match job_id {
            Some(job_id) => {
                sqlx::query(&format!(
                    "SELECT {REVIEW_COLUMNS} FROM review_queue WHERE job_id = ? ORDER BY id ASC"
                ))
                .bind(job_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {REVIEW_COLUMNS} FROM review_queue ORDER BY id ASC"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(review_from_row).collect()
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn find_cards_by_set_number(
        &self,
        set_code: &str,
        collector_number: &str,
    ) -> Result<Vec<CatalogCard>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CARD_COLUMNS} FROM cards WHERE lower(set_code) = lower(?) AND collector_number = ?"
        ))
        .bind(set_code)
        .bind(collector_number)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(card_from_row).collect()
    }

    async fn find_cards_by_name(
        &self,
        name: &str,
        set_code: Option<&str>,
    ) -> Result<Vec<CatalogCard>, StoreError> {
        let rows = match set_code.filter(|s| !s.is_empty()) {
            Some(set_code) => {
                sqlx::query(&format!(
                    "SELECT {CARD_COLUMNS} FROM cards WHERE lower(name) = lower(?) AND lower(set_code) = lower(?)"
                ))
                .bind(name)
                .bind(set_code)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {CARD_COLUMNS} FROM cards WHERE lower(name) = lower(?)"
                ))
                .bind(name)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(card_from_row).collect()
    }

    async fn get_card(&self, scryfall_id: &str) -> Result<Option<CatalogCard>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CARD_COLUMNS} FROM cards WHERE scryfall_id = ?"
        ))
        .bind(scryfall_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(card_from_row).transpose()
    }

    async fn search_cards(
        &self,
        query: &str,
        preferred_set: &str,
    ) -> Result<Vec<CatalogCard>, StoreError> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT {CARD_COLUMNS} FROM cards WHERE name LIKE ? \
             ORDER BY CASE WHEN lower(set_code) = lower(?) THEN 0 ELSE 1 END, name ASC, set_code DESC \
             LIMIT 20"
        ))
        .bind(format!("%{}%", query.trim()))
        .bind(preferred_set)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(card_from_row).collect()
    }

    async fn upsert_cards(&self, cards: &[CatalogCard]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for card in cards {
            sqlx::query(&format!(
                "INSERT OR REPLACE INTO cards ({CARD_COLUMNS}) VALUES (?, ?, ?, ?, ?)"
            ))
            .bind(&card.scryfall_id)
            .bind(&card.name)
            .bind(&card.set_code)
            .bind(&card.collector_number)
            .bind(&card.image_uri)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn count_cards(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM cards")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    async fn add_inventory(&self, item: &InventoryItem) -> Result<(), StoreError> {
        // One statement, so two concurrent imports of the same printing cannot
        // both miss the existing row and insert twice.
        sqlx::query(
            "INSERT INTO inventory (scryfall_id, quantity, condition, is_foil, language, location) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT (scryfall_id, condition, is_foil, language) \
             DO UPDATE SET quantity = quantity + excluded.quantity",
        )
        .bind(&item.scryfall_id)
        .bind(item.quantity)
        .bind(&item.condition)
        .bind(item.is_foil)
        .bind(&item.language)
        .bind(&item.location)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_inventory(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<InventoryRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT i.id, i.scryfall_id, i.quantity, i.condition, i.is_foil, i.language, i.location, \
                    c.name AS card_name, c.set_code, c.collector_number \
             FROM inventory i LEFT JOIN cards c ON i.scryfall_id = c.scryfall_id \
             ORDER BY i.id DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<InventoryRecord, StoreError> {
                Ok(InventoryRecord {
                    id: row.try_get("id")?,
                    item: InventoryItem {
                        scryfall_id: row.try_get("scryfall_id")?,
                        quantity: row.try_get("quantity")?,
                        condition: row.try_get("condition")?,
                        is_foil: row.try_get("is_foil")?,
                        language: row.try_get("language")?,
                        location: row.try_get("location")?,
                    },
                    card_name: row.try_get("card_name")?,
                    set_code: row.try_get("set_code")?,
                    collector_number: row.try_get("collector_number")?,
                })
            })
            .collect()
    }

    async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&job.id)
        .bind(job.kind.as_str())
        .bind(job.status.as_str())
        .bind(job.progress_current)
        .bind(job.progress_total)
        .bind(job.result_summary.as_deref())
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Job, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => job_from_row(&row),
            None => Err(StoreError::not_found("job", id)),
        }
    }

    async fn list_jobs(&self, limit: i64) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn update_job_status(&self, id: &str, status: JobStatus) -> Result<(), StoreError> {
        self.transition(id, status, None).await
    }

    async fn update_job_progress(
        &self,
        id: &str,
        current: i64,
        total: i64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET progress_current = MAX(progress_current, ?), progress_total = ? \
             WHERE id = ?",
        )
        .bind(current)
        .bind(total)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("job", id));
        }
        Ok(())
    }

    async fn complete_job(&self, id: &str, summary: &str) -> Result<(), StoreError> {
        self.transition(id, JobStatus::Completed, Some(summary))
            .await
    }

    async fn fail_job(&self, id: &str, error: &str) -> Result<(), StoreError> {
        self.transition(id, JobStatus::Failed, Some(error)).await
    }

    async fn add_review_item(&self, item: &NewReviewItem) -> Result<i64, StoreError> {
        let raw = serde_json::to_string(&item.raw_data)?;
        let proposed = serde_json::to_string(&item.proposed)?;
        let result = sqlx::query(
            "INSERT INTO review_queue (job_id, issue, raw_data, proposed_values, note) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&item.job_id)
        .bind(item.issue.as_str())
        .bind(raw)
        .bind(proposed)
        .bind(item.note.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn list_review_items(&self) -> Result<Vec<ReviewItem>, StoreError> {
        self.fetch_review_items(None).await
    }

    async fn list_review_items_for_job(
        &self,
        job_id: &str,
    ) -> Result<Vec<ReviewItem>, StoreError> {
        self.fetch_review_items(Some(job_id)).await
    }

    async fn get_review_item(&self, id: i64) -> Result<ReviewItem, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {REVIEW_COLUMNS} FROM review_queue WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => review_from_row(&row),
            None => Err(StoreError::not_found("review item", id)),
        }
    }

    async fn delete_review_item(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM review_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("review item", id));
        }
        Ok(())
    }

    async fn count_review_items(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM review_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM system_settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("value")?)),
            None => Ok(None),
        }
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO system_settings (key, value) VALUES (?, ?) \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn parse_status(raw: &str) -> Result<JobStatus, StoreError> {
    raw.parse::<JobStatus>()
        .map_err(|err| StoreError::Corrupt(err.to_string()))
}

fn card_from_row(row: &SqliteRow) -> Result<CatalogCard, StoreError> {
    Ok(CatalogCard {
        scryfall_id: row.try_get("scryfall_id")?,
        name: row.try_get("name")?,
        set_code: row.try_get("set_code")?,
        collector_number: row.try_get("collector_number")?,
        image_uri: row.try_get("image_uri")?,
    })
}

fn job_from_row(row: &SqliteRow) -> Result<Job, StoreError> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    Ok(Job {
        id: row.try_get("id")?,
        kind: kind
            .parse::<JobKind>()
            .map_err(|err| StoreError::Corrupt(err.to_string()))?,
        status: parse_status(&status)?,
        progress_current: row.try_get("progress_current")?,
        progress_total: row.try_get("progress_total")?,
        result_summary: row.try_get("result_summary")?,
        created_at: row.try_get("created_at")?,
    })
}

fn review_from_row(row: &SqliteRow) -> Result<ReviewItem, StoreError> {
    let issue: String = row.try_get("issue")?;
    let raw: String = row.try_get("raw_data")?;
    let proposed: String = row.try_get("proposed_values")?;
    Ok(ReviewItem {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        issue: issue
            .parse::<ReviewIssue>()
            .map_err(|err| StoreError::Corrupt(err.to_string()))?,
        raw_data: serde_json::from_str::<BTreeMap<String, String>>(&raw)?,
        proposed: serde_json::from_str::<ProposedValues>(&proposed)?,
        note: row.try_get("note")?,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tempfile::TempDir;

    pub(crate) async fn temp_store() -> (TempDir, SqliteStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::open(&dir.path().join("test.db"), 8, Duration::from_secs(5))
            .await
            .expect("open store");
        (dir, store)
    }

    pub(crate) fn card(id: &str, name: &str, set_code: &str, collector_number: &str) -> CatalogCard {
        CatalogCard {
            scryfall_id: id.to_string(),
            name: name.to_string(),
            set_code: set_code.to_string(),
            collector_number: collector_number.to_string(),
            image_uri: format!("https://img.example/{id}.jpg"),
        }
    }

    pub(crate) async fn processing_job(store: &SqliteStore, kind: JobKind) -> Job {
        let job = Job::new(kind);
        store.create_job(&job).await.expect("create job");
        store
            .update_job_status(&job.id, JobStatus::Processing)
            .await
            .expect("mark processing");
        store.get_job(&job.id).await.expect("reload job")
    }

    /// Makes every inventory insert for `scryfall_id` abort inside SQLite.
    pub(crate) async fn reject_inventory_writes_for(store: &SqliteStore, scryfall_id: &str) {
        let escaped = scryfall_id.replace('\'', "''");
        sqlx::query(&format!(
            "CREATE TRIGGER reject_{n} BEFORE INSERT ON inventory \
             WHEN NEW.scryfall_id = '{escaped}' \
             BEGIN SELECT RAISE(ABORT, 'inventory write rejected'); END",
            n = escaped.len()
        ))
        .execute(store.pool())
        .await
        .expect("create trigger");
    }
}

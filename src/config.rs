use std::{env, path::PathBuf, str::FromStr, time::Duration};

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: PathBuf,
    pub upload_dir: PathBuf,
    pub job_workers: usize,
    pub import_workers: usize,
    pub job_queue_capacity: usize,
    pub catalog_manifest_url: String,
    pub catalog_bulk_type: String,
    pub sync_batch_size: usize,
    pub db_max_connections: u32,
    pub db_busy_timeout: Duration,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            database_path: PathBuf::from(string_from_env("DATABASE_PATH", "inventory.db")),
            upload_dir: PathBuf::from(string_from_env("UPLOAD_DIR", "uploads")),
            job_workers: parsed_from_env("JOB_WORKERS", 3, |v| *v >= 1),
            import_workers: parsed_from_env("IMPORT_WORKERS", default_import_workers(), |v| *v >= 1),
            job_queue_capacity: parsed_from_env("JOB_QUEUE_CAPACITY", 100, |v| *v >= 1),
            catalog_manifest_url: string_from_env(
                "CATALOG_MANIFEST_URL",
                "https://api.scryfall.com/bulk-data",
            ),
            catalog_bulk_type: string_from_env("CATALOG_BULK_TYPE", "default_cards"),
            sync_batch_size: parsed_from_env("SYNC_BATCH_SIZE", 2000, |v| *v >= 1),
            db_max_connections: parsed_from_env("DB_MAX_CONNECTIONS", 8, |v| *v >= 1),
            db_busy_timeout: Duration::from_millis(parsed_from_env(
                "DB_BUSY_TIMEOUT_MS",
                5000,
                |_| true,
            )),
        }
    }
}

/// One resolver per core, never fewer than two.
fn default_import_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(2)
}

fn string_from_env(key: &str, fallback: &str) -> String {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

pub(crate) fn parsed_from_env<T>(key: &str, fallback: T, accept: impl Fn(&T) -> bool) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .filter(|v| accept(v))
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsed_falls_back_on_missing_or_rejected_values() {
        assert_eq!(
            parsed_from_env::<usize>("CARDBULK_TEST_UNSET_VARIABLE", 42, |_| true),
            42
        );
        // PATH is always set and never parses as a number.
        assert_eq!(parsed_from_env::<u64>("PATH", 7, |_| true), 7);
    }

    #[test]
    fn import_workers_default_to_at_least_two() {
        assert!(default_import_workers() >= 2);
    }

    #[test]
    fn string_falls_back_when_unset() {
        assert_eq!(
            string_from_env("CARDBULK_TEST_UNSET_VARIABLE", "inventory.db"),
            "inventory.db"
        );
    }
}

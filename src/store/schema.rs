use sqlx::SqlitePool;
use tracing::debug;

const STATEMENTS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS cards (
        scryfall_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        set_code TEXT NOT NULL,
        collector_number TEXT NOT NULL,
        image_uri TEXT NOT NULL DEFAULT ''
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_cards_name ON cards (lower(name))",
    "CREATE INDEX IF NOT EXISTS idx_cards_set_number ON cards (lower(set_code), collector_number)",
    r#"CREATE TABLE IF NOT EXISTS inventory (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        scryfall_id TEXT NOT NULL,
        quantity INTEGER NOT NULL CHECK (quantity > 0),
        condition TEXT NOT NULL,
        is_foil INTEGER NOT NULL DEFAULT 0,
        language TEXT NOT NULL,
        location TEXT NOT NULL DEFAULT ''
    )"#,
    r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_inventory_identity
        ON inventory (scryfall_id, condition, is_foil, language)"#,
    r#"CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        status TEXT NOT NULL,
        progress_current INTEGER NOT NULL DEFAULT 0,
        progress_total INTEGER NOT NULL DEFAULT 0,
        result_summary TEXT,
        created_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS review_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL,
        issue TEXT NOT NULL,
        raw_data TEXT NOT NULL,
        proposed_values TEXT NOT NULL,
        note TEXT
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_review_queue_job ON review_queue (job_id)",
    r#"CREATE TABLE IF NOT EXISTS system_settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )"#,
];

/// Idempotent; safe to run on every start.
pub(super) async fn apply(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    debug!(
        target = "cardbulk.store",
        statements = STATEMENTS.len(),
        "schema applied"
    );
    Ok(())
}

use anyhow::Result;
use sqlx::SqlitePool;

/// Creates the ledger schema. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Users: a per-user tag on queries and API events
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            user_id TEXT PRIMARY KEY,
            info_json TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Files: one row per successfully indexed path
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            path TEXT PRIMARY KEY,
            bytes INTEGER NOT NULL,
            mtime_ns INTEGER NOT NULL,
            sha256 TEXT NOT NULL,
            mime TEXT NOT NULL,
            last_indexed_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT,
            qtext TEXT NOT NULL,
            top_k INTEGER NOT NULL,
            filters_json TEXT,
            model TEXT,
            latency_ms INTEGER NOT NULL,
            response_json TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS query_hits (
            query_id INTEGER NOT NULL,
            rank INTEGER NOT NULL,
            score REAL NOT NULL,
            path TEXT NOT NULL,
            chunk_idx INTEGER NOT NULL,
            sha256 TEXT NOT NULL,
            snippet TEXT NOT NULL,
            FOREIGN KEY (query_id) REFERENCES queries(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS api_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            api TEXT NOT NULL,
            request_json TEXT NOT NULL,
            response_json TEXT NOT NULL,
            status TEXT NOT NULL,
            latency_ms INTEGER NOT NULL,
            notes TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS web_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            api_event_id INTEGER NOT NULL,
            rank INTEGER NOT NULL,
            title TEXT,
            url TEXT,
            snippet TEXT,
            source TEXT,
            FOREIGN KEY (api_event_id) REFERENCES api_events(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS web_fetches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            api_event_id INTEGER NOT NULL,
            url TEXT,
            ok INTEGER NOT NULL,
            status_code INTEGER,
            text_length INTEGER,
            error TEXT,
            elapsed_ms INTEGER,
            FOREIGN KEY (api_event_id) REFERENCES api_events(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    for statement in [
        "CREATE INDEX IF NOT EXISTS idx_queries_user_time ON queries(user_id, created_at)",
        "CREATE INDEX IF NOT EXISTS idx_query_hits_qid ON query_hits(query_id)",
        "CREATE INDEX IF NOT EXISTS idx_api_events_user_time ON api_events(user_id, created_at)",
        "CREATE INDEX IF NOT EXISTS idx_api_events_api_time ON api_events(api, created_at)",
        "CREATE INDEX IF NOT EXISTS idx_web_results_event ON web_results(api_event_id)",
        "CREATE INDEX IF NOT EXISTS idx_web_fetches_event ON web_fetches(api_event_id)",
    ] {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}

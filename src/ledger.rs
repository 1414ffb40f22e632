//! Metadata ledger: the durable record of indexed files and of every query.
//!
//! Backed by a SQLite database created by [`migrate::run_migrations`].
//! Each logical unit (one file upsert, one query, one hit list, one API
//! event with its results) is a single statement or a single transaction.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::db;
use crate::migrate;
use crate::models::{ApiEvent, LedgerFileRecord, QueryHit, QueryRecord, WebFetch, WebResult};

#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

/// Row counts for the `stats` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSummary {
    pub files: i64,
    pub total_bytes: i64,
    pub last_indexed_at: Option<String>,
    pub users: i64,
    pub queries: i64,
    pub query_hits: i64,
    pub api_events: i64,
}

impl Ledger {
    /// Opens the ledger file, creating it and its schema if needed.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        migrate::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// `path → sha256` for every recorded file.
    pub async fn known_fingerprints(&self) -> sqlx::Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT path, sha256 FROM files")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get::<String, _>("path"), row.get::<String, _>("sha256")))
            .collect())
    }

    pub async fn upsert_file(&self, record: &LedgerFileRecord) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO files (path, bytes, mtime_ns, sha256, mime, last_indexed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                bytes = excluded.bytes,
                mtime_ns = excluded.mtime_ns,
                sha256 = excluded.sha256,
                mime = excluded.mime,
                last_indexed_at = excluded.last_indexed_at
            "#,
        )
        .bind(&record.path)
        .bind(record.bytes)
        .bind(record.mtime_ns)
        .bind(&record.sha256)
        .bind(&record.mime)
        .bind(&record.last_indexed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_file(&self, path: &str) -> sqlx::Result<Option<LedgerFileRecord>> {
        let row = sqlx::query(
            "SELECT path, bytes, mtime_ns, sha256, mime, last_indexed_at FROM files WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| file_from_row(&r)))
    }

    /// All recorded files, ordered by path.
    pub async fn list_files(&self) -> sqlx::Result<Vec<LedgerFileRecord>> {
        let rows = sqlx::query(
            "SELECT path, bytes, mtime_ns, sha256, mime, last_indexed_at FROM files ORDER BY path",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(file_from_row).collect())
    }

    /// Returns whether a row was removed.
    pub async fn delete_file(&self, path: &str) -> sqlx::Result<bool> {
        let result = sqlx::query("DELETE FROM files WHERE path = ?")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Records a user. Existing `info_json` is kept when `info_json` is `None`.
    pub async fn ensure_user(&self, user_id: &str, info_json: Option<&str>) -> sqlx::Result<()> {
        if user_id.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            INSERT INTO users (user_id, info_json) VALUES (?, ?)
            ON CONFLICT(user_id) DO UPDATE SET info_json = COALESCE(excluded.info_json, users.info_json)
            "#,
        )
        .bind(user_id)
        .bind(info_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Inserts a query record and returns its id.
    pub async fn log_query(&self, record: &QueryRecord) -> sqlx::Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO queries (user_id, qtext, top_k, filters_json, model, latency_ms, response_json)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.user_id)
        .bind(&record.qtext)
        .bind(record.top_k)
        .bind(&record.filters_json)
        .bind(&record.model)
        .bind(record.latency_ms)
        .bind(&record.response_json)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Inserts a query's ranked hits in one transaction.
    pub async fn log_query_hits(&self, hits: &[QueryHit]) -> sqlx::Result<()> {
        if hits.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for hit in hits {
            sqlx::query(
                r#"
                INSERT INTO query_hits (query_id, rank, score, path, chunk_idx, sha256, snippet)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(hit.query_id)
            .bind(hit.rank)
            .bind(hit.score)
            .bind(&hit.path)
            .bind(hit.chunk_idx)
            .bind(&hit.sha256)
            .bind(&hit.snippet)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    /// Inserts an API event and returns its id. A missing user is logged as
    /// `anonymous`.
    pub async fn log_api_event(&self, event: &ApiEvent) -> sqlx::Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO api_events (user_id, api, request_json, response_json, status, latency_ms, notes)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(
            event
                .user_id
                .as_deref()
                .filter(|u| !u.is_empty())
                .unwrap_or("anonymous"),
        )
        .bind(&event.api)
        .bind(event.request.to_string())
        .bind(event.response.to_string())
        .bind(&event.status)
        .bind(event.latency_ms)
        .bind(&event.notes)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Inserts ranked web results (rank starts at 1) in one transaction.
    pub async fn log_web_results(&self, api_event_id: i64, results: &[WebResult]) -> sqlx::Result<()> {
        if results.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (i, r) in results.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO web_results (api_event_id, rank, title, url, snippet, source)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(api_event_id)
            .bind(i as i64 + 1)
            .bind(&r.title)
            .bind(&r.url)
            .bind(&r.snippet)
            .bind(&r.source)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    pub async fn log_web_fetches(&self, api_event_id: i64, fetches: &[WebFetch]) -> sqlx::Result<()> {
        if fetches.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for f in fetches {
            sqlx::query(
                r#"
                INSERT INTO web_fetches (api_event_id, url, ok, status_code, text_length, error, elapsed_ms)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(api_event_id)
            .bind(&f.url)
            .bind(f.ok)
            .bind(f.status_code)
            .bind(f.text_length)
            .bind(&f.error)
            .bind(f.elapsed_ms)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    pub async fn summary(&self) -> sqlx::Result<LedgerSummary> {
        let files = sqlx::query(
            "SELECT COUNT(*) AS n, COALESCE(SUM(bytes), 0) AS total, MAX(last_indexed_at) AS last FROM files",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(LedgerSummary {
            files: files.get("n"),
            total_bytes: files.get("total"),
            last_indexed_at: files.get("last"),
            users: self.count_rows("users").await?,
            queries: self.count_rows("queries").await?,
            query_hits: self.count_rows("query_hits").await?,
            api_events: self.count_rows("api_events").await?,
        })
    }

    async fn count_rows(&self, table: &str) -> sqlx::Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        sqlx::query_scalar(&sql).fetch_one(&self.pool).await
    }
}

fn file_from_row(row: &sqlx::sqlite::SqliteRow) -> LedgerFileRecord {
    LedgerFileRecord {
        path: row.get("path"),
        bytes: row.get("bytes"),
        mtime_ns: row.get("mtime_ns"),
        sha256: row.get("sha256"),
        mime: row.get("mime"),
        last_indexed_at: row.get("last_indexed_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ledger() -> (tempfile::TempDir, Ledger) {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(&tmp.path().join("ledger.sqlite")).await.unwrap();
        (tmp, ledger)
    }

    fn file(path: &str, sha: &str, at: &str) -> LedgerFileRecord {
        LedgerFileRecord {
            path: path.to_string(),
            bytes: 10,
            mtime_ns: 5,
            sha256: sha.to_string(),
            mime: "text/plain".to_string(),
            last_indexed_at: at.to_string(),
        }
    }

    #[tokio::test]
    async fn file_upsert_is_keyed_by_path() {
        let (_tmp, ledger) = ledger().await;
        ledger.upsert_file(&file("/a", "1", "t1")).await.unwrap();
        ledger.upsert_file(&file("/b", "2", "t1")).await.unwrap();
        ledger.upsert_file(&file("/a", "3", "t2")).await.unwrap();

        let known = ledger.known_fingerprints().await.unwrap();
        assert_eq!(known.len(), 2);
        assert_eq!(known["/a"], "3");

        let a = ledger.get_file("/a").await.unwrap().unwrap();
        assert_eq!(a.last_indexed_at, "t2");
        assert!(ledger.get_file("/missing").await.unwrap().is_none());

        assert!(ledger.delete_file("/b").await.unwrap());
        assert!(!ledger.delete_file("/b").await.unwrap());
        let paths: Vec<_> = ledger
            .list_files()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(paths, vec!["/a"]);
    }

    #[tokio::test]
    async fn ensure_user_keeps_existing_info() {
        let (_tmp, ledger) = ledger().await;
        ledger.ensure_user("u1", Some(r#"{"team":"x"}"#)).await.unwrap();
        ledger.ensure_user("u1", None).await.unwrap();
        ledger.ensure_user("", None).await.unwrap();

        let info: Option<String> =
            sqlx::query_scalar("SELECT info_json FROM users WHERE user_id = 'u1'")
                .fetch_one(ledger.pool())
                .await
                .unwrap();
        assert_eq!(info.as_deref(), Some(r#"{"team":"x"}"#));
        assert_eq!(ledger.summary().await.unwrap().users, 1);
    }

    #[tokio::test]
    async fn query_and_hits_are_logged() {
        let (_tmp, ledger) = ledger().await;
        let record = QueryRecord {
            user_id: "u1".to_string(),
            qtext: "where is alpha".to_string(),
            top_k: 5,
            filters_json: None,
            model: Some("offline-hash".to_string()),
            latency_ms: 12,
            response_json: "[]".to_string(),
        };
        let first = ledger.log_query(&record).await.unwrap();
        let second = ledger.log_query(&record).await.unwrap();
        assert!(second > first);

        let hits = vec![
            QueryHit {
                query_id: second,
                rank: 1,
                score: 0.9,
                path: "/a".to_string(),
                chunk_idx: 0,
                sha256: "abc".to_string(),
                snippet: "alpha".to_string(),
            },
            QueryHit {
                query_id: second,
                rank: 2,
                score: 0.4,
                path: "/b".to_string(),
                chunk_idx: 3,
                sha256: "def".to_string(),
                snippet: "beta".to_string(),
            },
        ];
        ledger.log_query_hits(&hits).await.unwrap();

        let ranks: Vec<i64> =
            sqlx::query_scalar("SELECT rank FROM query_hits WHERE query_id = ? ORDER BY rank")
                .bind(second)
                .fetch_all(ledger.pool())
                .await
                .unwrap();
        assert_eq!(ranks, vec![1, 2]);

        let summary = ledger.summary().await.unwrap();
        assert_eq!(summary.queries, 2);
        assert_eq!(summary.query_hits, 2);
    }

    #[tokio::test]
    async fn api_event_with_web_results_and_fetches() {
        let (_tmp, ledger) = ledger().await;
        let event_id = ledger
            .log_api_event(&ApiEvent {
                user_id: None,
                api: "web_search".to_string(),
                request: serde_json::json!({"q": "rust"}),
                response: serde_json::json!({"n": 2}),
                status: "ok".to_string(),
                latency_ms: 40,
                notes: None,
            })
            .await
            .unwrap();

        ledger
            .log_web_results(
                event_id,
                &[
                    WebResult {
                        title: Some("Rust".to_string()),
                        url: Some("https://www.rust-lang.org".to_string()),
                        ..Default::default()
                    },
                    WebResult::default(),
                ],
            )
            .await
            .unwrap();
        ledger
            .log_web_fetches(
                event_id,
                &[WebFetch {
                    url: Some("https://www.rust-lang.org".to_string()),
                    ok: true,
                    status_code: Some(200),
                    text_length: Some(1024),
                    error: None,
                    elapsed_ms: Some(30),
                }],
            )
            .await
            .unwrap();

        let user: String = sqlx::query_scalar("SELECT user_id FROM api_events WHERE id = ?")
            .bind(event_id)
            .fetch_one(ledger.pool())
            .await
            .unwrap();
        assert_eq!(user, "anonymous");

        let ranks: Vec<i64> = sqlx::query_scalar(
            "SELECT rank FROM web_results WHERE api_event_id = ? ORDER BY rank",
        )
        .bind(event_id)
        .fetch_all(ledger.pool())
        .await
        .unwrap();
        assert_eq!(ranks, vec![1, 2]);

        let ok: i64 = sqlx::query_scalar("SELECT ok FROM web_fetches WHERE api_event_id = ?")
            .bind(event_id)
            .fetch_one(ledger.pool())
            .await
            .unwrap();
        assert_eq!(ok, 1);
    }
}

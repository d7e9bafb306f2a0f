use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

use crate::store::{TokenRecord, TokenStore};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/brewlock/brewlock.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to ":memory:" is its own database; keep one.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Token administration
    // ----------------------------

    /// Insert or replace a fully enrolled token.
    pub async fn add_token(&self, t: &TokenRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (token_id, user_name, name, barred, active)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(token_id) DO UPDATE SET
              user_name=excluded.user_name,
              name=excluded.name,
              barred=excluded.barred,
              active=excluded.active
            "#,
        )
        .bind(&t.token_id)
        .bind(&t.name)
        .bind(&t.name)
        .bind(t.barred)
        .bind(t.active)
        .execute(&self.pool)
        .await
        .context("add_token failed")?;
        Ok(())
    }

    pub async fn count_tokens(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await
            .context("count_tokens failed")?;
        Ok(n)
    }
}

fn from_unix(ts: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts).with_context(|| format!("bad unix timestamp {ts}"))
}

impl TokenStore for Db {
    async fn get_token(&self, token_id: &str) -> Result<Option<TokenRecord>> {
        let row = sqlx::query(
            r#"
            SELECT token_id, name, active, barred
            FROM users
            WHERE token_id = ?
            "#,
        )
        .bind(token_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_token failed")?;

        row.map(|r| -> Result<TokenRecord> {
            Ok(TokenRecord {
                token_id: r.try_get("token_id")?,
                name: r.try_get("name")?,
                active: r.try_get("active")?,
                barred: r.try_get("barred")?,
            })
        })
        .transpose()
    }

    async fn log_usage(&self, token_id: &str, category: &str, at: OffsetDateTime) -> Result<()> {
        let ts = at.unix_timestamp();
        let mut tx = self.pool.begin().await.context("log_usage: begin failed")?;

        sqlx::query("INSERT INTO usage_log (token_id, ts, category) VALUES (?, ?, ?)")
            .bind(token_id)
            .bind(ts)
            .bind(category)
            .execute(&mut *tx)
            .await
            .context("log_usage failed")?;

        sqlx::query("UPDATE users SET last_seen = ? WHERE token_id = ?")
            .bind(ts)
            .bind(token_id)
            .execute(&mut *tx)
            .await
            .context("log_usage: last_seen update failed")?;

        tx.commit().await.context("log_usage: commit failed")?;
        Ok(())
    }

    async fn last_usage_at(&self) -> Result<Option<OffsetDateTime>> {
        let ts: Option<i64> = sqlx::query_scalar("SELECT MAX(ts) FROM usage_log")
            .fetch_one(&self.pool)
            .await
            .context("last_usage_at failed")?;
        ts.map(from_unix).transpose()
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("get_setting '{key}' failed"))?;
        Ok(value)
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET
              value=excluded.value,
              updated_at=strftime('%s', 'now')
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("set_setting '{key}' failed"))?;
        Ok(())
    }

    async fn create_pending_token(&self, token_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (token_id, user_name, name, barred, active)
            VALUES (?, ?, 'Pending', 1, 0)
            ON CONFLICT(token_id) DO NOTHING
            "#,
        )
        .bind(token_id)
        .bind(format!("pending_{token_id}"))
        .execute(&self.pool)
        .await
        .context("create_pending_token failed")?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

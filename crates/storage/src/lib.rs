use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use uuid::Uuid;

use shared::domain::{DealId, IntentState, Session, TransferIntent, UserId};

/// Fixed key the whole session record persists under.
const SESSION_KEY: &str = "session";
/// The access token is mirrored under its own key so callers that only
/// need the bearer value avoid deserializing the session record.
const ACCESS_TOKEN_KEY: &str = "access_token";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Single connection: sqlite keeps per-connection state for
        // in-memory databases, and one user drives this store anyway.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn save_session(&self, session: &Session) -> Result<()> {
        let encoded = serde_json::to_string(session).context("failed to encode session")?;
        let mut tx = self.pool.begin().await?;
        upsert_state(&mut tx, SESSION_KEY, &encoded).await?;
        upsert_state(&mut tx, ACCESS_TOKEN_KEY, &session.access_token).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn load_session(&self) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT value FROM client_state WHERE key = ?")
            .bind(SESSION_KEY)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let raw: String = row.get(0);
        let session = serde_json::from_str(&raw).context("stored session is unreadable")?;
        Ok(Some(session))
    }

    pub async fn access_token(&self) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM client_state WHERE key = ?")
            .bind(ACCESS_TOKEN_KEY)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    /// Replaces both tokens of the persisted session and the mirrored
    /// access-token row in one transaction. Fails if no session is stored.
    pub async fn set_tokens(&self, access_token: &str, refresh_token: &str) -> Result<()> {
        let mut session = self
            .load_session()
            .await?
            .context("no session stored; cannot rotate tokens")?;
        session.access_token = access_token.to_string();
        session.refresh_token = refresh_token.to_string();

        let encoded = serde_json::to_string(&session).context("failed to encode session")?;
        let mut tx = self.pool.begin().await?;
        upsert_state(&mut tx, SESSION_KEY, &encoded).await?;
        upsert_state(&mut tx, ACCESS_TOKEN_KEY, access_token).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn clear_session(&self) -> Result<()> {
        sqlx::query("DELETE FROM client_state WHERE key IN (?, ?)")
            .bind(SESSION_KEY)
            .bind(ACCESS_TOKEN_KEY)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Writes a pending intent row BEFORE any balance moves so a crash
    /// mid-settlement leaves evidence behind.
    pub async fn record_transfer_intent(
        &self,
        deal_id: DealId,
        debit_user_id: UserId,
        credit_user_id: UserId,
        amount: i64,
    ) -> Result<TransferIntent> {
        let intent = TransferIntent {
            intent_id: Uuid::new_v4(),
            deal_id,
            debit_user_id,
            credit_user_id,
            amount,
            state: IntentState::Pending,
            created_at: Utc::now(),
            settled_at: None,
        };

        sqlx::query(
            "INSERT INTO transfer_intents
               (intent_id, deal_id, debit_user_id, credit_user_id, amount, state, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(intent.intent_id.to_string())
        .bind(intent.deal_id.0)
        .bind(intent.debit_user_id.0)
        .bind(intent.credit_user_id.0)
        .bind(intent.amount)
        .bind(intent.state.as_str())
        .bind(intent.created_at)
        .execute(&self.pool)
        .await?;

        Ok(intent)
    }

    pub async fn mark_transfer_settled(&self, intent_id: Uuid) -> Result<()> {
        self.finish_transfer(intent_id, IntentState::Settled).await
    }

    pub async fn mark_transfer_failed(&self, intent_id: Uuid) -> Result<()> {
        self.finish_transfer(intent_id, IntentState::Failed).await
    }

    async fn finish_transfer(&self, intent_id: Uuid, state: IntentState) -> Result<()> {
        let result = sqlx::query(
            "UPDATE transfer_intents SET state = ?, settled_at = ? WHERE intent_id = ?",
        )
        .bind(state.as_str())
        .bind(Utc::now())
        .bind(intent_id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("transfer intent {intent_id} not found");
        }
        Ok(())
    }

    /// Intents a previous run never finished. Surfaced at startup for
    /// manual reconciliation.
    pub async fn pending_transfer_intents(&self) -> Result<Vec<TransferIntent>> {
        let rows = sqlx::query(
            "SELECT intent_id, deal_id, debit_user_id, credit_user_id, amount, state,
                    created_at, settled_at
             FROM transfer_intents WHERE state = ? ORDER BY created_at",
        )
        .bind(IntentState::Pending.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| row_to_intent(&row)).collect()
    }
}

async fn upsert_state(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    key: &str,
    value: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO client_state (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn row_to_intent(row: &sqlx::sqlite::SqliteRow) -> Result<TransferIntent> {
    let raw_id: String = row.try_get("intent_id")?;
    let raw_state: String = row.try_get("state")?;
    Ok(TransferIntent {
        intent_id: Uuid::parse_str(&raw_id).context("stored intent id is not a uuid")?,
        deal_id: DealId(row.try_get("deal_id")?),
        debit_user_id: UserId(row.try_get("debit_user_id")?),
        credit_user_id: UserId(row.try_get("credit_user_id")?),
        amount: row.try_get("amount")?,
        state: IntentState::parse(&raw_state)
            .with_context(|| format!("unknown intent state '{raw_state}'"))?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        settled_at: row.try_get::<Option<DateTime<Utc>>, _>("settled_at")?,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;
    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

//! `instance_config` table access (spec.md §4.1 Instance Registry contract).

use crate::error::{Result, StorageError};
use crate::ChannelKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub channel: ChannelKind,
    pub is_default: bool,
    pub enable_auto_split: bool,

    pub evolution_url: Option<String>,
    pub evolution_key: Option<String>,
    pub provider_instance_id: Option<String>,

    pub bot_token: Option<String>,

    pub agent_api_url: Option<String>,
    pub agent_api_key: Option<String>,
    pub agent_default_name: Option<String>,
    pub agent_streaming: bool,
    pub agent_timeout_seconds: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields accepted by `upsert` (spec.md §4.1: "validates... writes atomically").
#[derive(Debug, Clone)]
pub struct UpsertInstance {
    pub name: String,
    pub channel: ChannelKind,
    pub is_default: bool,
    pub enable_auto_split: bool,
    pub evolution_url: Option<String>,
    pub evolution_key: Option<String>,
    pub provider_instance_id: Option<String>,
    pub bot_token: Option<String>,
    pub agent_api_url: Option<String>,
    pub agent_api_key: Option<String>,
    pub agent_default_name: Option<String>,
    pub agent_streaming: bool,
    pub agent_timeout_seconds: i64,
}

impl UpsertInstance {
    /// spec.md §4.1: "validates (non-empty name; channel kind recognized;
    /// URL/token presence per kind)"; SPEC_FULL.md §4.1 pins the per-kind
    /// fields the distillation left unenumerated.
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(StorageError::Constraint("instance name must not be empty".into()).into());
        }
        match self.channel {
            ChannelKind::Whatsapp => {
                if self.evolution_url.as_deref().unwrap_or("").is_empty() {
                    return Err(StorageError::Constraint(
                        "whatsapp instance requires evolution_url".into(),
                    )
                    .into());
                }
            }
            ChannelKind::Discord => {
                if self.bot_token.as_deref().unwrap_or("").is_empty() {
                    return Err(StorageError::Constraint(
                        "discord instance requires bot_token".into(),
                    )
                    .into());
                }
            }
        }
        Ok(())
    }
}

/// Ordering for `list` (spec.md §4.1: "newest first" is the default).
pub enum ListFilter {
    All,
    ByChannel(ChannelKind),
}

pub struct InstanceStore {
    pool: SqlitePool,
}

impl InstanceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, name: &str) -> Result<Option<Instance>> {
        let row = sqlx::query("SELECT * FROM instance_config WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| instance_from_row(&r)).transpose()
    }

    pub async fn default_instance(&self) -> Result<Option<Instance>> {
        let row = sqlx::query("SELECT * FROM instance_config WHERE is_default = 1 LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| instance_from_row(&r)).transpose()
    }

    pub async fn list(&self, filter: ListFilter) -> Result<Vec<Instance>> {
        let rows = match filter {
            ListFilter::All => {
                sqlx::query("SELECT * FROM instance_config ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
            ListFilter::ByChannel(channel) => {
                sqlx::query("SELECT * FROM instance_config WHERE channel = ?1 ORDER BY created_at DESC")
                    .bind(channel.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(instance_from_row).collect()
    }

    /// Validates, then writes atomically; if `is_default` is set, clears any
    /// previous default in the same transaction (spec.md §4.1).
    pub async fn upsert(&self, spec: UpsertInstance) -> Result<Instance> {
        spec.validate()?;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let existing_id: Option<String> =
            sqlx::query_scalar("SELECT id FROM instance_config WHERE name = ?1")
                .bind(&spec.name)
                .fetch_optional(&mut *tx)
                .await?;

        if spec.is_default {
            sqlx::query("UPDATE instance_config SET is_default = 0 WHERE name != ?1")
                .bind(&spec.name)
                .execute(&mut *tx)
                .await?;
        }

        let id = existing_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());

        if existing_id.is_some() {
            sqlx::query(
                "UPDATE instance_config SET channel=?1, is_default=?2, enable_auto_split=?3, \
                 evolution_url=?4, evolution_key=?5, provider_instance_id=?6, bot_token=?7, \
                 agent_api_url=?8, agent_api_key=?9, agent_default_name=?10, agent_streaming=?11, \
                 agent_timeout_seconds=?12, updated_at=?13 WHERE id=?14",
            )
            .bind(spec.channel.as_str())
            .bind(spec.is_default)
            .bind(spec.enable_auto_split)
            .bind(&spec.evolution_url)
            .bind(&spec.evolution_key)
            .bind(&spec.provider_instance_id)
            .bind(&spec.bot_token)
            .bind(&spec.agent_api_url)
            .bind(&spec.agent_api_key)
            .bind(&spec.agent_default_name)
            .bind(spec.agent_streaming)
            .bind(spec.agent_timeout_seconds)
            .bind(now.to_rfc3339())
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "INSERT INTO instance_config (id, name, channel, is_default, enable_auto_split, \
                 evolution_url, evolution_key, provider_instance_id, bot_token, agent_api_url, \
                 agent_api_key, agent_default_name, agent_streaming, agent_timeout_seconds, \
                 created_at, updated_at) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)",
            )
            .bind(&id)
            .bind(&spec.name)
            .bind(spec.channel.as_str())
            .bind(spec.is_default)
            .bind(spec.enable_auto_split)
            .bind(&spec.evolution_url)
            .bind(&spec.evolution_key)
            .bind(&spec.provider_instance_id)
            .bind(&spec.bot_token)
            .bind(&spec.agent_api_url)
            .bind(&spec.agent_api_key)
            .bind(&spec.agent_default_name)
            .bind(spec.agent_streaming)
            .bind(spec.agent_timeout_seconds)
            .bind(now.to_rfc3339())
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        let row = sqlx::query("SELECT * FROM instance_config WHERE id = ?1")
            .bind(&id)
            .fetch_one(&mut *tx)
            .await?;
        let instance = instance_from_row(&row)?;
        tx.commit().await?;
        Ok(instance)
    }

    /// Fails if traces reference the instance unless `cascade`, in which
    /// case traces, payloads and access rules scoped to it are removed in
    /// the same transaction (spec.md §4.1).
    pub async fn delete(&self, name: &str, cascade: bool) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let trace_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM message_trace WHERE instance_name = ?1")
                .bind(name)
                .fetch_one(&mut *tx)
                .await?;

        if trace_count > 0 && !cascade {
            return Err(StorageError::Constraint(format!(
                "instance {name} has {trace_count} referencing traces; cascade required"
            ))
            .into());
        }

        if cascade {
            sqlx::query(
                "DELETE FROM trace_payload WHERE trace_id IN \
                 (SELECT id FROM message_trace WHERE instance_name = ?1)",
            )
            .bind(name)
            .execute(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM message_trace WHERE instance_name = ?1")
                .bind(name)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM access_rule WHERE instance_name = ?1")
                .bind(name)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM instance_config WHERE name = ?1")
            .bind(name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

fn instance_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Instance> {
    let channel_str: String = row.try_get("channel")?;
    let channel = ChannelKind::parse(&channel_str)
        .ok_or_else(|| StorageError::Constraint(format!("unknown channel kind {channel_str}")))?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Instance {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        channel,
        is_default: row.try_get::<i64, _>("is_default")? != 0,
        enable_auto_split: row.try_get::<i64, _>("enable_auto_split")? != 0,
        evolution_url: row.try_get("evolution_url")?,
        evolution_key: row.try_get("evolution_key")?,
        provider_instance_id: row.try_get("provider_instance_id")?,
        bot_token: row.try_get("bot_token")?,
        agent_api_url: row.try_get("agent_api_url")?,
        agent_api_key: row.try_get("agent_api_key")?,
        agent_default_name: row.try_get("agent_default_name")?,
        agent_streaming: row.try_get::<i64, _>("agent_streaming")? != 0,
        agent_timeout_seconds: row.try_get("agent_timeout_seconds")?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| StorageError::Constraint(e.to_string()))?
            .with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| StorageError::Constraint(e.to_string()))?
            .with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_store() -> InstanceStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        InstanceStore::new(pool)
    }

    fn wa_spec(name: &str, default: bool) -> UpsertInstance {
        UpsertInstance {
            name: name.into(),
            channel: ChannelKind::Whatsapp,
            is_default: default,
            enable_auto_split: true,
            evolution_url: Some("https://evo.example".into()),
            evolution_key: Some("key".into()),
            provider_instance_id: Some("acme-wa".into()),
            bot_token: None,
            agent_api_url: Some("https://agent.example".into()),
            agent_api_key: Some("agent-key".into()),
            agent_default_name: Some("default".into()),
            agent_streaming: false,
            agent_timeout_seconds: 60,
        }
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let store = setup_store().await;
        store.upsert(wa_spec("acme", true)).await.unwrap();
        let got = store.get("acme").await.unwrap().unwrap();
        assert_eq!(got.name, "acme");
        assert!(got.is_default);
    }

    #[tokio::test]
    async fn rejects_whatsapp_without_evolution_url() {
        let store = setup_store().await;
        let mut spec = wa_spec("acme", false);
        spec.evolution_url = None;
        assert!(store.upsert(spec).await.is_err());
    }

    #[tokio::test]
    async fn setting_default_clears_previous_default() {
        let store = setup_store().await;
        store.upsert(wa_spec("a", true)).await.unwrap();
        store.upsert(wa_spec("b", true)).await.unwrap();
        assert!(!store.get("a").await.unwrap().unwrap().is_default);
        assert!(store.get("b").await.unwrap().unwrap().is_default);
        assert_eq!(store.default_instance().await.unwrap().unwrap().name, "b");
    }

    #[tokio::test]
    async fn delete_without_cascade_fails_when_traces_reference_it() {
        let store = setup_store().await;
        store.upsert(wa_spec("acme", false)).await.unwrap();
        sqlx::query(
            "INSERT INTO message_trace (id, instance_name, sender_external_id, message_type, \
             session_name, status, received_at) VALUES ('t1','acme','+1','text','s','received', ?1)",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&store.pool)
        .await
        .unwrap();

        assert!(store.delete("acme", false).await.is_err());
        assert!(store.delete("acme", true).await.is_ok());
        assert!(store.get("acme").await.unwrap().is_none());
    }
}

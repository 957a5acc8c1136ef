//! `user` / `user_external_id` tables (spec.md §3 User).

use crate::error::Result;
use crate::ChannelKind;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub display_name: Option<String>,
}

pub struct UserStore {
    pool: SqlitePool,
}

impl UserStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Looks up `UserExternalId(channel, external_id)`; if missing, creates
    /// a new `User` and links it (spec.md §4.3 step 2).
    pub async fn resolve_or_create(
        &self,
        channel: ChannelKind,
        external_id: &str,
        display_name: Option<&str>,
    ) -> Result<User> {
        if let Some(user) = self.find_by_external_id(channel, external_id).await? {
            return Ok(user);
        }

        let now = Utc::now().to_rfc3339();
        let user_id = Uuid::new_v4().to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO user (id, display_name, created_at) VALUES (?1, ?2, ?3)")
            .bind(&user_id)
            .bind(display_name)
            .bind(&now)
            .execute(&mut *tx)
            .await?;

        self.link_external_id_tx(&mut tx, channel, external_id, &user_id).await?;

        tx.commit().await?;

        Ok(User { id: user_id, display_name: display_name.map(str::to_string) })
    }

    pub async fn find_by_external_id(
        &self,
        channel: ChannelKind,
        external_id: &str,
    ) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT u.id, u.display_name FROM user u \
             JOIN user_external_id ue ON ue.user_id = u.id \
             WHERE ue.channel_kind = ?1 AND ue.external_id = ?2",
        )
        .bind(channel.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| -> Result<User> {
            Ok(User { id: r.try_get("id")?, display_name: r.try_get("display_name")? })
        })
        .transpose()
    }

    /// Caller-initiated cross-channel linking only (spec.md §9 Open
    /// Question, resolved in SPEC_FULL.md §4.3: no inference from matching
    /// phone/username).
    pub async fn link_external_id(
        &self,
        channel: ChannelKind,
        external_id: &str,
        user_id: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.link_external_id_tx(&mut tx, channel, external_id, user_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn link_external_id_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        channel: ChannelKind,
        external_id: &str,
        user_id: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO user_external_id (id, channel_kind, external_id, user_id, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(channel.as_str())
        .bind(external_id)
        .bind(user_id)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_store() -> UserStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        UserStore::new(pool)
    }

    #[tokio::test]
    async fn resolve_or_create_is_idempotent_per_external_id() {
        let store = setup_store().await;
        let a = store
            .resolve_or_create(ChannelKind::Whatsapp, "+15551234567", Some("Ann"))
            .await
            .unwrap();
        let b = store
            .resolve_or_create(ChannelKind::Whatsapp, "+15551234567", Some("Ann"))
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn cross_channel_link_joins_existing_user() {
        let store = setup_store().await;
        let wa = store
            .resolve_or_create(ChannelKind::Whatsapp, "+15551234567", Some("Ann"))
            .await
            .unwrap();
        store.link_external_id(ChannelKind::Discord, "disc#123", &wa.id).await.unwrap();
        let via_discord = store
            .find_by_external_id(ChannelKind::Discord, "disc#123")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(via_discord.id, wa.id);
    }
}

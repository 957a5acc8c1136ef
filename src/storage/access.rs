//! `access_rule` table access (spec.md §3 AccessRule). The scoring algorithm
//! over these rows lives in `crate::access`.

use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Allow,
    Block,
}

impl RuleType {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleType::Allow => "allow",
            RuleType::Block => "block",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(RuleType::Allow),
            "block" => Some(RuleType::Block),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRule {
    pub id: i64,
    pub phone_pattern: String,
    pub rule_type: RuleType,
    /// `None` = global.
    pub instance_name: Option<String>,
}

pub struct AccessStore {
    pool: SqlitePool,
}

impl AccessStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Rejects a trailing-`*`-only pattern of length 1 (spec.md §4.2 edge
    /// case: "rule with trailing `*` but length 1 (`*`) is rejected at
    /// insert").
    pub async fn insert(
        &self,
        phone_pattern: &str,
        rule_type: RuleType,
        instance_name: Option<&str>,
    ) -> Result<AccessRule> {
        if phone_pattern == "*" {
            return Err(StorageError::Constraint(
                "access rule pattern must not be a bare '*'".into(),
            )
            .into());
        }

        // The unique index on (phone_pattern, instance_name) does not catch
        // duplicate global rules: SQLite treats every NULL as distinct, so
        // two rows with instance_name = NULL never collide there.
        if instance_name.is_none() {
            let exists: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM access_rule WHERE phone_pattern = ?1 AND instance_name IS NULL",
            )
            .bind(phone_pattern)
            .fetch_one(&self.pool)
            .await?;
            if exists > 0 {
                return Err(StorageError::Constraint(format!(
                    "duplicate global access rule for pattern {phone_pattern}"
                ))
                .into());
            }
        }

        let now = chrono::Utc::now().to_rfc3339();
        let id = sqlx::query(
            "INSERT INTO access_rule (phone_pattern, rule_type, instance_name, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(phone_pattern)
        .bind(rule_type.as_str())
        .bind(instance_name)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(AccessRule {
            id,
            phone_pattern: phone_pattern.to_string(),
            rule_type,
            instance_name: instance_name.map(str::to_string),
        })
    }

    /// All rules scoped to `instance_name` OR global (spec.md §4.2 step 2).
    pub async fn candidates(&self, instance_name: &str) -> Result<Vec<AccessRule>> {
        let rows = sqlx::query(
            "SELECT id, phone_pattern, rule_type, instance_name FROM access_rule \
             WHERE instance_name = ?1 OR instance_name IS NULL",
        )
        .bind(instance_name)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                let rule_type_str: String = r.try_get("rule_type")?;
                Ok(AccessRule {
                    id: r.try_get("id")?,
                    phone_pattern: r.try_get("phone_pattern")?,
                    rule_type: RuleType::parse(&rule_type_str).ok_or_else(|| {
                        StorageError::Constraint(format!("unknown rule_type {rule_type_str}"))
                    })?,
                    instance_name: r.try_get("instance_name")?,
                })
            })
            .collect()
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM access_rule WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_store() -> AccessStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        AccessStore::new(pool)
    }

    #[tokio::test]
    async fn rejects_bare_wildcard_pattern() {
        let store = setup_store().await;
        assert!(store.insert("*", RuleType::Allow, None).await.is_err());
    }

    #[tokio::test]
    async fn rejects_duplicate_global_pattern() {
        let store = setup_store().await;
        store.insert("+1555*", RuleType::Block, None).await.unwrap();
        assert!(store.insert("+1555*", RuleType::Allow, None).await.is_err());
        // Scoped rules with the same pattern are unaffected.
        store.insert("+1555*", RuleType::Allow, Some("acme")).await.unwrap();
    }

    #[tokio::test]
    async fn candidates_includes_global_and_scoped() {
        let store = setup_store().await;
        store.insert("+1555*", RuleType::Block, Some("acme")).await.unwrap();
        store.insert("+44*", RuleType::Allow, None).await.unwrap();
        store.insert("+1555*", RuleType::Allow, Some("other")).await.unwrap();

        let candidates = store.candidates("acme").await.unwrap();
        assert_eq!(candidates.len(), 2);
    }
}

//! Instance Registry (spec.md §4.1): source of truth for instance configs,
//! with a process-local cache invalidated on write.

use crate::error::Result;
use crate::storage::instances::{Instance, InstanceStore, ListFilter, UpsertInstance};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;

/// Snapshot of all instances keyed by name, swapped atomically on write
/// (spec.md §4.1 Caching: "process-local, keyed by name; invalidated on any
/// write; readers tolerate stale reads up to one event boundary").
type Snapshot = HashMap<String, Instance>;

pub struct Registry {
    store: InstanceStore,
    cache: ArcSwap<Snapshot>,
}

impl Registry {
    pub async fn new(store: InstanceStore) -> Result<Self> {
        let all = store.list(ListFilter::All).await?;
        let snapshot: Snapshot = all.into_iter().map(|i| (i.name.clone(), i)).collect();
        Ok(Self { store, cache: ArcSwap::from_pointee(snapshot) })
    }

    pub fn get(&self, name: &str) -> Option<Instance> {
        self.cache.load().get(name).cloned()
    }

    pub fn default_instance(&self) -> Option<Instance> {
        self.cache.load().values().find(|i| i.is_default).cloned()
    }

    /// Newest-first, matching the underlying store's ordering.
    pub fn list(&self) -> Vec<Instance> {
        let mut all: Vec<Instance> = self.cache.load().values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    pub async fn upsert(&self, spec: UpsertInstance) -> Result<Instance> {
        let instance = self.store.upsert(spec).await?;
        self.reload().await?;
        Ok(instance)
    }

    pub async fn delete(&self, name: &str, cascade: bool) -> Result<()> {
        self.store.delete(name, cascade).await?;
        self.reload().await?;
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        let all = self.store.list(ListFilter::All).await?;
        let snapshot: Snapshot = all.into_iter().map(|i| (i.name.clone(), i)).collect();
        self.cache.store(Arc::new(snapshot));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChannelKind;
    use sqlx::sqlite::SqlitePoolOptions;

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
            agent_api_url: None,
            agent_api_key: None,
            agent_default_name: None,
            agent_streaming: false,
            agent_timeout_seconds: 60,
        }
    }

    async fn setup_registry() -> Registry {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        Registry::new(InstanceStore::new(pool)).await.unwrap()
    }

    #[tokio::test]
    async fn upsert_is_visible_immediately_after_write() {
        let registry = setup_registry().await;
        assert!(registry.get("acme").is_none());
        registry.upsert(wa_spec("acme", true)).await.unwrap();
        assert!(registry.get("acme").is_some());
        assert_eq!(registry.default_instance().unwrap().name, "acme");
    }

    #[tokio::test]
    async fn delete_invalidates_cache() {
        let registry = setup_registry().await;
        registry.upsert(wa_spec("acme", false)).await.unwrap();
        registry.delete("acme", false).await.unwrap();
        assert!(registry.get("acme").is_none());
    }
}

//! In-process document store, used when no database is configured

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::models::{DocKind, StoredDocument};
use crate::storage::DocumentStore;

#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<(DocKind, String), StoredDocument>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, kind: DocKind, id: &str) -> Result<Option<StoredDocument>> {
        Ok(self.docs.read().await.get(&(kind, id.to_string())).cloned())
    }

    async fn save(&self, doc: &StoredDocument) -> Result<()> {
        let mut docs = self.docs.write().await;
        let key = (doc.kind, doc.id.clone());

        let mut doc = doc.clone();
        if let Some(existing) = docs.get(&key) {
            doc.doc_created = existing.doc_created;
        }
        docs.insert(key, doc);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn doc(kind: DocKind, id: &str, created: chrono::DateTime<Utc>) -> StoredDocument {
        StoredDocument {
            kind,
            id: id.to_string(),
            body: json!({ "name": id }),
            doc_created: created,
            doc_updated: created,
        }
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let store = MemoryStore::new();
        assert!(store.get(DocKind::Domain, "zief.pl").await.unwrap().is_none());

        store.save(&doc(DocKind::Domain, "zief.pl", Utc::now())).await.unwrap();
        let found = store.get(DocKind::Domain, "zief.pl").await.unwrap().unwrap();
        assert_eq!(found.body, json!({ "name": "zief.pl" }));
    }

    #[tokio::test]
    async fn test_kinds_do_not_collide() {
        let store = MemoryStore::new();
        store.save(&doc(DocKind::Tag, "Zeus", Utc::now())).await.unwrap();

        assert!(store.get(DocKind::Domain, "Zeus").await.unwrap().is_none());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_save_keeps_created() {
        let store = MemoryStore::new();
        let first = Utc::now() - Duration::days(40);
        store.save(&doc(DocKind::Domain, "zief.pl", first)).await.unwrap();

        let now = Utc::now();
        store.save(&doc(DocKind::Domain, "zief.pl", now)).await.unwrap();

        let found = store.get(DocKind::Domain, "zief.pl").await.unwrap().unwrap();
        assert_eq!(found.doc_created, first);
        assert_eq!(found.doc_updated, now);
    }
}

/// In-memory reference implementation of [`DocumentStore`].
///
/// Preserves creation order on reads and supports an offline toggle so
/// tests can exercise the retry path. Not intended for production — the
/// host application brings its own store client.

use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::ids::DocumentId;
use crate::store::{DocType, Document, DocumentStore, Fields, Filter, Result, StoreError};

#[derive(Default)]
struct Inner {
    seq: u64,
    docs: Vec<Document>,
    offline: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store becoming unreachable; subsequent calls fail
    /// with `Network` until toggled back.
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().unwrap().offline = offline;
    }

    pub fn document_count(&self) -> usize {
        self.inner.lock().unwrap().docs.len()
    }

    fn check_online(inner: &Inner) -> Result<()> {
        if inner.offline {
            Err(StoreError::Network("memory store offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create_document(&self, doc_type: DocType, fields: Fields) -> Result<DocumentId> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_online(&inner)?;

        inner.seq += 1;
        // Sequence prefix keeps ids lexicographically ordered by creation
        let id = DocumentId::new(format!("{:012}-{}", inner.seq, Uuid::new_v4()));
        inner.docs.push(Document {
            id: id.clone(),
            doc_type,
            fields,
        });
        Ok(id)
    }

    async fn read_documents(&self, doc_type: DocType, filter: &Filter) -> Result<Vec<Document>> {
        let inner = self.inner.lock().unwrap();
        Self::check_online(&inner)?;

        Ok(inner
            .docs
            .iter()
            .filter(|d| d.doc_type == doc_type && filter.matches_doc(d))
            .cloned()
            .collect())
    }

    async fn delete_document(&self, id: &DocumentId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_online(&inner)?;

        let before = inner.docs.len();
        inner.docs.retain(|d| &d.id != id);
        if inner.docs.len() == before {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn fields(owner: &str) -> Fields {
        let mut f = Fields::new();
        f.insert("owner".into(), Value::String(owner.into()));
        f
    }

    #[tokio::test]
    async fn test_create_read_delete() {
        let store = MemoryStore::new();
        let id = store
            .create_document(DocType::FollowRequest, fields("alice"))
            .await
            .unwrap();

        let docs = store
            .read_documents(DocType::FollowRequest, &Filter::new().eq("owner", "alice"))
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, id);

        store.delete_document(&id).await.unwrap();
        assert!(matches!(
            store.delete_document(&id).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_reads_preserve_creation_order() {
        let store = MemoryStore::new();
        for owner in ["a", "b", "c"] {
            store
                .create_document(DocType::Post, fields(owner))
                .await
                .unwrap();
        }
        let docs = store
            .read_documents(DocType::Post, &Filter::new())
            .await
            .unwrap();
        let owners: Vec<_> = docs
            .iter()
            .map(|d| d.fields["owner"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(owners, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_offline_toggle() {
        let store = MemoryStore::new();
        store.set_offline(true);
        assert!(matches!(
            store.create_document(DocType::Post, Fields::new()).await,
            Err(StoreError::Network(_))
        ));

        store.set_offline(false);
        assert!(store.create_document(DocType::Post, Fields::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_type_isolation() {
        let store = MemoryStore::new();
        store.create_document(DocType::Post, fields("x")).await.unwrap();
        let grants = store
            .read_documents(DocType::Grant, &Filter::new())
            .await
            .unwrap();
        assert!(grants.is_empty());
    }
}

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::traits::{ChunkStore, StoredDocument};
use crate::types::DocumentId;

/// Process-local [`ChunkStore`]. Useful in tests and for ephemeral services
/// that still want the restore path exercised.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<BTreeMap<DocumentId, StoredDocument>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.lock().map_or(0, |docs| docs.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ChunkStore for MemoryStore {
    async fn save_document(&self, doc: &StoredDocument) -> anyhow::Result<()> {
        let mut docs = self
            .documents
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        docs.insert(doc.document.id.clone(), doc.clone());
        Ok(())
    }

    async fn delete_document(&self, id: &DocumentId) -> anyhow::Result<()> {
        let mut docs = self
            .documents
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        docs.remove(id);
        Ok(())
    }

    async fn load_all(&self) -> anyhow::Result<Vec<StoredDocument>> {
        let docs = self
            .documents
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        Ok(docs.values().cloned().collect())
    }
}

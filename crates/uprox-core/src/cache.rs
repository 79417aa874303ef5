//! Storage schema cache
//!
//! Layout analysis is deterministic per implementation identity, so schemas
//! are cached by content hash in a bounded concurrent cache.

use moka::future::Cache;
use std::sync::Arc;
use tracing::debug;
use uprox_artifact::{ContentHash, Implementation, LayoutAnalyzer, LayoutError, StorageSchema};

/// Schemas keyed by implementation identity
#[derive(Debug, Clone)]
pub struct LayoutCache {
    inner: Cache<ContentHash, Arc<StorageSchema>>,
    analyzer: LayoutAnalyzer,
}

impl LayoutCache {
    /// Create new cache with max capacity
    #[inline]
    #[must_use]
    pub fn new(max_capacity: u64) -> Self {
        Self {
            inner: Cache::new(max_capacity),
            analyzer: LayoutAnalyzer::new(),
        }
    }

    /// Schema of an implementation, analyzing it on first use
    ///
    /// Failures are not cached.
    ///
    /// # Errors
    /// Returns the analyzer's [`LayoutError`].
    pub async fn schema_of(
        &self,
        implementation: &Implementation,
    ) -> Result<Arc<StorageSchema>, LayoutError> {
        let id = *implementation.hash();
        if let Some(cached) = self.inner.get(&id).await {
            return Ok(cached);
        }

        let schema = Arc::new(self.analyzer.analyze(implementation)?);
        debug!(
            implementation = %id.short(),
            entries = schema.len(),
            "Storage layout analyzed"
        );
        self.inner.insert(id, Arc::clone(&schema)).await;
        Ok(schema)
    }

    /// Check whether a schema is cached
    #[must_use]
    pub async fn contains(&self, id: &ContentHash) -> bool {
        self.inner.get(id).await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uprox_artifact::{ContractSource, LayoutBuilder};

    fn implementation(layout: bool) -> Implementation {
        Implementation::new(ContractSource {
            contract_name: "Box".to_string(),
            bytecode: vec![0x60, 0x80],
            compiler_version: "0.8.11".to_string(),
            initializer: None,
            has_constructor: false,
            upgrade_entrypoint: true,
            storage_layout: layout
                .then(|| LayoutBuilder::new().var("value", "t_uint256").build().unwrap()),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn caches_by_identity() {
        let cache = LayoutCache::new(16);
        let implementation = implementation(true);

        let first = cache.schema_of(&implementation).await.unwrap();
        assert!(cache.contains(implementation.hash()).await);
        let second = cache.schema_of(&implementation).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache = LayoutCache::new(16);
        let bare = implementation(false);

        assert!(cache.schema_of(&bare).await.is_err());
        assert!(!cache.contains(bare.hash()).await);
    }
}

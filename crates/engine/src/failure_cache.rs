// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Failure cache policy (spec §4.G): a thin layer over
//! `njd_storage::MetadataStore`'s failure keyspace that centralises the
//! cacheability decision from `GoalError::cacheable` so goal code never
//! has to re-derive it.

use crate::error::GoalError;
use njd_storage::{MetadataStore, StorageError};
use njd_store::StorePath;
use std::sync::Arc;

pub struct FailureCache {
    metadata: Arc<dyn MetadataStore>,
    enabled: bool,
}

impl FailureCache {
    pub fn new(metadata: Arc<dyn MetadataStore>, enabled: bool) -> Self {
        Self { metadata, enabled }
    }

    pub async fn has_failed(&self, path: &StorePath) -> bool {
        self.metadata.has_path_failed(path).await
    }

    /// Insert `path` into the cache iff caching is enabled and `error`'s
    /// cacheability policy allows it for this derivation.
    pub async fn record_if_cacheable(
        &self,
        path: &StorePath,
        error: &GoalError,
        drv_is_fixed_output: bool,
    ) -> Result<bool, StorageError> {
        if !self.enabled || !error.cacheable(drv_is_fixed_output) {
            return Ok(false);
        }
        self.metadata.register_failed_path(path).await?;
        Ok(true)
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        self.metadata.clear_failure_cache().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use njd_storage::InMemoryMetadataStore;

    fn path(name: &str) -> StorePath {
        StorePath::from_fingerprint(name, name).unwrap()
    }

    #[tokio::test]
    async fn build_failures_are_cached_when_enabled() {
        let cache = FailureCache::new(Arc::new(InMemoryMetadataStore::new()), true);
        let p = path("out");
        let err = GoalError::BuildFailure { drv: path("drv"), reason: "bad exit".into() };
        assert!(cache.record_if_cacheable(&p, &err, false).await.unwrap());
        assert!(cache.has_failed(&p).await);
    }

    #[tokio::test]
    async fn fixed_output_failures_are_never_cached() {
        let cache = FailureCache::new(Arc::new(InMemoryMetadataStore::new()), true);
        let p = path("out");
        let err = GoalError::BuildFailure { drv: path("drv"), reason: "hash mismatch".into() };
        assert!(!cache.record_if_cacheable(&p, &err, true).await.unwrap());
        assert!(!cache.has_failed(&p).await);
    }

    #[tokio::test]
    async fn hook_failures_are_never_cached() {
        let cache = FailureCache::new(Arc::new(InMemoryMetadataStore::new()), true);
        let p = path("out");
        let err = GoalError::HookFailure("protocol violation".into());
        assert!(!cache.record_if_cacheable(&p, &err, false).await.unwrap());
    }

    #[tokio::test]
    async fn disabled_caching_never_inserts() {
        let cache = FailureCache::new(Arc::new(InMemoryMetadataStore::new()), false);
        let p = path("out");
        let err = GoalError::BuildFailure { drv: path("drv"), reason: "bad exit".into() };
        assert!(!cache.record_if_cacheable(&p, &err, false).await.unwrap());
    }
}

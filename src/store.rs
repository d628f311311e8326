// src/store.rs

//! Result persistence.
//!
//! Two shapes of state with different write disciplines: classified results
//! are append-only history, while each domain's status map is last-write-wins
//! per category. The trait keeps the processor backend-agnostic; the
//! in-memory implementation backs tests and single-instance runs.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::core::models::{ClassifiedResult, DomainStatusMap, ScanCategory, ScanStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("stored record did not decode: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait ResultRepository: Send + Sync {
    /// Appends one classified result. History is never rewritten.
    async fn insert_result(&self, result: ClassifiedResult) -> Result<(), StoreError>;

    /// Every stored result for a domain, oldest first.
    async fn results_for_domain(&self, domain_key: &str)
        -> Result<Vec<ClassifiedResult>, StoreError>;

    /// Overwrites one category verdict on the domain's status map.
    async fn update_status(
        &self,
        domain_key: &str,
        category: ScanCategory,
        status: ScanStatus,
    ) -> Result<(), StoreError>;

    /// The domain's current status map; all-Unknown for a never-scanned
    /// domain.
    async fn status_map(&self, domain_key: &str) -> Result<DomainStatusMap, StoreError>;
}

#[derive(Default)]
struct MemoryState {
    results: Vec<ClassifiedResult>,
    statuses: HashMap<String, DomainStatusMap>,
}

#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<MemoryState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultRepository for MemoryRepository {
    async fn insert_result(&self, result: ClassifiedResult) -> Result<(), StoreError> {
        self.state.lock().await.results.push(result);
        Ok(())
    }

    async fn results_for_domain(
        &self,
        domain_key: &str,
    ) -> Result<Vec<ClassifiedResult>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .results
            .iter()
            .filter(|r| r.domain_key == domain_key)
            .cloned()
            .collect())
    }

    async fn update_status(
        &self,
        domain_key: &str,
        category: ScanCategory,
        status: ScanStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .statuses
            .entry(domain_key.to_string())
            .or_default()
            .set(category, status);
        Ok(())
    }

    async fn status_map(&self, domain_key: &str) -> Result<DomainStatusMap, StoreError> {
        let state = self.state.lock().await;
        Ok(state.statuses.get(domain_key).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::RawScanResult;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn result(domain_key: &str, status: ScanStatus) -> ClassifiedResult {
        ClassifiedResult {
            scan_id: Uuid::new_v4(),
            domain_key: domain_key.to_string(),
            shared_id: None,
            status,
            categories: BTreeMap::new(),
            raw_result: RawScanResult::Unreachable,
            ruleset_version: "1.0.0".into(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn history_appends_and_filters_by_domain() {
        let repo = MemoryRepository::new();
        repo.insert_result(result("a", ScanStatus::Fail)).await.unwrap();
        repo.insert_result(result("a", ScanStatus::Pass)).await.unwrap();
        repo.insert_result(result("b", ScanStatus::Pass)).await.unwrap();

        let history = repo.results_for_domain("a").await.unwrap();
        assert_eq!(history.len(), 2);
        // Oldest first; the earlier Fail record survives the later Pass.
        assert_eq!(history[0].status, ScanStatus::Fail);
        assert_eq!(history[1].status, ScanStatus::Pass);
    }

    #[tokio::test]
    async fn status_map_is_last_write_wins_per_category() {
        let repo = MemoryRepository::new();
        repo.update_status("a", ScanCategory::Dmarc, ScanStatus::Fail)
            .await
            .unwrap();
        repo.update_status("a", ScanCategory::Dmarc, ScanStatus::Pass)
            .await
            .unwrap();
        repo.update_status("a", ScanCategory::Https, ScanStatus::Fail)
            .await
            .unwrap();

        let map = repo.status_map("a").await.unwrap();
        assert_eq!(map.dmarc, ScanStatus::Pass);
        assert_eq!(map.https, ScanStatus::Fail);
        assert_eq!(map.spf, ScanStatus::Unknown);
    }

    #[tokio::test]
    async fn unscanned_domain_reads_all_unknown() {
        let repo = MemoryRepository::new();
        assert_eq!(
            repo.status_map("never-seen").await.unwrap(),
            DomainStatusMap::default()
        );
    }
}

//! Generation history and token quota storage

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::core::errors::Result;
use crate::core::models::{GenerationHistory, QuotaStatus};
use crate::core::quota::QuotaManager;

/// Storage consumed by the orchestrator
#[async_trait]
pub trait Repository: Send + Sync {
    /// Store one generation record
    async fn save_generation(&self, history: &GenerationHistory) -> Result<()>;

    /// Most recent generations of a user, newest first
    async fn get_history(&self, user_id: &str, limit: usize) -> Result<Vec<GenerationHistory>>;

    /// Current token quota of a user
    async fn get_quota_usage(&self, user_id: &str) -> Result<QuotaStatus>;

    /// Add consumed tokens to the user's daily usage
    async fn update_quota_usage(&self, user_id: &str, tokens: u64) -> Result<()>;
}

/// Process-local repository
pub struct InMemoryRepository {
    history: DashMap<String, Vec<GenerationHistory>>,
    quotas: QuotaManager,
    daily_limit: u64,
}

impl InMemoryRepository {
    pub fn new(daily_limit: u64) -> Self {
        Self::with_quota_manager(QuotaManager::new(), daily_limit)
    }

    /// Use an existing quota manager, e.g. one with a fixed clock
    pub fn with_quota_manager(quotas: QuotaManager, daily_limit: u64) -> Self {
        Self {
            history: DashMap::new(),
            quotas,
            daily_limit,
        }
    }
}

impl std::fmt::Debug for InMemoryRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryRepository")
            .field("users", &self.history.len())
            .field("daily_limit", &self.daily_limit)
            .finish()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn save_generation(&self, history: &GenerationHistory) -> Result<()> {
        debug!(
            user_id = %history.user_id,
            generation_id = %history.id,
            tokens = history.tokens,
            completed = history.completed,
            "Saving generation"
        );
        self.history
            .entry(history.user_id.clone())
            .or_default()
            .push(history.clone());
        Ok(())
    }

    async fn get_history(&self, user_id: &str, limit: usize) -> Result<Vec<GenerationHistory>> {
        Ok(self
            .history
            .get(user_id)
            .map(|records| records.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_quota_usage(&self, user_id: &str) -> Result<QuotaStatus> {
        Ok(self.quotas.status_or_init(user_id, self.daily_limit))
    }

    async fn update_quota_usage(&self, user_id: &str, tokens: u64) -> Result<()> {
        self.quotas.status_or_init(user_id, self.daily_limit);
        self.quotas.add_usage(user_id, tokens);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio_test::assert_ok;

    fn record(id: &str, user: &str) -> GenerationHistory {
        GenerationHistory {
            id: id.to_string(),
            user_id: user.to_string(),
            project_id: None,
            prompt: "p".to_string(),
            content: "c".to_string(),
            model: "m".to_string(),
            tokens: 1,
            completed: true,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_history_newest_first() {
        let repo = InMemoryRepository::new(100);
        for id in ["a", "b", "c"] {
            assert_ok!(repo.save_generation(&record(id, "u1")).await);
        }
        assert_ok!(repo.save_generation(&record("x", "u2")).await);

        let ids: Vec<String> = repo
            .get_history("u1", 2)
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.id)
            .collect();
        assert_eq!(ids, vec!["c", "b"]);
        assert!(repo.get_history("nobody", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_token_quota() {
        let repo = InMemoryRepository::new(100);
        let status = repo.get_quota_usage("u1").await.unwrap();
        assert_eq!(status.remaining, 100);

        assert_ok!(repo.update_quota_usage("u1", 60).await);
        assert_ok!(repo.update_quota_usage("u1", 60).await);
        let status = repo.get_quota_usage("u1").await.unwrap();
        assert_eq!(status.used_today, 120);
        assert_eq!(status.remaining, 0);
        assert!(!status.can_generate());

        // Accounting for a user never queried registers them first
        repo.update_quota_usage("u2", 5).await.unwrap();
        assert_eq!(repo.get_quota_usage("u2").await.unwrap().used_today, 5);
    }
}

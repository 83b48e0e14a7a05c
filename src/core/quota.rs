//! Per-user daily usage quota with lazy midnight rollover

use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::models::QuotaStatus;

/// Source of the current day
pub type DayClock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

/// Usage counter for one user
#[derive(Debug, Clone)]
struct QuotaEntry {
    daily_limit: u64,
    used_today: u64,
    last_reset_day: NaiveDate,
}

impl QuotaEntry {
    fn new(daily_limit: u64, today: NaiveDate) -> Self {
        Self {
            daily_limit,
            used_today: 0,
            last_reset_day: today,
        }
    }

    /// The only reset path: first access on a later day zeroes the counter
    fn roll_over(&mut self, today: NaiveDate) {
        if self.last_reset_day < today {
            self.used_today = 0;
            self.last_reset_day = today;
        }
    }

    fn status(&self, user_id: &str) -> QuotaStatus {
        QuotaStatus::new(user_id, self.daily_limit, self.used_today, self.last_reset_day)
    }
}

/// Quota manager for per-user daily usage
///
/// Entries live in a sharded map; every operation holds only the shard lock
/// of the user it touches.
#[derive(Clone)]
pub struct QuotaManager {
    quotas: Arc<DashMap<String, QuotaEntry>>,
    clock: DayClock,
}

impl QuotaManager {
    /// Create a manager using the UTC calendar day
    pub fn new() -> Self {
        Self::with_clock(Arc::new(|| Utc::now().date_naive()))
    }

    /// Create a manager with an explicit day source
    pub fn with_clock(clock: DayClock) -> Self {
        Self {
            quotas: Arc::new(DashMap::new()),
            clock,
        }
    }

    fn today(&self) -> NaiveDate {
        (self.clock)()
    }

    /// Check whether the user still has quota, registering them on first use
    ///
    /// `daily_limit` only applies when the user is first registered. Later
    /// calls keep the stored limit and ignore the argument.
    pub fn check_quota(&self, user_id: &str, daily_limit: u64) -> bool {
        let today = self.today();
        let mut entry = self
            .quotas
            .entry(user_id.to_string())
            .or_insert_with(|| QuotaEntry::new(daily_limit, today));
        entry.roll_over(today);
        entry.used_today < entry.daily_limit
    }

    /// Count one use; does not re-check the limit
    pub fn use_quota(&self, user_id: &str) {
        self.add_usage(user_id, 1);
    }

    /// Count `amount` units against a known user
    pub fn add_usage(&self, user_id: &str, amount: u64) {
        let today = self.today();
        if let Some(mut entry) = self.quotas.get_mut(user_id) {
            entry.roll_over(today);
            entry.used_today = entry.used_today.saturating_add(amount);
            debug!(
                user_id = user_id,
                amount = amount,
                remaining = entry.daily_limit.saturating_sub(entry.used_today),
                "Quota usage recorded"
            );
        }
    }

    /// Check and count one use under the same lock
    ///
    /// As with `check_quota`, `daily_limit` only seeds a new user.
    pub fn try_consume(&self, user_id: &str, daily_limit: u64) -> bool {
        let today = self.today();
        let mut entry = self
            .quotas
            .entry(user_id.to_string())
            .or_insert_with(|| QuotaEntry::new(daily_limit, today));
        entry.roll_over(today);
        if entry.used_today < entry.daily_limit {
            entry.used_today += 1;
            true
        } else {
            false
        }
    }

    /// Copy of the user's quota, `None` if never referenced
    pub fn get_quota_status(&self, user_id: &str) -> Option<QuotaStatus> {
        let today = self.today();
        self.quotas.get_mut(user_id).map(|mut entry| {
            entry.roll_over(today);
            entry.status(user_id)
        })
    }

    /// Copy of the user's quota, registering them with `daily_limit` if new
    pub fn status_or_init(&self, user_id: &str, daily_limit: u64) -> QuotaStatus {
        let today = self.today();
        let mut entry = self
            .quotas
            .entry(user_id.to_string())
            .or_insert_with(|| QuotaEntry::new(daily_limit, today));
        entry.roll_over(today);
        entry.status(user_id)
    }

    /// Reset one user's counter
    pub fn reset(&self, user_id: &str) {
        let today = self.today();
        if let Some(mut entry) = self.quotas.get_mut(user_id) {
            entry.used_today = 0;
            entry.last_reset_day = today;
            info!(user_id = user_id, "Quota reset");
        }
    }

    /// Number of tracked users
    pub fn len(&self) -> usize {
        self.quotas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotas.is_empty()
    }
}

impl Default for QuotaManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QuotaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaManager")
            .field("users", &self.quotas.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Clock starting at 2024-03-01 that tests can advance
    fn shifting_clock() -> (DayClock, Arc<AtomicI64>) {
        let offset = Arc::new(AtomicI64::new(0));
        let base = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let shared = offset.clone();
        let clock: DayClock =
            Arc::new(move || base + Duration::days(shared.load(Ordering::SeqCst)));
        (clock, offset)
    }

    #[test]
    fn test_quota_check_and_use() {
        let manager = QuotaManager::new();

        assert!(manager.check_quota("u1", 2));
        manager.use_quota("u1");
        assert!(manager.check_quota("u1", 2));
        manager.use_quota("u1");
        assert!(!manager.check_quota("u1", 2));

        let status = manager.get_quota_status("u1").unwrap();
        assert_eq!(status.used_today, 2);
        assert_eq!(status.remaining, 0);
    }

    #[test]
    fn test_limit_is_fixed_at_registration() {
        let manager = QuotaManager::new();
        assert!(manager.check_quota("u1", 1));
        manager.use_quota("u1");

        // A larger limit on later calls does not widen the stored one
        assert!(!manager.check_quota("u1", 10));
        assert!(!manager.try_consume("u1", 10));
        assert_eq!(manager.get_quota_status("u1").unwrap().daily_limit, 1);
    }

    #[test]
    fn test_unknown_user_has_no_status() {
        let manager = QuotaManager::new();
        assert!(manager.get_quota_status("ghost").is_none());
        manager.use_quota("ghost");
        assert!(manager.get_quota_status("ghost").is_none());
    }

    #[test]
    fn test_rollover_resets_once_per_day() {
        let (clock, offset) = shifting_clock();
        let manager = QuotaManager::with_clock(clock);

        assert!(manager.check_quota("u1", 3));
        manager.add_usage("u1", 3);
        assert!(!manager.check_quota("u1", 3));

        offset.store(1, Ordering::SeqCst);
        assert!(manager.check_quota("u1", 3));
        let status = manager.get_quota_status("u1").unwrap();
        assert_eq!(status.used_today, 0);
        assert_eq!(status.last_reset_day, NaiveDate::from_ymd_opt(2024, 3, 2).unwrap());

        // Later accesses on the same day keep counting
        manager.use_quota("u1");
        for _ in 0..5 {
            assert!(manager.check_quota("u1", 3));
        }
        assert_eq!(manager.get_quota_status("u1").unwrap().used_today, 1);
    }

    #[test]
    fn test_returned_status_is_a_copy() {
        let manager = QuotaManager::new();
        manager.check_quota("u1", 10);
        let mut status = manager.get_quota_status("u1").unwrap();
        status.used_today = 99;
        assert_eq!(manager.get_quota_status("u1").unwrap().used_today, 0);
    }

    #[test]
    fn test_reset() {
        let manager = QuotaManager::new();
        manager.check_quota("u1", 1);
        manager.use_quota("u1");
        assert!(!manager.check_quota("u1", 1));
        manager.reset("u1");
        assert!(manager.check_quota("u1", 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_try_consume_never_over_admits() {
        let manager = QuotaManager::new();
        let mut handles = Vec::new();
        for _ in 0..50 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move { manager.try_consume("hot", 10) }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
        assert_eq!(manager.get_quota_status("hot").unwrap().used_today, 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_split_check_then_use_over_admission_is_bounded() {
        let manager = QuotaManager::new();
        let barrier = Arc::new(tokio::sync::Barrier::new(50));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let manager = manager.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                if manager.check_quota("racy", 10) {
                    tokio::task::yield_now().await;
                    manager.use_quota("racy");
                    true
                } else {
                    false
                }
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        // The split API can admit more than the limit, never more than the callers
        assert!(admitted >= 10);
        assert!(admitted <= 50);
        assert_eq!(
            manager.get_quota_status("racy").unwrap().used_today,
            admitted as u64
        );
    }
}

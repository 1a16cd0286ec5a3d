//! Account pool: selection, leasing and credit bookkeeping.
//!
//! Every lease mutation goes through the pool's allocation lock, so the
//! availability check and the lease write happen as one step.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::Result;
use crate::domain::{Account, AccountId, AccountLease, JobId, TokenStatus};
use crate::provider::CreditsInfo;
use crate::store::JobStore;

/// A leased account handed to a generate task.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub account: Account,
    /// Every eligible account was excluded, so the rotation started over and
    /// the caller should forget its exclusions.
    pub rotation_reset: bool,
}

pub struct AccountPool {
    store: Arc<dyn JobStore>,
    lease_ttl: chrono::Duration,
    alloc_lock: Mutex<()>,
}

impl AccountPool {
    pub fn new(store: Arc<dyn JobStore>, lease_ttl: chrono::Duration) -> Self {
        Self {
            store,
            lease_ttl,
            alloc_lock: Mutex::new(()),
        }
    }

    /// Lease the least recently used eligible account for `holder`.
    ///
    /// Returns `None` when no account is eligible; callers back off and retry.
    pub async fn acquire(
        &self,
        platform: &str,
        exclude: &[AccountId],
        holder: JobId,
    ) -> Result<Option<Allocation>> {
        let _guard = self.alloc_lock.lock().await;
        let now = Utc::now();

        let mut rotation_reset = false;
        let mut candidates = self
            .store
            .list_available_accounts(platform, exclude, now)
            .await?;
        if candidates.is_empty() && !exclude.is_empty() {
            candidates = self.store.list_available_accounts(platform, &[], now).await?;
            rotation_reset = !candidates.is_empty();
        }

        let Some(mut account) = candidates.into_iter().next() else {
            debug!(platform, job_id = %holder, "No eligible account");
            return Ok(None);
        };

        account.lease = Some(AccountLease {
            holder,
            acquired_at: now,
            expires_at: now
                .checked_add_signed(self.lease_ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        });
        account.last_used = Some(now);
        self.store.save_account(&account).await?;

        debug!(
            account_id = %account.id,
            job_id = %holder,
            rotation_reset,
            "Account leased"
        );
        Ok(Some(Allocation {
            account,
            rotation_reset,
        }))
    }

    /// Whether any account could be leased for `platform` right now.
    pub async fn has_eligible(&self, platform: &str) -> Result<bool> {
        Ok(!self
            .store
            .list_available_accounts(platform, &[], Utc::now())
            .await?
            .is_empty())
    }

    /// Release the lease on `account_id` if `holder` still owns it.
    pub async fn release(&self, account_id: AccountId, holder: JobId) -> Result<bool> {
        let _guard = self.alloc_lock.lock().await;
        let mut account = self.store.load_account(account_id).await?;
        if !account.lease.as_ref().is_some_and(|l| l.holder == holder) {
            return Ok(false);
        }
        account.lease = None;
        self.store.save_account(&account).await?;
        debug!(account_id = %account_id, job_id = %holder, "Account released");
        Ok(true)
    }

    /// Release every lease held by `holder`.
    pub async fn release_holder(&self, holder: JobId) -> Result<usize> {
        self.clear_leases(|lease, _| lease.holder == holder).await
    }

    /// Release every lease. Returns how many were cleared.
    pub async fn release_all(&self) -> Result<usize> {
        self.clear_leases(|_, _| true).await
    }

    /// Clear leases whose TTL elapsed.
    pub async fn reap_expired_leases(&self, now: DateTime<Utc>) -> Result<usize> {
        self.clear_leases(move |lease, _| lease.is_expired(now)).await
    }

    async fn clear_leases<F>(&self, mut predicate: F) -> Result<usize>
    where
        F: FnMut(&AccountLease, &Account) -> bool,
    {
        let _guard = self.alloc_lock.lock().await;
        let mut cleared = 0;
        for mut account in self.store.list_accounts(None).await? {
            let clear = match account.lease.as_ref() {
                Some(lease) => predicate(lease, &account),
                None => false,
            };
            if clear {
                account.lease = None;
                self.store.save_account(&account).await?;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    /// Store a fresh credit reading for `account_id`.
    pub async fn record_credits(
        &self,
        account_id: AccountId,
        credits: CreditsInfo,
        now: DateTime<Utc>,
    ) -> Result<Account> {
        let _guard = self.alloc_lock.lock().await;
        let mut account = self.store.load_account(account_id).await?;
        account.credits = Some(credits.credits);
        account.credits_reset_at = credits.reset_seconds.and_then(|secs| {
            let secs = i64::try_from(secs).ok()?;
            now.checked_add_signed(chrono::Duration::try_seconds(secs)?)
        });
        self.store.save_account(&account).await?;
        if account.is_exhausted() {
            info!(
                account_id = %account_id,
                reset_at = ?account.credits_reset_at,
                "Account credits exhausted"
            );
        }
        Ok(account)
    }

    pub async fn set_token_status(&self, account_id: AccountId, status: TokenStatus) -> Result<()> {
        let _guard = self.alloc_lock.lock().await;
        let mut account = self.store.load_account(account_id).await?;
        if account.token_status != status {
            account.token_status = status;
            self.store.save_account(&account).await?;
        }
        Ok(())
    }

    /// Return exhausted accounts whose reset time passed to "unknown" credits.
    pub async fn restore_exhausted(&self, now: DateTime<Utc>) -> Result<usize> {
        let _guard = self.alloc_lock.lock().await;
        let mut restored = 0;
        for mut account in self.store.list_accounts(None).await? {
            let due = account.is_exhausted()
                && account.credits_reset_at.is_some_and(|reset| reset <= now);
            if due {
                account.credits = None;
                account.credits_reset_at = None;
                if let Err(e) = self.store.save_account(&account).await {
                    warn!(account_id = %account.id, error = %e, "Failed to restore account credits");
                    continue;
                }
                info!(account_id = %account.id, "Account credits restored after reset");
                restored += 1;
            }
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewAccount;
    use crate::store::MemoryJobStore;
    use std::collections::HashSet;

    async fn pool_with(accounts: &[NewAccount]) -> (Arc<MemoryJobStore>, AccountPool) {
        let store = Arc::new(MemoryJobStore::new());
        for account in accounts {
            store.insert_account(account.clone()).await.unwrap();
        }
        let pool = AccountPool::new(store.clone(), chrono::Duration::seconds(600));
        (store, pool)
    }

    #[tokio::test]
    async fn test_lease_is_exclusive() {
        let (_store, pool) = pool_with(&[NewAccount::new("sora", "a", "ref-a")]).await;

        let first = pool.acquire("sora", &[], JobId(1)).await.unwrap();
        assert!(first.is_some());
        assert!(pool.acquire("sora", &[], JobId(2)).await.unwrap().is_none());

        let account_id = first.unwrap().account.id;
        assert!(!pool.release(account_id, JobId(2)).await.unwrap());
        assert!(pool.release(account_id, JobId(1)).await.unwrap());
        assert!(pool.acquire("sora", &[], JobId(2)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_acquires_never_share_an_account() {
        let accounts: Vec<NewAccount> = (0..3)
            .map(|i| NewAccount::new("sora", format!("acct-{i}"), format!("ref-{i}")))
            .collect();
        let (_store, pool) = pool_with(&accounts).await;
        let pool = Arc::new(pool);

        let mut handles = Vec::new();
        for job in 0..10 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.acquire("sora", &[], JobId(job)).await.unwrap()
            }));
        }

        let mut leased = HashSet::new();
        let mut granted = 0;
        for handle in handles {
            if let Some(allocation) = handle.await.unwrap() {
                granted += 1;
                assert!(leased.insert(allocation.account.id));
            }
        }
        assert_eq!(granted, 3);
    }

    #[tokio::test]
    async fn test_least_recently_used_rotation() {
        let (_store, pool) = pool_with(&[
            NewAccount::new("sora", "a", "ref-a"),
            NewAccount::new("sora", "b", "ref-b"),
        ])
        .await;

        let first = pool.acquire("sora", &[], JobId(1)).await.unwrap().unwrap();
        pool.release(first.account.id, JobId(1)).await.unwrap();
        let second = pool.acquire("sora", &[], JobId(2)).await.unwrap().unwrap();

        assert_ne!(first.account.id, second.account.id);
    }

    #[tokio::test]
    async fn test_exclusions_wrap_around() {
        let (_store, pool) = pool_with(&[NewAccount::new("sora", "a", "ref-a")]).await;
        let only = AccountId(1);

        let allocation = pool.acquire("sora", &[only], JobId(1)).await.unwrap().unwrap();
        assert_eq!(allocation.account.id, only);
        assert!(allocation.rotation_reset);
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let store = Arc::new(MemoryJobStore::new());
        store
            .insert_account(NewAccount::new("sora", "a", "ref-a"))
            .await
            .unwrap();
        let pool = AccountPool::new(store.clone(), chrono::Duration::milliseconds(-1));

        assert!(pool.acquire("sora", &[], JobId(1)).await.unwrap().is_some());
        // TTL already elapsed, so the account is free again.
        let taken = pool.acquire("sora", &[], JobId(2)).await.unwrap().unwrap();
        assert_eq!(taken.account.lease.unwrap().holder, JobId(2));

        // The original holder cannot release the new lease.
        assert!(!pool.release(AccountId(1), JobId(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_exhausted_accounts_are_skipped_then_restored() {
        let (store, pool) = pool_with(&[NewAccount::new("sora", "a", "ref-a")]).await;
        let now = Utc::now();

        let account = pool
            .record_credits(
                AccountId(1),
                CreditsInfo {
                    credits: 0,
                    reset_seconds: Some(60),
                },
                now,
            )
            .await
            .unwrap();
        assert!(account.is_exhausted());
        assert!(!pool.has_eligible("sora").await.unwrap());

        assert_eq!(pool.restore_exhausted(now).await.unwrap(), 0);
        let later = now + chrono::Duration::seconds(61);
        assert_eq!(pool.restore_exhausted(later).await.unwrap(), 1);

        let restored = store.load_account(AccountId(1)).await.unwrap();
        assert_eq!(restored.credits, None);
        assert!(pool.has_eligible("sora").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_all_and_by_holder() {
        let (_store, pool) = pool_with(&[
            NewAccount::new("sora", "a", "ref-a"),
            NewAccount::new("sora", "b", "ref-b"),
        ])
        .await;
        pool.acquire("sora", &[], JobId(1)).await.unwrap().unwrap();
        pool.acquire("sora", &[], JobId(2)).await.unwrap().unwrap();

        assert_eq!(pool.release_holder(JobId(1)).await.unwrap(), 1);
        assert_eq!(pool.release_all().await.unwrap(), 1);
        assert_eq!(pool.release_all().await.unwrap(), 0);
    }
}

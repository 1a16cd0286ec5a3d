use sqlx::FromRow;

use crate::database::time::{from_ms, opt_from_ms, opt_to_ms, to_ms};
use crate::domain::{Account, AccountId, AccountLease, JobId, TokenStatus};
use crate::{Error, Result};

/// Row of the `accounts` table.
#[derive(Debug, Clone, FromRow)]
pub struct AccountRow {
    pub id: i64,
    pub platform: String,
    pub label: String,
    pub auth_ref: String,
    pub token_status: String,
    pub credits: Option<i64>,
    pub credits_reset_at: Option<i64>,
    pub last_used: Option<i64>,
    pub lease_holder: Option<i64>,
    pub lease_acquired_at: Option<i64>,
    pub lease_expires_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl AccountRow {
    pub fn from_account(account: &Account) -> Self {
        let lease = account.lease.as_ref();
        Self {
            id: account.id.0,
            platform: account.platform.clone(),
            label: account.label.clone(),
            auth_ref: account.auth_ref.clone(),
            token_status: account.token_status.to_string(),
            credits: account.credits,
            credits_reset_at: opt_to_ms(account.credits_reset_at),
            last_used: opt_to_ms(account.last_used),
            lease_holder: lease.map(|l| l.holder.0),
            lease_acquired_at: lease.map(|l| to_ms(l.acquired_at)),
            lease_expires_at: lease.map(|l| to_ms(l.expires_at)),
            created_at: to_ms(account.created_at),
            updated_at: to_ms(account.updated_at),
        }
    }

    pub fn into_account(self) -> Result<Account> {
        let token_status: TokenStatus = self.token_status.parse().map_err(|_| {
            Error::Other(format!(
                "account {} has unknown token status '{}'",
                self.id, self.token_status
            ))
        })?;
        let lease = match (self.lease_holder, self.lease_acquired_at, self.lease_expires_at) {
            (Some(holder), Some(acquired_at), Some(expires_at)) => Some(AccountLease {
                holder: JobId(holder),
                acquired_at: from_ms(acquired_at),
                expires_at: from_ms(expires_at),
            }),
            _ => None,
        };

        Ok(Account {
            id: AccountId(self.id),
            platform: self.platform,
            label: self.label,
            auth_ref: self.auth_ref,
            token_status,
            credits: self.credits,
            credits_reset_at: opt_from_ms(self.credits_reset_at),
            last_used: opt_from_ms(self.last_used),
            lease,
            created_at: from_ms(self.created_at),
            updated_at: from_ms(self.updated_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::time::truncate_ms;
    use crate::domain::NewAccount;
    use chrono::Utc;

    #[test]
    fn test_row_conversion_preserves_lease() {
        let now = truncate_ms(Utc::now());
        let mut account = Account::from_new(
            AccountId(3),
            NewAccount::new("sora", "ops@example.com", "vault:ops").with_credits(12),
            now,
        );
        account.token_status = TokenStatus::Valid;
        account.lease = Some(AccountLease {
            holder: JobId(40),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(600),
        });

        let row = AccountRow::from_account(&account);
        assert_eq!(row.token_status, "valid");
        assert_eq!(row.lease_holder, Some(40));

        assert_eq!(row.into_account().unwrap(), account);
    }

    #[test]
    fn test_partial_lease_columns_mean_free() {
        let account = Account::from_new(
            AccountId(1),
            NewAccount::new("sora", "a", "ref"),
            truncate_ms(Utc::now()),
        );
        let mut row = AccountRow::from_account(&account);
        row.lease_holder = Some(9);
        assert!(row.into_account().unwrap().lease.is_none());
    }
}

//! PostgreSQL adapter for the atelier storage traits.
//!
//! The transactional source-of-truth backend. Every compound operation runs
//! inside one database transaction holding a `FOR UPDATE NOWAIT` lock on the
//! affected account or escrow row; lock contention surfaces as
//! [`StorageError::Busy`] so callers retry instead of waiting unbounded.
//! The unique index on `external_reference` is the structural backstop for
//! idempotent credit replay.

use crate::model::{
    compute_entry_hash, AccountRecord, ActionClaim, ActionOutcome, AppliedEntry,
    EngagementStateRecord, EntryAppend, EscrowRecord, MilestoneRecord, ReleaseOutcome,
    TransactionRecord,
};
use crate::traits::{
    AccountStore, EngagementStateStore, EscrowStore, LedgerStore, QueryWindow,
};
use crate::{StorageError, StorageResult};
use atelier_types::{
    AccountId, EngagementId, EscrowStatus, ExternalReference, MilestoneId, MilestoneStatus,
    TransactionId, TransactionKind, WorkflowPhase,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

/// PostgreSQL-backed atelier storage adapter.
#[derive(Clone)]
pub struct PostgresAtelierStorage {
    pool: PgPool,
}

impl PostgresAtelierStorage {
    /// Connect to PostgreSQL and initialize required schema.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    /// Connect with explicit pool parameters.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to connect postgres: {e}")))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create adapter from an existing pool.
    pub async fn from_pool(pool: PgPool) -> StorageResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> StorageResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS atelier_accounts (
                account_id TEXT PRIMARY KEY,
                balance_minor BIGINT NOT NULL CHECK (balance_minor >= 0),
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS atelier_transactions (
                transaction_id TEXT PRIMARY KEY,
                sequence BIGSERIAL NOT NULL UNIQUE,
                account_id TEXT NOT NULL REFERENCES atelier_accounts(account_id),
                kind TEXT NOT NULL,
                amount_minor BIGINT NOT NULL,
                balance_before_minor BIGINT NOT NULL,
                balance_after_minor BIGINT NOT NULL,
                external_reference TEXT UNIQUE,
                correlation_id TEXT,
                metadata JSONB NOT NULL,
                previous_hash TEXT,
                entry_hash TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS atelier_escrows (
                engagement_id TEXT PRIMARY KEY,
                initiator_id TEXT NOT NULL,
                committed_minor BIGINT NOT NULL,
                released_minor BIGINT NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                CHECK (released_minor >= 0 AND released_minor <= committed_minor)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS atelier_milestones (
                milestone_id TEXT PRIMARY KEY,
                engagement_id TEXT NOT NULL REFERENCES atelier_escrows(engagement_id),
                ordinal INTEGER NOT NULL,
                label TEXT NOT NULL,
                weight_pct INTEGER NOT NULL,
                amount_minor BIGINT NOT NULL,
                status TEXT NOT NULL,
                completed_at TIMESTAMPTZ,
                UNIQUE (engagement_id, ordinal)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS atelier_engagement_state (
                engagement_id TEXT PRIMARY KEY,
                phase TEXT NOT NULL,
                busy_action TEXT,
                last_completed_action TEXT,
                last_completed_at TIMESTAMPTZ,
                last_result JSONB,
                metadata JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl AccountStore for PostgresAtelierStorage {
    async fn create_account(
        &self,
        account_id: &AccountId,
        at: DateTime<Utc>,
    ) -> StorageResult<AccountRecord> {
        sqlx::query(
            r#"
            INSERT INTO atelier_accounts (account_id, balance_minor, created_at, updated_at)
            VALUES ($1, 0, $2, $2)
            "#,
        )
        .bind(&account_id.0)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(AccountRecord {
            account_id: account_id.clone(),
            balance_minor: 0,
            created_at: at,
            updated_at: at,
        })
    }

    async fn get_account(&self, account_id: &AccountId) -> StorageResult<Option<AccountRecord>> {
        let row = sqlx::query("SELECT * FROM atelier_accounts WHERE account_id = $1")
            .bind(&account_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        row.map(|row| account_from_row(&row)).transpose()
    }
}

#[async_trait]
impl LedgerStore for PostgresAtelierStorage {
    async fn apply_entry(
        &self,
        append: EntryAppend,
        at: DateTime<Utc>,
    ) -> StorageResult<AppliedEntry> {
        if append.amount_minor == 0 {
            return Err(StorageError::InvalidInput(
                "entry amount must be non-zero".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        // Exclusive lock on the account row for the whole unit of work.
        let account_row = sqlx::query(
            "SELECT * FROM atelier_accounts WHERE account_id = $1 FOR UPDATE NOWAIT",
        )
        .bind(&append.account_id.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_err)?
        .ok_or_else(|| {
            StorageError::NotFound(format!("account {} not found", append.account_id))
        })?;
        let account = account_from_row(&account_row)?;

        // Replay check under the same lock scope as the mutation.
        if let Some(reference) = &append.external_reference {
            let existing = sqlx::query(
                "SELECT * FROM atelier_transactions WHERE external_reference = $1",
            )
            .bind(&reference.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
            if let Some(row) = existing {
                let transaction = transaction_from_row(&row)?;
                // The recorded entry may belong to a different account than
                // the caller named; the replay reports that account's state.
                let account = if transaction.account_id == append.account_id {
                    account
                } else {
                    let row = sqlx::query("SELECT * FROM atelier_accounts WHERE account_id = $1")
                        .bind(&transaction.account_id.0)
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(map_sqlx_err)?
                        .ok_or_else(|| {
                            StorageError::Backend(format!(
                                "journal references missing account {}",
                                transaction.account_id
                            ))
                        })?;
                    account_from_row(&row)?
                };
                return Ok(AppliedEntry {
                    transaction,
                    account,
                    replayed: true,
                });
            }
        }

        let balance_before = account.balance_minor;
        let balance_after = balance_before + append.amount_minor;
        if balance_after < 0 {
            return Err(StorageError::InsufficientFunds {
                required_minor: -append.amount_minor,
                available_minor: balance_before,
            });
        }

        let previous_hash: Option<String> = sqlx::query(
            r#"
            SELECT entry_hash FROM atelier_transactions
             WHERE account_id = $1
             ORDER BY sequence DESC
             LIMIT 1
            "#,
        )
        .bind(&append.account_id.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_err)?
        .map(|row| row.try_get("entry_hash"))
        .transpose()
        .map_err(map_sqlx_err)?;

        let entry_hash = compute_entry_hash(
            &append.account_id,
            append.kind,
            append.amount_minor,
            balance_before,
            balance_after,
            append.external_reference.as_ref(),
            at,
            previous_hash.as_deref(),
        );
        let transaction_id = TransactionId::generate();

        sqlx::query(
            r#"
            INSERT INTO atelier_transactions
                (transaction_id, account_id, kind, amount_minor, balance_before_minor,
                 balance_after_minor, external_reference, correlation_id, metadata,
                 previous_hash, entry_hash, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&transaction_id.0)
        .bind(&append.account_id.0)
        .bind(append.kind.as_str())
        .bind(append.amount_minor)
        .bind(balance_before)
        .bind(balance_after)
        .bind(append.external_reference.as_ref().map(|r| r.0.clone()))
        .bind(append.correlation_id.as_ref().map(|c| c.0.clone()))
        .bind(&append.metadata)
        .bind(previous_hash.as_deref())
        .bind(&entry_hash)
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        sqlx::query(
            "UPDATE atelier_accounts SET balance_minor = $1, updated_at = $2 WHERE account_id = $3",
        )
        .bind(balance_after)
        .bind(at)
        .bind(&append.account_id.0)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)?;

        Ok(AppliedEntry {
            transaction: TransactionRecord {
                transaction_id,
                account_id: append.account_id.clone(),
                kind: append.kind,
                amount_minor: append.amount_minor,
                balance_before_minor: balance_before,
                balance_after_minor: balance_after,
                external_reference: append.external_reference,
                correlation_id: append.correlation_id,
                metadata: append.metadata,
                previous_hash,
                entry_hash,
                created_at: at,
            },
            account: AccountRecord {
                balance_minor: balance_after,
                updated_at: at,
                ..account
            },
            replayed: false,
        })
    }

    async fn find_by_external_reference(
        &self,
        reference: &ExternalReference,
    ) -> StorageResult<Option<TransactionRecord>> {
        let row = sqlx::query("SELECT * FROM atelier_transactions WHERE external_reference = $1")
            .bind(&reference.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        row.map(|row| transaction_from_row(&row)).transpose()
    }

    async fn list_transactions(
        &self,
        account_id: &AccountId,
        window: QueryWindow,
    ) -> StorageResult<Vec<TransactionRecord>> {
        let limit = if window.limit == 0 {
            i64::MAX
        } else {
            window.limit as i64
        };
        let rows = sqlx::query(
            r#"
            SELECT * FROM atelier_transactions
             WHERE account_id = $1
             ORDER BY sequence ASC
             OFFSET $2 LIMIT $3
            "#,
        )
        .bind(&account_id.0)
        .bind(window.offset as i64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        rows.iter().map(transaction_from_row).collect()
    }
}

#[async_trait]
impl EscrowStore for PostgresAtelierStorage {
    async fn create_escrow(&self, escrow: EscrowRecord) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO atelier_escrows
                (engagement_id, initiator_id, committed_minor, released_minor, status,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&escrow.engagement_id.0)
        .bind(&escrow.initiator_id.0)
        .bind(escrow.committed_minor)
        .bind(escrow.released_minor)
        .bind(escrow.status.as_str())
        .bind(escrow.created_at)
        .bind(escrow.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn get_escrow(
        &self,
        engagement_id: &EngagementId,
    ) -> StorageResult<Option<EscrowRecord>> {
        let row = sqlx::query("SELECT * FROM atelier_escrows WHERE engagement_id = $1")
            .bind(&engagement_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        row.map(|row| escrow_from_row(&row)).transpose()
    }

    async fn fund_escrow(
        &self,
        engagement_id: &EngagementId,
        expected_from: EscrowStatus,
        milestones: Vec<MilestoneRecord>,
        at: DateTime<Utc>,
    ) -> StorageResult<EscrowRecord> {
        for (expected_ordinal, milestone) in milestones.iter().enumerate() {
            if milestone.ordinal != expected_ordinal as u32 {
                return Err(StorageError::InvariantViolation(format!(
                    "milestone ordinals must be contiguous from zero, found {} at position {}",
                    milestone.ordinal, expected_ordinal
                )));
            }
        }

        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let escrow = lock_escrow(&mut tx, engagement_id).await?;
        if escrow.status != expected_from {
            return Err(StorageError::InvariantViolation(format!(
                "invalid escrow transition: expected {}, found {}",
                expected_from, escrow.status
            )));
        }

        for milestone in &milestones {
            sqlx::query(
                r#"
                INSERT INTO atelier_milestones
                    (milestone_id, engagement_id, ordinal, label, weight_pct, amount_minor,
                     status, completed_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(&milestone.milestone_id.0)
            .bind(&milestone.engagement_id.0)
            .bind(milestone.ordinal as i32)
            .bind(&milestone.label)
            .bind(milestone.weight_pct as i32)
            .bind(milestone.amount_minor)
            .bind(milestone.status.as_str())
            .bind(milestone.completed_at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
        }

        sqlx::query(
            "UPDATE atelier_escrows SET status = $1, updated_at = $2 WHERE engagement_id = $3",
        )
        .bind(EscrowStatus::Funded.as_str())
        .bind(at)
        .bind(&engagement_id.0)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)?;

        Ok(EscrowRecord {
            status: EscrowStatus::Funded,
            updated_at: at,
            ..escrow
        })
    }

    async fn transition_escrow(
        &self,
        engagement_id: &EngagementId,
        expected_from: EscrowStatus,
        to: EscrowStatus,
        at: DateTime<Utc>,
    ) -> StorageResult<EscrowRecord> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let escrow = lock_escrow(&mut tx, engagement_id).await?;
        if escrow.status != expected_from {
            return Err(StorageError::InvariantViolation(format!(
                "invalid escrow transition: expected {}, found {}",
                expected_from, escrow.status
            )));
        }

        sqlx::query(
            "UPDATE atelier_escrows SET status = $1, updated_at = $2 WHERE engagement_id = $3",
        )
        .bind(to.as_str())
        .bind(at)
        .bind(&engagement_id.0)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)?;

        Ok(EscrowRecord {
            status: to,
            updated_at: at,
            ..escrow
        })
    }

    async fn release_milestone(
        &self,
        engagement_id: &EngagementId,
        milestone_id: &MilestoneId,
        at: DateTime<Utc>,
    ) -> StorageResult<ReleaseOutcome> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let escrow = lock_escrow(&mut tx, engagement_id).await?;
        if escrow.status != EscrowStatus::Funded {
            return Err(StorageError::InvariantViolation(format!(
                "release requires funded escrow, found {}",
                escrow.status
            )));
        }

        let rows = sqlx::query(
            "SELECT * FROM atelier_milestones WHERE engagement_id = $1 ORDER BY ordinal ASC",
        )
        .bind(&engagement_id.0)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;
        let milestones = rows
            .iter()
            .map(milestone_from_row)
            .collect::<StorageResult<Vec<_>>>()?;

        let target = milestones
            .iter()
            .find(|m| &m.milestone_id == milestone_id)
            .ok_or_else(|| {
                StorageError::NotFound(format!("milestone {} not found", milestone_id))
            })?;
        if target.status == MilestoneStatus::Completed {
            return Err(StorageError::Conflict(format!(
                "milestone {} already completed",
                milestone_id
            )));
        }
        let blocked = milestones
            .iter()
            .any(|m| m.ordinal < target.ordinal && m.status != MilestoneStatus::Completed);
        if blocked {
            return Err(StorageError::InvariantViolation(format!(
                "milestone {} released out of sequence",
                milestone_id
            )));
        }

        let amount = target.amount_minor;
        let released_after = escrow.released_minor + amount;
        if released_after > escrow.committed_minor {
            return Err(StorageError::InvariantViolation(format!(
                "release of {} exceeds remaining {}",
                amount,
                escrow.remaining_minor()
            )));
        }
        let status_after = if released_after == escrow.committed_minor {
            EscrowStatus::Completed
        } else {
            EscrowStatus::Funded
        };

        sqlx::query(
            "UPDATE atelier_milestones SET status = $1, completed_at = $2 WHERE milestone_id = $3",
        )
        .bind(MilestoneStatus::Completed.as_str())
        .bind(at)
        .bind(&milestone_id.0)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        sqlx::query(
            r#"
            UPDATE atelier_escrows
               SET released_minor = $1, status = $2, updated_at = $3
             WHERE engagement_id = $4
            "#,
        )
        .bind(released_after)
        .bind(status_after.as_str())
        .bind(at)
        .bind(&engagement_id.0)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)?;

        Ok(ReleaseOutcome {
            escrow: EscrowRecord {
                released_minor: released_after,
                status: status_after,
                updated_at: at,
                ..escrow
            },
            milestone: Some(MilestoneRecord {
                status: MilestoneStatus::Completed,
                completed_at: Some(at),
                ..target.clone()
            }),
        })
    }

    async fn release_amount(
        &self,
        engagement_id: &EngagementId,
        amount_minor: i64,
        at: DateTime<Utc>,
    ) -> StorageResult<ReleaseOutcome> {
        if amount_minor <= 0 {
            return Err(StorageError::InvalidInput(
                "release amount must be positive".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let escrow = lock_escrow(&mut tx, engagement_id).await?;
        if escrow.status != EscrowStatus::Funded {
            return Err(StorageError::InvariantViolation(format!(
                "release requires funded escrow, found {}",
                escrow.status
            )));
        }
        let released_after = escrow.released_minor + amount_minor;
        if released_after > escrow.committed_minor {
            return Err(StorageError::InvariantViolation(format!(
                "release of {} exceeds remaining {}",
                amount_minor,
                escrow.remaining_minor()
            )));
        }
        let status_after = if released_after == escrow.committed_minor {
            EscrowStatus::Completed
        } else {
            EscrowStatus::Funded
        };

        sqlx::query(
            r#"
            UPDATE atelier_escrows
               SET released_minor = $1, status = $2, updated_at = $3
             WHERE engagement_id = $4
            "#,
        )
        .bind(released_after)
        .bind(status_after.as_str())
        .bind(at)
        .bind(&engagement_id.0)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)?;

        Ok(ReleaseOutcome {
            escrow: EscrowRecord {
                released_minor: released_after,
                status: status_after,
                updated_at: at,
                ..escrow
            },
            milestone: None,
        })
    }

    async fn set_milestone_status(
        &self,
        engagement_id: &EngagementId,
        milestone_id: &MilestoneId,
        expected_from: MilestoneStatus,
        to: MilestoneStatus,
        at: DateTime<Utc>,
    ) -> StorageResult<MilestoneRecord> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        // The escrow row is the lock anchor for all milestone writes.
        lock_escrow(&mut tx, engagement_id).await?;

        let row = sqlx::query(
            "SELECT * FROM atelier_milestones WHERE milestone_id = $1 AND engagement_id = $2",
        )
        .bind(&milestone_id.0)
        .bind(&engagement_id.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_err)?
        .ok_or_else(|| StorageError::NotFound(format!("milestone {} not found", milestone_id)))?;
        let milestone = milestone_from_row(&row)?;
        if milestone.status != expected_from {
            return Err(StorageError::InvariantViolation(format!(
                "invalid milestone transition: expected {}, found {}",
                expected_from, milestone.status
            )));
        }

        let completed_at = if to == MilestoneStatus::Completed {
            Some(at)
        } else {
            milestone.completed_at
        };
        sqlx::query(
            "UPDATE atelier_milestones SET status = $1, completed_at = $2 WHERE milestone_id = $3",
        )
        .bind(to.as_str())
        .bind(completed_at)
        .bind(&milestone_id.0)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)?;

        Ok(MilestoneRecord {
            status: to,
            completed_at,
            ..milestone
        })
    }

    async fn list_milestones(
        &self,
        engagement_id: &EngagementId,
    ) -> StorageResult<Vec<MilestoneRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM atelier_milestones WHERE engagement_id = $1 ORDER BY ordinal ASC",
        )
        .bind(&engagement_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        rows.iter().map(milestone_from_row).collect()
    }
}

#[async_trait]
impl EngagementStateStore for PostgresAtelierStorage {
    async fn init_state(
        &self,
        engagement_id: &EngagementId,
        phase: WorkflowPhase,
        at: DateTime<Utc>,
    ) -> StorageResult<EngagementStateRecord> {
        sqlx::query(
            r#"
            INSERT INTO atelier_engagement_state
                (engagement_id, phase, busy_action, last_completed_action, last_completed_at,
                 last_result, metadata, updated_at)
            VALUES ($1, $2, NULL, NULL, NULL, NULL, 'null'::jsonb, $3)
            "#,
        )
        .bind(&engagement_id.0)
        .bind(phase.as_str())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(EngagementStateRecord {
            engagement_id: engagement_id.clone(),
            phase,
            busy_action: None,
            last_completed_action: None,
            last_completed_at: None,
            last_result: None,
            metadata: Value::Null,
            updated_at: at,
        })
    }

    async fn get_state(
        &self,
        engagement_id: &EngagementId,
    ) -> StorageResult<Option<EngagementStateRecord>> {
        let row = sqlx::query("SELECT * FROM atelier_engagement_state WHERE engagement_id = $1")
            .bind(&engagement_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        row.map(|row| state_from_row(&row)).transpose()
    }

    async fn begin_action(
        &self,
        engagement_id: &EngagementId,
        action: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<ActionClaim> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let state = lock_state(&mut tx, engagement_id).await?;
        if let Some(held) = state.busy_action {
            return Ok(ActionClaim::Held { action: held });
        }

        sqlx::query(
            r#"
            UPDATE atelier_engagement_state
               SET busy_action = $1, updated_at = $2
             WHERE engagement_id = $3
            "#,
        )
        .bind(action)
        .bind(at)
        .bind(&engagement_id.0)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)?;

        let state = lock_free_state(&self.pool, engagement_id).await?;
        Ok(ActionClaim::Claimed(state))
    }

    async fn finish_action(
        &self,
        engagement_id: &EngagementId,
        action: &str,
        outcome: ActionOutcome,
        at: DateTime<Utc>,
    ) -> StorageResult<EngagementStateRecord> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let state = lock_state(&mut tx, engagement_id).await?;
        if state.busy_action.as_deref() != Some(action) {
            return Err(StorageError::InvariantViolation(format!(
                "finish for action {} but flag holds {:?}",
                action, state.busy_action
            )));
        }

        match &outcome {
            ActionOutcome::Completed { result, next_phase } => {
                let phase = next_phase.unwrap_or(state.phase);
                sqlx::query(
                    r#"
                    UPDATE atelier_engagement_state
                       SET busy_action = NULL,
                           last_completed_action = $1,
                           last_completed_at = $2,
                           last_result = $3,
                           phase = $4,
                           updated_at = $2
                     WHERE engagement_id = $5
                    "#,
                )
                .bind(action)
                .bind(at)
                .bind(result)
                .bind(phase.as_str())
                .bind(&engagement_id.0)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;
            }
            ActionOutcome::Failed => {
                sqlx::query(
                    r#"
                    UPDATE atelier_engagement_state
                       SET busy_action = NULL, updated_at = $1
                     WHERE engagement_id = $2
                    "#,
                )
                .bind(at)
                .bind(&engagement_id.0)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;
            }
        }

        tx.commit().await.map_err(map_sqlx_err)?;
        lock_free_state(&self.pool, engagement_id).await
    }

    async fn transition_phase(
        &self,
        engagement_id: &EngagementId,
        expected_from: WorkflowPhase,
        to: WorkflowPhase,
        at: DateTime<Utc>,
    ) -> StorageResult<EngagementStateRecord> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let state = lock_state(&mut tx, engagement_id).await?;
        if state.phase != expected_from {
            return Err(StorageError::InvariantViolation(format!(
                "invalid phase transition: expected {}, found {}",
                expected_from, state.phase
            )));
        }

        sqlx::query(
            r#"
            UPDATE atelier_engagement_state
               SET phase = $1, updated_at = $2
             WHERE engagement_id = $3
            "#,
        )
        .bind(to.as_str())
        .bind(at)
        .bind(&engagement_id.0)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)?;
        lock_free_state(&self.pool, engagement_id).await
    }

    async fn put_metadata(
        &self,
        engagement_id: &EngagementId,
        key: &str,
        value: Value,
        at: DateTime<Utc>,
    ) -> StorageResult<EngagementStateRecord> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let state = lock_state(&mut tx, engagement_id).await?;
        let mut metadata = match state.metadata {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        metadata.insert(key.to_string(), value);

        sqlx::query(
            r#"
            UPDATE atelier_engagement_state
               SET metadata = $1, updated_at = $2
             WHERE engagement_id = $3
            "#,
        )
        .bind(Value::Object(metadata))
        .bind(at)
        .bind(&engagement_id.0)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)?;
        lock_free_state(&self.pool, engagement_id).await
    }
}

async fn lock_escrow(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    engagement_id: &EngagementId,
) -> StorageResult<EscrowRecord> {
    let row = sqlx::query("SELECT * FROM atelier_escrows WHERE engagement_id = $1 FOR UPDATE NOWAIT")
        .bind(&engagement_id.0)
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_sqlx_err)?
        .ok_or_else(|| {
            StorageError::NotFound(format!("escrow for engagement {} not found", engagement_id))
        })?;
    escrow_from_row(&row)
}

async fn lock_state(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    engagement_id: &EngagementId,
) -> StorageResult<EngagementStateRecord> {
    let row = sqlx::query(
        "SELECT * FROM atelier_engagement_state WHERE engagement_id = $1 FOR UPDATE NOWAIT",
    )
    .bind(&engagement_id.0)
    .fetch_optional(&mut **tx)
    .await
    .map_err(map_sqlx_err)?
    .ok_or_else(|| {
        StorageError::NotFound(format!("state for engagement {} not found", engagement_id))
    })?;
    state_from_row(&row)
}

async fn lock_free_state(
    pool: &PgPool,
    engagement_id: &EngagementId,
) -> StorageResult<EngagementStateRecord> {
    let row = sqlx::query("SELECT * FROM atelier_engagement_state WHERE engagement_id = $1")
        .bind(&engagement_id.0)
        .fetch_optional(pool)
        .await
        .map_err(map_sqlx_err)?
        .ok_or_else(|| {
            StorageError::NotFound(format!("state for engagement {} not found", engagement_id))
        })?;
    state_from_row(&row)
}

fn account_from_row(row: &PgRow) -> StorageResult<AccountRecord> {
    Ok(AccountRecord {
        account_id: AccountId::new(row.try_get::<String, _>("account_id").map_err(map_sqlx_err)?),
        balance_minor: row.try_get("balance_minor").map_err(map_sqlx_err)?,
        created_at: row.try_get("created_at").map_err(map_sqlx_err)?,
        updated_at: row.try_get("updated_at").map_err(map_sqlx_err)?,
    })
}

fn transaction_from_row(row: &PgRow) -> StorageResult<TransactionRecord> {
    let kind: String = row.try_get("kind").map_err(map_sqlx_err)?;
    Ok(TransactionRecord {
        transaction_id: TransactionId::new(
            row.try_get::<String, _>("transaction_id").map_err(map_sqlx_err)?,
        ),
        account_id: AccountId::new(row.try_get::<String, _>("account_id").map_err(map_sqlx_err)?),
        kind: TransactionKind::parse(&kind)
            .ok_or_else(|| StorageError::Serialization(format!("unknown kind '{kind}'")))?,
        amount_minor: row.try_get("amount_minor").map_err(map_sqlx_err)?,
        balance_before_minor: row.try_get("balance_before_minor").map_err(map_sqlx_err)?,
        balance_after_minor: row.try_get("balance_after_minor").map_err(map_sqlx_err)?,
        external_reference: row
            .try_get::<Option<String>, _>("external_reference")
            .map_err(map_sqlx_err)?
            .map(ExternalReference::new),
        correlation_id: row
            .try_get::<Option<String>, _>("correlation_id")
            .map_err(map_sqlx_err)?
            .map(EngagementId::new),
        metadata: row.try_get("metadata").map_err(map_sqlx_err)?,
        previous_hash: row.try_get("previous_hash").map_err(map_sqlx_err)?,
        entry_hash: row.try_get("entry_hash").map_err(map_sqlx_err)?,
        created_at: row.try_get("created_at").map_err(map_sqlx_err)?,
    })
}

fn escrow_from_row(row: &PgRow) -> StorageResult<EscrowRecord> {
    let status: String = row.try_get("status").map_err(map_sqlx_err)?;
    Ok(EscrowRecord {
        engagement_id: EngagementId::new(
            row.try_get::<String, _>("engagement_id").map_err(map_sqlx_err)?,
        ),
        initiator_id: AccountId::new(
            row.try_get::<String, _>("initiator_id").map_err(map_sqlx_err)?,
        ),
        committed_minor: row.try_get("committed_minor").map_err(map_sqlx_err)?,
        released_minor: row.try_get("released_minor").map_err(map_sqlx_err)?,
        status: EscrowStatus::parse(&status)
            .ok_or_else(|| StorageError::Serialization(format!("unknown status '{status}'")))?,
        created_at: row.try_get("created_at").map_err(map_sqlx_err)?,
        updated_at: row.try_get("updated_at").map_err(map_sqlx_err)?,
    })
}

fn milestone_from_row(row: &PgRow) -> StorageResult<MilestoneRecord> {
    let status: String = row.try_get("status").map_err(map_sqlx_err)?;
    Ok(MilestoneRecord {
        milestone_id: MilestoneId::new(
            row.try_get::<String, _>("milestone_id").map_err(map_sqlx_err)?,
        ),
        engagement_id: EngagementId::new(
            row.try_get::<String, _>("engagement_id").map_err(map_sqlx_err)?,
        ),
        ordinal: row.try_get::<i32, _>("ordinal").map_err(map_sqlx_err)? as u32,
        label: row.try_get("label").map_err(map_sqlx_err)?,
        weight_pct: row.try_get::<i32, _>("weight_pct").map_err(map_sqlx_err)? as u32,
        amount_minor: row.try_get("amount_minor").map_err(map_sqlx_err)?,
        status: MilestoneStatus::parse(&status)
            .ok_or_else(|| StorageError::Serialization(format!("unknown status '{status}'")))?,
        completed_at: row.try_get("completed_at").map_err(map_sqlx_err)?,
    })
}

fn state_from_row(row: &PgRow) -> StorageResult<EngagementStateRecord> {
    let phase: String = row.try_get("phase").map_err(map_sqlx_err)?;
    Ok(EngagementStateRecord {
        engagement_id: EngagementId::new(
            row.try_get::<String, _>("engagement_id").map_err(map_sqlx_err)?,
        ),
        phase: WorkflowPhase::parse(&phase)
            .ok_or_else(|| StorageError::Serialization(format!("unknown phase '{phase}'")))?,
        busy_action: row.try_get("busy_action").map_err(map_sqlx_err)?,
        last_completed_action: row.try_get("last_completed_action").map_err(map_sqlx_err)?,
        last_completed_at: row.try_get("last_completed_at").map_err(map_sqlx_err)?,
        last_result: row.try_get("last_result").map_err(map_sqlx_err)?,
        metadata: row.try_get("metadata").map_err(map_sqlx_err)?,
        updated_at: row.try_get("updated_at").map_err(map_sqlx_err)?,
    })
}

fn map_sqlx_err(err: sqlx::Error) -> StorageError {
    match &err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // lock_not_available: a NOWAIT row lock was contended.
            Some("55P03") => StorageError::Busy("row lock unavailable".to_string()),
            // unique_violation: duplicate primary key or external reference.
            Some("23505") => StorageError::Conflict(db.message().to_string()),
            // check_violation: balance floor or release bound.
            Some("23514") => StorageError::InvariantViolation(db.message().to_string()),
            _ => StorageError::Backend(err.to_string()),
        },
        _ => StorageError::Backend(err.to_string()),
    }
}

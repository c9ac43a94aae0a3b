//! PostgreSQL ledger store.
//!
//! Enable with the `postgres` feature flag. Units of work lock the
//! workspace row (`FOR UPDATE`) for their whole lifetime, which serialises
//! every balance mutation of one tenant while leaving other tenants free.
//! The hold sweep uses `SKIP LOCKED` so it never waits on live traffic.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use super::{BalanceSnapshot, LedgerStore, LedgerTx, StorageResultExt, StoreError, StoreResult};
use crate::types::{
    AllocationId, AllocationType, CreditAllocation, CreditCategory, CreditHold, CreditTransaction,
    HoldId, Metadata, OperationType, OverrideId, Plan, QuotaOverride, TransactionId,
    Workspace, WorkspaceId,
};

#[derive(Clone, Debug)]
pub struct PostgresConfig {
    pub table_prefix: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Upper bound on waiting for a workspace lock inside a unit of work.
    pub lock_timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            table_prefix: "ledger_".to_string(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(10),
            lock_timeout: Duration::from_secs(5),
        }
    }
}

impl PostgresConfig {
    pub fn prefix(mut self, prefix: impl Into<String>) -> StoreResult<Self> {
        let prefix = prefix.into();
        if !prefix.chars().all(|c| c.is_ascii_lowercase() || c == '_') {
            return Err(StoreError::Storage {
                message: format!(
                    "Invalid table prefix '{}': only lowercase ASCII and underscore allowed",
                    prefix
                ),
            });
        }
        self.table_prefix = prefix;
        Ok(self)
    }
}

#[derive(Clone, Debug)]
struct Tables {
    workspaces: String,
    allocations: String,
    transactions: String,
    holds: String,
    usage: String,
    overrides: String,
}

impl Tables {
    fn new(prefix: &str) -> Self {
        Self {
            workspaces: format!("{}workspaces", prefix),
            allocations: format!("{}credit_allocations", prefix),
            transactions: format!("{}credit_transactions", prefix),
            holds: format!("{}credit_holds", prefix),
            usage: format!("{}usage_daily", prefix),
            overrides: format!("{}quota_overrides", prefix),
        }
    }
}

pub struct PostgresStore {
    pool: PgPool,
    tables: Tables,
    config: PostgresConfig,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        Self::connect_with(database_url, PostgresConfig::default()).await
    }

    pub async fn connect_with(
        database_url: &str,
        config: PostgresConfig,
    ) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(database_url)
            .await?;
        Ok(Self::with_pool(pool, config))
    }

    pub fn with_pool(pool: PgPool, config: PostgresConfig) -> Self {
        Self {
            tables: Tables::new(&config.table_prefix),
            pool,
            config,
        }
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        let t = &self.tables;
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {ws} (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                plan TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {alloc} (
                id UUID PRIMARY KEY,
                workspace_id UUID NOT NULL REFERENCES {ws} (id) ON DELETE CASCADE,
                category TEXT NOT NULL,
                allocation_type TEXT NOT NULL,
                amount_granted NUMERIC(18, 4) NOT NULL,
                amount_remaining NUMERIC(18, 4) NOT NULL,
                granted_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ,
                cycle_tag TEXT,
                source_id TEXT,
                replaces UUID,
                CHECK (amount_remaining >= 0 AND amount_remaining <= amount_granted)
            );
            CREATE INDEX IF NOT EXISTS idx_{alloc}_fifo
                ON {alloc} (workspace_id, category, expires_at);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_{alloc}_cycle
                ON {alloc} (workspace_id, category, allocation_type, cycle_tag)
                WHERE cycle_tag IS NOT NULL;

            CREATE TABLE IF NOT EXISTS {txn} (
                seq BIGSERIAL NOT NULL,
                id UUID PRIMARY KEY,
                workspace_id UUID NOT NULL REFERENCES {ws} (id) ON DELETE CASCADE,
                transaction_type TEXT NOT NULL,
                category TEXT NOT NULL,
                amount NUMERIC(18, 4) NOT NULL,
                allocation_id UUID,
                source_id TEXT,
                source_type TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                metadata JSONB NOT NULL DEFAULT '{{}}'
            );
            CREATE INDEX IF NOT EXISTS idx_{txn}_source
                ON {txn} (workspace_id, category, source_id);
            CREATE INDEX IF NOT EXISTS idx_{txn}_seq ON {txn} (workspace_id, seq);

            CREATE TABLE IF NOT EXISTS {holds} (
                id UUID PRIMARY KEY,
                workspace_id UUID NOT NULL REFERENCES {ws} (id) ON DELETE CASCADE,
                category TEXT NOT NULL,
                amount_reserved NUMERIC(18, 4) NOT NULL CHECK (amount_reserved > 0),
                source_id TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                status TEXT NOT NULL,
                settled_at TIMESTAMPTZ
            );
            CREATE INDEX IF NOT EXISTS idx_{holds}_sweep
                ON {holds} (workspace_id, status, expires_at);

            CREATE TABLE IF NOT EXISTS {usage} (
                workspace_id UUID NOT NULL REFERENCES {ws} (id) ON DELETE CASCADE,
                operation TEXT NOT NULL,
                day DATE NOT NULL,
                count BIGINT NOT NULL DEFAULT 0,
                PRIMARY KEY (workspace_id, operation, day)
            );

            CREATE TABLE IF NOT EXISTS {ovr} (
                id UUID PRIMARY KEY,
                workspace_id UUID NOT NULL REFERENCES {ws} (id) ON DELETE CASCADE,
                operation TEXT NOT NULL,
                admin_id TEXT NOT NULL,
                reason TEXT NOT NULL,
                period_tag TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                UNIQUE (workspace_id, operation, period_tag)
            );
            "#,
            ws = t.workspaces,
            alloc = t.allocations,
            txn = t.transactions,
            holds = t.holds,
            usage = t.usage,
            ovr = t.overrides,
        );
        sqlx::raw_sql(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    async fn open(
        &self,
        workspace_id: &WorkspaceId,
        skip_locked: bool,
    ) -> StoreResult<Option<Box<dyn LedgerTx>>> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let lock_timeout = format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.config.lock_timeout.as_millis()
        );
        sqlx::query(&lock_timeout)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        let query = format!(
            "SELECT id FROM {} WHERE id = $1 FOR UPDATE{}",
            self.tables.workspaces,
            if skip_locked { " SKIP LOCKED" } else { "" }
        );
        let locked = sqlx::query(&query)
            .bind(workspace_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        if locked.is_none() {
            return if skip_locked {
                Ok(None)
            } else {
                Err(StoreError::NotFound {
                    entity: "workspace",
                    id: workspace_id.to_string(),
                })
            };
        }

        Ok(Some(Box::new(PostgresTx {
            workspace_id: *workspace_id,
            tx,
            tables: self.tables.clone(),
        })))
    }
}

fn map_sqlx(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // serialization_failure, deadlock_detected, lock_not_available
            Some("40001") | Some("40P01") | Some("55P03") => StoreError::Conflict {
                message: db.message().to_string(),
            },
            _ => StoreError::Storage {
                message: err.to_string(),
            },
        },
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable {
                message: err.to_string(),
            }
        }
        _ => StoreError::Storage {
            message: err.to_string(),
        },
    }
}

fn parse_text<T: std::str::FromStr>(row: &PgRow, column: &str) -> StoreResult<T>
where
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column).map_err(map_sqlx)?;
    raw.parse::<T>().storage_err_ctx(column)
}

fn workspace_from_row(row: &PgRow) -> StoreResult<Workspace> {
    Ok(Workspace {
        id: WorkspaceId::from(row.try_get::<Uuid, _>("id").map_err(map_sqlx)?),
        name: row.try_get("name").map_err(map_sqlx)?,
        plan: parse_text::<Plan>(row, "plan")?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        updated_at: row.try_get("updated_at").map_err(map_sqlx)?,
    })
}

fn allocation_from_row(row: &PgRow) -> StoreResult<CreditAllocation> {
    Ok(CreditAllocation {
        id: AllocationId::from(row.try_get::<Uuid, _>("id").map_err(map_sqlx)?),
        workspace_id: WorkspaceId::from(row.try_get::<Uuid, _>("workspace_id").map_err(map_sqlx)?),
        category: parse_text(row, "category")?,
        allocation_type: parse_text(row, "allocation_type")?,
        amount_granted: row.try_get("amount_granted").map_err(map_sqlx)?,
        amount_remaining: row.try_get("amount_remaining").map_err(map_sqlx)?,
        granted_at: row.try_get("granted_at").map_err(map_sqlx)?,
        expires_at: row.try_get("expires_at").map_err(map_sqlx)?,
        cycle_tag: row.try_get("cycle_tag").map_err(map_sqlx)?,
        source_id: row.try_get("source_id").map_err(map_sqlx)?,
        replaces: row
            .try_get::<Option<Uuid>, _>("replaces")
            .map_err(map_sqlx)?
            .map(AllocationId::from),
    })
}

fn transaction_from_row(row: &PgRow) -> StoreResult<CreditTransaction> {
    let metadata: serde_json::Value = row.try_get("metadata").map_err(map_sqlx)?;
    Ok(CreditTransaction {
        id: TransactionId::from(row.try_get::<Uuid, _>("id").map_err(map_sqlx)?),
        workspace_id: WorkspaceId::from(row.try_get::<Uuid, _>("workspace_id").map_err(map_sqlx)?),
        transaction_type: parse_text(row, "transaction_type")?,
        category: parse_text(row, "category")?,
        amount: row.try_get("amount").map_err(map_sqlx)?,
        allocation_id: row
            .try_get::<Option<Uuid>, _>("allocation_id")
            .map_err(map_sqlx)?
            .map(AllocationId::from),
        source_id: row.try_get("source_id").map_err(map_sqlx)?,
        source_type: row.try_get("source_type").map_err(map_sqlx)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        metadata: serde_json::from_value::<Metadata>(metadata)?,
    })
}

fn hold_from_row(row: &PgRow) -> StoreResult<CreditHold> {
    Ok(CreditHold {
        id: HoldId::from(row.try_get::<Uuid, _>("id").map_err(map_sqlx)?),
        workspace_id: WorkspaceId::from(row.try_get::<Uuid, _>("workspace_id").map_err(map_sqlx)?),
        category: parse_text(row, "category")?,
        amount_reserved: row.try_get("amount_reserved").map_err(map_sqlx)?,
        source_id: row.try_get("source_id").map_err(map_sqlx)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        expires_at: row.try_get("expires_at").map_err(map_sqlx)?,
        status: parse_text(row, "status")?,
        settled_at: row.try_get("settled_at").map_err(map_sqlx)?,
    })
}

fn override_from_row(row: &PgRow) -> StoreResult<QuotaOverride> {
    Ok(QuotaOverride {
        id: OverrideId::from(row.try_get::<Uuid, _>("id").map_err(map_sqlx)?),
        workspace_id: WorkspaceId::from(row.try_get::<Uuid, _>("workspace_id").map_err(map_sqlx)?),
        operation: parse_text(row, "operation")?,
        admin_id: row.try_get("admin_id").map_err(map_sqlx)?,
        reason: row.try_get("reason").map_err(map_sqlx)?,
        period_tag: row.try_get("period_tag").map_err(map_sqlx)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
    })
}

fn collect<T>(rows: &[PgRow], map: impl Fn(&PgRow) -> StoreResult<T>) -> StoreResult<Vec<T>> {
    rows.iter().map(map).collect()
}

#[async_trait]
impl LedgerStore for PostgresStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn save_workspace(&self, workspace: &Workspace) -> StoreResult<()> {
        let query = format!(
            r#"
            INSERT INTO {} (id, name, plan, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                name = $2,
                plan = $3,
                updated_at = $5
            "#,
            self.tables.workspaces
        );
        sqlx::query(&query)
            .bind(workspace.id.as_uuid())
            .bind(&workspace.name)
            .bind(workspace.plan.as_str())
            .bind(workspace.created_at)
            .bind(workspace.updated_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn load_workspace(&self, id: &WorkspaceId) -> StoreResult<Option<Workspace>> {
        let query = format!("SELECT * FROM {} WHERE id = $1", self.tables.workspaces);
        let row = sqlx::query(&query)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(workspace_from_row).transpose()
    }

    async fn list_workspaces(&self) -> StoreResult<Vec<Workspace>> {
        let query = format!(
            "SELECT * FROM {} ORDER BY created_at",
            self.tables.workspaces
        );
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        collect(&rows, workspace_from_row)
    }

    async fn begin(&self, workspace_id: &WorkspaceId) -> StoreResult<Box<dyn LedgerTx>> {
        self.open(workspace_id, false)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "workspace",
                id: workspace_id.to_string(),
            })
    }

    async fn try_begin(
        &self,
        workspace_id: &WorkspaceId,
    ) -> StoreResult<Option<Box<dyn LedgerTx>>> {
        self.open(workspace_id, true).await
    }

    async fn balance_snapshot(
        &self,
        workspace_id: &WorkspaceId,
        category: CreditCategory,
        now: DateTime<Utc>,
    ) -> StoreResult<BalanceSnapshot> {
        // One statement, one snapshot.
        let query = format!(
            r#"
            SELECT
                (SELECT COALESCE(SUM(amount_remaining), 0) FROM {alloc}
                  WHERE workspace_id = $1 AND category = $2 AND amount_remaining > 0
                    AND (expires_at IS NULL OR expires_at > $3)) AS remaining,
                (SELECT COALESCE(SUM(amount_reserved), 0) FROM {holds}
                  WHERE workspace_id = $1 AND category = $2 AND status = 'ACTIVE'
                    AND expires_at > $3) AS reserved
            "#,
            alloc = self.tables.allocations,
            holds = self.tables.holds,
        );
        let row = sqlx::query(&query)
            .bind(workspace_id.as_uuid())
            .bind(category.as_str())
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;

        Ok(BalanceSnapshot {
            remaining: row.try_get::<Decimal, _>("remaining").map_err(map_sqlx)?,
            reserved: row.try_get::<Decimal, _>("reserved").map_err(map_sqlx)?,
        })
    }

    async fn load_hold(&self, id: &HoldId) -> StoreResult<Option<CreditHold>> {
        let query = format!("SELECT * FROM {} WHERE id = $1", self.tables.holds);
        let row = sqlx::query(&query)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(hold_from_row).transpose()
    }

    async fn list_allocations(
        &self,
        workspace_id: &WorkspaceId,
    ) -> StoreResult<Vec<CreditAllocation>> {
        let query = format!(
            "SELECT * FROM {} WHERE workspace_id = $1 ORDER BY granted_at",
            self.tables.allocations
        );
        let rows = sqlx::query(&query)
            .bind(workspace_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        collect(&rows, allocation_from_row)
    }

    async fn list_transactions(
        &self,
        workspace_id: &WorkspaceId,
    ) -> StoreResult<Vec<CreditTransaction>> {
        let query = format!(
            "SELECT * FROM {} WHERE workspace_id = $1 ORDER BY seq",
            self.tables.transactions
        );
        let rows = sqlx::query(&query)
            .bind(workspace_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        collect(&rows, transaction_from_row)
    }

    async fn list_holds(&self, workspace_id: &WorkspaceId) -> StoreResult<Vec<CreditHold>> {
        let query = format!(
            "SELECT * FROM {} WHERE workspace_id = $1 ORDER BY created_at",
            self.tables.holds
        );
        let rows = sqlx::query(&query)
            .bind(workspace_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        collect(&rows, hold_from_row)
    }

    async fn workspaces_with_expired_holds(
        &self,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<WorkspaceId>> {
        let query = format!(
            "SELECT DISTINCT workspace_id FROM {} WHERE status = 'ACTIVE' AND expires_at <= $1",
            self.tables.holds
        );
        let rows = sqlx::query(&query)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter()
            .map(|row| {
                row.try_get::<Uuid, _>("workspace_id")
                    .map(WorkspaceId::from)
                    .map_err(map_sqlx)
            })
            .collect()
    }

    async fn purge_retired_allocations(&self, expired_before: DateTime<Utc>) -> StoreResult<usize> {
        let query = format!(
            r#"
            DELETE FROM {} WHERE id IN (
                SELECT id FROM {} WHERE amount_remaining = 0
                  AND expires_at IS NOT NULL AND expires_at < $1
                FOR UPDATE SKIP LOCKED
            )
            "#,
            self.tables.allocations, self.tables.allocations
        );
        let result = sqlx::query(&query)
            .bind(expired_before)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected() as usize)
    }

    async fn increment_usage(
        &self,
        workspace_id: &WorkspaceId,
        operation: OperationType,
        day: NaiveDate,
    ) -> StoreResult<u64> {
        let query = format!(
            r#"
            INSERT INTO {t} (workspace_id, operation, day, count)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (workspace_id, operation, day) DO UPDATE SET count = {t}.count + 1
            RETURNING count
            "#,
            t = self.tables.usage
        );
        let count: i64 = sqlx::query_scalar(&query)
            .bind(workspace_id.as_uuid())
            .bind(operation.as_str())
            .bind(day)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(count.max(0) as u64)
    }

    async fn usage_between(
        &self,
        workspace_id: &WorkspaceId,
        operation: OperationType,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StoreResult<u64> {
        let query = format!(
            r#"
            SELECT COALESCE(SUM(count), 0)::BIGINT FROM {}
            WHERE workspace_id = $1 AND operation = $2 AND day >= $3 AND day <= $4
            "#,
            self.tables.usage
        );
        let total: i64 = sqlx::query_scalar(&query)
            .bind(workspace_id.as_uuid())
            .bind(operation.as_str())
            .bind(from)
            .bind(to)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(total.max(0) as u64)
    }

    async fn save_override(&self, record: &QuotaOverride) -> StoreResult<()> {
        let query = format!(
            r#"
            INSERT INTO {} (id, workspace_id, operation, admin_id, reason, period_tag, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (workspace_id, operation, period_tag) DO NOTHING
            "#,
            self.tables.overrides
        );
        sqlx::query(&query)
            .bind(record.id.as_uuid())
            .bind(record.workspace_id.as_uuid())
            .bind(record.operation.as_str())
            .bind(&record.admin_id)
            .bind(&record.reason)
            .bind(&record.period_tag)
            .bind(record.created_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn find_override(
        &self,
        workspace_id: &WorkspaceId,
        operation: OperationType,
        period_tag: &str,
    ) -> StoreResult<Option<QuotaOverride>> {
        let query = format!(
            "SELECT * FROM {} WHERE workspace_id = $1 AND operation = $2 AND period_tag = $3",
            self.tables.overrides
        );
        let row = sqlx::query(&query)
            .bind(workspace_id.as_uuid())
            .bind(operation.as_str())
            .bind(period_tag)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(override_from_row).transpose()
    }
}

struct PostgresTx {
    workspace_id: WorkspaceId,
    tx: Transaction<'static, Postgres>,
    tables: Tables,
}

#[async_trait]
impl LedgerTx for PostgresTx {
    fn workspace_id(&self) -> WorkspaceId {
        self.workspace_id
    }

    async fn live_allocations(
        &mut self,
        category: CreditCategory,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<CreditAllocation>> {
        let query = format!(
            r#"
            SELECT * FROM {} WHERE workspace_id = $1 AND category = $2
              AND amount_remaining > 0 AND (expires_at IS NULL OR expires_at > $3)
            ORDER BY expires_at ASC NULLS LAST, granted_at ASC
            FOR UPDATE
            "#,
            self.tables.allocations
        );
        let rows = sqlx::query(&query)
            .bind(self.workspace_id.as_uuid())
            .bind(category.as_str())
            .bind(now)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        collect(&rows, allocation_from_row)
    }

    async fn allocations_with_remaining(
        &mut self,
        category: CreditCategory,
        allocation_type: AllocationType,
    ) -> StoreResult<Vec<CreditAllocation>> {
        let query = format!(
            r#"
            SELECT * FROM {} WHERE workspace_id = $1 AND category = $2
              AND allocation_type = $3 AND amount_remaining > 0
            ORDER BY expires_at ASC NULLS LAST, granted_at ASC
            FOR UPDATE
            "#,
            self.tables.allocations
        );
        let rows = sqlx::query(&query)
            .bind(self.workspace_id.as_uuid())
            .bind(category.as_str())
            .bind(allocation_type.as_str())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        collect(&rows, allocation_from_row)
    }

    async fn allocation(&mut self, id: &AllocationId) -> StoreResult<Option<CreditAllocation>> {
        let query = format!(
            "SELECT * FROM {} WHERE id = $1 AND workspace_id = $2 FOR UPDATE",
            self.tables.allocations
        );
        let row = sqlx::query(&query)
            .bind(id.as_uuid())
            .bind(self.workspace_id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(allocation_from_row).transpose()
    }

    async fn cycle_allocation(
        &mut self,
        category: CreditCategory,
        cycle_tag: &str,
    ) -> StoreResult<Option<CreditAllocation>> {
        let query = format!(
            r#"
            SELECT * FROM {} WHERE workspace_id = $1 AND category = $2
              AND allocation_type = 'INCLUDED' AND cycle_tag = $3
            "#,
            self.tables.allocations
        );
        let row = sqlx::query(&query)
            .bind(self.workspace_id.as_uuid())
            .bind(category.as_str())
            .bind(cycle_tag)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(allocation_from_row).transpose()
    }

    async fn insert_allocation(&mut self, allocation: &CreditAllocation) -> StoreResult<()> {
        let query = format!(
            r#"
            INSERT INTO {} (id, workspace_id, category, allocation_type, amount_granted,
                amount_remaining, granted_at, expires_at, cycle_tag, source_id, replaces)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
            self.tables.allocations
        );
        sqlx::query(&query)
            .bind(allocation.id.as_uuid())
            .bind(allocation.workspace_id.as_uuid())
            .bind(allocation.category.as_str())
            .bind(allocation.allocation_type.as_str())
            .bind(allocation.amount_granted)
            .bind(allocation.amount_remaining)
            .bind(allocation.granted_at)
            .bind(allocation.expires_at)
            .bind(&allocation.cycle_tag)
            .bind(&allocation.source_id)
            .bind(allocation.replaces.map(|r| r.as_uuid()))
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn update_allocation(&mut self, allocation: &CreditAllocation) -> StoreResult<()> {
        let query = format!(
            "UPDATE {} SET amount_remaining = $1 WHERE id = $2 AND workspace_id = $3",
            self.tables.allocations
        );
        let result = sqlx::query(&query)
            .bind(allocation.amount_remaining)
            .bind(allocation.id.as_uuid())
            .bind(self.workspace_id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "allocation",
                id: allocation.id.to_string(),
            });
        }
        Ok(())
    }

    async fn reserved_total(
        &mut self,
        category: CreditCategory,
        now: DateTime<Utc>,
    ) -> StoreResult<Decimal> {
        let query = format!(
            r#"
            SELECT COALESCE(SUM(amount_reserved), 0) FROM {}
            WHERE workspace_id = $1 AND category = $2 AND status = 'ACTIVE' AND expires_at > $3
            "#,
            self.tables.holds
        );
        sqlx::query_scalar::<_, Decimal>(&query)
            .bind(self.workspace_id.as_uuid())
            .bind(category.as_str())
            .bind(now)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_sqlx)
    }

    async fn source_transactions(
        &mut self,
        category: CreditCategory,
        source_id: &str,
    ) -> StoreResult<Vec<CreditTransaction>> {
        let query = format!(
            r#"
            SELECT * FROM {} WHERE workspace_id = $1 AND category = $2 AND source_id = $3
            ORDER BY seq
            "#,
            self.tables.transactions
        );
        let rows = sqlx::query(&query)
            .bind(self.workspace_id.as_uuid())
            .bind(category.as_str())
            .bind(source_id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        collect(&rows, transaction_from_row)
    }

    async fn insert_transactions(&mut self, transactions: &[CreditTransaction]) -> StoreResult<()> {
        let query = format!(
            r#"
            INSERT INTO {} (id, workspace_id, transaction_type, category, amount,
                allocation_id, source_id, source_type, created_at, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
            self.tables.transactions
        );
        for txn in transactions {
            sqlx::query(&query)
                .bind(txn.id.as_uuid())
                .bind(txn.workspace_id.as_uuid())
                .bind(txn.transaction_type.as_str())
                .bind(txn.category.as_str())
                .bind(txn.amount)
                .bind(txn.allocation_id.map(|a| a.as_uuid()))
                .bind(&txn.source_id)
                .bind(&txn.source_type)
                .bind(txn.created_at)
                .bind(txn.metadata.to_json())
                .execute(&mut *self.tx)
                .await
                .map_err(map_sqlx)?;
        }
        Ok(())
    }

    async fn hold(&mut self, id: &HoldId) -> StoreResult<Option<CreditHold>> {
        let query = format!(
            "SELECT * FROM {} WHERE id = $1 AND workspace_id = $2 FOR UPDATE",
            self.tables.holds
        );
        let row = sqlx::query(&query)
            .bind(id.as_uuid())
            .bind(self.workspace_id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(hold_from_row).transpose()
    }

    async fn active_hold_for_source(
        &mut self,
        category: CreditCategory,
        source_id: &str,
    ) -> StoreResult<Option<CreditHold>> {
        let query = format!(
            r#"
            SELECT * FROM {} WHERE workspace_id = $1 AND category = $2
              AND source_id = $3 AND status = 'ACTIVE'
            LIMIT 1 FOR UPDATE
            "#,
            self.tables.holds
        );
        let row = sqlx::query(&query)
            .bind(self.workspace_id.as_uuid())
            .bind(category.as_str())
            .bind(source_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(hold_from_row).transpose()
    }

    async fn expired_active_holds(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<CreditHold>> {
        let query = format!(
            r#"
            SELECT * FROM {} WHERE workspace_id = $1 AND status = 'ACTIVE' AND expires_at <= $2
            ORDER BY expires_at
            LIMIT $3
            FOR UPDATE SKIP LOCKED
            "#,
            self.tables.holds
        );
        let rows = sqlx::query(&query)
            .bind(self.workspace_id.as_uuid())
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        collect(&rows, hold_from_row)
    }

    async fn insert_hold(&mut self, hold: &CreditHold) -> StoreResult<()> {
        let query = format!(
            r#"
            INSERT INTO {} (id, workspace_id, category, amount_reserved, source_id,
                created_at, expires_at, status, settled_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
            self.tables.holds
        );
        sqlx::query(&query)
            .bind(hold.id.as_uuid())
            .bind(hold.workspace_id.as_uuid())
            .bind(hold.category.as_str())
            .bind(hold.amount_reserved)
            .bind(&hold.source_id)
            .bind(hold.created_at)
            .bind(hold.expires_at)
            .bind(hold.status.as_str())
            .bind(hold.settled_at)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn update_hold(&mut self, hold: &CreditHold) -> StoreResult<()> {
        let query = format!(
            r#"
            UPDATE {} SET status = $1, expires_at = $2, settled_at = $3
            WHERE id = $4 AND workspace_id = $5
            "#,
            self.tables.holds
        );
        let result = sqlx::query(&query)
            .bind(hold.status.as_str())
            .bind(hold.expires_at)
            .bind(hold.settled_at)
            .bind(hold.id.as_uuid())
            .bind(self.workspace_id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "hold",
                id: hold.id.to_string(),
            });
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await.map_err(map_sqlx)
    }
}

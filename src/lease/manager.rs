use crate::batch::model::ItemStatus;
use crate::clock::Clock;
use crate::error::{OrchestratorError, Result};
use crate::storage::repository::{ItemRepository, JobRepository};
use log::{info, warn};
use sea_orm::{DatabaseConnection, TransactionTrait};
use std::sync::Arc;
use std::time::Duration;

/// worker 对某个 item 的租约
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub item_id: i32,
    pub job_id: i32,
    pub owner: String,
    pub expires_at: i64,
}

/// 租约管理：acquire 是对 item 租约字段的 CAS，renew/finish 都以 owner 为栅栏
pub struct LeaseManager {
    db: Arc<DatabaseConnection>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl LeaseManager {
    pub fn new(db: Arc<DatabaseConnection>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self { db, clock, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn expiry(&self, now: i64) -> i64 {
        now + self.ttl.as_millis() as i64
    }

    pub async fn acquire(&self, item_id: i32, owner: &str) -> Result<Lease> {
        let now = self.clock.now_ms();
        let expires_at = self.expiry(now);
        if !ItemRepository::try_lease(&self.db, item_id, owner, now, expires_at).await? {
            return Err(OrchestratorError::LeaseConflict(item_id));
        }
        let item = ItemRepository::find(&self.db, item_id)
            .await?
            .ok_or(OrchestratorError::ItemNotFound(item_id))?;
        Ok(Lease {
            item_id,
            job_id: item.job_id,
            owner: owner.to_string(),
            expires_at,
        })
    }

    /// 续租并刷新心跳
    pub async fn renew(&self, lease: &mut Lease) -> Result<()> {
        let now = self.clock.now_ms();
        let expires_at = self.expiry(now);
        if ItemRepository::renew(&self.db, lease.item_id, &lease.owner, now, expires_at).await? {
            lease.expires_at = expires_at;
            Ok(())
        } else {
            Err(self.lost(lease))
        }
    }

    /// 交还租约，item 回到 pending；所属 job 已被取消时改为 skipped 并计数。
    /// 返回 item 的新状态，租约已不在自己手里时返回 None（重复调用无副作用）
    pub async fn release(&self, lease: &Lease) -> Result<Option<ItemStatus>> {
        let now = self.clock.now_ms();
        let txn = self.db.begin().await?;
        let status = if ItemRepository::skip_if_job_failed(&txn, lease.item_id, &lease.owner, now).await? {
            JobRepository::add_terminal(&txn, lease.job_id, ItemStatus::Skipped, 1, now).await?;
            Some(ItemStatus::Skipped)
        } else if ItemRepository::release(&txn, lease.item_id, &lease.owner, now).await? {
            Some(ItemStatus::Pending)
        } else {
            None
        };
        txn.commit().await?;
        if status == Some(ItemStatus::Skipped) {
            warn!("item [{}] 交还时 job [{}] 已取消，记为 skipped", lease.item_id, lease.job_id);
        }
        Ok(status)
    }

    pub async fn mark_running(&self, lease: &mut Lease, step: &str) -> Result<()> {
        let now = self.clock.now_ms();
        let expires_at = self.expiry(now);
        if ItemRepository::mark_running(&self.db, lease.item_id, &lease.owner, step, now, expires_at)
            .await?
        {
            lease.expires_at = expires_at;
            Ok(())
        } else {
            Err(self.lost(lease))
        }
    }

    /// 写入已完成 step 列表，顺带续租
    pub async fn record_progress(&self, lease: &mut Lease, completed: &[String]) -> Result<()> {
        let now = self.clock.now_ms();
        let expires_at = self.expiry(now);
        if ItemRepository::record_progress(
            &self.db,
            lease.item_id,
            &lease.owner,
            completed,
            now,
            expires_at,
        )
        .await?
        {
            lease.expires_at = expires_at;
            Ok(())
        } else {
            Err(self.lost(lease))
        }
    }

    /// item 进入终态并释放租约；item 状态、job 计数和 job 收尾在同一个事务里。
    /// 返回 job 是否因此完成
    pub async fn finish(
        &self,
        lease: Lease,
        status: ItemStatus,
        error: Option<String>,
    ) -> Result<bool> {
        let now = self.clock.now_ms();
        let txn = self.db.begin().await?;
        if !ItemRepository::finish(&txn, lease.item_id, &lease.owner, status, error, now).await? {
            txn.rollback().await?;
            return Err(self.lost(&lease));
        }
        JobRepository::add_terminal(&txn, lease.job_id, status, 1, now).await?;
        let job_done = JobRepository::try_complete(&txn, lease.job_id, now).await?;
        txn.commit().await?;
        if job_done {
            info!("✓ job [{}] 已完成", lease.job_id);
        }
        Ok(job_done)
    }

    fn lost(&self, lease: &Lease) -> OrchestratorError {
        OrchestratorError::LeaseLost {
            item_id: lease.item_id,
            owner: lease.owner.clone(),
        }
    }
}

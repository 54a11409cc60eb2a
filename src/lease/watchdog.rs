use crate::batch::model::{ItemStatus, JobConfig, JobStatus};
use crate::clock::Clock;
use crate::error::{truncate_error, Result};
use crate::storage::repository::{ItemRepository, JobRepository};
use log::{error, info, warn};
use sea_orm::{DatabaseConnection, TransactionTrait};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// 一次回收的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reclaimed {
    pub item_id: i32,
    pub job_id: i32,
    pub prior_owner: Option<String>,
    pub new_status: ItemStatus,
}

/// 周期性扫描心跳超时的 item，收回租约。只改状态/attempt/租约字段，从不碰 checkpoint
pub struct Watchdog {
    db: Arc<DatabaseConnection>,
    clock: Arc<dyn Clock>,
    lease_ttl: Duration,
    interval: Duration,
    max_error_len: usize,
}

impl Watchdog {
    pub fn new(
        db: Arc<DatabaseConnection>,
        clock: Arc<dyn Clock>,
        lease_ttl: Duration,
        interval: Duration,
        max_error_len: usize,
    ) -> Self {
        Self {
            db,
            clock,
            lease_ttl,
            interval,
            max_error_len,
        }
    }

    pub async fn sweep(&self) -> Result<Vec<Reclaimed>> {
        let now = self.clock.now_ms();
        let cutoff = now - self.lease_ttl.as_millis() as i64;
        let stale = ItemRepository::stale(&self.db, cutoff).await?;
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let mut jobs: HashMap<i32, Option<(JobStatus, JobConfig)>> = HashMap::new();
        let mut out = Vec::new();

        for item in stale {
            if !jobs.contains_key(&item.job_id) {
                let info = JobRepository::find(&self.db, item.job_id)
                    .await?
                    .and_then(|j| {
                        let status = JobStatus::parse(&j.status)?;
                        let cfg = serde_json::from_str::<JobConfig>(&j.config_json).ok()?;
                        Some((status, cfg))
                    });
                jobs.insert(item.job_id, info);
            }
            let Some(Some((job_status, cfg))) = jobs.get(&item.job_id).cloned() else {
                error!("item [{}] 所属 job [{}] 无法读取，跳过回收", item.id, item.job_id);
                continue;
            };

            let attempts_after = item.attempts + 1;
            let (to, err) = if job_status == JobStatus::Failed {
                (ItemStatus::Skipped, None)
            } else if attempts_after > cfg.max_attempts {
                let msg = format!(
                    "lease expired {} times (last owner {}), giving up",
                    attempts_after,
                    item.lease_owner.as_deref().unwrap_or("-")
                );
                (
                    ItemStatus::Failed,
                    Some(truncate_error(&msg, self.max_error_len)),
                )
            } else {
                (ItemStatus::Pending, None)
            };

            // 回收与终态计数在同一个事务里，计数不会漏
            let txn = self.db.begin().await?;
            if !ItemRepository::reclaim(&txn, &item, to, err, now).await? {
                // worker 刚好续租或者已经完成，放过
                txn.rollback().await?;
                continue;
            }
            let mut job_done = false;
            if to.is_terminal() {
                JobRepository::add_terminal(&txn, item.job_id, to, 1, now).await?;
                job_done = JobRepository::try_complete(&txn, item.job_id, now).await?;
            }
            txn.commit().await?;

            warn!(
                "⚠ 回收超时租约 item [{}] {} (job {}, owner {}, attempt {}/{}) -> {}",
                item.id,
                item.ticker,
                item.job_id,
                item.lease_owner.as_deref().unwrap_or("-"),
                attempts_after,
                cfg.max_attempts,
                to.as_str()
            );
            if job_done {
                info!("✓ job [{}] 全部 item 已结束", item.job_id);
            }

            out.push(Reclaimed {
                item_id: item.id,
                job_id: item.job_id,
                prior_owner: item.lease_owner.clone(),
                new_status: to,
            });
        }

        Ok(out)
    }

    /// 常驻循环，收到 shutdown 信号后退出
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("watchdog 启动，间隔 {:?}，租约 {:?}", self.interval, self.lease_ttl);
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.sweep().await {
                Ok(r) if !r.is_empty() => info!("watchdog 本轮回收 {} 个 item", r.len()),
                Ok(_) => {}
                Err(e) => error!("watchdog 扫描失败: {}", e),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                res = shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }
        info!("watchdog 已停止");
    }
}

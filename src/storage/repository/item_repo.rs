use crate::batch::model::{ItemFilter, ItemStatus, JobStats, JobStatus};
use crate::storage::entity::item::{self, Entity as Item};
use crate::storage::entity::job;
use sea_orm::sea_query::{Expr, Query, SelectStatement};
use sea_orm::{
    ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect,
};

const LIVE: [&str; 2] = ["leased", "running"];
const NON_TERMINAL: [&str; 3] = ["pending", "leased", "running"];

pub struct ItemRepository;

impl ItemRepository {
    pub async fn find(
        db: &DatabaseConnection,
        item_id: i32,
    ) -> Result<Option<item::Model>, sea_orm::DbErr> {
        Item::find_by_id(item_id).one(db).await
    }

    pub async fn list(
        db: &DatabaseConnection,
        job_id: i32,
        filter: &ItemFilter,
    ) -> Result<Vec<item::Model>, sea_orm::DbErr> {
        let mut q = Item::find().filter(item::Column::JobId.eq(job_id));
        if let Some(status) = filter.status {
            q = q.filter(item::Column::Status.eq(status.as_str()));
        }
        if let Some(ref ticker) = filter.ticker {
            q = q.filter(item::Column::Ticker.eq(ticker.clone()));
        }
        q = q
            .order_by_desc(item::Column::Priority)
            .order_by_asc(item::Column::Id);
        if let Some(limit) = filter.limit {
            q = q.limit(limit);
        }
        q.all(db).await
    }

    /// 某个 job 下待领取的 item：priority DESC, id ASC
    pub async fn pending_candidates(
        db: &DatabaseConnection,
        job_id: i32,
        limit: u64,
    ) -> Result<Vec<item::Model>, sea_orm::DbErr> {
        Item::find()
            .filter(item::Column::JobId.eq(job_id))
            .filter(item::Column::Status.eq(ItemStatus::Pending.as_str()))
            .order_by_desc(item::Column::Priority)
            .order_by_asc(item::Column::Id)
            .limit(limit)
            .all(db)
            .await
    }

    /// 租约 CAS：无人持有或已过期才能拿到
    pub async fn try_lease(
        db: &DatabaseConnection,
        item_id: i32,
        owner: &str,
        now: i64,
        expires_at: i64,
    ) -> Result<bool, sea_orm::DbErr> {
        let res = Item::update_many()
            .col_expr(item::Column::Status, Expr::value(ItemStatus::Leased.as_str()))
            .col_expr(item::Column::LeaseOwner, Expr::value(owner.to_string()))
            .col_expr(item::Column::LeaseExpiresAt, Expr::value(expires_at))
            .col_expr(item::Column::LastHeartbeatAt, Expr::value(now))
            .col_expr(item::Column::UpdatedAt, Expr::value(now))
            .filter(item::Column::Id.eq(item_id))
            .filter(item::Column::Status.is_in(NON_TERMINAL))
            .filter(
                Condition::any()
                    .add(item::Column::LeaseOwner.is_null())
                    .add(item::Column::LeaseExpiresAt.is_null())
                    .add(item::Column::LeaseExpiresAt.lt(now)),
            )
            .exec(db)
            .await?;
        Ok(res.rows_affected == 1)
    }

    pub async fn renew(
        db: &DatabaseConnection,
        item_id: i32,
        owner: &str,
        now: i64,
        expires_at: i64,
    ) -> Result<bool, sea_orm::DbErr> {
        let res = Item::update_many()
            .col_expr(item::Column::LeaseExpiresAt, Expr::value(expires_at))
            .col_expr(item::Column::LastHeartbeatAt, Expr::value(now))
            .col_expr(item::Column::UpdatedAt, Expr::value(now))
            .filter(item::Column::Id.eq(item_id))
            .filter(item::Column::LeaseOwner.eq(owner))
            .filter(item::Column::Status.is_in(LIVE))
            .exec(db)
            .await?;
        Ok(res.rows_affected == 1)
    }

    /// 主动交还租约：item 回到 pending，不计 attempt
    pub async fn release<C: ConnectionTrait>(
        db: &C,
        item_id: i32,
        owner: &str,
        now: i64,
    ) -> Result<bool, sea_orm::DbErr> {
        let res = Item::update_many()
            .col_expr(item::Column::Status, Expr::value(ItemStatus::Pending.as_str()))
            .col_expr(item::Column::LeaseOwner, Expr::value(Option::<String>::None))
            .col_expr(item::Column::LeaseExpiresAt, Expr::value(Option::<i64>::None))
            .col_expr(item::Column::UpdatedAt, Expr::value(now))
            .filter(item::Column::Id.eq(item_id))
            .filter(item::Column::LeaseOwner.eq(owner))
            .filter(item::Column::Status.is_in(LIVE))
            .exec(db)
            .await?;
        Ok(res.rows_affected == 1)
    }

    /// 进入 running 并记录当前 step，同时续租
    pub async fn mark_running(
        db: &DatabaseConnection,
        item_id: i32,
        owner: &str,
        step: &str,
        now: i64,
        expires_at: i64,
    ) -> Result<bool, sea_orm::DbErr> {
        let res = Item::update_many()
            .col_expr(item::Column::Status, Expr::value(ItemStatus::Running.as_str()))
            .col_expr(item::Column::CurrentStep, Expr::value(step.to_string()))
            .col_expr(item::Column::LeaseExpiresAt, Expr::value(expires_at))
            .col_expr(item::Column::LastHeartbeatAt, Expr::value(now))
            .col_expr(item::Column::UpdatedAt, Expr::value(now))
            .filter(item::Column::Id.eq(item_id))
            .filter(item::Column::LeaseOwner.eq(owner))
            .filter(item::Column::Status.is_in(LIVE))
            .exec(db)
            .await?;
        Ok(res.rows_affected == 1)
    }

    /// 记录 step 进度（仅租约持有者可写）
    pub async fn record_progress(
        db: &DatabaseConnection,
        item_id: i32,
        owner: &str,
        completed_step_ids: &[String],
        now: i64,
        expires_at: i64,
    ) -> Result<bool, sea_orm::DbErr> {
        let ids = serde_json::to_string(completed_step_ids)
            .map_err(|e| sea_orm::DbErr::Custom(format!("step ids json: {}", e)))?;
        let res = Item::update_many()
            .col_expr(item::Column::CompletedStepIds, Expr::value(ids))
            .col_expr(
                item::Column::CompletedSteps,
                Expr::value(completed_step_ids.len() as i32),
            )
            .col_expr(item::Column::LeaseExpiresAt, Expr::value(expires_at))
            .col_expr(item::Column::LastHeartbeatAt, Expr::value(now))
            .col_expr(item::Column::UpdatedAt, Expr::value(now))
            .filter(item::Column::Id.eq(item_id))
            .filter(item::Column::LeaseOwner.eq(owner))
            .filter(item::Column::Status.is_in(LIVE))
            .exec(db)
            .await?;
        Ok(res.rows_affected == 1)
    }

    /// 终态迁移并清空租约，同一条 UPDATE 完成
    pub async fn finish<C: ConnectionTrait>(
        db: &C,
        item_id: i32,
        owner: &str,
        status: ItemStatus,
        error: Option<String>,
        now: i64,
    ) -> Result<bool, sea_orm::DbErr> {
        let mut q = Item::update_many()
            .col_expr(item::Column::Status, Expr::value(status.as_str()))
            .col_expr(item::Column::LeaseOwner, Expr::value(Option::<String>::None))
            .col_expr(item::Column::LeaseExpiresAt, Expr::value(Option::<i64>::None))
            .col_expr(item::Column::CurrentStep, Expr::value(Option::<String>::None))
            .col_expr(item::Column::UpdatedAt, Expr::value(now));
        if error.is_some() {
            q = q.col_expr(item::Column::LastError, Expr::value(error));
        }
        let res = q
            .filter(item::Column::Id.eq(item_id))
            .filter(item::Column::LeaseOwner.eq(owner))
            .filter(item::Column::Status.is_in(LIVE))
            .exec(db)
            .await?;
        Ok(res.rows_affected == 1)
    }

    /// 心跳早于 cutoff 的 leased/running item
    pub async fn stale(
        db: &DatabaseConnection,
        cutoff: i64,
    ) -> Result<Vec<item::Model>, sea_orm::DbErr> {
        Item::find()
            .filter(item::Column::Status.is_in(LIVE))
            .filter(
                Condition::any()
                    .add(item::Column::LastHeartbeatAt.is_null())
                    .add(item::Column::LastHeartbeatAt.lt(cutoff)),
            )
            .order_by_asc(item::Column::Id)
            .all(db)
            .await
    }

    /// watchdog 回收：attempt+1，清空租约；只动状态/租约字段，不动 step 进度
    pub async fn reclaim<C: ConnectionTrait>(
        db: &C,
        stale: &item::Model,
        to: ItemStatus,
        error: Option<String>,
        now: i64,
    ) -> Result<bool, sea_orm::DbErr> {
        let mut q = Item::update_many()
            .col_expr(item::Column::Status, Expr::value(to.as_str()))
            .col_expr(
                item::Column::Attempts,
                Expr::col(item::Column::Attempts).add(1),
            )
            .col_expr(item::Column::LeaseOwner, Expr::value(Option::<String>::None))
            .col_expr(item::Column::LeaseExpiresAt, Expr::value(Option::<i64>::None))
            .col_expr(item::Column::UpdatedAt, Expr::value(now));
        if error.is_some() {
            q = q.col_expr(item::Column::LastError, Expr::value(error));
        }
        q = q
            .filter(item::Column::Id.eq(stale.id))
            .filter(item::Column::Status.is_in(LIVE))
            .filter(item::Column::Attempts.eq(stale.attempts));
        // owner 和心跳都没变才回收，避免和刚刚续租的 worker 抢
        q = match &stale.lease_owner {
            Some(owner) => q.filter(item::Column::LeaseOwner.eq(owner.clone())),
            None => q.filter(item::Column::LeaseOwner.is_null()),
        };
        q = match stale.last_heartbeat_at {
            Some(hb) => q.filter(item::Column::LastHeartbeatAt.eq(hb)),
            None => q.filter(item::Column::LastHeartbeatAt.is_null()),
        };
        Ok(q.exec(db).await?.rows_affected == 1)
    }

    /// 取消 job 时把还没人领的 item 直接置为 skipped
    pub async fn skip_pending<C: ConnectionTrait>(
        db: &C,
        job_id: i32,
        now: i64,
    ) -> Result<u64, sea_orm::DbErr> {
        let res = Item::update_many()
            .col_expr(item::Column::Status, Expr::value(ItemStatus::Skipped.as_str()))
            .col_expr(item::Column::UpdatedAt, Expr::value(now))
            .filter(item::Column::JobId.eq(job_id))
            .filter(item::Column::Status.eq(ItemStatus::Pending.as_str()))
            .exec(db)
            .await?;
        Ok(res.rows_affected)
    }

    /// 交还时所属 job 已经 failed（被取消）：item 直接 skipped，而不是回到 pending
    pub async fn skip_if_job_failed<C: ConnectionTrait>(
        db: &C,
        item_id: i32,
        owner: &str,
        now: i64,
    ) -> Result<bool, sea_orm::DbErr> {
        let res = Item::update_many()
            .col_expr(item::Column::Status, Expr::value(ItemStatus::Skipped.as_str()))
            .col_expr(item::Column::LeaseOwner, Expr::value(Option::<String>::None))
            .col_expr(item::Column::LeaseExpiresAt, Expr::value(Option::<i64>::None))
            .col_expr(item::Column::CurrentStep, Expr::value(Option::<String>::None))
            .col_expr(item::Column::UpdatedAt, Expr::value(now))
            .filter(item::Column::Id.eq(item_id))
            .filter(item::Column::LeaseOwner.eq(owner))
            .filter(item::Column::Status.is_in(LIVE))
            .filter(item::Column::JobId.in_subquery(failed_job_ids()))
            .exec(db)
            .await?;
        Ok(res.rows_affected == 1)
    }

    /// 修复：已 failed 的 job 下残留的 pending item 一律 skipped
    pub async fn skip_stranded<C: ConnectionTrait>(db: &C, now: i64) -> Result<u64, sea_orm::DbErr> {
        let res = Item::update_many()
            .col_expr(item::Column::Status, Expr::value(ItemStatus::Skipped.as_str()))
            .col_expr(item::Column::UpdatedAt, Expr::value(now))
            .filter(item::Column::Status.eq(ItemStatus::Pending.as_str()))
            .filter(item::Column::JobId.in_subquery(failed_job_ids()))
            .exec(db)
            .await?;
        Ok(res.rows_affected)
    }

    pub async fn stats(db: &DatabaseConnection, job_id: i32) -> Result<JobStats, sea_orm::DbErr> {
        let mut stats = JobStats::default();
        for status in [
            ItemStatus::Pending,
            ItemStatus::Leased,
            ItemStatus::Running,
            ItemStatus::Completed,
            ItemStatus::Failed,
            ItemStatus::Skipped,
        ] {
            let n = Item::find()
                .filter(item::Column::JobId.eq(job_id))
                .filter(item::Column::Status.eq(status.as_str()))
                .count(db)
                .await? as usize;
            match status {
                ItemStatus::Pending => stats.pending = n,
                ItemStatus::Leased => stats.leased = n,
                ItemStatus::Running => stats.running = n,
                ItemStatus::Completed => stats.completed = n,
                ItemStatus::Failed => stats.failed = n,
                ItemStatus::Skipped => stats.skipped = n,
            }
            stats.total += n;
        }

        let rows: Vec<(i32, i32)> = Item::find()
            .select_only()
            .column(item::Column::CompletedSteps)
            .column(item::Column::TotalSteps)
            .filter(item::Column::JobId.eq(job_id))
            .into_tuple()
            .all(db)
            .await?;
        for (done, total) in rows {
            stats.steps_done += done as i64;
            stats.steps_total += total as i64;
        }
        Ok(stats)
    }
}

fn failed_job_ids() -> SelectStatement {
    Query::select()
        .column(job::Column::Id)
        .from(job::Entity)
        .and_where(job::Column::Status.eq(JobStatus::Failed.as_str()))
        .to_owned()
}

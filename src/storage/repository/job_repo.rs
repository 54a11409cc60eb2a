use crate::batch::model::{ItemStatus, JobStatus, JobSubmission};
use crate::storage::entity::checkpoint::{self, Entity as Checkpoint};
use crate::storage::entity::item::{self, ActiveModel as ItemActiveModel, Entity as Item};
use crate::storage::entity::job::{self, ActiveModel as JobActiveModel, Entity as Job};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseBackend, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, Set, Statement, TransactionTrait, UpdateMany,
};

/// 按 item 实际状态重算 job 计数（单条 UPDATE，读写在同一语句内）
const RECONCILE_COUNTERS_SQL: &str = "UPDATE jobs SET \
    completed_items = (SELECT COUNT(*) FROM items WHERE items.job_id = jobs.id AND items.status = 'completed'), \
    failed_items = (SELECT COUNT(*) FROM items WHERE items.job_id = jobs.id AND items.status = 'failed'), \
    skipped_items = (SELECT COUNT(*) FROM items WHERE items.job_id = jobs.id AND items.status = 'skipped') \
    WHERE status IN ('pending', 'running', 'paused', 'failed')";

pub struct JobRepository;

impl JobRepository {
    /// 一次事务内写入 job 和全部 item
    pub async fn create_job(
        db: &DatabaseConnection,
        submission: &JobSubmission,
        tickers: &[String],
        total_steps: i32,
        now: i64,
    ) -> Result<i32, sea_orm::DbErr> {
        let config_json = serde_json::to_string(&submission.config)
            .map_err(|e| sea_orm::DbErr::Custom(format!("config json: {}", e)))?;

        let txn = db.begin().await?;
        let job = JobActiveModel {
            name: Set(submission.name.clone()),
            status: Set(JobStatus::Pending.as_str().to_string()),
            pause_reason: Set(None),
            priority: Set(submission.priority),
            operation_type: Set(submission.config.operation_type.clone()),
            config_json: Set(config_json),
            total_items: Set(tickers.len() as i32),
            completed_items: Set(0),
            failed_items: Set(0),
            skipped_items: Set(0),
            last_error: Set(None),
            created_at: Set(now),
            started_at: Set(None),
            completed_at: Set(None),
            last_activity_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        let items: Vec<ItemActiveModel> = tickers
            .iter()
            .map(|t| ItemActiveModel {
                job_id: Set(job.id),
                ticker: Set(t.clone()),
                status: Set(ItemStatus::Pending.as_str().to_string()),
                priority: Set(submission.item_priorities.get(t).copied().unwrap_or(0)),
                attempts: Set(0),
                last_error: Set(None),
                lease_owner: Set(None),
                lease_expires_at: Set(None),
                last_heartbeat_at: Set(None),
                total_steps: Set(total_steps),
                completed_steps: Set(0),
                completed_step_ids: Set("[]".to_string()),
                current_step: Set(None),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            })
            .collect();
        if !items.is_empty() {
            Item::insert_many(items).exec_without_returning(&txn).await?;
        }

        txn.commit().await?;
        Ok(job.id)
    }

    pub async fn find(
        db: &DatabaseConnection,
        job_id: i32,
    ) -> Result<Option<job::Model>, sea_orm::DbErr> {
        Job::find_by_id(job_id).one(db).await
    }

    /// 可领取任务的 job：优先级降序，同优先级按提交顺序
    pub async fn runnable_jobs(db: &DatabaseConnection) -> Result<Vec<job::Model>, sea_orm::DbErr> {
        Job::find()
            .filter(job::Column::Status.is_in([
                JobStatus::Pending.as_str(),
                JobStatus::Running.as_str(),
            ]))
            .order_by_desc(job::Column::Priority)
            .order_by_asc(job::Column::Id)
            .all(db)
            .await
    }

    pub async fn paused_jobs(
        db: &DatabaseConnection,
        reason: &str,
    ) -> Result<Vec<job::Model>, sea_orm::DbErr> {
        Job::find()
            .filter(job::Column::Status.eq(JobStatus::Paused.as_str()))
            .filter(job::Column::PauseReason.eq(reason))
            .order_by_asc(job::Column::Id)
            .all(db)
            .await
    }

    /// 条件状态迁移：只有当前状态在 from 中才会生效，返回受影响行数
    pub async fn transition<C: ConnectionTrait>(
        db: &C,
        job_id: i32,
        from: &[JobStatus],
        to: JobStatus,
        pause_reason: Option<&str>,
        now: i64,
    ) -> Result<u64, sea_orm::DbErr> {
        let from: Vec<&str> = from.iter().map(|s| s.as_str()).collect();
        let mut update = Job::update_many()
            .col_expr(job::Column::Status, Expr::value(to.as_str()))
            .col_expr(
                job::Column::PauseReason,
                Expr::value(pause_reason.map(|s| s.to_string())),
            )
            .col_expr(job::Column::LastActivityAt, Expr::value(now));
        if to == JobStatus::Running {
            update = update.col_expr(
                job::Column::StartedAt,
                Expr::col(job::Column::StartedAt).if_null(now),
            );
        }
        if to.is_terminal() {
            update = update.col_expr(job::Column::CompletedAt, Expr::value(now));
        }
        let res = update
            .filter(job::Column::Id.eq(job_id))
            .filter(job::Column::Status.is_in(from))
            .exec(db)
            .await?;
        Ok(res.rows_affected)
    }

    /// 只恢复指定原因的暂停（reason = None 时恢复任意暂停）
    pub async fn resume(
        db: &DatabaseConnection,
        job_id: i32,
        reason: Option<&str>,
        now: i64,
    ) -> Result<u64, sea_orm::DbErr> {
        let mut q = Job::update_many()
            .col_expr(job::Column::Status, Expr::value(JobStatus::Running.as_str()))
            .col_expr(job::Column::PauseReason, Expr::value(Option::<String>::None))
            .col_expr(
                job::Column::StartedAt,
                Expr::col(job::Column::StartedAt).if_null(now),
            )
            .col_expr(job::Column::LastActivityAt, Expr::value(now))
            .filter(job::Column::Id.eq(job_id))
            .filter(job::Column::Status.eq(JobStatus::Paused.as_str()));
        if let Some(r) = reason {
            q = q.filter(job::Column::PauseReason.eq(r));
        }
        Ok(q.exec(db).await?.rows_affected)
    }

    pub async fn set_last_error<C: ConnectionTrait>(
        db: &C,
        job_id: i32,
        message: &str,
    ) -> Result<(), sea_orm::DbErr> {
        Job::update_many()
            .col_expr(job::Column::LastError, Expr::value(message.to_string()))
            .filter(job::Column::Id.eq(job_id))
            .exec(db)
            .await?;
        Ok(())
    }

    /// item 进入终态后累加对应计数（单条 UPDATE，原子）
    pub async fn add_terminal<C: ConnectionTrait>(
        db: &C,
        job_id: i32,
        status: ItemStatus,
        n: u64,
        now: i64,
    ) -> Result<(), sea_orm::DbErr> {
        let col = match status {
            ItemStatus::Completed => job::Column::CompletedItems,
            ItemStatus::Failed => job::Column::FailedItems,
            ItemStatus::Skipped => job::Column::SkippedItems,
            _ => return Ok(()),
        };
        if n == 0 {
            return Ok(());
        }
        Job::update_many()
            .col_expr(col, Expr::col(col).add(n as i32))
            .col_expr(job::Column::LastActivityAt, Expr::value(now))
            .filter(job::Column::Id.eq(job_id))
            .exec(db)
            .await?;
        Ok(())
    }

    /// 所有 item 都到终态时把 job 标记为 completed；已取消（failed）的 job 保持原状
    pub async fn try_complete<C: ConnectionTrait>(
        db: &C,
        job_id: i32,
        now: i64,
    ) -> Result<bool, sea_orm::DbErr> {
        let res = completion_update(now)
            .filter(job::Column::Id.eq(job_id))
            .exec(db)
            .await?;
        Ok(res.rows_affected > 0)
    }

    /// 同 try_complete，但扫描全部未结束的 job（启动修复用）
    pub async fn complete_finished<C: ConnectionTrait>(
        db: &C,
        now: i64,
    ) -> Result<u64, sea_orm::DbErr> {
        Ok(completion_update(now).exec(db).await?.rows_affected)
    }

    pub async fn reconcile_counters<C: ConnectionTrait>(db: &C) -> Result<u64, sea_orm::DbErr> {
        let res = db
            .execute(Statement::from_string(
                DatabaseBackend::Sqlite,
                RECONCILE_COUNTERS_SQL.to_string(),
            ))
            .await?;
        Ok(res.rows_affected())
    }

    pub async fn touch(db: &DatabaseConnection, job_id: i32, now: i64) -> Result<(), sea_orm::DbErr> {
        Job::update_many()
            .col_expr(job::Column::LastActivityAt, Expr::value(now))
            .filter(job::Column::Id.eq(job_id))
            .exec(db)
            .await?;
        Ok(())
    }

    /// 级联删除：checkpoint -> item -> job
    pub async fn delete_cascade(db: &DatabaseConnection, job_id: i32) -> Result<u64, sea_orm::DbErr> {
        let txn = db.begin().await?;
        Checkpoint::delete_many()
            .filter(checkpoint::Column::JobId.eq(job_id))
            .exec(&txn)
            .await?;
        Item::delete_many()
            .filter(item::Column::JobId.eq(job_id))
            .exec(&txn)
            .await?;
        let res = Job::delete_many()
            .filter(job::Column::Id.eq(job_id))
            .exec(&txn)
            .await?;
        txn.commit().await?;
        Ok(res.rows_affected)
    }
}

fn completion_update(now: i64) -> UpdateMany<Job> {
    let done = Expr::col(job::Column::CompletedItems)
        .add(Expr::col(job::Column::FailedItems))
        .add(Expr::col(job::Column::SkippedItems));
    Job::update_many()
        .col_expr(job::Column::Status, Expr::value(JobStatus::Completed.as_str()))
        .col_expr(job::Column::PauseReason, Expr::value(Option::<String>::None))
        .col_expr(job::Column::CompletedAt, Expr::value(now))
        .col_expr(job::Column::LastActivityAt, Expr::value(now))
        .filter(job::Column::Status.is_in([
            JobStatus::Pending.as_str(),
            JobStatus::Running.as_str(),
            JobStatus::Paused.as_str(),
        ]))
        .filter(Expr::expr(done).gte(Expr::col(job::Column::TotalItems)))
}

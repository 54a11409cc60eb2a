use crate::batch::model::{
    ItemFilter, ItemStatus, JobStats, JobStatus, JobSubmission, PAUSE_QUOTA, PAUSE_USER,
};
use crate::batch::worker::ItemWorker;
use crate::checkpoint::CheckpointStore;
use crate::clock::Clock;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::executor::ExecutorRegistry;
use crate::gate::CallGate;
use crate::lease::{Lease, LeaseManager, Watchdog};
use crate::rotator::{Credential, CredentialRotator};
use crate::storage::entity::{checkpoint, item, job};
use crate::storage::repository::{ItemRepository, JobRepository};
use log::{error, info, warn};
use regex::Regex;
use sea_orm::{DatabaseConnection, TransactionTrait};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};

const CLAIM_SCAN: u64 = 8;

/// 批处理调度器：对外提供 job 管理接口，并驱动 worker 池
pub struct BatchService {
    pub(crate) db: Arc<DatabaseConnection>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: OrchestratorConfig,
    pub(crate) rotator: Arc<CredentialRotator>,
    pub(crate) gate: Arc<CallGate>,
    pub(crate) leases: Arc<LeaseManager>,
    pub(crate) checkpoints: Arc<CheckpointStore>,
    pub(crate) watchdog: Arc<Watchdog>,
    pub(crate) registry: Arc<ExecutorRegistry>,
    ticker_re: Regex,
    instance: String,
}

impl BatchService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: OrchestratorConfig,
        registry: ExecutorRegistry,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let gate = Arc::new(CallGate::new(
            config.gate_lock_path.clone(),
            config.call_cooldown,
        )?);
        let rotator = Arc::new(CredentialRotator::new(
            db.clone(),
            clock.clone(),
            Credential::from_keys(&config.credentials),
            config.daily_limit,
        ));
        let leases = Arc::new(LeaseManager::new(db.clone(), clock.clone(), config.lease_ttl));
        let checkpoints = Arc::new(CheckpointStore::new(db.clone(), clock.clone()));
        let watchdog = Arc::new(Watchdog::new(
            db.clone(),
            clock.clone(),
            config.lease_ttl,
            config.watchdog_interval,
            config.max_error_len,
        ));
        let ticker_re = Regex::new(r"^[A-Z0-9][A-Z0-9.\-]{0,11}$")
            .map_err(|e| OrchestratorError::InvalidJob(e.to_string()))?;

        Ok(Self {
            db,
            clock,
            config,
            rotator,
            gate,
            leases,
            checkpoints,
            watchdog,
            registry: Arc::new(registry),
            ticker_re,
            instance: format!("{:04x}", rand::random::<u16>()),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn rotator(&self) -> &Arc<CredentialRotator> {
        &self.rotator
    }

    pub fn gate(&self) -> &Arc<CallGate> {
        &self.gate
    }

    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    pub fn watchdog(&self) -> &Arc<Watchdog> {
        &self.watchdog
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    /// 清洗 ticker：去空白、转大写、校验、去重（保持原顺序）
    pub fn normalize_tickers(&self, raw: &[String]) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(raw.len());
        for t in raw {
            let t = t.trim().to_uppercase();
            if t.is_empty() {
                continue;
            }
            if !self.ticker_re.is_match(&t) {
                return Err(OrchestratorError::InvalidTicker(t));
            }
            if seen.insert(t.clone()) {
                out.push(t);
            }
        }
        Ok(out)
    }

    pub async fn submit_job(&self, submission: JobSubmission) -> Result<i32> {
        if !self.registry.contains(&submission.config.operation_type) {
            return Err(OrchestratorError::UnknownOperation(
                submission.config.operation_type.clone(),
            ));
        }
        let steps = submission.config.steps();
        if steps.is_empty() {
            return Err(OrchestratorError::InvalidJob("no years requested".into()));
        }
        if submission.config.max_attempts < 1 {
            return Err(OrchestratorError::InvalidJob("max_attempts must be >= 1".into()));
        }
        let tickers = self.normalize_tickers(&submission.tickers)?;
        if tickers.is_empty() {
            return Err(OrchestratorError::InvalidJob("no tickers".into()));
        }
        let mut submission = submission;
        submission.item_priorities = submission
            .item_priorities
            .into_iter()
            .map(|(k, v)| (k.trim().to_uppercase(), v))
            .collect();

        let now = self.clock.now_ms();
        let job_id =
            JobRepository::create_job(&self.db, &submission, &tickers, steps.len() as i32, now)
                .await?;
        info!(
            "✓ 已提交 job [{}] {}: {} 个 ticker × {} 个年份",
            job_id,
            submission.name,
            tickers.len(),
            steps.len()
        );
        Ok(job_id)
    }

    pub async fn get_job_status(&self, job_id: i32) -> Result<job::Model> {
        JobRepository::find(&self.db, job_id)
            .await?
            .ok_or(OrchestratorError::JobNotFound(job_id))
    }

    pub async fn job_stats(&self, job_id: i32) -> Result<JobStats> {
        self.get_job_status(job_id).await?;
        Ok(ItemRepository::stats(&self.db, job_id).await?)
    }

    /// 人工暂停；已经暂停则视为成功。额度暂停中的 job 原因改为 user，额度恢复后不再自动拉起
    pub async fn pause_job(&self, job_id: i32) -> Result<()> {
        let now = self.clock.now_ms();
        let n = JobRepository::transition(
            self.db.as_ref(),
            job_id,
            &[JobStatus::Pending, JobStatus::Running, JobStatus::Paused],
            JobStatus::Paused,
            Some(PAUSE_USER),
            now,
        )
        .await?;
        if n > 0 {
            info!("job [{}] 已暂停", job_id);
            return Ok(());
        }
        let job = self.get_job_status(job_id).await?;
        Err(OrchestratorError::InvalidTransition {
            job_id,
            action: "pause",
            status: job.status,
        })
    }

    pub async fn resume_job(&self, job_id: i32) -> Result<()> {
        let now = self.clock.now_ms();
        if JobRepository::resume(&self.db, job_id, None, now).await? > 0 {
            info!("job [{}] 已恢复", job_id);
            return Ok(());
        }
        let job = self.get_job_status(job_id).await?;
        match JobStatus::parse(&job.status) {
            Some(JobStatus::Running) | Some(JobStatus::Pending) => Ok(()),
            _ => Err(OrchestratorError::InvalidTransition {
                job_id,
                action: "resume",
                status: job.status,
            }),
        }
    }

    /// 取消：job 置为 failed，未领取的 item 直接 skipped；在跑的 item 做完当前 step 后 skipped
    pub async fn cancel_job(&self, job_id: i32) -> Result<()> {
        self.abort_job(job_id, "cancelled by user").await?;
        Ok(())
    }

    /// job 级失败（人工取消或不可恢复的配置错误）
    pub(crate) async fn abort_job(&self, job_id: i32, reason: &str) -> Result<()> {
        let now = self.clock.now_ms();
        // 状态切换、pending 跳过与计数一起提交
        let txn = self.db.begin().await?;
        let n = JobRepository::transition(
            &txn,
            job_id,
            &[JobStatus::Pending, JobStatus::Running, JobStatus::Paused],
            JobStatus::Failed,
            None,
            now,
        )
        .await?;
        if n == 0 {
            txn.rollback().await?;
            let job = self.get_job_status(job_id).await?;
            return Err(OrchestratorError::InvalidTransition {
                job_id,
                action: "abort",
                status: job.status,
            });
        }
        JobRepository::set_last_error(&txn, job_id, reason).await?;
        let skipped = ItemRepository::skip_pending(&txn, job_id, now).await?;
        JobRepository::add_terminal(&txn, job_id, ItemStatus::Skipped, skipped, now).await?;
        txn.commit().await?;
        warn!(
            "✗ job [{}] 已终止: {} ({} 个待处理 item 跳过)",
            job_id, reason, skipped
        );
        Ok(())
    }

    pub async fn list_items(&self, job_id: i32, filter: ItemFilter) -> Result<Vec<item::Model>> {
        Ok(ItemRepository::list(&self.db, job_id, &filter).await?)
    }

    pub async fn get_checkpoints(&self, item_id: i32) -> Result<Vec<checkpoint::Model>> {
        if ItemRepository::find(&self.db, item_id).await?.is_none() {
            return Err(OrchestratorError::ItemNotFound(item_id));
        }
        self.checkpoints.for_item(item_id).await
    }

    pub async fn delete_job(&self, job_id: i32) -> Result<()> {
        if JobRepository::delete_cascade(&self.db, job_id).await? == 0 {
            return Err(OrchestratorError::JobNotFound(job_id));
        }
        info!("job [{}] 及其 item/checkpoint 已删除", job_id);
        Ok(())
    }

    /// 启动时的恢复：过期租约按 watchdog 同样的规则回收，
    /// 再按 item 实际状态校正 job 计数，收尾已经全部结束的 job
    pub async fn recover(&self) -> Result<usize> {
        info!("正在执行启动恢复程序...");
        let reclaimed = self.watchdog.sweep().await?;
        if reclaimed.is_empty() {
            info!("未发现需要恢复的 item");
        } else {
            info!("✓ 成功回收 {} 个中断的 item", reclaimed.len());
        }

        let now = self.clock.now_ms();
        let txn = self.db.begin().await?;
        let stranded = ItemRepository::skip_stranded(&txn, now).await?;
        JobRepository::reconcile_counters(&txn).await?;
        let completed = JobRepository::complete_finished(&txn, now).await?;
        txn.commit().await?;
        if stranded > 0 {
            warn!("⚠ 已取消 job 中残留 {} 个 pending item，记为 skipped", stranded);
        }
        if completed > 0 {
            info!("✓ {} 个 job 的 item 已全部结束，补记完成", completed);
        }
        Ok(reclaimed.len())
    }

    /// 有凭证恢复额度后，把因额度暂停的 job 拉回 running
    pub async fn resume_quota_paused(&self) -> Result<usize> {
        let paused = JobRepository::paused_jobs(&self.db, PAUSE_QUOTA).await?;
        if paused.is_empty() || !self.rotator.has_capacity().await? {
            return Ok(0);
        }
        let now = self.clock.now_ms();
        let mut resumed = 0;
        for job in paused {
            if JobRepository::resume(&self.db, job.id, Some(PAUSE_QUOTA), now).await? > 0 {
                info!("✓ 额度已恢复，job [{}] 继续执行", job.id);
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    /// 额度耗尽：job 暂停，等待新的一天
    pub(crate) async fn pause_for_quota(&self, job_id: i32) -> Result<()> {
        let now = self.clock.now_ms();
        let n = JobRepository::transition(
            self.db.as_ref(),
            job_id,
            &[JobStatus::Pending, JobStatus::Running],
            JobStatus::Paused,
            Some(PAUSE_QUOTA),
            now,
        )
        .await?;
        if n > 0 {
            warn!("⚠ 所有凭证今日额度已用完，job [{}] 暂停", job_id);
        }
        Ok(())
    }

    /// 原子领取下一个 item：job 优先级/FIFO，再 item 优先级/FIFO
    pub async fn claim_next(
        &self,
        worker_id: &str,
    ) -> Result<Option<(job::Model, item::Model, Lease)>> {
        for job in JobRepository::runnable_jobs(&self.db).await? {
            let candidates = ItemRepository::pending_candidates(&self.db, job.id, CLAIM_SCAN).await?;
            for cand in candidates {
                match self.leases.acquire(cand.id, worker_id).await {
                    Ok(lease) => {
                        let now = self.clock.now_ms();
                        JobRepository::transition(
                            self.db.as_ref(),
                            job.id,
                            &[JobStatus::Pending],
                            JobStatus::Running,
                            None,
                            now,
                        )
                        .await?;
                        let item = ItemRepository::find(&self.db, cand.id)
                            .await?
                            .unwrap_or(cand);
                        return Ok(Some((job, item, lease)));
                    }
                    // 被别的 worker 抢走，看下一个
                    Err(OrchestratorError::LeaseConflict(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(None)
    }

    /// 启动 worker 池 + watchdog + 额度监控
    pub fn start(self: &Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(self.config.worker_count + 2);

        for idx in 0..self.config.worker_count {
            let worker_id = format!("{}-p{}-w{}", self.instance, std::process::id(), idx + 1);
            let worker = ItemWorker::new(worker_id, self.clone(), shutdown_rx.clone());
            tasks.push(tokio::spawn(worker.run_loop()));
        }

        tasks.push(tokio::spawn(self.watchdog.clone().run(shutdown_rx.clone())));

        let svc = self.clone();
        let mut rx = shutdown_rx;
        tasks.push(tokio::spawn(async move {
            loop {
                if *rx.borrow() {
                    break;
                }
                if let Err(e) = svc.resume_quota_paused().await {
                    error!("额度检查失败: {}", e);
                }
                tokio::select! {
                    _ = sleep(svc.config.quota_check_interval) => {}
                    res = rx.changed() => {
                        if res.is_err() {
                            break;
                        }
                    }
                }
            }
        }));

        info!("调度器已启动: {} 个 worker", self.config.worker_count);
        SchedulerHandle { shutdown_tx, tasks }
    }

    /// 轮询直到 job 进入终态或超时，返回最后一次读到的 job
    pub async fn wait_for_job(&self, job_id: i32, timeout: Duration) -> Result<job::Model> {
        self.wait_until(job_id, timeout, |s| s.is_terminal()).await
    }

    pub async fn wait_for_status(
        &self,
        job_id: i32,
        status: JobStatus,
        timeout: Duration,
    ) -> Result<job::Model> {
        self.wait_until(job_id, timeout, |s| s == status).await
    }

    async fn wait_until<F>(&self, job_id: i32, timeout: Duration, done: F) -> Result<job::Model>
    where
        F: Fn(JobStatus) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let job = self.get_job_status(job_id).await?;
            let reached = JobStatus::parse(&job.status).map(&done).unwrap_or(false);
            if reached || Instant::now() >= deadline {
                return Ok(job);
            }
            sleep(Duration::from_millis(25)).await;
        }
    }
}

pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// 通知所有 worker 在 step 之间停下，并等待退出
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for res in futures::future::join_all(self.tasks).await {
            if let Err(e) = res {
                error!("调度任务异常退出: {}", e);
            }
        }
        info!("调度器已停止");
    }
}

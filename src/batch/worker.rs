use crate::batch::model::{ItemStatus, JobConfig, JobStatus, StepError};
use crate::batch::service::BatchService;
use crate::error::{truncate_error, OrchestratorError, Result};
use crate::executor::{AnalysisExecutor, StepOutput};
use crate::lease::Lease;
use crate::storage::entity::{item, job};
use crate::storage::repository::{ItemRepository, JobRepository};
use log::{error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

/// 单个 item 一次处理的结局
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed,
    Failed(String),
    Skipped,
    /// 额度耗尽，job 已暂停，item 回到 pending
    QuotaPaused,
    /// job 暂停或进程退出，item 原样交还
    Released,
    /// 租约已被 watchdog 收回，什么也不做
    LeaseLost,
}

enum StepFailure {
    Exhausted,
    Failed(StepError),
}

/// 指数退避：base * 2^(retry-1)，加 0~20% 抖动，整体不超过 cap
pub fn backoff_delay(retry: u32, base: Duration, cap: Duration) -> Duration {
    let exp = base.saturating_mul(1u32 << retry.saturating_sub(1).min(16));
    let delay = exp.min(cap);
    let jitter = delay.mul_f64(rand::random::<f64>() * 0.2);
    (delay + jitter).min(cap)
}

/// 执行期间后台定时续租，drop 时停止
struct Heartbeat(JoinHandle<()>);

impl Heartbeat {
    fn start(svc: Arc<BatchService>, lease: &Lease) -> Self {
        let item_id = lease.item_id;
        let owner = lease.owner.clone();
        let period = (svc.leases.ttl() / 3).max(Duration::from_millis(10));
        Heartbeat(tokio::spawn(async move {
            loop {
                sleep(period).await;
                let now = svc.clock.now_ms();
                let expires_at = now + svc.leases.ttl().as_millis() as i64;
                match ItemRepository::renew(&svc.db, item_id, &owner, now, expires_at).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => warn!("心跳续租失败 item [{}]: {}", item_id, e),
                }
            }
        }))
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct ItemWorker {
    id: String,
    svc: Arc<BatchService>,
    shutdown: watch::Receiver<bool>,
}

impl ItemWorker {
    pub fn new(id: String, svc: Arc<BatchService>, shutdown: watch::Receiver<bool>) -> Self {
        Self { id, svc, shutdown }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// 常驻循环：领取 -> 执行 -> 再领取；没活就短睡眠
    pub async fn run_loop(mut self) {
        info!("worker {} 启动", self.id);
        let poll = self.svc.config.poll_interval;
        loop {
            if self.stopping() {
                break;
            }

            let claimed = match self.svc.claim_next(&self.id).await {
                Ok(c) => c,
                Err(e) => {
                    warn!("⚠ [{}] claim_next 失败: {}", self.id, e);
                    sleep(poll).await;
                    continue;
                }
            };

            let Some((job, item, lease)) = claimed else {
                tokio::select! {
                    _ = sleep(poll) => {}
                    res = self.shutdown.changed() => {
                        if res.is_err() {
                            break;
                        }
                    }
                }
                continue;
            };

            let item_id = item.id;
            let release_on_error = lease.clone();
            match self.process(&job, &item, lease).await {
                Ok(outcome) => {
                    info!("[{}] item [{}] {} -> {:?}", self.id, item_id, item.ticker, outcome);
                }
                Err(e) => {
                    error!("✗ [{}] 处理 item [{}] 出错: {}", self.id, item_id, e);
                    if let Err(e) = self.svc.leases.release(&release_on_error).await {
                        error!("交还租约失败 item [{}]: {}", item_id, e);
                    }
                    sleep(poll).await;
                }
            }
        }
        info!("worker {} 已停止", self.id);
    }

    /// 依次执行 item 剩余的 step（年份升序），已有 checkpoint 的 step 直接跳过
    pub async fn process(
        &self,
        job: &job::Model,
        item: &item::Model,
        mut lease: Lease,
    ) -> Result<ItemOutcome> {
        let cfg: JobConfig = match serde_json::from_str(&job.config_json) {
            Ok(c) => c,
            Err(e) => {
                return self
                    .abort_for_config(job.id, lease, format!("bad job config: {}", e))
                    .await;
            }
        };
        let executor = match self.svc.registry.resolve(&cfg.operation_type) {
            Ok(x) => x,
            Err(e) => return self.abort_for_config(job.id, lease, e.to_string()).await,
        };

        let _heartbeat = Heartbeat::start(self.svc.clone(), &lease);

        let steps = cfg.steps();
        let mut done: HashSet<String> = self.svc.checkpoints.completed_steps(item.id).await?;
        done.extend(item.completed_step_list());
        let mut completed: Vec<String> = steps.iter().filter(|s| done.contains(*s)).cloned().collect();

        info!(
            "🚀 [{}] 开始 item [{}] {} (job {}, {}/{} 年份已完成)",
            self.id,
            item.id,
            item.ticker,
            job.id,
            completed.len(),
            steps.len()
        );
        if completed.len() as i32 != item.completed_steps {
            // checkpoint 已写但进度没来得及写（上次崩溃），先补齐
            if let Err(e) = self.svc.leases.record_progress(&mut lease, &completed).await {
                return self.lease_error(e);
            }
        }

        for step in steps.iter().filter(|s| !done.contains(*s)) {
            // step 之间检查取消/暂停/退出，不打断正在进行的外部调用
            let current = match self.svc.get_job_status(job.id).await {
                Ok(j) => JobStatus::parse(&j.status),
                Err(OrchestratorError::JobNotFound(_)) => Some(JobStatus::Failed),
                Err(e) => return Err(e),
            };
            match current {
                Some(JobStatus::Failed) | None => {
                    return self.finish(lease, ItemStatus::Skipped, None).await;
                }
                Some(JobStatus::Paused) => return self.release(&lease, ItemOutcome::Released).await,
                _ => {}
            }
            if self.stopping() {
                return self.release(&lease, ItemOutcome::Released).await;
            }

            if let Err(e) = self.svc.leases.mark_running(&mut lease, step).await {
                return self.lease_error(e);
            }

            let step_result = match self
                .run_step(executor.as_ref(), &cfg, &item.ticker, step, &mut lease)
                .await
            {
                Ok(r) => r,
                Err(e) => return self.lease_error(e),
            };
            match step_result {
                Ok(out) => {
                    self.svc
                        .checkpoints
                        .record(item.id, job.id, step, &out.artifact_id)
                        .await?;
                    completed.push(step.clone());
                    if let Err(e) = self.svc.leases.record_progress(&mut lease, &completed).await {
                        return self.lease_error(e);
                    }
                    JobRepository::touch(&self.svc.db, job.id, self.svc.clock.now_ms()).await?;
                    info!(
                        "✓ [{}] {} {} 完成 ({}/{})",
                        self.id,
                        item.ticker,
                        step,
                        completed.len(),
                        steps.len()
                    );
                }
                Err(StepFailure::Exhausted) => {
                    self.svc.pause_for_quota(job.id).await?;
                    return self.release(&lease, ItemOutcome::QuotaPaused).await;
                }
                Err(StepFailure::Failed(err)) => {
                    let msg = truncate_error(
                        &format!("year {}: {}", step, err.message),
                        self.svc.config.max_error_len,
                    );
                    warn!("✗ [{}] {} 失败: {}", self.id, item.ticker, msg);
                    return self.finish(lease, ItemStatus::Failed, Some(msg)).await;
                }
            }
        }

        self.finish(lease, ItemStatus::Completed, None).await
    }

    /// 单个 step：每次尝试都重新占用凭证，经闸门调用执行器；临时错误退避重试
    async fn run_step(
        &self,
        executor: &dyn AnalysisExecutor,
        cfg: &JobConfig,
        ticker: &str,
        step: &str,
        lease: &mut Lease,
    ) -> Result<std::result::Result<StepOutput, StepFailure>> {
        let mut retries = 0u32;
        loop {
            let credential = match self.svc.rotator.reserve().await {
                Ok(c) => c,
                Err(OrchestratorError::QuotaExhausted) => return Ok(Err(StepFailure::Exhausted)),
                Err(e) => return Err(e),
            };

            let step_timeout = self.svc.config.step_timeout;
            let cred = &credential;
            let res = self
                .svc
                .gate
                .with_call(move || async move {
                    // 执行器卡住时心跳会一直续租，这里给单次调用兜个上限
                    match timeout(step_timeout, executor.execute(ticker, step, cred)).await {
                        Ok(r) => r,
                        Err(_) => Err(StepError::transient(format!(
                            "step timed out after {:?}",
                            step_timeout
                        ))),
                    }
                })
                .await?;

            match res {
                Ok(out) => return Ok(Ok(out)),
                Err(err) if err.retryable && retries < cfg.max_step_retries => {
                    retries += 1;
                    let delay = backoff_delay(
                        retries,
                        self.svc.config.backoff_base,
                        self.svc.config.backoff_cap,
                    );
                    warn!(
                        "⚠ [{}] {} {} 重试 [{}/{}] {:?} 后: {}",
                        self.id, ticker, step, retries, cfg.max_step_retries, delay, err.message
                    );
                    self.svc.leases.renew(lease).await?;
                    sleep(delay).await;
                }
                Err(err) if err.retryable => {
                    return Ok(Err(StepFailure::Failed(StepError::transient(format!(
                        "retries exhausted after {} attempts: {}",
                        retries + 1,
                        err.message
                    )))));
                }
                Err(err) => return Ok(Err(StepFailure::Failed(err))),
            }
        }
    }

    async fn finish(
        &self,
        lease: Lease,
        status: ItemStatus,
        error: Option<String>,
    ) -> Result<ItemOutcome> {
        let outcome = match status {
            ItemStatus::Completed => ItemOutcome::Completed,
            ItemStatus::Skipped => ItemOutcome::Skipped,
            _ => ItemOutcome::Failed(error.clone().unwrap_or_default()),
        };
        match self.svc.leases.finish(lease, status, error).await {
            Ok(_) => Ok(outcome),
            Err(e) => self.lease_error(e),
        }
    }

    /// 交还租约；job 这时已被取消的话 item 直接记为 skipped
    async fn release(&self, lease: &Lease, outcome: ItemOutcome) -> Result<ItemOutcome> {
        match self.svc.leases.release(lease).await? {
            Some(ItemStatus::Skipped) => Ok(ItemOutcome::Skipped),
            Some(_) => Ok(outcome),
            None => Ok(ItemOutcome::LeaseLost),
        }
    }

    /// 配置类错误是 job 级失败：终止 job，本 item 记为 skipped
    async fn abort_for_config(&self, job_id: i32, lease: Lease, reason: String) -> Result<ItemOutcome> {
        error!("✗ job [{}] 配置错误: {}", job_id, reason);
        let reason = truncate_error(&reason, self.svc.config.max_error_len);
        match self.svc.abort_job(job_id, &reason).await {
            Ok(()) | Err(OrchestratorError::InvalidTransition { .. }) => {}
            Err(e) => return Err(e),
        }
        self.finish(lease, ItemStatus::Skipped, None).await
    }

    fn lease_error(&self, e: OrchestratorError) -> Result<ItemOutcome> {
        match e {
            OrchestratorError::LeaseLost { item_id, .. } => {
                warn!("⚠ [{}] item [{}] 租约已被收回，放弃", self.id, item_id);
                Ok(ItemOutcome::LeaseLost)
            }
            other => Err(other),
        }
    }
}

#![allow(dead_code)]

use async_trait::async_trait;
use sea_orm::DatabaseConnection;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tickerbatch::batch::StepError;
use tickerbatch::executor::{AnalysisExecutor, ExecutorRegistry, StepOutput};
use tickerbatch::rotator::Credential;
use tickerbatch::storage::establish_connection;
use tickerbatch::{BatchService, ManualClock, OrchestratorConfig};

pub const OP: &str = "extract";
/// 2024-06-03T12:00:00Z
pub const T0: i64 = 1_717_416_000_000;

pub struct TestEnv {
    pub dir: TempDir,
    pub db: Arc<DatabaseConnection>,
    pub clock: Arc<ManualClock>,
}

impl TestEnv {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("batch.db").display());
        let db = establish_connection(&url).await.expect("connect");
        Self {
            dir,
            db: Arc::new(db),
            clock: Arc::new(ManualClock::new(T0)),
        }
    }

    pub fn config(&self, credentials: &[&str], daily_limit: i64) -> OrchestratorConfig {
        let mut cfg = OrchestratorConfig::new(
            self.dir.path().join("gate.lock"),
            credentials.iter().map(|s| s.to_string()).collect(),
        );
        cfg.call_cooldown = Duration::ZERO;
        cfg.lease_ttl = Duration::from_secs(60);
        cfg.watchdog_interval = Duration::from_millis(50);
        cfg.quota_check_interval = Duration::from_millis(20);
        cfg.poll_interval = Duration::from_millis(10);
        cfg.worker_count = 1;
        cfg.daily_limit = daily_limit;
        cfg.max_error_len = 120;
        cfg.backoff_base = Duration::from_millis(5);
        cfg.backoff_cap = Duration::from_millis(20);
        cfg.step_timeout = Duration::from_millis(200);
        cfg
    }

    pub fn service(&self, cfg: OrchestratorConfig, executor: Arc<dyn AnalysisExecutor>) -> Arc<BatchService> {
        let registry = ExecutorRegistry::new().with(OP, executor);
        Arc::new(
            BatchService::new(self.db.clone(), cfg, registry, self.clock.clone()).expect("service"),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub key: String,
    pub step: String,
    pub credential: String,
}

/// 按脚本返回结果的执行器：某个 (ticker, year) 可预置若干错误，用完后成功
#[derive(Default)]
pub struct ScriptedExecutor {
    pub calls: Mutex<Vec<Call>>,
    script: Mutex<HashMap<(String, String), VecDeque<StepError>>>,
    hangs: Mutex<HashSet<(String, String)>>,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(self: &Arc<Self>, key: &str, step: &str, err: StepError) -> Arc<Self> {
        self.script
            .lock()
            .unwrap()
            .entry((key.to_string(), step.to_string()))
            .or_default()
            .push_back(err);
        self.clone()
    }

    /// 该 (ticker, year) 的下一次调用永远不返回
    pub fn hang(self: &Arc<Self>, key: &str, step: &str) -> Arc<Self> {
        self.hangs
            .lock()
            .unwrap()
            .insert((key.to_string(), step.to_string()));
        self.clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_for(&self, key: &str, step: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.key == key && c.step == step)
            .count()
    }
}

#[async_trait]
impl AnalysisExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        item_key: &str,
        step: &str,
        credential: &Credential,
    ) -> Result<StepOutput, StepError> {
        self.calls.lock().unwrap().push(Call {
            key: item_key.to_string(),
            step: step.to_string(),
            credential: credential.id.clone(),
        });
        let hang = self
            .hangs
            .lock()
            .unwrap()
            .remove(&(item_key.to_string(), step.to_string()));
        if hang {
            std::future::pending::<()>().await;
        }
        let scripted = self
            .script
            .lock()
            .unwrap()
            .get_mut(&(item_key.to_string(), step.to_string()))
            .and_then(|q| q.pop_front());
        match scripted {
            Some(err) => Err(err),
            None => Ok(StepOutput::new(format!("{}-{}", item_key, step))),
        }
    }
}

pub fn tickers(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

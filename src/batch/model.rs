use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "paused" => Some(JobStatus::Paused),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemStatus {
    Pending,
    Leased,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Leased => "leased",
            ItemStatus::Running => "running",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
            ItemStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ItemStatus::Pending),
            "leased" => Some(ItemStatus::Leased),
            "running" => Some(ItemStatus::Running),
            "completed" => Some(ItemStatus::Completed),
            "failed" => Some(ItemStatus::Failed),
            "skipped" => Some(ItemStatus::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Completed | ItemStatus::Failed | ItemStatus::Skipped
        )
    }
}

/// 暂停原因：额度耗尽的暂停会被自动恢复，人工暂停只能手动恢复
pub const PAUSE_QUOTA: &str = "quota";
pub const PAUSE_USER: &str = "user";

/// 每个 job 的执行参数，序列化后存进 jobs.config_json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub operation_type: String,
    pub years: Vec<i32>,
    /// 单个 step 遇到临时错误时最多重试几次
    pub max_step_retries: u32,
    /// item 被 watchdog 回收的次数上限，超过即判定失败
    pub max_attempts: i32,
}

impl JobConfig {
    pub fn new(operation_type: impl Into<String>, years: Vec<i32>) -> Self {
        Self {
            operation_type: operation_type.into(),
            years,
            max_step_retries: 3,
            max_attempts: 3,
        }
    }

    /// step 标识：去重后的年份，升序
    pub fn steps(&self) -> Vec<String> {
        let mut years = self.years.clone();
        years.sort_unstable();
        years.dedup();
        years.into_iter().map(|y| y.to_string()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct JobSubmission {
    pub name: String,
    pub tickers: Vec<String>,
    pub config: JobConfig,
    pub priority: i32,
    /// 单个 ticker 的优先级，未列出的为 0
    pub item_priorities: HashMap<String, i32>,
}

impl JobSubmission {
    pub fn new(name: impl Into<String>, tickers: Vec<String>, config: JobConfig) -> Self {
        Self {
            name: name.into(),
            tickers,
            config,
            priority: 0,
            item_priorities: HashMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_item_priority(mut self, ticker: impl Into<String>, priority: i32) -> Self {
        self.item_priorities.insert(ticker.into(), priority);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepErrorType {
    Transient, // 服务不可用/限流/网络（可重试）
    Permanent, // 输入非法/找不到文档（不可重试）
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepError {
    pub error_type: StepErrorType,
    pub message: String,
    pub retryable: bool,
}

impl StepError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self {
            error_type: StepErrorType::Transient,
            message: msg.into(),
            retryable: true,
        }
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self {
            error_type: StepErrorType::Permanent,
            message: msg.into(),
            retryable: false,
        }
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.error_type, self.message)
    }
}

impl std::error::Error for StepError {}

#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    pub status: Option<ItemStatus>,
    pub ticker: Option<String>,
    pub limit: Option<u64>,
}

impl ItemFilter {
    pub fn status(status: ItemStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobStats {
    pub total: usize,
    pub pending: usize,
    pub leased: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub steps_done: i64,
    pub steps_total: i64,
}

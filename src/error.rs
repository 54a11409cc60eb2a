use crate::config::ConfigError;

#[derive(thiserror::Error, Debug)]
pub enum OrchestratorError {
    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("all credentials exhausted for today")]
    QuotaExhausted,
    #[error("item {0} is already leased")]
    LeaseConflict(i32),
    #[error("lease on item {item_id} no longer held by {owner}")]
    LeaseLost { item_id: i32, owner: String },
    #[error("job {0} not found")]
    JobNotFound(i32),
    #[error("item {0} not found")]
    ItemNotFound(i32),
    #[error("job {job_id}: cannot {action} while {status}")]
    InvalidTransition {
        job_id: i32,
        action: &'static str,
        status: String,
    },
    #[error("no executor registered for operation '{0}'")]
    UnknownOperation(String),
    #[error("invalid ticker: {0}")]
    InvalidTicker(String),
    #[error("invalid job config: {0}")]
    InvalidJob(String),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

/// 截断错误信息到 max_chars 个字符（按字符边界）
pub fn truncate_error(msg: &str, max_chars: usize) -> String {
    if msg.chars().count() <= max_chars {
        return msg.to_string();
    }
    msg.chars().take(max_chars).collect()
}

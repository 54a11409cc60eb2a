use std::path::PathBuf;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("missing env {0}")]
    MissingEnv(&'static str),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// 调度引擎的进程级配置（数据库、调用闸门、租约、额度、重试）
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub database_url: String,
    /// 全局调用闸门的锁文件路径，没有默认值，必须显式给出
    pub gate_lock_path: PathBuf,
    pub call_cooldown: Duration,
    pub lease_ttl: Duration,
    pub watchdog_interval: Duration,
    pub quota_check_interval: Duration,
    pub poll_interval: Duration,
    pub worker_count: usize,
    pub credentials: Vec<String>,
    pub daily_limit: i64,
    pub max_error_len: usize,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// 单次执行器调用的上限，超时按临时错误重试
    pub step_timeout: Duration,
}

impl OrchestratorConfig {
    /// 除了锁文件路径和凭证以外全部给默认值
    pub fn new(gate_lock_path: impl Into<PathBuf>, credentials: Vec<String>) -> Self {
        Self {
            database_url: "sqlite://tickerbatch.db?mode=rwc".to_string(),
            gate_lock_path: gate_lock_path.into(),
            call_cooldown: Duration::from_millis(1_000),
            lease_ttl: Duration::from_secs(300),
            watchdog_interval: Duration::from_secs(30),
            quota_check_interval: Duration::from_secs(60),
            poll_interval: Duration::from_millis(300),
            worker_count: 4,
            credentials,
            daily_limit: 250,
            max_error_len: 500,
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(120),
            step_timeout: Duration::from_secs(120),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let gate_lock_path = std::env::var("CALL_GATE_LOCK_PATH")
            .map_err(|_| ConfigError::MissingEnv("CALL_GATE_LOCK_PATH"))?;
        let credentials = parse_keys(
            &std::env::var("API_KEYS").map_err(|_| ConfigError::MissingEnv("API_KEYS"))?,
        );

        let mut cfg = Self::new(gate_lock_path, credentials);
        if let Ok(url) = std::env::var("DATABASE_URL") {
            cfg.database_url = url;
        }
        if let Some(ms) = env_num::<u64>("CALL_COOLDOWN_MS")? {
            cfg.call_cooldown = Duration::from_millis(ms);
        }
        if let Some(s) = env_num::<u64>("LEASE_TTL_SECS")? {
            cfg.lease_ttl = Duration::from_secs(s);
        }
        if let Some(s) = env_num::<u64>("WATCHDOG_INTERVAL_SECS")? {
            cfg.watchdog_interval = Duration::from_secs(s);
        }
        if let Some(s) = env_num::<u64>("QUOTA_CHECK_INTERVAL_SECS")? {
            cfg.quota_check_interval = Duration::from_secs(s);
        }
        if let Some(ms) = env_num::<u64>("POLL_INTERVAL_MS")? {
            cfg.poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = env_num::<usize>("WORKER_COUNT")? {
            cfg.worker_count = n;
        }
        if let Some(n) = env_num::<i64>("DAILY_LIMIT")? {
            cfg.daily_limit = n;
        }
        if let Some(n) = env_num::<usize>("MAX_ERROR_LEN")? {
            cfg.max_error_len = n;
        }
        if let Some(ms) = env_num::<u64>("BACKOFF_BASE_MS")? {
            cfg.backoff_base = Duration::from_millis(ms);
        }
        if let Some(ms) = env_num::<u64>("BACKOFF_CAP_MS")? {
            cfg.backoff_cap = Duration::from_millis(ms);
        }
        if let Some(s) = env_num::<u64>("STEP_TIMEOUT_SECS")? {
            cfg.step_timeout = Duration::from_secs(s);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker_count must be > 0".into()));
        }
        if self.credentials.is_empty() {
            return Err(ConfigError::Invalid("no credentials configured".into()));
        }
        if self.daily_limit <= 0 {
            return Err(ConfigError::Invalid("daily_limit must be > 0".into()));
        }
        if self.gate_lock_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("gate lock path is empty".into()));
        }
        // 退避时心跳照常续租，单次退避仍不能跨过一个租约 TTL
        if self.backoff_cap >= self.lease_ttl {
            return Err(ConfigError::Invalid(format!(
                "backoff cap {:?} must be shorter than lease ttl {:?}",
                self.backoff_cap, self.lease_ttl
            )));
        }
        if self.step_timeout.is_zero() || self.step_timeout >= self.lease_ttl {
            return Err(ConfigError::Invalid(format!(
                "step timeout {:?} must be non-zero and shorter than lease ttl {:?}",
                self.step_timeout, self.lease_ttl
            )));
        }
        Ok(())
    }
}

/// 逗号/分号/空白分隔的 key 列表
pub fn parse_keys(raw: &str) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for k in raw
        .split(|c| c == ',' || c == ';' || c == '\n' || c == '\t' || c == ' ')
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
    {
        if !keys.iter().any(|e| e == k) {
            keys.push(k.to_string());
        }
    }
    keys
}

fn env_num<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_keys_splits_and_dedups() {
        let keys = parse_keys("k1, k2;k3\nk1\t k4 ");
        assert_eq!(keys, vec!["k1", "k2", "k3", "k4"]);
    }

    #[test]
    fn validate_rejects_backoff_cap_beyond_ttl() {
        let mut cfg = OrchestratorConfig::new("/tmp/gate.lock", vec!["k".into()]);
        cfg.lease_ttl = Duration::from_secs(10);
        cfg.backoff_cap = Duration::from_secs(10);
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn validate_rejects_step_timeout_beyond_ttl() {
        let mut cfg = OrchestratorConfig::new("/tmp/gate.lock", vec!["k".into()]);
        cfg.lease_ttl = Duration::from_secs(60);
        cfg.step_timeout = Duration::from_secs(60);
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(msg)) if msg.contains("step timeout")));

        cfg.step_timeout = Duration::ZERO;
        assert!(cfg.validate().is_err());

        cfg.step_timeout = Duration::from_secs(30);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_credentials_and_zero_workers() {
        let cfg = OrchestratorConfig::new("/tmp/gate.lock", vec![]);
        assert!(cfg.validate().is_err());

        let mut cfg = OrchestratorConfig::new("/tmp/gate.lock", vec!["k".into()]);
        cfg.worker_count = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = OrchestratorConfig::new("/tmp/gate.lock", vec!["k".into()]);
        assert!(cfg.validate().is_ok());
    }
}

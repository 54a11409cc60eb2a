use crate::clock::Clock;
use crate::error::{OrchestratorError, Result};
use crate::storage::repository::CredentialRepository;
use log::{debug, warn};
use sea_orm::DatabaseConnection;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

const MAX_CAS_ROUNDS: usize = 64;

/// 一个 API 凭证。id 是脱敏后的稳定标识，secret 只在调用外部服务时使用
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub id: String,
    secret: String,
}

impl Credential {
    pub fn new(id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// 由原始 key 列表生成凭证，id 取 key 的首尾片段
    pub fn from_keys(keys: &[String]) -> Vec<Credential> {
        let mut out: Vec<Credential> = Vec::with_capacity(keys.len());
        for (idx, key) in keys.iter().enumerate() {
            let chars: Vec<char> = key.chars().collect();
            let mut id = if chars.len() > 12 {
                let head: String = chars[..4].iter().collect();
                let tail: String = chars[chars.len() - 4..].iter().collect();
                format!("{}…{}", head, tail)
            } else {
                format!("cred{}", idx + 1)
            };
            if out.iter().any(|c| c.id == id) {
                id = format!("{}#{}", id, idx + 1);
            }
            out.push(Credential::new(id, key.clone()));
        }
        out
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<Credential {}>", self.id)
    }
}

/// 当天某个凭证的用量视图
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageView {
    pub credential_id: String,
    pub count: i64,
    pub last_used_at: Option<i64>,
}

/// 在未达上限的凭证里选用量最少的；平局取 last_used 最早（从未用过最优先），再按 id
pub fn pick_least_used(usage: &[UsageView], daily_limit: i64) -> Option<usize> {
    usage
        .iter()
        .enumerate()
        .filter(|(_, u)| u.count < daily_limit)
        .min_by(|(_, a), (_, b)| {
            a.count
                .cmp(&b.count)
                .then(a.last_used_at.cmp(&b.last_used_at))
                .then(a.credential_id.cmp(&b.credential_id))
        })
        .map(|(idx, _)| idx)
}

pub struct CredentialRotator {
    db: Arc<DatabaseConnection>,
    clock: Arc<dyn Clock>,
    credentials: Vec<Credential>,
    daily_limit: i64,
    // 进程内先串行，跨进程靠计数 CAS
    local: Mutex<()>,
}

impl CredentialRotator {
    pub fn new(
        db: Arc<DatabaseConnection>,
        clock: Arc<dyn Clock>,
        credentials: Vec<Credential>,
        daily_limit: i64,
    ) -> Self {
        Self {
            db,
            clock,
            credentials,
            daily_limit,
            local: Mutex::new(()),
        }
    }

    pub fn daily_limit(&self) -> i64 {
        self.daily_limit
    }

    /// 原子地选出并占用一个凭证，全部耗尽时返回 QuotaExhausted
    pub async fn reserve(&self) -> Result<Credential> {
        let _guard = self.local.lock().await;

        for round in 0..MAX_CAS_ROUNDS {
            let day = self.clock.day_key();
            let usage = self.usage_for(&day).await?;

            let Some(idx) = pick_least_used(&usage, self.daily_limit) else {
                return Err(OrchestratorError::QuotaExhausted);
            };
            let pick = &usage[idx];
            let now = self.clock.now_ms();
            let won = CredentialRepository::try_increment(
                &self.db,
                &pick.credential_id,
                &day,
                pick.count,
                self.daily_limit,
                now,
            )
            .await?;

            if won {
                debug!(
                    "凭证 {} 已占用 ({}/{}) [{}]",
                    pick.credential_id,
                    pick.count + 1,
                    self.daily_limit,
                    day
                );
                // usage 与 credentials 同序
                return Ok(self.credentials[idx].clone());
            }

            // 其他进程抢先改了计数，重新读一遍
            if round > 0 && round % 8 == 0 {
                warn!("凭证占用冲突，已重试 {} 次", round);
            }
            sleep(Duration::from_millis(5 + (rand::random::<u8>() % 10) as u64)).await;
        }

        Err(OrchestratorError::Db(sea_orm::DbErr::Custom(
            "credential reservation kept losing the race".to_string(),
        )))
    }

    /// 是否还有任意凭证今天可用（用于自动恢复额度暂停的 job）
    pub async fn has_capacity(&self) -> Result<bool> {
        let day = self.clock.day_key();
        let usage = self.usage_for(&day).await?;
        Ok(pick_least_used(&usage, self.daily_limit).is_some())
    }

    /// 当天用量快照，顺序与配置一致
    pub async fn usage_today(&self) -> Result<Vec<UsageView>> {
        let day = self.clock.day_key();
        self.usage_for(&day).await
    }

    async fn usage_for(&self, day: &str) -> Result<Vec<UsageView>> {
        let ids: Vec<String> = self.credentials.iter().map(|c| c.id.clone()).collect();
        CredentialRepository::ensure_day_rows(&self.db, &ids, day).await?;
        let rows: HashMap<String, _> = CredentialRepository::usage_for_day(&self.db, day)
            .await?
            .into_iter()
            .map(|r| (r.credential_id.clone(), r))
            .collect();

        Ok(self
            .credentials
            .iter()
            .map(|c| match rows.get(&c.id) {
                Some(r) => UsageView {
                    credential_id: c.id.clone(),
                    count: r.request_count,
                    last_used_at: r.last_used_at,
                },
                None => UsageView {
                    credential_id: c.id.clone(),
                    count: 0,
                    last_used_at: None,
                },
            })
            .collect())
    }
}

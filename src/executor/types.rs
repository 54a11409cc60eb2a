use crate::batch::model::StepError;
use crate::rotator::Credential;
use async_trait::async_trait;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepOutput {
    pub artifact_id: String,
}

impl StepOutput {
    pub fn new(artifact_id: impl Into<String>) -> Self {
        Self {
            artifact_id: artifact_id.into(),
        }
    }
}

/// 外部分析执行器：处理一个 ticker 的一个 step（年份）
///
/// 必须可以安全重试：同一 step 在临时错误后可能被再次调用。
#[async_trait]
pub trait AnalysisExecutor: Send + Sync {
    async fn execute(
        &self,
        item_key: &str,
        step: &str,
        credential: &Credential,
    ) -> Result<StepOutput, StepError>;
}

use crate::error::{OrchestratorError, Result};
use crate::executor::types::AnalysisExecutor;
use std::collections::HashMap;
use std::sync::Arc;

/// operation_type -> executor，由宿主程序启动时注册
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn AnalysisExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        operation_type: impl Into<String>,
        executor: Arc<dyn AnalysisExecutor>,
    ) -> &mut Self {
        self.executors.insert(operation_type.into(), executor);
        self
    }

    pub fn with(mut self, operation_type: impl Into<String>, executor: Arc<dyn AnalysisExecutor>) -> Self {
        self.register(operation_type, executor);
        self
    }

    pub fn resolve(&self, operation_type: &str) -> Result<Arc<dyn AnalysisExecutor>> {
        self.executors
            .get(operation_type)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownOperation(operation_type.to_string()))
    }

    pub fn contains(&self, operation_type: &str) -> bool {
        self.executors.contains_key(operation_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::model::StepError;
    use crate::executor::types::StepOutput;
    use crate::rotator::Credential;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl AnalysisExecutor for Echo {
        async fn execute(
            &self,
            item_key: &str,
            step: &str,
            _credential: &Credential,
        ) -> std::result::Result<StepOutput, StepError> {
            Ok(StepOutput::new(format!("{}:{}", item_key, step)))
        }
    }

    #[tokio::test]
    async fn resolves_registered_operation() {
        let registry = ExecutorRegistry::new().with("extract", Arc::new(Echo));
        assert!(registry.contains("extract"));

        let exec = registry.resolve("extract").unwrap();
        let out = exec
            .execute("AAPL", "2023", &Credential::new("cred1", "k"))
            .await
            .unwrap();
        assert_eq!(out.artifact_id, "AAPL:2023");
    }

    #[test]
    fn unknown_operation_is_an_error() {
        let registry = ExecutorRegistry::new();
        assert!(matches!(
            registry.resolve("nope"),
            Err(OrchestratorError::UnknownOperation(op)) if op == "nope"
        ));
    }
}

use crate::clock::Clock;
use crate::error::Result;
use crate::storage::entity::checkpoint;
use crate::storage::repository::CheckpointRepository;
use sea_orm::DatabaseConnection;
use std::collections::HashSet;
use std::sync::Arc;

/// step 完成记录，(item, step) 幂等写入
pub struct CheckpointStore {
    db: Arc<DatabaseConnection>,
    clock: Arc<dyn Clock>,
}

impl CheckpointStore {
    pub fn new(db: Arc<DatabaseConnection>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// 返回 true 表示新写入，false 表示该 step 已有记录
    pub async fn record(
        &self,
        item_id: i32,
        job_id: i32,
        step: &str,
        artifact_id: &str,
    ) -> Result<bool> {
        let now = self.clock.now_ms();
        Ok(CheckpointRepository::insert_or_ignore(&self.db, item_id, job_id, step, artifact_id, now).await?)
    }

    pub async fn for_item(&self, item_id: i32) -> Result<Vec<checkpoint::Model>> {
        Ok(CheckpointRepository::for_item(&self.db, item_id).await?)
    }

    pub async fn completed_steps(&self, item_id: i32) -> Result<HashSet<String>> {
        Ok(self
            .for_item(item_id)
            .await?
            .into_iter()
            .map(|c| c.step)
            .collect())
    }

    pub async fn count_for_job(&self, job_id: i32) -> Result<u64> {
        Ok(CheckpointRepository::count_for_job(&self.db, job_id).await?)
    }
}

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Deserialize, Serialize)]
#[sea_orm(table_name = "items")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub job_id: i32,
    pub ticker: String,
    pub status: String, // pending/leased/running/completed/failed/skipped
    pub priority: i32,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<i64>,
    pub last_heartbeat_at: Option<i64>,
    pub total_steps: i32,
    pub completed_steps: i32,
    pub completed_step_ids: String, // JSON 数组，按完成顺序
    pub current_step: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn completed_step_list(&self) -> Vec<String> {
        serde_json::from_str(&self.completed_step_ids).unwrap_or_default()
    }
}

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Deserialize, Serialize)]
#[sea_orm(table_name = "credential_usage")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub credential_id: String,
    pub day: String, // UTC YYYY-MM-DD
    pub request_count: i64,
    pub last_used_at: Option<i64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

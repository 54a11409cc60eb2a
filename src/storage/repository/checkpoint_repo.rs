use crate::storage::entity::checkpoint::{self, ActiveModel as CheckpointActiveModel, Entity as Checkpoint};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    Set,
};

pub struct CheckpointRepository;

impl CheckpointRepository {
    /// INSERT ... ON CONFLICT(item_id, step) DO NOTHING，返回是否真的写入
    pub async fn insert_or_ignore(
        db: &DatabaseConnection,
        item_id: i32,
        job_id: i32,
        step: &str,
        artifact_id: &str,
        now: i64,
    ) -> Result<bool, DbErr> {
        let active_model = CheckpointActiveModel {
            item_id: Set(item_id),
            job_id: Set(job_id),
            step: Set(step.to_string()),
            artifact_id: Set(artifact_id.to_string()),
            created_at: Set(now),
            ..Default::default()
        };

        let res = Checkpoint::insert(active_model)
            .on_conflict(
                OnConflict::columns([checkpoint::Column::ItemId, checkpoint::Column::Step])
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(db)
            .await;
        match res {
            Ok(rows) => Ok(rows > 0),
            Err(DbErr::RecordNotInserted) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn for_item(
        db: &DatabaseConnection,
        item_id: i32,
    ) -> Result<Vec<checkpoint::Model>, DbErr> {
        Checkpoint::find()
            .filter(checkpoint::Column::ItemId.eq(item_id))
            .order_by_asc(checkpoint::Column::Step)
            .order_by_asc(checkpoint::Column::Id)
            .all(db)
            .await
    }

    pub async fn count_for_job(db: &DatabaseConnection, job_id: i32) -> Result<u64, DbErr> {
        Checkpoint::find()
            .filter(checkpoint::Column::JobId.eq(job_id))
            .count(db)
            .await
    }
}

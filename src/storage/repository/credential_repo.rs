use crate::storage::entity::credential_usage::{
    self, ActiveModel as UsageActiveModel, Entity as CredentialUsage,
};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set};

pub struct CredentialRepository;

impl CredentialRepository {
    /// 保证当天每个凭证都有一行计数（已存在则忽略）
    pub async fn ensure_day_rows(
        db: &DatabaseConnection,
        credential_ids: &[String],
        day: &str,
    ) -> Result<(), DbErr> {
        if credential_ids.is_empty() {
            return Ok(());
        }
        let rows = credential_ids.iter().map(|id| UsageActiveModel {
            credential_id: Set(id.clone()),
            day: Set(day.to_string()),
            request_count: Set(0),
            last_used_at: Set(None),
            ..Default::default()
        });
        let res = CredentialUsage::insert_many(rows)
            .on_conflict(
                OnConflict::columns([
                    credential_usage::Column::CredentialId,
                    credential_usage::Column::Day,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(db)
            .await;
        match res {
            Ok(_) | Err(DbErr::RecordNotInserted) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn usage_for_day(
        db: &DatabaseConnection,
        day: &str,
    ) -> Result<Vec<credential_usage::Model>, DbErr> {
        CredentialUsage::find()
            .filter(credential_usage::Column::Day.eq(day))
            .all(db)
            .await
    }

    /// 乐观锁自增：只有计数仍为 expected 且未到上限时才成功
    pub async fn try_increment(
        db: &DatabaseConnection,
        credential_id: &str,
        day: &str,
        expected: i64,
        limit: i64,
        now: i64,
    ) -> Result<bool, DbErr> {
        let res = CredentialUsage::update_many()
            .col_expr(
                credential_usage::Column::RequestCount,
                Expr::col(credential_usage::Column::RequestCount).add(1),
            )
            .col_expr(credential_usage::Column::LastUsedAt, Expr::value(now))
            .filter(credential_usage::Column::CredentialId.eq(credential_id))
            .filter(credential_usage::Column::Day.eq(day))
            .filter(credential_usage::Column::RequestCount.eq(expected))
            .filter(credential_usage::Column::RequestCount.lt(limit))
            .exec(db)
            .await?;
        Ok(res.rows_affected == 1)
    }

    /// 直接设置某天的计数（运维/测试用：例如同步供应商侧已用额度）
    pub async fn set_usage(
        db: &DatabaseConnection,
        credential_id: &str,
        day: &str,
        count: i64,
    ) -> Result<(), DbErr> {
        Self::ensure_day_rows(db, &[credential_id.to_string()], day).await?;
        CredentialUsage::update_many()
            .col_expr(credential_usage::Column::RequestCount, Expr::value(count))
            .filter(credential_usage::Column::CredentialId.eq(credential_id))
            .filter(credential_usage::Column::Day.eq(day))
            .exec(db)
            .await?;
        Ok(())
    }
}

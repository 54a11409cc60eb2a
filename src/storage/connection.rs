use crate::storage::entity::{checkpoint, credential_usage, item, job};
use log::info;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, Schema};
use std::time::Duration;

pub async fn establish_connection(db_url: &str) -> Result<DatabaseConnection, DbErr> {
    let mut opt = ConnectOptions::new(db_url.to_owned());
    opt.max_connections(10)
        .min_connections(2)
        .connect_timeout(Duration::from_secs(8))
        .acquire_timeout(Duration::from_secs(8))
        .idle_timeout(Duration::from_secs(8))
        .max_lifetime(Duration::from_secs(8))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    let db = Database::connect(opt).await?;

    // 启用 WAL 模式，多个 worker 进程共享同一个库文件
    let _ = sea_orm::ConnectionTrait::execute(
        &db,
        sea_orm::Statement::from_string(
            sea_orm::DatabaseBackend::Sqlite,
            "PRAGMA journal_mode=WAL;".to_string(),
        ),
    )
    .await?;

    // 创建表（如果不存在）
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);

    let stmt = builder.build(schema.create_table_from_entity(job::Entity).if_not_exists());
    db.execute(stmt).await?;

    let stmt = builder.build(schema.create_table_from_entity(item::Entity).if_not_exists());
    db.execute(stmt).await?;

    let stmt = builder.build(
        schema
            .create_table_from_entity(checkpoint::Entity)
            .if_not_exists(),
    );
    db.execute(stmt).await?;

    let stmt = builder.build(
        schema
            .create_table_from_entity(credential_usage::Entity)
            .if_not_exists(),
    );
    db.execute(stmt).await?;

    // 唯一索引：checkpoint 按 (item, step) 幂等，额度按 (credential, day) 唯一
    for sql in [
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_checkpoints_item_step ON checkpoints(item_id, step);",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_credential_usage_cred_day ON credential_usage(credential_id, day);",
        "CREATE INDEX IF NOT EXISTS idx_items_job_status ON items(job_id, status);",
        "CREATE INDEX IF NOT EXISTS idx_items_status_heartbeat ON items(status, last_heartbeat_at);",
    ] {
        db.execute(sea_orm::Statement::from_string(
            sea_orm::DatabaseBackend::Sqlite,
            sql.to_string(),
        ))
        .await?;
    }

    info!("Database connection established with WAL mode and tables initialized.");

    Ok(db)
}

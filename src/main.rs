use anyhow::{bail, Context};
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tickerbatch::batch::ItemFilter;
use tickerbatch::executor::{ExecutorRegistry, LlmExtractionExecutor};
use tickerbatch::storage::establish_connection;
use tickerbatch::{BatchService, JobConfig, JobSubmission, OrchestratorConfig, SystemClock};

const OPERATION: &str = "financial_extraction";

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let ts = Local::now().format("%Y%m%d-%H%M%S").to_string();
    let log_dir = std::path::PathBuf::from("logs");
    std::fs::create_dir_all(&log_dir)?;
    let log_path = log_dir.join(format!("tickerbatch-{}.log", ts));
    let log_file = std::fs::File::create(&log_path)?;
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .filter_level(log::LevelFilter::Warn)
        .filter_module("tickerbatch", log::LevelFilter::Info)
        .filter_module("sqlx", log::LevelFilter::Error)
        .filter_module("sea_orm", log::LevelFilter::Error)
        .init();

    // 加载 .env（不存在就只用系统环境变量）
    if dotenv::dotenv().is_err() {
        log::warn!("未找到 .env 文件，从系统环境变量读取");
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(tickers_path) = args.first() else {
        bail!("usage: tickerbatch <tickers-file> [job-name]");
    };
    let job_name = args.get(1).cloned().unwrap_or_else(|| format!("batch-{}", ts));

    let config = OrchestratorConfig::from_env().context("读取配置失败")?;
    let years: Vec<i32> = std::env::var("YEARS")
        .unwrap_or_else(|_| "2021,2022,2023".to_string())
        .split(',')
        .map(|s| s.trim().parse::<i32>())
        .collect::<Result<_, _>>()
        .context("YEARS 格式错误")?;

    let raw = std::fs::read_to_string(tickers_path)
        .with_context(|| format!("无法读取 ticker 文件 {}", tickers_path))?;
    let tickers: Vec<String> = raw
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| l.to_string())
        .collect();

    let db = Arc::new(
        establish_connection(&config.database_url)
            .await
            .context("数据库连接失败")?,
    );

    let executor = LlmExtractionExecutor::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let registry = ExecutorRegistry::new().with(OPERATION, Arc::new(executor));

    let service = Arc::new(BatchService::new(
        db,
        config,
        registry,
        Arc::new(SystemClock),
    )?);

    service.recover().await?;

    let job_id = service
        .submit_job(JobSubmission::new(job_name, tickers, JobConfig::new(OPERATION, years)))
        .await?;
    println!("job [{}] 已提交，日志: {}", job_id, log_path.display());

    let handle = service.start();
    let job = loop {
        let job = service.wait_for_job(job_id, Duration::from_secs(30)).await?;
        let stats = service.job_stats(job_id).await?;
        println!(
            "[{}] {} 完成 {} / 失败 {} / 跳过 {} / 共 {} (年份进度 {}/{})",
            job.status,
            job.name,
            job.completed_items,
            job.failed_items,
            job.skipped_items,
            job.total_items,
            stats.steps_done,
            stats.steps_total
        );
        if job.status == "completed" || job.status == "failed" {
            break job;
        }
    };
    handle.shutdown().await;

    let failed = service
        .list_items(job_id, ItemFilter::status(tickerbatch::batch::ItemStatus::Failed))
        .await?;
    for item in failed {
        println!(
            "  ✗ {}: {}",
            item.ticker,
            item.last_error.unwrap_or_default()
        );
    }
    println!("job [{}] 结束: {}", job.id, job.status);
    Ok(())
}

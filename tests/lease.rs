mod common;

use common::{tickers, TestEnv, OP};
use std::sync::Arc;
use std::time::Duration;
use tickerbatch::batch::{ItemStatus, JobConfig, JobStatus, JobSubmission};
use tickerbatch::lease::{LeaseManager, Watchdog};
use tickerbatch::storage::repository::{CheckpointRepository, ItemRepository, JobRepository};
use tickerbatch::OrchestratorError;

async fn seed_job(env: &TestEnv, keys: &[&str], years: Vec<i32>, max_attempts: i32) -> (i32, Vec<i32>) {
    let mut cfg = JobConfig::new(OP, years);
    cfg.max_attempts = max_attempts;
    let total_steps = cfg.steps().len() as i32;
    let submission = JobSubmission::new("lease-test", tickers(keys), cfg);
    let job_id = JobRepository::create_job(&env.db, &submission, &tickers(keys), total_steps, common::T0)
        .await
        .unwrap();
    let items = ItemRepository::list(&env.db, job_id, &Default::default())
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.id)
        .collect();
    (job_id, items)
}

fn manager(env: &TestEnv) -> Arc<LeaseManager> {
    Arc::new(LeaseManager::new(
        env.db.clone(),
        env.clock.clone(),
        Duration::from_secs(60),
    ))
}

#[tokio::test]
async fn concurrent_acquire_has_exactly_one_winner() {
    let env = TestEnv::new().await;
    let (_, items) = seed_job(&env, &["AAPL"], vec![2023], 3).await;
    let item_id = items[0];

    // 两个 manager 模拟两个进程
    let managers = [manager(&env), manager(&env)];
    let mut tasks = Vec::new();
    for i in 0..16 {
        let m = managers[i % 2].clone();
        tasks.push(tokio::spawn(async move {
            m.acquire(item_id, &format!("w{}", i)).await
        }));
    }

    let mut wins = 0;
    let mut conflicts = 0;
    for t in tasks {
        match t.await.unwrap() {
            Ok(_) => wins += 1,
            Err(OrchestratorError::LeaseConflict(id)) => {
                assert_eq!(id, item_id);
                conflicts += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(conflicts, 15);

    let item = ItemRepository::find(&env.db, item_id).await.unwrap().unwrap();
    assert_eq!(item.status, "leased");
    assert!(item.lease_owner.is_some());
}

#[tokio::test]
async fn expired_lease_can_be_taken_over_and_fences_old_owner() {
    let env = TestEnv::new().await;
    let (_, items) = seed_job(&env, &["MSFT"], vec![2022, 2023], 3).await;
    let m = manager(&env);

    let mut old = m.acquire(items[0], "w-old").await.unwrap();
    assert!(matches!(
        m.acquire(items[0], "w-new").await,
        Err(OrchestratorError::LeaseConflict(_))
    ));

    env.clock.advance_secs(61);
    let new = m.acquire(items[0], "w-new").await.unwrap();
    assert_eq!(new.owner, "w-new");

    // 旧 owner 的续租和进度写入都被拒绝
    assert!(matches!(
        m.renew(&mut old).await,
        Err(OrchestratorError::LeaseLost { .. })
    ));
    assert!(matches!(
        m.record_progress(&mut old, &["2022".to_string()]).await,
        Err(OrchestratorError::LeaseLost { .. })
    ));
}

#[tokio::test]
async fn renew_extends_expiry_and_release_is_idempotent() {
    let env = TestEnv::new().await;
    let (_, items) = seed_job(&env, &["NVDA"], vec![2023], 3).await;
    let m = manager(&env);

    let mut lease = m.acquire(items[0], "w1").await.unwrap();
    let first_expiry = lease.expires_at;
    env.clock.advance_secs(30);
    m.renew(&mut lease).await.unwrap();
    assert_eq!(lease.expires_at, first_expiry + 30_000);

    m.release(&lease).await.unwrap();
    m.release(&lease).await.unwrap();

    let item = ItemRepository::find(&env.db, items[0]).await.unwrap().unwrap();
    assert_eq!(item.status, "pending");
    assert_eq!(item.lease_owner, None);
    assert_eq!(item.attempts, 0);

    // 交还后别人可以立即拿到
    m.acquire(items[0], "w2").await.unwrap();
}

#[tokio::test]
async fn watchdog_reclaims_silent_lease_without_touching_checkpoints() {
    let env = TestEnv::new().await;
    let (job_id, items) = seed_job(&env, &["TSLA"], vec![2021, 2022, 2023], 3).await;
    let m = manager(&env);
    let watchdog = Watchdog::new(
        env.db.clone(),
        env.clock.clone(),
        Duration::from_secs(60),
        Duration::from_secs(1),
        120,
    );

    let mut lease = m.acquire(items[0], "w-crashed").await.unwrap();
    m.mark_running(&mut lease, "2021").await.unwrap();
    CheckpointRepository::insert_or_ignore(&env.db, items[0], job_id, "2021", "a1", common::T0)
        .await
        .unwrap();
    m.record_progress(&mut lease, &["2021".to_string()]).await.unwrap();

    // 恰好 60s 还不算过期
    env.clock.advance_secs(60);
    assert!(watchdog.sweep().await.unwrap().is_empty());

    env.clock.advance_ms(1);
    let reclaimed = watchdog.sweep().await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].prior_owner.as_deref(), Some("w-crashed"));
    assert_eq!(reclaimed[0].new_status, ItemStatus::Pending);

    let item = ItemRepository::find(&env.db, items[0]).await.unwrap().unwrap();
    assert_eq!(item.status, "pending");
    assert_eq!(item.attempts, 1);
    assert_eq!(item.lease_owner, None);
    assert_eq!(item.completed_steps, 1);
    assert_eq!(item.completed_step_list(), vec!["2021".to_string()]);

    let cps = CheckpointRepository::for_item(&env.db, items[0]).await.unwrap();
    assert_eq!(cps.len(), 1);
    assert_eq!(cps[0].step, "2021");
}

#[tokio::test]
async fn watchdog_fails_item_after_max_attempts() {
    let env = TestEnv::new().await;
    let (job_id, items) = seed_job(&env, &["IBM"], vec![2023], 2).await;
    let m = manager(&env);
    let watchdog = Watchdog::new(
        env.db.clone(),
        env.clock.clone(),
        Duration::from_secs(60),
        Duration::from_secs(1),
        120,
    );

    for round in 1..=3 {
        m.acquire(items[0], &format!("w{}", round)).await.unwrap();
        env.clock.advance_secs(61);
        let reclaimed = watchdog.sweep().await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        let expected = if round <= 2 {
            ItemStatus::Pending
        } else {
            ItemStatus::Failed
        };
        assert_eq!(reclaimed[0].new_status, expected, "round {}", round);
    }

    let item = ItemRepository::find(&env.db, items[0]).await.unwrap().unwrap();
    assert_eq!(item.status, "failed");
    assert_eq!(item.attempts, 3);
    assert!(item.last_error.unwrap().contains("lease expired"));

    let job = JobRepository::find(&env.db, job_id).await.unwrap().unwrap();
    assert_eq!(job.failed_items, 1);
    assert_eq!(job.status, "completed");
}

#[tokio::test]
async fn checkpoint_insert_is_idempotent() {
    let env = TestEnv::new().await;
    let (job_id, items) = seed_job(&env, &["AMZN"], vec![2023], 3).await;

    let first = CheckpointRepository::insert_or_ignore(&env.db, items[0], job_id, "2023", "art-1", common::T0)
        .await
        .unwrap();
    let second = CheckpointRepository::insert_or_ignore(&env.db, items[0], job_id, "2023", "art-2", common::T0)
        .await
        .unwrap();
    assert!(first);
    assert!(!second);

    let cps = CheckpointRepository::for_item(&env.db, items[0]).await.unwrap();
    assert_eq!(cps.len(), 1);
    assert_eq!(cps[0].artifact_id, "art-1");
}

#[tokio::test]
async fn finish_counts_item_and_completes_job_together() {
    let env = TestEnv::new().await;
    let (job_id, items) = seed_job(&env, &["ORCL", "SAP"], vec![2023], 3).await;
    let m = manager(&env);

    let first = m.acquire(items[0], "w1").await.unwrap();
    assert_eq!(first.job_id, job_id);
    assert!(!m.finish(first, ItemStatus::Completed, None).await.unwrap());
    let job = JobRepository::find(&env.db, job_id).await.unwrap().unwrap();
    assert_eq!(job.completed_items, 1);
    assert_eq!(job.status, "pending");

    let second = m.acquire(items[1], "w1").await.unwrap();
    assert!(m
        .finish(second, ItemStatus::Failed, Some("boom".into()))
        .await
        .unwrap());
    let job = JobRepository::find(&env.db, job_id).await.unwrap().unwrap();
    assert_eq!(job.failed_items, 1);
    assert_eq!(job.status, "completed");
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn finish_with_lost_lease_leaves_counters_alone() {
    let env = TestEnv::new().await;
    let (job_id, items) = seed_job(&env, &["INTC"], vec![2023], 3).await;
    let m = manager(&env);

    let old = m.acquire(items[0], "w-old").await.unwrap();
    env.clock.advance_secs(61);
    m.acquire(items[0], "w-new").await.unwrap();

    assert!(matches!(
        m.finish(old, ItemStatus::Completed, None).await,
        Err(OrchestratorError::LeaseLost { .. })
    ));
    let job = JobRepository::find(&env.db, job_id).await.unwrap().unwrap();
    assert_eq!(job.completed_items, 0);
    assert_eq!(job.status, "pending");

    let item = ItemRepository::find(&env.db, items[0]).await.unwrap().unwrap();
    assert_eq!(item.status, "leased");
    assert_eq!(item.lease_owner.as_deref(), Some("w-new"));
}

#[tokio::test]
async fn release_into_failed_job_skips_item() {
    let env = TestEnv::new().await;
    let (job_id, items) = seed_job(&env, &["CSCO"], vec![2022, 2023], 3).await;
    let m = manager(&env);

    let mut lease = m.acquire(items[0], "w1").await.unwrap();
    m.mark_running(&mut lease, "2022").await.unwrap();
    JobRepository::transition(
        env.db.as_ref(),
        job_id,
        &[JobStatus::Pending],
        JobStatus::Failed,
        None,
        common::T0,
    )
    .await
    .unwrap();

    assert_eq!(m.release(&lease).await.unwrap(), Some(ItemStatus::Skipped));
    // 第二次交还已经不持有租约
    assert_eq!(m.release(&lease).await.unwrap(), None);

    let item = ItemRepository::find(&env.db, items[0]).await.unwrap().unwrap();
    assert_eq!(item.status, "skipped");
    assert_eq!(item.lease_owner, None);
    assert_eq!(item.current_step, None);

    let job = JobRepository::find(&env.db, job_id).await.unwrap().unwrap();
    assert_eq!(job.skipped_items, 1);
    assert_eq!(job.status, "failed");
}

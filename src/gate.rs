use fs2::FileExt;
use log::{debug, info};
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// 全局调用闸门
///
/// 跨线程、跨进程保证同一时刻最多一个外部调用在执行，且每次调用结束后
/// 必须冷却 `cooldown` 才放行下一个。底层是锁文件上的 flock，持有进程
/// 崩溃时由操作系统自动释放。
#[derive(Debug, Clone)]
pub struct CallGate {
    lock_path: PathBuf,
    cooldown: Duration,
}

impl CallGate {
    pub fn new(lock_path: impl Into<PathBuf>, cooldown: Duration) -> std::io::Result<Self> {
        let lock_path = lock_path.into();
        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        // 先确保锁文件存在
        open_lock_file(&lock_path)?;
        info!(
            "调用闸门就绪: {} (cooldown {:?})",
            lock_path.display(),
            cooldown
        );
        Ok(Self {
            lock_path,
            cooldown,
        })
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// acquire -> f() -> sleep(cooldown) -> release；f 的错误在释放后原样返回
    pub async fn with_call<F, Fut, T>(&self, f: F) -> std::io::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let wait_started = Instant::now();
        let guard = self.acquire().await?;
        debug!("闸门已获取，等待 {:?}", wait_started.elapsed());

        let out = f().await;

        if !self.cooldown.is_zero() {
            tokio::time::sleep(self.cooldown).await;
        }
        drop(guard);
        Ok(out)
    }

    async fn acquire(&self) -> std::io::Result<GateGuard> {
        let path = self.lock_path.clone();
        // flock 是阻塞调用，放到 blocking 线程池
        tokio::task::spawn_blocking(move || {
            let file = open_lock_file(&path)?;
            FileExt::lock_exclusive(&file)?;
            Ok(GateGuard { file })
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
    }
}

fn open_lock_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

/// 每次获取都独立 open，这样同进程内不同任务之间也互斥
struct GateGuard {
    file: File,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        // 关闭文件同样会释放锁，这里显式解锁
        let _ = FileExt::unlock(&self.file);
    }
}

//! 磁盘缩放图缓存。
//!
//! 缓存文件为 `<cache_folder>/<cache_key>`，不另存元数据：
//! 当且仅当缓存文件存在且 mtime 严格晚于源图 mtime 时视为新鲜，否则重新生成。
//! 缓存文件只会被创建或覆盖，本模块从不删除。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use moka::future::Cache;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::resizer::{CancelFlag, ResizeError, ResizeJob, Resizer};
use super::resolver::CacheKey;

/// 键级锁表容量上限与空闲过期时间
const KEY_LOCK_CAPACITY: u64 = 10_000;
const KEY_LOCK_TTI: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("源图片不可用 {}: {source}", .path.display())]
    SourceUnavailable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("未配置缩放实现")]
    NoResizer,

    #[error("生成缩放图失败 {} -> {} ({size}x{size}): {error}", .image.display(), .output.display())]
    ResizeFailed {
        image: PathBuf,
        output: PathBuf,
        size: u32,
        #[source]
        error: ResizeError,
    },

    #[error("缓存目录 I/O 错误: {0}")]
    Io(#[from] std::io::Error),
}

pub struct CacheStore {
    folder: PathBuf,
    resizer: Option<Arc<dyn Resizer>>,
    /// 限制同时进行的缩放任务数量（CPU 密集）
    permits: Arc<Semaphore>,
    /// 按缓存键串行化 “检查 -> 生成”，避免并发请求重复缩放同一文件
    key_locks: Cache<String, Arc<Mutex<()>>>,
}

impl CacheStore {
    /// `max_parallel = 0` 表示取 CPU 核心数
    pub fn new(
        folder: impl Into<PathBuf>,
        resizer: Option<Arc<dyn Resizer>>,
        max_parallel: usize,
    ) -> Self {
        let permits = if max_parallel == 0 {
            num_cpus::get()
        } else {
            max_parallel
        };
        Self {
            folder: folder.into(),
            resizer,
            permits: Arc::new(Semaphore::new(permits)),
            key_locks: Cache::builder()
                .max_capacity(KEY_LOCK_CAPACITY)
                .time_to_idle(KEY_LOCK_TTI)
                .build(),
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn resizer_name(&self) -> Option<&'static str> {
        self.resizer.as_ref().map(|r| r.name())
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.folder.join(key.as_str())
    }

    /// 确保缓存目录存在
    pub async fn prepare(&self) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.folder).await?;
        Ok(())
    }

    /// 返回新鲜的缓存文件路径，必要时调用缩放实现重新生成。
    pub async fn ensure_fresh(
        &self,
        key: &CacheKey,
        source: &Path,
        size: u32,
    ) -> Result<PathBuf, CacheError> {
        let source_mtime = source_mtime(source).await?;
        let output = self.path_for(key);
        if is_fresh(&output, source_mtime).await {
            debug!(cache_key = %key, "缓存命中");
            return Ok(output);
        }

        let lock = self
            .key_locks
            .get_with(key.to_string(), async { Arc::new(Mutex::new(())) })
            .await;
        let guard = lock.lock_owned().await;
        if is_fresh(&output, source_mtime).await {
            debug!(cache_key = %key, "等待期间已由其他请求生成");
            return Ok(output);
        }

        let Some(resizer) = self.resizer.clone() else {
            error!(cache_key = %key, source = %source.display(), "缓存未命中且未配置缩放实现");
            return Err(CacheError::NoResizer);
        };

        self.prepare().await?;
        let tmp = self
            .folder
            .join(format!(".{key}.{}.tmp.jpg", Uuid::new_v4().simple()));
        let job = ResizeJob {
            source: source.to_path_buf(),
            output: tmp,
            width: size,
            height: size,
        };

        let started = Instant::now();
        let result = match self.permits.clone().acquire_owned().await {
            Ok(permit) => run_resize(resizer, job, output.clone(), guard, permit).await,
            Err(e) => Err(ResizeError::Join(format!("获取缩放信号量失败: {e}"))),
        };

        match result {
            Ok(()) => {
                info!(
                    cache_key = %key,
                    source = %source.display(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "缩放图已生成"
                );
                Ok(output)
            }
            Err(e) => {
                error!(
                    source = %source.display(),
                    output = %output.display(),
                    width = size,
                    height = size,
                    "生成缩放图失败: {}", e
                );
                Err(CacheError::ResizeFailed {
                    image: source.to_path_buf(),
                    output,
                    size,
                    error: e,
                })
            }
        }
    }
}

/// 存在且 mtime 严格晚于源图才算新鲜；不存在、不可读、相等或更早都视为过期。
pub async fn is_fresh(output: &Path, source_mtime: SystemTime) -> bool {
    match tokio::fs::metadata(output).await.and_then(|m| m.modified()) {
        Ok(mtime) => mtime > source_mtime,
        Err(_) => false,
    }
}

async fn source_mtime(source: &Path) -> Result<SystemTime, CacheError> {
    let unavailable = |e: std::io::Error| CacheError::SourceUnavailable {
        path: source.to_path_buf(),
        source: e,
    };
    let meta = tokio::fs::metadata(source).await.map_err(unavailable)?;
    if !meta.is_file() {
        return Err(unavailable(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "不是普通文件",
        )));
    }
    meta.modified().map_err(unavailable)
}

/// 在阻塞线程池执行缩放：先写临时文件，成功后原子 rename 到目标路径。
///
/// 键锁与信号量许可随任务移入阻塞线程，请求被中断时仍持有到任务结束；
/// 外层 future 被 drop 会置位取消标记。
async fn run_resize(
    resizer: Arc<dyn Resizer>,
    job: ResizeJob,
    target: PathBuf,
    guard: OwnedMutexGuard<()>,
    permit: OwnedSemaphorePermit,
) -> Result<(), ResizeError> {
    let cancel = CancelFlag::new();
    let on_drop = cancel.cancel_on_drop();

    let handle = tokio::task::spawn_blocking(move || {
        let _guard = guard;
        let _permit = permit;
        let result = resizer.resize(&job, &cancel).and_then(|()| {
            cancel.check()?;
            std::fs::rename(&job.output, &target)?;
            Ok(())
        });
        if result.is_err() {
            let _ = std::fs::remove_file(&job.output);
        }
        result
    });

    let result = handle
        .await
        .map_err(|e| ResizeError::Join(e.to_string()))?;
    on_drop.disarm();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::avatar::resizer::tests::CountingResizer;
    use std::fs::File;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// 写出半截输出后一直阻塞，直到取消标记置位
    #[derive(Default)]
    struct StallingResizer {
        started: AtomicBool,
        saw_cancel: AtomicBool,
    }

    impl Resizer for StallingResizer {
        fn name(&self) -> &'static str {
            "stalling"
        }

        fn resize(&self, job: &ResizeJob, cancel: &CancelFlag) -> Result<(), ResizeError> {
            std::fs::write(&job.output, b"partial")?;
            self.started.store(true, Ordering::SeqCst);
            let deadline = Instant::now() + Duration::from_secs(10);
            while Instant::now() < deadline {
                if cancel.is_cancelled() {
                    self.saw_cancel.store(true, Ordering::SeqCst);
                    return Err(ResizeError::Cancelled);
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..500 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    struct Fixture {
        _src_dir: tempfile::TempDir,
        cache_dir: tempfile::TempDir,
        source: PathBuf,
        resizer: Arc<CountingResizer>,
        store: Arc<CacheStore>,
    }

    fn fixture_with(resizer: CountingResizer) -> Fixture {
        let src_dir = tempfile::tempdir().expect("tempdir");
        let cache_dir = tempfile::tempdir().expect("tempdir");
        let source = src_dir.path().join("img.png");
        std::fs::write(&source, b"source").expect("write source");
        set_mtime(&source, SystemTime::now() - Duration::from_secs(120));

        let resizer = Arc::new(resizer);
        let store = Arc::new(CacheStore::new(
            cache_dir.path(),
            Some(resizer.clone() as Arc<dyn Resizer>),
            2,
        ));
        Fixture {
            _src_dir: src_dir,
            cache_dir,
            source,
            resizer,
            store,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(CountingResizer::default())
    }

    fn set_mtime(path: &Path, t: SystemTime) {
        File::options()
            .write(true)
            .open(path)
            .expect("open for mtime")
            .set_modified(t)
            .expect("set mtime");
    }

    fn cache_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .expect("read cache dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn miss_then_hit_resizes_once() {
        let f = fixture();
        let key = CacheKey::identity("abc", 80);

        let first = f.store.ensure_fresh(&key, &f.source, 80).await.expect("first");
        assert_eq!(first, f.cache_dir.path().join("abc.s80.jpg"));
        assert_eq!(std::fs::read_to_string(&first).expect("read"), "80x80");

        let second = f.store.ensure_fresh(&key, &f.source, 80).await.expect("second");
        assert_eq!(first, second);
        assert_eq!(f.resizer.count(), 1);
        assert_eq!(cache_entries(f.cache_dir.path()), vec!["abc.s80.jpg"]);
    }

    #[tokio::test]
    async fn touched_source_triggers_exactly_one_regeneration() {
        let f = fixture();
        let key = CacheKey::default_image("nobody", 40);
        let out = f.store.ensure_fresh(&key, &f.source, 40).await.expect("first");

        let now = SystemTime::now();
        set_mtime(&out, now - Duration::from_secs(60));
        set_mtime(&f.source, now - Duration::from_secs(30));

        f.store.ensure_fresh(&key, &f.source, 40).await.expect("regen");
        f.store.ensure_fresh(&key, &f.source, 40).await.expect("hit");
        assert_eq!(f.resizer.count(), 2);
    }

    #[tokio::test]
    async fn equal_mtime_counts_as_stale() {
        let f = fixture();
        let key = CacheKey::identity("abc", 16);
        let out = f.store.ensure_fresh(&key, &f.source, 16).await.expect("first");

        let t = SystemTime::now() - Duration::from_secs(10);
        set_mtime(&out, t);
        set_mtime(&f.source, t);
        assert!(!is_fresh(&out, t).await);

        f.store.ensure_fresh(&key, &f.source, 16).await.expect("regen");
        assert_eq!(f.resizer.count(), 2);
    }

    #[tokio::test]
    async fn missing_source_is_unavailable() {
        let f = fixture();
        let missing = f.source.with_file_name("missing.png");
        let err = f
            .store
            .ensure_fresh(&CacheKey::identity("abc", 80), &missing, 80)
            .await
            .expect_err("missing source");
        assert!(matches!(err, CacheError::SourceUnavailable { .. }), "got {err:?}");
        assert_eq!(f.resizer.count(), 0);
    }

    #[tokio::test]
    async fn failed_resize_leaves_no_files() {
        let f = fixture_with(CountingResizer::failing());
        let err = f
            .store
            .ensure_fresh(&CacheKey::identity("abc", 80), &f.source, 80)
            .await
            .expect_err("resize fails");
        assert!(matches!(err, CacheError::ResizeFailed { size: 80, .. }), "got {err:?}");
        assert!(cache_entries(f.cache_dir.path()).is_empty());

        // 不缓存失败结果：下一次请求会再次尝试
        let _ = f
            .store
            .ensure_fresh(&CacheKey::identity("abc", 80), &f.source, 80)
            .await;
        assert_eq!(f.resizer.count(), 2);
    }

    #[tokio::test]
    async fn stale_entry_without_resizer_is_error() {
        let cache_dir = tempfile::tempdir().expect("tempdir");
        let source = cache_dir.path().join("src.png");
        std::fs::write(&source, b"x").expect("write");
        let store = CacheStore::new(cache_dir.path().join("out"), None, 1);

        let err = store
            .ensure_fresh(&CacheKey::identity("abc", 80), &source, 80)
            .await
            .expect_err("no resizer");
        assert!(matches!(err, CacheError::NoResizer));
        assert_eq!(store.resizer_name(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_request_cancels_resize_and_publishes_nothing() {
        let cache_dir = tempfile::tempdir().expect("tempdir");
        let source = cache_dir.path().join("src.png");
        std::fs::write(&source, b"x").expect("write");
        set_mtime(&source, SystemTime::now() - Duration::from_secs(120));
        let out_dir = cache_dir.path().join("out");

        let resizer = Arc::new(StallingResizer::default());
        let store = Arc::new(CacheStore::new(
            &out_dir,
            Some(resizer.clone() as Arc<dyn Resizer>),
            1,
        ));

        let task = {
            let store = store.clone();
            let source = source.clone();
            tokio::spawn(async move {
                store
                    .ensure_fresh(&CacheKey::identity("abc", 80), &source, 80)
                    .await
            })
        };

        assert!(wait_until(|| resizer.started.load(Ordering::SeqCst)).await);
        task.abort();
        let err = task.await.expect_err("aborted");
        assert!(err.is_cancelled());

        let settled = wait_until(|| {
            resizer.saw_cancel.load(Ordering::SeqCst) && cache_entries(&out_dir).is_empty()
        })
        .await;
        assert!(settled, "left behind: {:?}", cache_entries(&out_dir));
        assert!(resizer.saw_cancel.load(Ordering::SeqCst));
        assert!(!out_dir.join("abc.s80.jpg").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_share_one_resize() {
        let f = fixture();
        let key = CacheKey::identity("abc", 64);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = f.store.clone();
            let source = f.source.clone();
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                store.ensure_fresh(&key, &source, 64).await
            }));
        }
        for t in tasks {
            t.await.expect("join").expect("ensure_fresh");
        }
        assert_eq!(f.resizer.count(), 1);
    }
}

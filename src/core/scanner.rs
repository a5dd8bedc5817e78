//! 异步目录扫描服务
//!
//! 扫描不阻塞同步线程：进程级共享一个工作池，按服务实例引用
//! 计数，最后一个服务释放时拆除。请求完成后通过 Cookie 弱引用
//! 回通知发起方的 waiter；发起方已销毁则结果直接丢弃。

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::core::node::NodeDbId;
use crate::core::waiter::Waiter;
use crate::fs::{FsCapability, FsNode};

/// 扫描工作协程数
const SCAN_WORKERS: usize = 4;

/// debris 目录不参与扫描
const DEBRIS_DIR_NAME: &str = ".debris";

/// 一次目录扫描请求
pub struct ScanRequest {
    target: NodeDbId,
    target_path: PathBuf,
    completed: AtomicBool,
    failed: AtomicBool,
    results: StdMutex<Vec<FsNode>>,
    cookie: Weak<Cookie>,
}

impl ScanRequest {
    /// 请求是否完成
    pub fn completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// 完成且目录读取成功
    pub fn ok(&self) -> bool {
        self.completed() && !self.failed.load(Ordering::Acquire)
    }

    /// 是否针对给定目标
    pub fn matches(&self, target: NodeDbId) -> bool {
        self.target == target
    }

    pub fn target_path(&self) -> &PathBuf {
        &self.target_path
    }

    /// 取走扫描结果
    pub fn take_results(&self) -> Vec<FsNode> {
        std::mem::take(&mut self.results.lock().unwrap())
    }
}

/// 服务与请求之间的共享句柄：完成时唤醒属主的 waiter
struct Cookie {
    waiter: Arc<Waiter>,
}

impl Cookie {
    fn completed(&self) {
        self.waiter.notify();
    }
}

struct PoolJob {
    request: Arc<ScanRequest>,
    fs: Arc<dyn FsCapability>,
}

/// 进程级工作池状态
struct PoolState {
    refcount: usize,
    tx: mpsc::UnboundedSender<PoolJob>,
}

fn pool_slot() -> &'static StdMutex<Option<PoolState>> {
    static POOL: OnceLock<StdMutex<Option<PoolState>>> = OnceLock::new();
    POOL.get_or_init(|| StdMutex::new(None))
}

fn spawn_workers(rx: mpsc::UnboundedReceiver<PoolJob>) {
    // 工作池跑在自己的线程和运行时上，独立于任何调用方运行时的生死
    let spawned = std::thread::Builder::new()
        .name("scan-pool".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    warn!("构建扫描池运行时失败: {}", e);
                    return;
                }
            };
            rt.block_on(async move {
                let rx = Arc::new(Mutex::new(rx));
                let mut workers = tokio::task::JoinSet::new();
                for i in 0..SCAN_WORKERS {
                    let rx = rx.clone();
                    workers.spawn(async move {
                        loop {
                            let job = { rx.lock().await.recv().await };
                            let Some(job) = job else {
                                debug!("扫描工作协程 {} 退出", i);
                                break;
                            };
                            run_scan(job).await;
                        }
                    });
                }
                while workers.join_next().await.is_some() {}
            });
        });

    if let Err(e) = spawned {
        // 线程起不来时接收端随闭包销毁，后续请求会直接标记失败
        warn!("创建扫描池线程失败: {}", e);
    }
}

async fn run_scan(job: PoolJob) {
    let request = job.request;

    match job.fs.list_dir(&request.target_path).await {
        Ok(nodes) => {
            let filtered: Vec<FsNode> = nodes
                .into_iter()
                .filter(|n| n.name != DEBRIS_DIR_NAME)
                .collect();
            *request.results.lock().unwrap() = filtered;
        }
        Err(e) => {
            warn!("目录扫描失败: {:?} - {}", request.target_path, e);
            request.failed.store(true, Ordering::Release);
        }
    }

    request.completed.store(true, Ordering::Release);

    // 属主还活着才通知；否则结果自然丢弃
    if let Some(cookie) = request.cookie.upgrade() {
        cookie.completed();
    }
}

/// 扫描服务（每个同步一个实例，共享进程级工作池）
pub struct ScanService {
    cookie: Arc<Cookie>,
    fs: Arc<dyn FsCapability>,
    tx: mpsc::UnboundedSender<PoolJob>,
}

impl ScanService {
    pub fn new(waiter: Arc<Waiter>, fs: Arc<dyn FsCapability>) -> ScanService {
        let tx = {
            let mut slot = pool_slot().lock().unwrap();
            match slot.as_mut() {
                Some(state) => {
                    state.refcount += 1;
                    state.tx.clone()
                }
                None => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    spawn_workers(rx);
                    *slot = Some(PoolState {
                        refcount: 1,
                        tx: tx.clone(),
                    });
                    debug!("扫描工作池已创建 ({} 协程)", SCAN_WORKERS);
                    tx
                }
            }
        };

        ScanService {
            cookie: Arc::new(Cookie { waiter }),
            fs,
            tx,
        }
    }

    /// 发起一次目录扫描；调用方轮询请求的 completed 标志
    pub fn scan(&self, target: NodeDbId, target_path: PathBuf) -> Arc<ScanRequest> {
        let request = Arc::new(ScanRequest {
            target,
            target_path,
            completed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            results: StdMutex::new(Vec::new()),
            cookie: Arc::downgrade(&self.cookie),
        });

        let job = PoolJob {
            request: request.clone(),
            fs: self.fs.clone(),
        };
        if self.tx.send(job).is_err() {
            // 池已拆除（不应发生）：标记失败，让调用方下轮重试
            request.failed.store(true, Ordering::Release);
            request.completed.store(true, Ordering::Release);
        }

        request
    }
}

impl Drop for ScanService {
    fn drop(&mut self) {
        let mut slot = pool_slot().lock().unwrap();
        if let Some(state) = slot.as_mut() {
            state.refcount -= 1;
            if state.refcount == 0 {
                // 丢掉发送端，工作协程读到 None 退出
                *slot = None;
                debug!("扫描工作池已释放");
            }
        }
    }
}

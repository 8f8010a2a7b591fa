// 并行度控制器
//
// 回答"当前允许多少个分片传输并发"：
// - 基线取 max(4, 处理器数)
// - 可用内存占比低于阈值时减半，下限 2
// - 队列的并发操作数和单操作内的分片并发都受该值约束，
//   保证在途传输总量对移动端射频和内存是合理的

use parking_lot::Mutex;
use sysinfo::System;
use tokio::sync::watch;
use tracing::{debug, info};

/// 资源受限时的并行度下限
pub const REDUCED_PARALLELISM: usize = 2;

/// 并行度基线下限
const BASELINE_PARALLELISM: usize = 4;

/// 触发降级的可用内存占比阈值
const MEMORY_PRESSURE_RATIO: f64 = 0.1;

/// 单个操作内的分片请求并发上限
pub const OPERATION_CHUNK_PARALLELISM: usize = 5;

/// 并行度控制器
pub struct ParallelismController {
    /// 系统信息探测器
    system: Mutex<System>,
    /// 当前并行度（watch 对外可观察）
    current: watch::Sender<usize>,
}

impl std::fmt::Debug for ParallelismController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelismController")
            .field("current", &self.current())
            .finish()
    }
}

impl ParallelismController {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();

        let initial = Self::compute(&system);
        info!("并行度控制器初始化: 并行度={}", initial);

        let (current, _) = watch::channel(initial);
        Self {
            system: Mutex::new(system),
            current,
        }
    }

    /// 由当前系统状态计算并行度
    fn compute(system: &System) -> usize {
        let cpu_count = system.cpus().len().max(
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        );
        let parallelism = BASELINE_PARALLELISM.max(cpu_count);

        // 内存吃紧时减半降载
        let total = system.total_memory();
        if total > 0 {
            let ratio = system.available_memory() as f64 / total as f64;
            if ratio < MEMORY_PRESSURE_RATIO {
                return REDUCED_PARALLELISM.max(parallelism / 2);
            }
        }

        parallelism
    }

    /// 重新探测系统状态并更新并行度
    pub fn recompute(&self) -> usize {
        let value = {
            let mut system = self.system.lock();
            system.refresh_cpu();
            system.refresh_memory();
            Self::compute(&system)
        };

        let old = *self.current.borrow();
        if old != value {
            info!("并行度调整: {} -> {}", old, value);
            let _ = self.current.send(value);
        } else {
            debug!("并行度不变: {}", value);
        }
        value
    }

    /// 当前并行度
    pub fn current(&self) -> usize {
        *self.current.borrow()
    }

    /// 订阅并行度变化
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.current.subscribe()
    }

    /// 队列允许的并发操作数
    ///
    /// `configured` 非 0 时作为上限参与约束
    pub fn operation_limit(&self, configured: usize) -> usize {
        let current = self.current();
        if configured == 0 {
            current
        } else {
            current.min(configured).max(1)
        }
    }

    /// 单操作内允许的分片并发数
    pub fn chunk_limit(&self, configured: usize) -> usize {
        let cap = if configured == 0 {
            OPERATION_CHUNK_PARALLELISM
        } else {
            configured.min(OPERATION_CHUNK_PARALLELISM)
        };
        self.current().min(cap).max(1)
    }
}

impl Default for ParallelismController {
    fn default() -> Self {
        Self::new()
    }
}

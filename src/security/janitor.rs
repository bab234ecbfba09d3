/// 后台清扫任务
///
/// 按固定间隔跑四个互相独立的子清扫：空闲连接、过期限流窗口、
/// 过期滥用事件、过期封禁。任何一个子清扫的结果都不影响其它子清扫。
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::security::gateway::SecurityGateway;

/// 周期清扫器
pub struct Janitor {
    gateway: Arc<SecurityGateway>,
    interval: Duration,
}

/// 运行中清扫任务的句柄，用于优雅停机
pub struct JanitorHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl JanitorHandle {
    /// 通知任务退出并等待收尾
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }

    /// 仅发出停止信号，不等待
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Janitor {
    pub fn new(gateway: Arc<SecurityGateway>) -> Self {
        let interval = gateway.config().janitor_interval();
        Self { gateway, interval }
    }

    pub fn with_interval(gateway: Arc<SecurityGateway>, interval: Duration) -> Self {
        Self { gateway, interval }
    }

    /// 启动后台任务
    pub fn spawn(self) -> JanitorHandle {
        let (tx, mut rx) = watch::channel(false);
        let gateway = self.gateway;
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // 第一跳立即触发，跳过它
            ticker.tick().await;
            info!("🧹 清扫任务启动，间隔 {:?}", interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_sweep(&gateway);
                    }
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            info!("清扫任务退出");
                            break;
                        }
                    }
                }
            }
        });

        JanitorHandle {
            shutdown: tx,
            handle,
        }
    }
}

/// 跑一轮清扫：四个子清扫各自独立执行并记录
///
/// 空闲连接清扫会回调宿主的 ConnectionCloser，其实现不受本 crate 控制，
/// 任何一个子清扫 panic 都不允许波及其余子清扫或杀掉清扫任务本身。
fn run_sweep(gateway: &SecurityGateway) {
    sweep_step("空闲连接", || gateway.sweep_idle_connections());
    sweep_step("限流 key", || gateway.rate_limiter().cleanup());
    sweep_step("滥用数据", || gateway.abuse_engine().cleanup_old_data());
    sweep_step("过期封禁", || gateway.blocks().evict_expired());
}

fn sweep_step(label: &str, step: impl FnOnce() -> usize) {
    match catch_unwind(AssertUnwindSafe(step)) {
        Ok(removed) if removed > 0 => debug!("🧹 回收{}: {}", label, removed),
        Ok(_) => {}
        Err(_) => error!("清扫子步骤 {} panic，本轮跳过", label),
    }
}

//! 优雅关闭
//!
//! 根 CancellationToken 派生出每查询子 token，关闭时级联取消；
//! 关闭原因通过 watch 通道对外可见，drain 在宽限期内等活跃查询归零。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// 前台中断（Ctrl+C 或 quit 命令）
    Interrupt,
    /// 部署层终止（SIGTERM）
    Terminate,
    /// 致命错误，放弃宽限期之外的等待
    Fatal(String),
}

/// 关闭信号管理器：持有根 token 与宽限期
pub struct ShutdownManager {
    root: CancellationToken,
    reason_tx: watch::Sender<Option<ShutdownReason>>,
    /// 关闭后等待活跃查询收尾的宽限期
    grace: Duration,
}

impl ShutdownManager {
    pub fn new(grace: Duration) -> Self {
        let (reason_tx, _) = watch::channel(None);
        Self {
            root: CancellationToken::new(),
            reason_tx,
            grace,
        }
    }

    /// 根 token；关闭时级联取消所有 child_token
    pub fn token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// 每查询子 token
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// 触发关闭；重复调用保留第一个原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        self.reason_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        self.root.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }

    /// 已触发的关闭原因
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason_tx.borrow().clone()
    }

    /// 订阅关闭原因变化
    pub fn subscribe(&self) -> watch::Receiver<Option<ShutdownReason>> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.root.cancelled().await;
    }

    /// 宽限期内等 active 归零；超时返回 false
    pub async fn drain(&self, active: &AtomicUsize) -> bool {
        let deadline = Instant::now() + self.grace;
        while active.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    /// 监听系统信号，任一到达即触发关闭（每进程调用一次）
    pub fn watch_signals(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let reason = next_signal().await;
            tracing::info!(reason = ?reason, "shutdown signal caught, draining active queries");
            manager.shutdown(reason);
        });
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

/// 阻塞到第一个关闭信号到达
#[cfg(unix)]
async fn next_signal() -> ShutdownReason {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("SIGTERM handler unavailable ({}), falling back to Ctrl+C only", e);
            let _ = tokio::signal::ctrl_c().await;
            return ShutdownReason::Interrupt;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => ShutdownReason::Interrupt,
        _ = sigterm.recv() => ShutdownReason::Terminate,
    }
}

#[cfg(not(unix))]
async fn next_signal() -> ShutdownReason {
    let _ = tokio::signal::ctrl_c().await;
    ShutdownReason::Interrupt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_cascades_to_child_tokens() {
        let manager = ShutdownManager::default();
        let child = manager.child_token();
        assert!(!manager.is_shutdown());
        assert!(!child.is_cancelled());

        manager.shutdown(ShutdownReason::Interrupt);
        assert!(manager.is_shutdown());
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::default();
        manager.shutdown(ShutdownReason::Terminate);
        manager.shutdown(ShutdownReason::Fatal("late".to_string()));
        assert_eq!(manager.reason(), Some(ShutdownReason::Terminate));
    }

    #[tokio::test]
    async fn test_drain_returns_when_active_hits_zero() {
        let manager = ShutdownManager::new(Duration::from_secs(5));
        let active = Arc::new(AtomicUsize::new(1));

        let countdown = Arc::clone(&active);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            countdown.store(0, Ordering::SeqCst);
        });

        assert!(manager.drain(&active).await);
    }

    #[tokio::test]
    async fn test_drain_gives_up_after_grace() {
        let manager = ShutdownManager::new(Duration::from_millis(100));
        let active = AtomicUsize::new(1);
        let started = Instant::now();
        assert!(!manager.drain(&active).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}

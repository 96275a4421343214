use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

use crate::latch::ShutdownLatch;

/// 关闭信号类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM - 优雅关闭
    Term,

    /// SIGINT - Ctrl+C
    Interrupt,

    /// 手动触发
    Manual,
}

/// 信号处理器：把进程终止信号转发到关闭闩
pub struct SignalHandler {
    latch: Arc<ShutdownLatch>,
}

impl SignalHandler {
    pub fn new(latch: Arc<ShutdownLatch>) -> Self {
        Self { latch }
    }

    pub fn latch(&self) -> &Arc<ShutdownLatch> {
        &self.latch
    }

    /// 等待系统信号并触发关闭闩
    ///
    /// 重复信号只记录日志，闩保证清理只执行一次。
    #[cfg(unix)]
    pub async fn wait_for_system_signal(&self) -> std::io::Result<ShutdownSignal> {
        use signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        let received = tokio::select! {
            _ = sigterm.recv() => ShutdownSignal::Term,
            _ = sigint.recv() => ShutdownSignal::Interrupt,
            _ = self.latch.wait() => ShutdownSignal::Manual,
        };
        self.forward(received);
        Ok(received)
    }

    /// 等待系统信号（非 unix 平台只有 Ctrl+C）
    #[cfg(not(unix))]
    pub async fn wait_for_system_signal(&self) -> std::io::Result<ShutdownSignal> {
        let received = tokio::select! {
            res = signal::ctrl_c() => {
                res?;
                ShutdownSignal::Interrupt
            }
            _ = self.latch.wait() => ShutdownSignal::Manual,
        };
        self.forward(received);
        Ok(received)
    }

    /// 持续监听系统信号，直到进程退出
    ///
    /// 第一个信号触发关闭闩，之后的每个信号都记录为重复请求。
    /// 只有信号注册失败时返回。
    #[cfg(unix)]
    pub async fn listen(&self) -> std::io::Result<()> {
        use signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        loop {
            let received = tokio::select! {
                Some(()) = sigterm.recv() => ShutdownSignal::Term,
                Some(()) = sigint.recv() => ShutdownSignal::Interrupt,
                else => return Ok(()),
            };
            self.forward(received);
        }
    }

    #[cfg(not(unix))]
    pub async fn listen(&self) -> std::io::Result<()> {
        loop {
            signal::ctrl_c().await?;
            self.forward(ShutdownSignal::Interrupt);
        }
    }

    /// 手动触发关闭
    pub fn trigger_shutdown(&self) -> bool {
        self.forward(ShutdownSignal::Manual)
    }

    pub(crate) fn forward(&self, received: ShutdownSignal) -> bool {
        if self.latch.trigger() {
            info!(signal = ?received, "Shutdown triggered");
            true
        } else {
            if received != ShutdownSignal::Manual {
                warn!(signal = ?received, "Shutdown already in progress");
            }
            false
        }
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// 一次性关闭闩
///
/// 无论信号重复到达还是正常退出与信号同时发生，`trigger` 只有第一次返回 true，
/// 清理流程以此为准只执行一次。
#[derive(Debug, Default)]
pub struct ShutdownLatch {
    triggered: AtomicBool,
    notify: Notify,
}

impl ShutdownLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// 触发关闭，仅第一次调用返回 true
    pub fn trigger(&self) -> bool {
        let first = self
            .triggered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// 等待触发（已触发时立即返回）
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_trigger_once() {
        let latch = ShutdownLatch::new();
        assert!(!latch.is_triggered());
        assert!(latch.trigger());
        assert!(!latch.trigger());
        assert!(latch.is_triggered());
    }

    #[tokio::test]
    async fn test_concurrent_trigger_single_winner() {
        let latch = Arc::new(ShutdownLatch::new());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let latch = latch.clone();
            tasks.push(tokio::spawn(async move { latch.trigger() }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_wait_wakes_all_waiters() {
        let latch = Arc::new(ShutdownLatch::new());
        let a = tokio::spawn({
            let latch = latch.clone();
            async move { latch.wait().await }
        });
        let b = tokio::spawn({
            let latch = latch.clone();
            async move { latch.wait().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        latch.trigger();

        tokio::time::timeout(Duration::from_secs(1), async {
            a.await.unwrap();
            b.await.unwrap();
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_wait_after_trigger_returns() {
        let latch = ShutdownLatch::new();
        latch.trigger();
        tokio_test::block_on(latch.wait());
    }
}

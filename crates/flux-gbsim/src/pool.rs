// 设备池
// 持有全部模拟设备，负责错峰启动、汇总统计和只执行一次的关闭

use flux_shutdown::ShutdownLatch;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::device::{DeviceConfig, RegistrationStatus, SimDevice};
use crate::media::MediaSource;

/// 设备池汇总统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub devices: usize,
    pub registered: usize,
    pub active_relays: usize,
    /// 各中继最近 1 秒字节数之和
    pub last_second_bytes: u64,
    pub total_bytes: u64,
    pub total_packets: u64,
}

impl PoolStats {
    pub fn megabytes_per_second(&self) -> f64 {
        self.last_second_bytes as f64 / (1024.0 * 1024.0)
    }
}

pub struct DevicePool {
    devices: Vec<Arc<SimDevice>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    latch: ShutdownLatch,
    start_stagger: Duration,
    join_timeout: Duration,
}

impl DevicePool {
    pub fn new(configs: Vec<DeviceConfig>, media: Arc<dyn MediaSource>) -> Self {
        let devices = configs
            .into_iter()
            .map(|config| Arc::new(SimDevice::new(config, media.clone())))
            .collect();
        Self::from_devices(devices)
    }

    pub fn from_devices(devices: Vec<Arc<SimDevice>>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            devices,
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
            latch: ShutdownLatch::new(),
            start_stagger: Duration::from_millis(500),
            join_timeout: Duration::from_secs(5),
        }
    }

    /// 相邻设备启动间隔
    pub fn with_start_stagger(mut self, stagger: Duration) -> Self {
        self.start_stagger = stagger;
        self
    }

    /// 关闭时等待单台设备退出的上限
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn devices(&self) -> &[Arc<SimDevice>] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn is_shut_down(&self) -> bool {
        self.latch.is_triggered()
    }

    /// 依次启动全部设备，返回实际启动的数量
    ///
    /// 错峰期间收到关闭请求时停止启动剩余设备。
    pub async fn start(&self) -> usize {
        let mut started = 0;

        for (i, device) in self.devices.iter().enumerate() {
            if self.latch.is_triggered() {
                break;
            }
            if i > 0 && !self.start_stagger.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.start_stagger) => {}
                    _ = self.latch.wait() => break,
                }
            }

            let device = device.clone();
            let rx = self.shutdown_tx.subscribe();
            let handle = tokio::spawn(async move {
                if let Err(e) = device.run(rx).await {
                    tracing::error!(
                        target: "gbsim::pool",
                        device_id = %device.device_id(),
                        error = %e,
                        "Device exited with error"
                    );
                }
            });
            self.tasks.lock().await.push(handle);
            started += 1;
        }

        tracing::info!(target: "gbsim::pool", started, total = self.devices.len(), "Device pool started");
        started
    }

    /// 汇总统计
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            devices: self.devices.len(),
            ..PoolStats::default()
        };

        for device in &self.devices {
            if device.status() == RegistrationStatus::Registered {
                stats.registered += 1;
            }
            for relay in device.relay_stats() {
                stats.active_relays += 1;
                stats.last_second_bytes += relay.last_second_bytes;
                stats.total_bytes += relay.total_bytes;
                stats.total_packets += relay.total_packets;
            }
        }
        stats
    }

    /// 关闭设备池，只有第一次调用执行清理
    ///
    /// 通知全部设备循环退出，等待各循环在限定时间内结束（超时则中止任务），
    /// 最后停止残留的中继和推流进程。
    pub async fn shutdown(&self) -> bool {
        if !self.latch.trigger() {
            tracing::debug!(target: "gbsim::pool", "Shutdown already performed");
            return false;
        }
        tracing::info!(target: "gbsim::pool", devices = self.devices.len(), "Shutting down device pool");

        self.shutdown_tx.send_replace(true);

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for mut task in tasks {
            if tokio::time::timeout(self.join_timeout, &mut task).await.is_err() {
                tracing::warn!(target: "gbsim::pool", "Device loop did not exit in time, aborting");
                task.abort();
            }
        }

        let mut relays = 0;
        for device in &self.devices {
            relays += device.relays().stop_all().await;
            device.registry().clear();
        }

        tracing::info!(target: "gbsim::pool", leftover_relays = relays, "Device pool stopped");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::NullSource;

    fn configs(n: usize) -> Vec<DeviceConfig> {
        (0..n)
            .map(|i| DeviceConfig::new(format!("3402000000132000{:04}", i + 1), "127.0.0.1", 9))
            .collect()
    }

    #[tokio::test]
    async fn test_stats_of_idle_pool() {
        let pool = DevicePool::new(configs(2), Arc::new(NullSource));
        let stats = pool.stats();
        assert_eq!(stats.devices, 2);
        assert_eq!(stats.registered, 0);
        assert_eq!(stats.active_relays, 0);
        assert_eq!(stats.megabytes_per_second(), 0.0);
    }

    #[tokio::test]
    async fn test_shutdown_runs_once() {
        let pool = DevicePool::new(configs(2), Arc::new(NullSource)).with_start_stagger(Duration::ZERO);
        assert_eq!(pool.start().await, 2);

        let (a, b) = tokio::join!(pool.shutdown(), pool.shutdown());
        assert!(a ^ b);
        assert!(!pool.shutdown().await);
        assert!(pool.is_shut_down());
    }

    #[tokio::test]
    async fn test_start_after_shutdown_starts_nothing() {
        let pool = DevicePool::new(configs(1), Arc::new(NullSource));
        pool.shutdown().await;
        assert_eq!(pool.start().await, 0);
    }
}

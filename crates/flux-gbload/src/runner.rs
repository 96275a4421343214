// 并发拉流压测
// 收集目标 -> 限并发拉流 -> 失败的目标重试一轮

use flux_shutdown::ShutdownLatch;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::client::{channel_id_of, device_id_of, LiveTarget, PlatformClient};
use crate::error::{LoadError, Result};
use crate::stats::GlobalStats;

#[derive(Debug, Clone)]
pub struct LoadConfig {
    /// 每台设备最多拉取的通道数，0 表示不限
    pub per_device_limit: usize,
    /// 每路播放时长
    pub play_duration: Duration,
    /// 同时进行的拉流数
    pub concurrency: usize,
    pub device_page_size: usize,
    pub channel_page_size: usize,
    pub stats_interval: Duration,
    /// 第一轮失败的目标是否再拉一次
    pub retry_failed: bool,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            per_device_limit: 0,
            play_duration: Duration::from_secs(300),
            concurrency: 20,
            device_page_size: 100,
            channel_page_size: 200,
            stats_interval: Duration::from_secs(1),
            retry_failed: true,
        }
    }
}

/// 压测结果
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub targets: usize,
    /// 第一轮失败的目标
    pub failed: Vec<LiveTarget>,
    /// 重试后仍失败的目标
    pub still_failed: Vec<LiveTarget>,
    /// 两轮合计收到的字节
    pub total_bytes: u64,
    pub elapsed: Duration,
}

enum Outcome {
    Played,
    Failed,
    /// 关闭期间未开始
    Skipped,
}

#[derive(Clone)]
pub struct LoadTester {
    client: Arc<PlatformClient>,
    config: LoadConfig,
    stats: Arc<GlobalStats>,
    shutdown: Arc<ShutdownLatch>,
}

impl LoadTester {
    pub fn new(client: PlatformClient, config: LoadConfig) -> Self {
        Self {
            client: Arc::new(client),
            config,
            stats: Arc::new(GlobalStats::new()),
            shutdown: Arc::new(ShutdownLatch::new()),
        }
    }

    /// 触发后正在播放的流立即结束，尚未开始的不再开始
    pub fn with_shutdown(mut self, latch: Arc<ShutdownLatch>) -> Self {
        self.shutdown = latch;
        self
    }

    pub fn stats(&self) -> &Arc<GlobalStats> {
        &self.stats
    }

    pub fn config(&self) -> &LoadConfig {
        &self.config
    }

    /// 分页查询全部设备及其通道，展开为拉流目标
    ///
    /// 缺少 ID 的设备或通道被跳过；通道上限在跳过之前按查询顺序截断。
    pub async fn collect_targets(&self) -> Result<Vec<LiveTarget>> {
        let devices = self.client.devices(self.config.device_page_size).await?;
        tracing::info!(target: "gbload::runner", devices = devices.len(), base_url = self.client.base_url(), "Devices found");

        let mut targets = Vec::new();
        for device in &devices {
            let Some(device_id) = device_id_of(device) else {
                continue;
            };
            let mut channels = self
                .client
                .channels(&device_id, self.config.channel_page_size)
                .await?;
            if self.config.per_device_limit > 0 {
                channels.truncate(self.config.per_device_limit);
            }
            targets.extend(
                channels
                    .iter()
                    .filter_map(channel_id_of)
                    .map(|channel_id| LiveTarget::new(device_id.clone(), channel_id)),
            );
        }

        tracing::info!(target: "gbload::runner", targets = targets.len(), "Live targets collected");
        Ok(targets)
    }

    /// 拉取一路流直到播放时长用完、流结束或收到关闭
    ///
    /// 收到过数据且没有出错才算成功。
    pub async fn pull(&self, target: &LiveTarget) -> bool {
        let key = target.stream_key();
        self.stats.register(&key);
        let result = self.pull_stream(target, &key).await;
        self.stats.unregister(&key);

        match result {
            Ok(bytes) if bytes > 0 => {
                tracing::debug!(target: "gbload::runner", bytes, "Stream finished");
                true
            }
            Ok(_) => {
                tracing::warn!(target: "gbload::runner", "Stream ended without data");
                false
            }
            Err(e) => {
                tracing::warn!(target: "gbload::runner", error = %e, "Stream failed");
                false
            }
        }
    }

    async fn pull_stream(&self, target: &LiveTarget, key: &str) -> Result<u64> {
        let mut resp = self.client.open_live(target).await?;
        let deadline = tokio::time::Instant::now() + self.config.play_duration;
        let read_timeout = self.client.timeout();
        let mut received = 0u64;

        loop {
            let chunk = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                _ = self.shutdown.wait() => break,
                res = tokio::time::timeout(read_timeout, resp.chunk()) => match res {
                    Ok(chunk) => chunk?,
                    Err(_) => return Err(LoadError::Stalled(key.to_string())),
                },
            };
            match chunk {
                Some(bytes) => {
                    received += bytes.len() as u64;
                    self.stats.add_bytes(key, bytes.len() as u64);
                }
                None => break,
            }
        }
        Ok(received)
    }

    /// 以限定并发拉取一组目标，返回失败的目标（按设备/通道排序）
    pub async fn run_round(&self, targets: &[LiveTarget]) -> Vec<LiveTarget> {
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut set = JoinSet::new();

        for target in targets.iter().cloned() {
            let tester = self.clone();
            let permits = permits.clone();
            let span = tracing::info_span!("gbload.pull", stream = %target);
            set.spawn(
                async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return (target, Outcome::Skipped);
                    };
                    if tester.shutdown.is_triggered() {
                        return (target, Outcome::Skipped);
                    }
                    let outcome = if tester.pull(&target).await {
                        Outcome::Played
                    } else {
                        Outcome::Failed
                    };
                    (target, outcome)
                }
                .instrument(span),
            );
        }

        let mut failed = Vec::new();
        let mut skipped = 0usize;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((target, Outcome::Failed)) => failed.push(target),
                Ok((_, Outcome::Skipped)) => skipped += 1,
                Ok((_, Outcome::Played)) => {}
                Err(e) => tracing::error!(target: "gbload::runner", error = %e, "Pull task panicked"),
            }
        }
        if skipped > 0 {
            tracing::info!(target: "gbload::runner", skipped, "Streams not started due to shutdown");
        }

        failed.sort();
        failed
    }

    /// 完整压测：收集目标，拉流一轮，失败的再重试一轮
    pub async fn run(&self) -> Result<LoadReport> {
        let started = Instant::now();
        let targets = self.collect_targets().await?;
        tracing::info!(
            target: "gbload::runner",
            targets = targets.len(),
            concurrency = self.config.concurrency,
            duration_secs = self.config.play_duration.as_secs(),
            "Starting concurrent live pulls"
        );

        let reporter = self.stats.spawn_reporter(self.config.stats_interval);
        let failed = self.run_round(&targets).await;
        reporter.abort();
        let mut total_bytes = self.stats.snapshot().total_bytes;

        let mut still_failed = Vec::new();
        if !failed.is_empty() && self.config.retry_failed && !self.shutdown.is_triggered() {
            tracing::warn!(target: "gbload::runner", failed = failed.len(), "Retrying failed streams");
            self.stats.reset();
            let retry_started = Instant::now();

            let reporter = self.stats.spawn_reporter(self.config.stats_interval);
            still_failed = self.run_round(&failed).await;
            reporter.abort();
            total_bytes += self.stats.snapshot().total_bytes;

            tracing::info!(
                target: "gbload::runner",
                elapsed_secs = retry_started.elapsed().as_secs_f64(),
                still_failed = still_failed.len(),
                "Retry round finished"
            );
        }

        Ok(LoadReport {
            targets: targets.len(),
            failed,
            still_failed,
            total_bytes,
            elapsed: started.elapsed(),
        })
    }
}

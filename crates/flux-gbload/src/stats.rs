// 全局拉流统计
// 各路流登记自己的字节数，汇报任务每个周期输出一次全局快照

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsSnapshot {
    /// 当前正在播放的路数
    pub active_streams: usize,
    /// 当前活动流已收字节之和
    pub active_bytes: u64,
    /// 本轮累计字节（含已结束的流）
    pub total_bytes: u64,
    /// 自本轮第一路流登记起的时长
    pub play_duration: Duration,
}

impl StatsSnapshot {
    pub fn total_megabytes(&self) -> f64 {
        self.total_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// 线程安全的全局统计
pub struct GlobalStats {
    streams: DashMap<String, u64>,
    total_bytes: AtomicU64,
    epoch: Instant,
    /// 首路流登记时刻（相对 epoch 的毫秒数加 1，0 表示尚未开始）
    started_at: AtomicU64,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalStats {
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
            total_bytes: AtomicU64::new(0),
            epoch: Instant::now(),
            started_at: AtomicU64::new(0),
        }
    }

    fn now_mark(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    pub fn register(&self, stream_key: &str) {
        let _ = self
            .started_at
            .compare_exchange(0, self.now_mark(), Ordering::AcqRel, Ordering::Acquire);
        self.streams.insert(stream_key.to_string(), 0);
    }

    pub fn unregister(&self, stream_key: &str) {
        self.streams.remove(stream_key);
    }

    /// 未登记的流不计数
    pub fn add_bytes(&self, stream_key: &str, bytes: u64) {
        if let Some(mut received) = self.streams.get_mut(stream_key) {
            *received += bytes;
            self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let started = self.started_at.load(Ordering::Acquire);
        let play_duration = if started == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(self.now_mark().saturating_sub(started))
        };

        StatsSnapshot {
            active_streams: self.streams.len(),
            active_bytes: self.streams.iter().map(|e| *e.value()).sum(),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            play_duration,
        }
    }

    /// 开始新一轮统计（重试轮）
    pub fn reset(&self) {
        self.streams.clear();
        self.total_bytes.store(0, Ordering::Relaxed);
        self.started_at.store(0, Ordering::Release);
    }

    /// 周期性输出全局快照，调用方负责 abort
    pub fn spawn_reporter(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let stats = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            let mut last_total = 0u64;
            loop {
                ticker.tick().await;
                let snap = stats.snapshot();
                let delta = snap.total_bytes.saturating_sub(last_total);
                last_total = snap.total_bytes;
                tracing::info!(
                    target: "gbload::stats",
                    streams = snap.active_streams,
                    play_secs = snap.play_duration.as_secs(),
                    "Global: {:.3} MB total, {:.3} MB/s",
                    snap.total_megabytes(),
                    delta as f64 / (1024.0 * 1024.0) / period.as_secs_f64()
                );
            }
        })
    }
}

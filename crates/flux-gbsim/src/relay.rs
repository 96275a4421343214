// UDP 中继
// 推流源发到本地临时端口，中继原样转发到平台给出的目标地址，并按秒统计带宽

use dashmap::DashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::media::{FeedHandle, FeedRequest, MediaSource};
use crate::session::{SessionKey, SessionRegistry};
use crate::{Result, SimError};

const SAMPLE_WINDOW: Duration = Duration::from_secs(1);

/// 中继配置
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// 无数据超过该时长自动停止
    pub idle_timeout: Duration,
    /// 单次接收等待（空闲检查粒度）
    pub recv_timeout: Duration,
    /// 停止时等待转发任务退出的上限
    pub join_timeout: Duration,
    /// 本地监听地址
    pub bind_ip: IpAddr,
    pub buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(15),
            recv_timeout: Duration::from_secs(1),
            join_timeout: Duration::from_millis(500),
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            buffer_size: 65536,
        }
    }
}

/// 单个中继的流量计数
#[derive(Debug, Default)]
pub struct RelayCounters {
    last_window_bytes: AtomicU64,
    total_bytes: AtomicU64,
    total_packets: AtomicU64,
}

/// 中继流量快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStat {
    pub key: SessionKey,
    pub local_port: u16,
    /// 最近一个 1 秒窗口的字节数
    pub last_second_bytes: u64,
    pub total_bytes: u64,
    pub total_packets: u64,
}

struct RelayHandle {
    generation: u64,
    local_port: u16,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    feed: FeedHandle,
    counters: Arc<RelayCounters>,
}

struct RelayShared {
    device_id: String,
    relays: DashMap<SessionKey, RelayHandle>,
    registry: Arc<SessionRegistry>,
    media: Arc<dyn MediaSource>,
}

impl RelayShared {
    /// 中继空闲自停：只移除自己这一代的条目，不等待自身任务
    async fn expire(&self, key: &SessionKey, generation: u64) {
        let Some((_, handle)) = self
            .relays
            .remove_if(key, |_, h| h.generation == generation)
        else {
            return;
        };
        self.registry.forget(key);
        self.media.stop(handle.feed).await;
    }
}

/// 中继引擎（每台设备一个）
///
/// 中继表与会话登记表的读改写都在 DashMap 分片锁内完成，网络 I/O 不持锁。
#[derive(Clone)]
pub struct RelayEngine {
    shared: Arc<RelayShared>,
    config: RelayConfig,
    next_generation: Arc<AtomicU64>,
}

impl RelayEngine {
    pub fn new(
        device_id: impl Into<String>,
        registry: Arc<SessionRegistry>,
        media: Arc<dyn MediaSource>,
        config: RelayConfig,
    ) -> Self {
        Self {
            shared: Arc::new(RelayShared {
                device_id: device_id.into(),
                relays: DashMap::new(),
                registry,
                media,
            }),
            config,
            next_generation: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.shared.registry
    }

    pub fn media(&self) -> &Arc<dyn MediaSource> {
        &self.shared.media
    }

    /// 启动中继，返回本地监听端口
    ///
    /// 同键已有中继时先停止旧的再启动。
    ///
    /// # 参数
    ///
    /// * `key` - 会话键（含转发目标）
    /// * `label` - 推流水印文字
    ///
    /// # 错误
    ///
    /// 本地端口绑定失败时返回 `Network`
    pub async fn start(&self, key: SessionKey, label: &str) -> Result<u16> {
        if self.shared.relays.contains_key(&key) {
            let busy = SimError::ResourceBusy(key.to_string());
            tracing::info!(target: "gbsim::relay", reason = %busy, "Restarting relay");
            self.stop(&key).await;
        }

        let sock_in = UdpSocket::bind(SocketAddr::new(self.config.bind_ip, 0)).await?;
        let local_port = sock_in.local_addr()?.port();
        let out_ip = match key.target {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let sock_out = UdpSocket::bind(SocketAddr::new(out_ip, 0)).await?;

        let feed = match self
            .shared
            .media
            .start(FeedRequest {
                device_id: &self.shared.device_id,
                key: &key,
                label,
                local_port,
            })
            .await
        {
            Ok(feed) => feed,
            Err(e) => {
                tracing::warn!(
                    target: "gbsim::relay",
                    session = %key,
                    error = %e,
                    "Media feed failed to start, relay stays up"
                );
                FeedHandle::none()
            }
        };

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let counters = Arc::new(RelayCounters::default());
        let (stop_tx, stop_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();

        let task = tokio::spawn(relay_loop(RelayLoop {
            shared: self.shared.clone(),
            key: key.clone(),
            generation,
            sock_in,
            sock_out,
            idle_timeout: self.config.idle_timeout,
            recv_timeout: self.config.recv_timeout,
            buffer_size: self.config.buffer_size,
            counters: counters.clone(),
            stop_rx,
            ready_rx,
        }));

        let handle = RelayHandle {
            generation,
            local_port,
            stop_tx,
            task,
            feed,
            counters,
        };
        if let Some(old) = self.shared.relays.insert(key.clone(), handle) {
            self.shutdown_handle(old).await;
        }
        let _ = ready_tx.send(());

        tracing::info!(
            target: "gbsim::relay",
            device_id = %self.shared.device_id,
            session = %key,
            local_port,
            "Relay started"
        );
        Ok(local_port)
    }

    /// 停止中继（幂等：不存在的键直接返回 false）
    pub async fn stop(&self, key: &SessionKey) -> bool {
        let Some((_, handle)) = self.shared.relays.remove(key) else {
            return false;
        };
        self.shared.registry.forget(key);
        self.shutdown_handle(handle).await;
        tracing::info!(
            target: "gbsim::relay",
            device_id = %self.shared.device_id,
            session = %key,
            "Relay stopped"
        );
        true
    }

    /// 停止某通道下的全部中继，返回停止数量
    pub async fn stop_by_channel(&self, channel_id: &str) -> usize {
        let keys: Vec<SessionKey> = self
            .shared
            .relays
            .iter()
            .filter(|e| e.key().belongs_to(channel_id))
            .map(|e| e.key().clone())
            .collect();
        self.stop_keys(keys).await
    }

    /// 停止全部中继，返回停止数量
    pub async fn stop_all(&self) -> usize {
        let keys = self.keys();
        self.stop_keys(keys).await
    }

    async fn stop_keys(&self, keys: Vec<SessionKey>) -> usize {
        let mut stopped = 0;
        for key in keys {
            if self.stop(&key).await {
                stopped += 1;
            }
        }
        stopped
    }

    async fn shutdown_handle(&self, handle: RelayHandle) {
        let RelayHandle {
            stop_tx,
            mut task,
            feed,
            ..
        } = handle;
        let _ = stop_tx.send(true);
        if tokio::time::timeout(self.config.join_timeout, &mut task)
            .await
            .is_err()
        {
            task.abort();
        }
        self.shared.media.stop(feed).await;
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.shared.relays.contains_key(key)
    }

    pub fn local_port(&self, key: &SessionKey) -> Option<u16> {
        self.shared.relays.get(key).map(|h| h.local_port)
    }

    pub fn keys(&self) -> Vec<SessionKey> {
        self.shared.relays.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.shared.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.relays.is_empty()
    }

    /// 各中继的流量快照
    pub fn stats(&self) -> Vec<RelayStat> {
        self.shared
            .relays
            .iter()
            .map(|e| RelayStat {
                key: e.key().clone(),
                local_port: e.local_port,
                last_second_bytes: e.counters.last_window_bytes.load(Ordering::Relaxed),
                total_bytes: e.counters.total_bytes.load(Ordering::Relaxed),
                total_packets: e.counters.total_packets.load(Ordering::Relaxed),
            })
            .collect()
    }
}

struct RelayLoop {
    shared: Arc<RelayShared>,
    key: SessionKey,
    generation: u64,
    sock_in: UdpSocket,
    sock_out: UdpSocket,
    idle_timeout: Duration,
    recv_timeout: Duration,
    buffer_size: usize,
    counters: Arc<RelayCounters>,
    stop_rx: watch::Receiver<bool>,
    ready_rx: oneshot::Receiver<()>,
}

async fn relay_loop(ctx: RelayLoop) {
    let RelayLoop {
        shared,
        key,
        generation,
        sock_in,
        sock_out,
        idle_timeout,
        recv_timeout,
        buffer_size,
        counters,
        mut stop_rx,
        ready_rx,
    } = ctx;

    // 等到条目登记进中继表再开始计时
    if ready_rx.await.is_err() {
        return;
    }

    let target = key.target;
    let mut buf = vec![0u8; buffer_size];
    let mut last_recv = Instant::now();
    let mut window_start = Instant::now();
    let mut window_bytes: u64 = 0;

    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            res = tokio::time::timeout(recv_timeout, sock_in.recv_from(&mut buf)) => {
                match res {
                    Ok(Ok((len, _))) => {
                        if let Err(e) = sock_out.send_to(&buf[..len], target).await {
                            tracing::debug!(target: "gbsim::relay", session = %key, error = %e, "Forward failed");
                        }
                        last_recv = Instant::now();
                        window_bytes += len as u64;
                        counters.total_bytes.fetch_add(len as u64, Ordering::Relaxed);
                        counters.total_packets.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Err(e)) => {
                        tracing::debug!(target: "gbsim::relay", session = %key, error = %e, "Relay receive failed");
                    }
                    Err(_) => {}
                }
            }
        }

        if *stop_rx.borrow() {
            break;
        }

        let now = Instant::now();
        if now.duration_since(last_recv) > idle_timeout {
            tracing::info!(
                target: "gbsim::relay",
                device_id = %shared.device_id,
                session = %key,
                idle_secs = idle_timeout.as_secs_f64(),
                "Relay idle, stopping"
            );
            shared.expire(&key, generation).await;
            break;
        }

        let elapsed = now.duration_since(window_start);
        if elapsed >= SAMPLE_WINDOW {
            let mbps = window_bytes as f64 / (1024.0 * 1024.0) / elapsed.as_secs_f64();
            counters.last_window_bytes.store(window_bytes, Ordering::Relaxed);
            tracing::debug!(
                target: "gbsim::relay",
                session = %key,
                dest = %target,
                "Bandwidth {:.3} MB/s",
                mbps
            );
            window_bytes = 0;
            window_start = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::NullSource;
    use crate::session::DialogId;

    fn engine(idle: Duration) -> RelayEngine {
        RelayEngine::new(
            "dev",
            Arc::new(SessionRegistry::new()),
            Arc::new(NullSource),
            RelayConfig {
                idle_timeout: idle,
                recv_timeout: Duration::from_millis(50),
                ..RelayConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_relay_forwards_datagrams() {
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = sink.local_addr().unwrap();
        let relays = engine(Duration::from_secs(10));
        let key = SessionKey::new("CH1", target);

        let port = relays.start(key.clone(), "CH1").await.unwrap();
        let feeder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        feeder.send_to(b"hello-ps", ("127.0.0.1", port)).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), sink.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"hello-ps");

        let stat = relays.stats().pop().unwrap();
        assert_eq!(stat.total_bytes, 8);
        assert_eq!(stat.total_packets, 1);
        assert!(relays.stop(&key).await);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let relays = engine(Duration::from_secs(10));
        let key = SessionKey::new("CH1", "127.0.0.1:5004".parse().unwrap());
        relays.registry().record(DialogId::from("abc"), key.clone());
        relays.start(key.clone(), "CH1").await.unwrap();

        let (a, b) = tokio::join!(relays.stop(&key), relays.stop(&key));
        assert!(a ^ b);
        assert!(!relays.stop(&key).await);
        assert!(relays.is_empty());
        assert_eq!(relays.registry().dialog_of(&key), None);
        assert!(relays.registry().contains_dialog(&DialogId::from("abc")));
    }

    #[tokio::test]
    async fn test_restart_same_key_replaces_relay() {
        let relays = engine(Duration::from_secs(10));
        let key = SessionKey::new("CH1", "127.0.0.1:5004".parse().unwrap());
        let first = relays.start(key.clone(), "CH1").await.unwrap();
        let second = relays.start(key.clone(), "CH1").await.unwrap();

        assert_eq!(relays.len(), 1);
        assert_eq!(relays.local_port(&key), Some(second));
        assert_ne!(first, second);
        relays.stop_all().await;
    }

    #[tokio::test]
    async fn test_same_channel_different_ports_coexist() {
        let relays = engine(Duration::from_secs(10));
        let a = SessionKey::new("CH1", "127.0.0.1:5004".parse().unwrap());
        let b = SessionKey::new("CH1", "127.0.0.1:5006".parse().unwrap());
        let c = SessionKey::new("CH2", "127.0.0.1:5008".parse().unwrap());
        relays.start(a.clone(), "CH1").await.unwrap();
        relays.start(b.clone(), "CH1").await.unwrap();
        relays.start(c.clone(), "CH2").await.unwrap();
        assert_eq!(relays.len(), 3);

        assert_eq!(relays.stop_by_channel("CH1").await, 2);
        assert_eq!(relays.keys(), vec![c]);
        assert_eq!(relays.stop_all().await, 1);
        assert_eq!(relays.stop_all().await, 0);
    }

    #[tokio::test]
    async fn test_idle_relay_stops_itself() {
        let relays = engine(Duration::from_millis(200));
        let key = SessionKey::new("CH1", "127.0.0.1:5004".parse().unwrap());
        relays.registry().record(DialogId::from("abc"), key.clone());
        relays.start(key.clone(), "CH1").await.unwrap();
        assert!(relays.contains(&key));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!relays.contains(&key));
        assert_eq!(
            relays.registry().resolve_and_clear(&DialogId::from("abc")),
            Some(std::collections::HashSet::new())
        );
    }

    #[tokio::test]
    async fn test_idle_stop_does_not_remove_newer_relay() {
        let relays = engine(Duration::from_millis(200));
        let key = SessionKey::new("CH1", "127.0.0.1:5004".parse().unwrap());
        relays.start(key.clone(), "CH1").await.unwrap();

        // 反复重启，旧一代的空闲自停不能误删新一代
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            relays.start(key.clone(), "CH1").await.unwrap();
        }
        assert!(relays.contains(&key));
        relays.stop(&key).await;
    }
}

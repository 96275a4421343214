// 集成测试辅助：回环地址上的脚本化平台
#![allow(dead_code)]

use flux_gbsim::device::{DeviceConfig, DeviceTiming, RegistrationStatus, SimDevice};
use flux_gbsim::sip::{SipMessage, SipMethod, SipRequest, SipResponse};
use flux_gbsim::NullSource;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const DEVICE_ID: &str = "34020000001320000001";
pub const CHANNEL_ID: &str = "34020000001320000101";
pub const PLATFORM_ID: &str = "34020000002000000001";

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// 测试用快速定时
pub fn fast_timing() -> DeviceTiming {
    DeviceTiming {
        heartbeat_interval: Duration::from_secs(30),
        relay_idle_timeout: Duration::from_secs(30),
        register_retry: Duration::from_secs(1),
        register_expires: Duration::from_secs(3600),
        poll_interval: Duration::from_millis(50),
    }
}

pub struct FakePlatform {
    pub socket: UdpSocket,
    pub addr: SocketAddr,
}

impl FakePlatform {
    pub async fn bind() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        Self { socket, addr }
    }

    pub fn device_config(&self) -> DeviceConfig {
        let mut config = DeviceConfig::new(DEVICE_ID, "127.0.0.1", self.addr.port());
        config.name = "测试设备".to_string();
        config.timing = fast_timing();
        config
    }

    /// 接收下一条消息，超时视为测试失败
    pub async fn recv(&self) -> (SipMessage, SocketAddr) {
        self.try_recv(RECV_TIMEOUT)
            .await
            .expect("platform timed out waiting for a message")
    }

    pub async fn try_recv(&self, wait: Duration) -> Option<(SipMessage, SocketAddr)> {
        let mut buf = vec![0u8; 65536];
        let (len, from) = tokio::time::timeout(wait, self.socket.recv_from(&mut buf))
            .await
            .ok()?
            .unwrap();
        Some((SipMessage::parse(&buf[..len]).unwrap(), from))
    }

    /// 跳过其他消息，直到收到指定方法的请求
    pub async fn recv_request(&self, method: SipMethod) -> (SipRequest, SocketAddr) {
        loop {
            if let (SipMessage::Request(req), from) = self.recv().await {
                if req.method == method {
                    return (req, from);
                }
            }
        }
    }

    /// 跳过其他消息，直到收到对指定方法的响应
    pub async fn recv_response(&self, method: SipMethod) -> SipResponse {
        loop {
            if let (SipMessage::Response(resp), _) = self.recv().await {
                if resp.cseq_method() == Some(method.clone()) {
                    return resp;
                }
            }
        }
    }

    pub async fn send(&self, text: &str, to: SocketAddr) {
        self.socket.send_to(text.as_bytes(), to).await.unwrap();
    }

    /// 等待 REGISTER 并按给定状态码应答，返回设备信令地址
    pub async fn answer_register(&self, status: u16, extra: &[(&str, &str)]) -> (SipRequest, SocketAddr) {
        let (req, from) = self.recv_request(SipMethod::Register).await;
        let reason = if status == 200 { "OK" } else { "Unauthorized" };
        self.send(&reply(&req, status, reason, extra), from).await;
        (req, from)
    }

    /// 平台发往设备的请求
    pub fn request(
        &self,
        method: &str,
        user: Option<&str>,
        device: SocketAddr,
        call_id: &str,
        extra: &[(&str, &str)],
        body: Option<(&str, &str)>,
    ) -> String {
        let uri = match user {
            Some(user) => format!("sip:{}@{}", user, device),
            None => format!("sip:{}", device),
        };
        let mut text = format!("{} {} SIP/2.0\r\n", method, uri);
        text.push_str(&format!("Via: SIP/2.0/UDP {};branch=z9hG4bK{}\r\n", self.addr, call_id));
        text.push_str(&format!("From: <sip:{}@{}>;tag=plat{}\r\n", PLATFORM_ID, self.addr, call_id));
        text.push_str(&format!("To: <{}>\r\n", uri));
        text.push_str(&format!("Call-ID: {}\r\n", call_id));
        text.push_str(&format!("CSeq: 20 {}\r\n", method));
        for (name, value) in extra {
            text.push_str(&format!("{}: {}\r\n", name, value));
        }
        match body {
            Some((content_type, body)) => {
                text.push_str(&format!("Content-Type: {}\r\n", content_type));
                text.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
            }
            None => text.push_str("Content-Length: 0\r\n\r\n"),
        }
        text
    }
}

/// 按请求回填对话头部生成响应
pub fn reply(req: &SipRequest, status: u16, reason: &str, extra: &[(&str, &str)]) -> String {
    let mut text = format!("SIP/2.0 {} {}\r\n", status, reason);
    for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
        if let Some(value) = req.headers.get(name) {
            text.push_str(&format!("{}: {}\r\n", name, value));
        }
    }
    for (name, value) in extra {
        text.push_str(&format!("{}: {}\r\n", name, value));
    }
    text.push_str("Content-Length: 0\r\n\r\n");
    text
}

pub fn offer_sdp(target: SocketAddr, ssrc: &str) -> String {
    format!(
        "v=0\r\no={} 0 0 IN IP4 {}\r\ns=Play\r\nc=IN IP4 {}\r\nt=0 0\r\nm=video {} RTP/AVP 96\r\na=recvonly\r\na=rtpmap:96 PS/90000\r\ny={}\r\n",
        PLATFORM_ID,
        target.ip(),
        target.ip(),
        target.port(),
        ssrc
    )
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn spawn_device(device: Arc<SimDevice>) -> (watch::Sender<bool>, JoinHandle<()>) {
    init_tracing();
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        device.run(rx).await.unwrap();
    });
    (tx, handle)
}

/// 启动设备并完成注册
pub async fn registered_device(
    platform: &FakePlatform,
    config: DeviceConfig,
) -> (Arc<SimDevice>, SocketAddr, watch::Sender<bool>, JoinHandle<()>) {
    let device = Arc::new(SimDevice::new(config, Arc::new(NullSource)));
    let (tx, handle) = spawn_device(device.clone());
    let (_, addr) = platform.answer_register(200, &[]).await;
    wait_status(&device, RegistrationStatus::Registered).await;
    (device, addr, tx, handle)
}

pub async fn wait_status(device: &SimDevice, status: RegistrationStatus) {
    let mut rx = device.subscribe_status();
    tokio::time::timeout(RECV_TIMEOUT, rx.wait_for(|s| *s == status))
        .await
        .expect("status did not change in time")
        .unwrap();
}

/// 轮询直到条件成立
pub async fn eventually<F: Fn() -> bool>(wait: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + wait;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

pub async fn stop_device(tx: watch::Sender<bool>, handle: JoinHandle<()>) {
    tx.send_replace(true);
    tokio::time::timeout(RECV_TIMEOUT, handle).await.unwrap().unwrap();
}

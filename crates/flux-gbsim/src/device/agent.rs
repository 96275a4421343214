// 设备信令循环
// 单个接收点按到达顺序处理入站消息，接收超时同时作为定时检查的节拍

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::Instrument;

use super::channel::{build_channels, Channel};
use super::registration::{RegistrationAction, RegistrationState, RegistrationStatus};
use super::DeviceConfig;
use crate::contact::{bind_ip, ContactResolver, RouteProbeResolver};
use crate::media::MediaSource;
use crate::relay::{RelayConfig, RelayEngine, RelayStat};
use crate::session::{DialogId, SessionKey, SessionRegistry};
use crate::sip::builder::{self, LocalParty};
use crate::sip::digest::{local_nonce, DigestChallenge};
use crate::sip::manscdp::{self, BasicParam, CmdType, ManscdpQuery};
use crate::sip::message::{header_tag, uri_user, SipMessage, SipMethod, SipRequest, SipResponse};
use crate::sip::sdp::{build_answer, generate_ssrc, parse_session_initiation};
use crate::sip::IdentityGenerator;
use crate::{Result, SimError};

const REQUIRED_HEADERS: [&str; 5] = ["Via", "From", "To", "Call-ID", "CSeq"];
const RECV_BUFFER: usize = 65536;

/// 模拟设备
///
/// 构造时生成固定的 tag、Call-ID 前缀和通道目录；[`SimDevice::run`] 绑定信令端口
/// 并一直运行到收到停止信号，退出前停止本设备的全部中继。
pub struct SimDevice {
    config: DeviceConfig,
    channels: Vec<Channel>,
    identity: IdentityGenerator,
    relays: RelayEngine,
    contact_resolver: Arc<dyn ContactResolver>,
    status: watch::Sender<RegistrationStatus>,
}

/// 一次运行期间的网络上下文
struct Link {
    socket: UdpSocket,
    platform: SocketAddr,
    contact_ip: String,
    local_port: u16,
}

/// 单次运行的注册上下文
struct RegisterContext {
    state: RegistrationState,
    challenge: Option<DigestChallenge>,
}

impl SimDevice {
    pub fn new(config: DeviceConfig, media: Arc<dyn MediaSource>) -> Self {
        let channels = build_channels(&config.device_id, &config.name, config.channel_count);
        let relays = RelayEngine::new(
            config.device_id.clone(),
            Arc::new(SessionRegistry::new()),
            media,
            RelayConfig {
                idle_timeout: config.timing.relay_idle_timeout,
                ..RelayConfig::default()
            },
        );
        let (status, _) = watch::channel(RegistrationStatus::Unregistered);

        Self {
            config,
            channels,
            identity: IdentityGenerator::new(),
            relays,
            contact_resolver: Arc::new(RouteProbeResolver),
            status,
        }
    }

    pub fn with_contact_resolver(mut self, resolver: Arc<dyn ContactResolver>) -> Self {
        self.contact_resolver = resolver;
        self
    }

    /// 替换中继参数（空闲超时仍以设备定时参数为准）
    pub fn with_relay_config(mut self, config: RelayConfig) -> Self {
        self.relays = RelayEngine::new(
            self.config.device_id.clone(),
            self.relays.registry().clone(),
            self.relays.media().clone(),
            RelayConfig {
                idle_timeout: self.config.timing.relay_idle_timeout,
                ..config
            },
        );
        self
    }

    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn relays(&self) -> &RelayEngine {
        &self.relays
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.relays.registry()
    }

    pub fn status(&self) -> RegistrationStatus {
        *self.status.borrow()
    }

    /// 订阅注册状态变化
    pub fn subscribe_status(&self) -> watch::Receiver<RegistrationStatus> {
        self.status.subscribe()
    }

    pub fn relay_stats(&self) -> Vec<RelayStat> {
        self.relays.stats()
    }

    /// 运行设备直到 `shutdown` 变为 true（或发送端被丢弃）
    ///
    /// # 错误
    ///
    /// 平台地址解析或信令端口绑定失败时返回错误；进入循环后的错误只记录日志。
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let link = self.connect().await?;
        let device_id = self.config.device_id.as_str();

        tracing::info!(
            target: "gbsim::device",
            %device_id,
            local = %format!("{}:{}", link.contact_ip, link.local_port),
            platform = %link.platform,
            channels = self.channels.len(),
            "Device started"
        );

        let mut reg = RegisterContext {
            state: RegistrationState::new(&self.config.timing),
            challenge: None,
        };
        if reg.state.start(Instant::now()) == RegistrationAction::SendRegister {
            self.send_register(&link, &reg).await;
        }
        self.publish_status(reg.state.status());

        let mut buf = vec![0u8; RECV_BUFFER];
        let poll = self.config.timing.poll_interval;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {}
                res = tokio::time::timeout(poll, link.socket.recv_from(&mut buf)) => {
                    match res {
                        Ok(Ok((len, from))) => {
                            self.handle_datagram(&link, &mut reg, &buf[..len], from).await;
                        }
                        Ok(Err(e)) => {
                            let err = SimError::from(e);
                            tracing::warn!(target: "gbsim::device", %device_id, error = %err, "Receive failed");
                        }
                        Err(_) => {}
                    }
                }
            }

            if shutdown_requested(&shutdown) {
                break;
            }

            for action in reg.state.poll(Instant::now()) {
                match action {
                    RegistrationAction::SendRegister => self.send_register(&link, &reg).await,
                    RegistrationAction::SendHeartbeat => self.send_heartbeat(&link).await,
                }
            }
            self.publish_status(reg.state.status());
        }

        let stopped = self.relays.stop_all().await;
        self.registry().clear();
        self.publish_status(RegistrationStatus::Unregistered);
        tracing::info!(target: "gbsim::device", %device_id, relays = stopped, "Device stopped");
        Ok(())
    }

    async fn connect(&self) -> Result<Link> {
        let platform = tokio::net::lookup_host((self.config.platform_ip.as_str(), self.config.platform_port))
            .await?
            .next()
            .ok_or_else(|| {
                SimError::Config(format!("Cannot resolve platform address {}", self.config.platform_ip))
            })?;

        let local: IpAddr = self
            .config
            .local_ip
            .parse()
            .map_err(|_| SimError::Config(format!("Invalid local ip: {}", self.config.local_ip)))?;
        let bind = SocketAddr::new(bind_ip(local, platform.ip()), self.config.local_port);

        let socket = UdpSocket::bind(bind).await?;
        let bound = socket.local_addr()?;
        let contact_ip = self.contact_resolver.resolve(bound, platform).to_string();

        Ok(Link {
            socket,
            platform,
            contact_ip,
            local_port: bound.port(),
        })
    }

    fn local_party<'a>(&'a self, link: &'a Link) -> LocalParty<'a> {
        LocalParty {
            device_id: &self.config.device_id,
            contact_ip: &link.contact_ip,
            local_port: link.local_port,
            platform: link.platform,
            identity: &self.identity,
        }
    }

    fn publish_status(&self, status: RegistrationStatus) {
        self.status.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }

    async fn send(&self, link: &Link, text: String, to: SocketAddr) {
        tracing::trace!(target: "gbsim::sip", device_id = %self.config.device_id, remote = %to, "Sending:\n{}", text);
        if let Err(e) = link.socket.send_to(text.as_bytes(), to).await {
            let err = SimError::from(e);
            tracing::warn!(
                target: "gbsim::sip",
                device_id = %self.config.device_id,
                remote = %to,
                error = %err,
                "Send failed"
            );
        }
    }

    async fn send_register(&self, link: &Link, reg: &RegisterContext) {
        let (realm, nonce) = match &reg.challenge {
            Some(ch) if self.config.honor_challenge => (
                ch.realm.clone().unwrap_or_else(|| self.config.realm.clone()),
                ch.nonce.clone(),
            ),
            _ => (self.config.realm.clone(), local_nonce()),
        };
        let req = builder::register_request(
            &self.local_party(link),
            &realm,
            &self.config.password,
            &nonce,
            self.config.timing.register_expires.as_secs(),
        );
        tracing::debug!(target: "gbsim::device", device_id = %self.config.device_id, "Sending REGISTER");
        self.send(link, req.to_string(), link.platform).await;
    }

    async fn send_heartbeat(&self, link: &Link) {
        let body = manscdp::keepalive_xml(&self.config.device_id, self.identity.next_sn());
        let req = builder::heartbeat_request(&self.local_party(link), body);
        tracing::debug!(target: "gbsim::device", device_id = %self.config.device_id, "Sending keepalive");
        self.send(link, req.to_string(), link.platform).await;
    }

    async fn handle_datagram(&self, link: &Link, reg: &mut RegisterContext, data: &[u8], from: SocketAddr) {
        let message = match SipMessage::parse(data) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(
                    target: "gbsim::sip",
                    device_id = %self.config.device_id,
                    remote = %from,
                    error = %e,
                    "Dropping datagram"
                );
                return;
            }
        };
        tracing::trace!(
            target: "gbsim::sip",
            device_id = %self.config.device_id,
            remote = %from,
            "Received:\n{}",
            String::from_utf8_lossy(data)
        );

        match message {
            SipMessage::Response(resp) => self.handle_response(link, reg, resp),
            SipMessage::Request(req) => {
                if let Some(missing) = REQUIRED_HEADERS.iter().find(|h| !req.headers.contains(h)) {
                    tracing::warn!(
                        target: "gbsim::sip",
                        device_id = %self.config.device_id,
                        remote = %from,
                        method = %req.method,
                        "Dropping request without {} header",
                        missing
                    );
                    return;
                }

                let span = tracing::info_span!(
                    "gbsim.sip.request",
                    device_id = %self.config.device_id,
                    method = %req.method,
                    call_id = req.call_id().unwrap_or_default(),
                    remote = %from
                );
                if let Err(e) = self.handle_request(link, req, from).instrument(span).await {
                    tracing::warn!(
                        target: "gbsim::sip",
                        device_id = %self.config.device_id,
                        remote = %from,
                        error = %e,
                        "Request handling failed"
                    );
                }
            }
        }
    }

    fn handle_response(&self, link: &Link, reg: &mut RegisterContext, resp: SipResponse) {
        if resp.cseq_method() != Some(SipMethod::Register) {
            tracing::debug!(
                target: "gbsim::sip",
                device_id = %self.config.device_id,
                status = resp.status_code,
                "Ignoring response"
            );
            return;
        }
        let expected = self.identity.call_id(&link.contact_ip);
        if resp.call_id() != Some(expected.as_str()) {
            tracing::debug!(
                target: "gbsim::sip",
                device_id = %self.config.device_id,
                call_id = resp.call_id().unwrap_or_default(),
                "REGISTER response for another dialog"
            );
            return;
        }

        match reg.state.on_response(resp.status_code, Instant::now()) {
            Ok(true) => {
                reg.challenge = None;
                tracing::info!(target: "gbsim::device", device_id = %self.config.device_id, "Registered");
            }
            Ok(false) => {}
            Err(e) => {
                reg.challenge = resp
                    .headers
                    .get("WWW-Authenticate")
                    .or_else(|| resp.headers.get("Proxy-Authenticate"))
                    .and_then(DigestChallenge::parse);
                tracing::warn!(
                    target: "gbsim::device",
                    device_id = %self.config.device_id,
                    error = %e,
                    "Registration rejected"
                );
            }
        }
        self.publish_status(reg.state.status());
    }

    async fn handle_request(&self, link: &Link, req: SipRequest, from: SocketAddr) -> Result<()> {
        match req.method {
            SipMethod::Invite => self.handle_invite(link, &req, from).await,
            SipMethod::Bye => self.handle_bye(link, &req, from).await,
            SipMethod::Message => self.handle_message(link, &req, from).await,
            SipMethod::Subscribe => self.handle_subscribe(link, &req, from).await,
            SipMethod::Ack => Ok(()),
            _ => {
                let resp = builder::ok_response(&req, &self.local_party(link))?;
                self.send(link, resp.to_string(), from).await;
                Ok(())
            }
        }
    }

    /// INVITE：应答 SDP 后按 `通道@目标` 启动中继并登记到 Call-ID 下
    async fn handle_invite(&self, link: &Link, req: &SipRequest, from: SocketAddr) -> Result<()> {
        let offer = match parse_session_initiation(req.body.as_deref()) {
            Ok(offer) => offer,
            Err(e) => {
                tracing::warn!(target: "gbsim::device", error = %e, "INVITE without usable target, no stream started");
                return Ok(());
            }
        };

        let local = self.local_party(link);
        let ssrc = offer.ssrc.clone().unwrap_or_else(generate_ssrc);
        let sdp = build_answer(&self.config.device_id, &link.contact_ip, 0, &ssrc, offer.format.as_deref());
        let resp = builder::invite_ok(req, &local, sdp)?;
        self.send(link, resp.to_string(), from).await;

        let channel_id = self.resolve_channel(req.uri_user());
        let label = self
            .channels
            .iter()
            .find(|c| c.id == channel_id)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| channel_id.clone());
        let key = SessionKey::new(channel_id, offer.target);

        tracing::info!(target: "gbsim::device", session = %key, %ssrc, "Starting stream");
        let local_port = self.relays.start(key.clone(), &label).await?;
        if let Some(call_id) = req.call_id() {
            self.registry().record(DialogId::new(call_id), key.clone());
        }
        tracing::debug!(target: "gbsim::device", session = %key, local_port, "Stream started");
        Ok(())
    }

    fn resolve_channel(&self, uri_user: Option<&str>) -> String {
        uri_user
            .map(str::to_string)
            .or_else(|| self.channels.first().map(|c| c.id.clone()))
            .unwrap_or_else(|| self.config.device_id.clone())
    }

    /// BYE：先应答，再按 Call-ID 精确停止；对话未知时按通道停止，仍无通道则全部停止
    ///
    /// 已知对话的键若已因空闲超时摘光，BYE 只是空操作，不会波及同通道的其它会话。
    async fn handle_bye(&self, link: &Link, req: &SipRequest, from: SocketAddr) -> Result<()> {
        let resp = builder::ok_response(req, &self.local_party(link))?;
        self.send(link, resp.to_string(), from).await;

        let dialog = DialogId::new(req.call_id().unwrap_or_default());
        match self.registry().resolve_and_clear(&dialog) {
            Some(keys) => {
                let mut stopped = 0;
                for key in &keys {
                    if self.relays.stop(key).await {
                        stopped += 1;
                    }
                }
                tracing::info!(target: "gbsim::device", %dialog, sessions = stopped, "Stream stopped by dialog");
            }
            None => match req.uri_user() {
                Some(channel_id) => {
                    let stopped = self.relays.stop_by_channel(channel_id).await;
                    tracing::info!(target: "gbsim::device", %dialog, channel_id, sessions = stopped, "Stream stopped by channel");
                }
                None => {
                    let stopped = self.relays.stop_all().await;
                    tracing::info!(target: "gbsim::device", %dialog, sessions = stopped, "All streams stopped");
                }
            },
        }
        Ok(())
    }

    async fn handle_message(&self, link: &Link, req: &SipRequest, from: SocketAddr) -> Result<()> {
        let local = self.local_party(link);
        let query = match req.body.as_deref().filter(|b| !b.trim().is_empty()) {
            Some(body) => ManscdpQuery::parse(body)?,
            None => {
                let resp = builder::ok_response(req, &local)?;
                self.send(link, resp.to_string(), from).await;
                return Ok(());
            }
        };
        let sn = query.sn_or_now();

        tracing::info!(target: "gbsim::device", cmd_type = %query.cmd_type, %sn, "MESSAGE query");
        match query.kind() {
            CmdType::DeviceInfo => {
                let body = manscdp::device_info_xml(&self.config.device_id, &self.config.name, &sn);
                let resp = builder::manscdp_ok(req, &local, body)?;
                self.send(link, resp.to_string(), from).await;
            }
            CmdType::DeviceStatus => {
                let body = manscdp::device_status_xml(&self.config.device_id, &sn);
                let resp = builder::manscdp_ok(req, &local, body)?;
                self.send(link, resp.to_string(), from).await;
            }
            CmdType::ConfigDownload => {
                let param = BasicParam {
                    device_id: &self.config.device_id,
                    name: &self.config.name,
                    ip: &link.contact_ip,
                    port: link.local_port,
                    password: &self.config.password,
                };
                let body = manscdp::config_download_xml(&param, &sn);
                let resp = builder::manscdp_ok(req, &local, body)?;
                self.send(link, resp.to_string(), from).await;
            }
            CmdType::Catalog => {
                // 先回 200，再以新的 MESSAGE 把目录发给平台
                let resp = builder::ok_response(req, &local)?;
                self.send(link, resp.to_string(), from).await;

                let platform_id = self.sender_id(req);
                let body = manscdp::catalog_xml(
                    &self.config.device_id,
                    &self.channels,
                    &sn,
                    query.info_id.as_deref(),
                );
                let msg = builder::catalog_message(&local, &platform_id, body);
                self.send(link, msg.to_string(), link.platform).await;
                tracing::info!(target: "gbsim::device", channels = self.channels.len(), "Catalog sent");
            }
            CmdType::Other => {
                let resp = builder::ok_response(req, &local)?;
                self.send(link, resp.to_string(), from).await;
            }
        }
        Ok(())
    }

    async fn handle_subscribe(&self, link: &Link, req: &SipRequest, from: SocketAddr) -> Result<()> {
        let local = self.local_party(link);
        let is_catalog = req
            .headers
            .get("Event")
            .and_then(|e| e.split(';').next())
            .map(|e| e.trim().eq_ignore_ascii_case("catalog"))
            .unwrap_or(false);

        if !is_catalog {
            let resp = builder::ok_response(req, &local)?;
            self.send(link, resp.to_string(), from).await;
            return Ok(());
        }

        let query = req
            .body
            .as_deref()
            .filter(|b| !b.trim().is_empty())
            .map(ManscdpQuery::parse)
            .transpose()?;
        let sn = query
            .as_ref()
            .map(|q| q.sn_or_now())
            .unwrap_or_else(manscdp::now_sn);
        let ok_device_id = query
            .as_ref()
            .and_then(|q| q.device_id.clone())
            .unwrap_or_else(|| self.config.device_id.clone());

        let resp = builder::subscribe_ok(req, &local, manscdp::subscribe_result_xml(&ok_device_id, &sn))?;
        self.send(link, resp.to_string(), from).await;

        let from_header = req.headers.get("From").unwrap_or_default();
        let expires = req
            .headers
            .get("Expires")
            .and_then(|v| v.trim().parse::<u32>().ok());
        let body = manscdp::catalog_xml(
            &self.config.device_id,
            &self.channels,
            &sn,
            query.as_ref().and_then(|q| q.info_id.as_deref()),
        );
        let notify = builder::catalog_notify(
            &local,
            &self.sender_id(req),
            header_tag(from_header),
            expires,
            body,
        );
        self.send(link, notify.to_string(), from).await;
        tracing::info!(target: "gbsim::device", ?expires, channels = self.channels.len(), "Catalog subscription notified");
        Ok(())
    }

    /// 请求发起方（平台）的 SIP 编码
    fn sender_id(&self, req: &SipRequest) -> String {
        req.headers
            .get("From")
            .and_then(uri_user)
            .map(str::to_string)
            .unwrap_or_else(|| self.config.platform_id.clone())
    }
}

fn shutdown_requested(rx: &watch::Receiver<bool>) -> bool {
    // 发送端被丢弃同样视为停止
    *rx.borrow() || rx.has_changed().is_err()
}

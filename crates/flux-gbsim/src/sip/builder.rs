// 设备侧 SIP 消息构造
// 请求由设备主动发往平台，响应按入站请求回填对话头部

use super::digest::{authorization_header, DigestCredentials};
use super::identity::{random_hex, IdentityGenerator};
use super::manscdp::MANSCDP_CONTENT_TYPE;
use super::message::{header_tag, SipMethod, SipRequest, SipResponse};
use crate::{Result, SimError};
use std::net::SocketAddr;

pub const USER_AGENT: &str = "GB28181-Device/1.0";
const MAX_FORWARDS: &str = "70";

/// 构造消息所需的设备侧上下文
#[derive(Debug, Clone, Copy)]
pub struct LocalParty<'a> {
    pub device_id: &'a str,
    /// 对外通告的可路由地址
    pub contact_ip: &'a str,
    pub local_port: u16,
    pub platform: SocketAddr,
    pub identity: &'a IdentityGenerator,
}

impl<'a> LocalParty<'a> {
    fn via(&self) -> String {
        format!(
            "SIP/2.0/UDP {}:{};branch={}",
            self.contact_ip,
            self.local_port,
            self.identity.branch()
        )
    }

    fn contact(&self) -> String {
        format!("<sip:{}@{}:{}>", self.device_id, self.contact_ip, self.local_port)
    }

    fn platform_uri(&self, user: Option<&str>) -> String {
        match user {
            Some(user) => format!("sip:{}@{}", user, self.platform),
            None => format!("sip:{}", self.platform),
        }
    }

    fn device_aor(&self) -> String {
        format!("<{}>", self.platform_uri(Some(self.device_id)))
    }

    /// 设备主动请求的公共头部
    fn request(&self, method: SipMethod, uri: String, to: String, call_id: String) -> SipRequest {
        let cseq = self.identity.next_cseq();
        let mut req = SipRequest::new(method.clone(), uri);
        req.add_header("Via", self.via());
        req.add_header("From", format!("{};tag={}", self.device_aor(), self.identity.tag()));
        req.add_header("To", to);
        req.add_header("Call-ID", call_id);
        req.add_header("CSeq", format!("{} {}", cseq, method));
        req
    }

    fn fresh_call_id(&self) -> String {
        format!("{}@{}", random_hex(32), self.contact_ip)
    }
}

/// REGISTER 请求（携带单轮 Digest 鉴权）
pub fn register_request(
    local: &LocalParty<'_>,
    realm: &str,
    password: &str,
    nonce: &str,
    expires: u64,
) -> SipRequest {
    let uri = local.platform_uri(None);
    let creds = DigestCredentials {
        username: local.device_id,
        realm,
        password,
    };
    let auth = authorization_header(&creds, "REGISTER", &uri, nonce);

    let mut req = local.request(
        SipMethod::Register,
        uri,
        local.device_aor(),
        local.identity.call_id(local.contact_ip),
    );
    req.add_header("Contact", local.contact());
    req.add_header("Authorization", auth);
    req.add_header("Max-Forwards", MAX_FORWARDS);
    req.add_header("User-Agent", USER_AGENT);
    req.add_header("Expires", expires.to_string());
    req
}

/// 心跳 Keepalive MESSAGE
pub fn heartbeat_request(local: &LocalParty<'_>, body: String) -> SipRequest {
    let mut req = local.request(
        SipMethod::Message,
        local.platform_uri(None),
        local.device_aor(),
        local.fresh_call_id(),
    );
    req.add_header("Content-Type", MANSCDP_CONTENT_TYPE);
    req.add_header("User-Agent", USER_AGENT);
    req.add_header("Max-Forwards", MAX_FORWARDS);
    req.set_body(body);
    req
}

/// 目录应答 MESSAGE（设备 -> 平台）
pub fn catalog_message(local: &LocalParty<'_>, platform_id: &str, body: String) -> SipRequest {
    let target = local.platform_uri(Some(platform_id));
    let mut req = local.request(
        SipMethod::Message,
        target.clone(),
        format!("<{}>", target),
        local.fresh_call_id(),
    );
    req.add_header("Content-Type", MANSCDP_CONTENT_TYPE);
    req.add_header("User-Agent", USER_AGENT);
    req.add_header("Max-Forwards", MAX_FORWARDS);
    req.set_body(body);
    req
}

/// 目录订阅的 NOTIFY（Request-URI 与 To 指向订阅者）
pub fn catalog_notify(
    local: &LocalParty<'_>,
    platform_id: &str,
    subscriber_tag: Option<&str>,
    expires: Option<u32>,
    body: String,
) -> SipRequest {
    let target = local.platform_uri(Some(platform_id));
    let to = match subscriber_tag {
        Some(tag) => format!("<{}>;tag={}", target, tag),
        None => format!("<{}>", target),
    };
    let state = match expires {
        Some(expires) => format!("active;expires={};retry-after=0", expires),
        None => "active".to_string(),
    };

    let mut req = local.request(SipMethod::Notify, target, to, local.fresh_call_id());
    req.add_header("Content-Type", MANSCDP_CONTENT_TYPE);
    req.add_header("Event", "presence");
    req.add_header("Subscription-State", state);
    req.add_header("User-Agent", USER_AGENT);
    req.add_header("Max-Forwards", MAX_FORWARDS);
    req.set_body(body);
    req
}

/// 按入站请求生成响应：回填 Via/From/To/Call-ID/CSeq，To 缺 tag 时补设备 tag
pub fn response_to(
    req: &SipRequest,
    local: &LocalParty<'_>,
    status_code: u16,
    reason: &str,
) -> Result<SipResponse> {
    let mut resp = SipResponse::new(status_code, reason);

    for via in req.headers.get_all("Via") {
        resp.add_header("Via", rewrite_via(via, local.contact_ip));
    }
    for name in ["From", "To", "Call-ID", "CSeq"] {
        let value = req
            .headers
            .get(name)
            .ok_or_else(|| SimError::malformed(format!("Missing {} header", name)))?;
        if name == "To" && header_tag(value).is_none() {
            resp.add_header("To", format!("{};tag={}", value, local.identity.tag()));
        } else {
            resp.add_header(name, value);
        }
    }
    if !resp.headers.contains("Via") {
        return Err(SimError::malformed("Missing Via header"));
    }
    resp.add_header("User-Agent", USER_AGENT);
    Ok(resp)
}

/// 通用 200 OK
pub fn ok_response(req: &SipRequest, local: &LocalParty<'_>) -> Result<SipResponse> {
    response_to(req, local, 200, "OK")
}

/// INVITE 的 200 OK（携带应答 SDP）
pub fn invite_ok(req: &SipRequest, local: &LocalParty<'_>, sdp: String) -> Result<SipResponse> {
    let mut resp = ok_response(req, local)?;
    resp.add_header("Contact", local.contact());
    resp.add_header("Content-Type", "application/sdp");
    resp.set_body(sdp);
    Ok(resp)
}

/// 携带 MANSCDP 消息体的 200 OK
pub fn manscdp_ok(req: &SipRequest, local: &LocalParty<'_>, body: String) -> Result<SipResponse> {
    let mut resp = ok_response(req, local)?;
    resp.add_header("Content-Type", MANSCDP_CONTENT_TYPE);
    resp.set_body(body);
    Ok(resp)
}

/// SUBSCRIBE 的 200 OK（Result=OK 消息体）
pub fn subscribe_ok(req: &SipRequest, local: &LocalParty<'_>, body: String) -> Result<SipResponse> {
    let mut resp = ok_response(req, local)?;
    resp.add_header("Event", "presence");
    if let Some(expires) = req.headers.get("Expires") {
        resp.add_header("Expires", expires);
    }
    resp.add_header("Content-Type", MANSCDP_CONTENT_TYPE);
    resp.set_body(body);
    Ok(resp)
}

/// 把 Via 中不可路由的主机（`0.0.0.0`，或 contact 非回环时的 `127.0.0.1`）换成 contact 地址
pub fn rewrite_via(via: &str, contact_ip: &str) -> String {
    let Some((proto, rest)) = via.split_once(' ') else {
        return via.to_string();
    };
    let rest = rest.trim_start();
    let (sent_by, params) = match rest.find(';') {
        Some(pos) => (&rest[..pos], &rest[pos..]),
        None => (rest, ""),
    };
    let (host, port) = match sent_by.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (sent_by, None),
    };

    let unroutable = host == "0.0.0.0" || (host == "127.0.0.1" && contact_ip != "127.0.0.1");
    if !unroutable {
        return via.to_string();
    }

    match port {
        Some(port) => format!("{} {}:{}{}", proto, contact_ip, port, params),
        None => format!("{} {}{}", proto, contact_ip, params),
    }
}

// SDP 解析与生成
// 平台 INVITE 中携带推流目标，设备以 sendonly 的 PS 流应答

use crate::{Result, SimError};
use std::net::{IpAddr, SocketAddr};

/// 未给出媒体端口时使用的默认目标端口
pub const DEFAULT_MEDIA_PORT: u16 = 5004;

/// SDP 会话描述
#[derive(Debug, Clone, Default)]
pub struct SdpSession {
    /// 版本
    pub version: u8,
    /// o= 中的会话源
    pub origin: String,
    /// 会话名称
    pub session_name: String,
    /// c= 中的地址
    pub connection: Option<String>,
    /// SSRC（GB28181 使用 y= 行携带，按原文保留前导零）
    pub ssrc: Option<String>,
    /// f= 媒体参数
    pub format: Option<String>,
    /// 媒体描述
    pub media: Vec<SdpMedia>,
}

/// SDP 媒体描述
#[derive(Debug, Clone)]
pub struct SdpMedia {
    /// 媒体类型（video/audio）
    pub media_type: String,
    pub port: u16,
    pub protocol: String,
    pub formats: Vec<u8>,
    pub attributes: Vec<String>,
}

impl SdpSession {
    /// 从字符串解析 SDP（宽松解析，未知行忽略）
    pub fn from_string(sdp: &str) -> Self {
        let mut session = SdpSession::default();
        let mut current_media: Option<SdpMedia> = None;

        for line in sdp.lines() {
            let line = line.trim();
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "v" => session.version = value.trim().parse().unwrap_or(0),
                "o" => {
                    session.origin = value.split_whitespace().next().unwrap_or_default().to_string();
                }
                "s" => session.session_name = value.to_string(),
                "c" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 3 {
                        session.connection = Some(parts[2].to_string());
                    }
                }
                "y" => {
                    let v = value.trim();
                    if !v.is_empty() {
                        session.ssrc = Some(v.to_string());
                    }
                }
                "f" => session.format = Some(value.trim().to_string()),
                "m" => {
                    if let Some(media) = current_media.take() {
                        session.media.push(media);
                    }
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 3 {
                        current_media = Some(SdpMedia {
                            media_type: parts[0].to_string(),
                            port: parts[1].parse().unwrap_or(0),
                            protocol: parts[2].to_string(),
                            formats: parts[3..].iter().filter_map(|s| s.parse().ok()).collect(),
                            attributes: Vec::new(),
                        });
                    }
                }
                "a" => {
                    if let Some(ref mut media) = current_media {
                        media.attributes.push(value.to_string());
                    }
                }
                _ => {}
            }
        }

        if let Some(media) = current_media {
            session.media.push(media);
        }
        session
    }

    fn media_port(&self, media_type: &str) -> Option<u16> {
        self.media
            .iter()
            .find(|m| m.media_type.eq_ignore_ascii_case(media_type))
            .map(|m| m.port)
    }

    /// 推流目标端口：优先 video，其次 audio，否则默认端口
    pub fn target_port(&self) -> u16 {
        self.media_port("video")
            .or_else(|| self.media_port("audio"))
            .unwrap_or(DEFAULT_MEDIA_PORT)
    }
}

/// 平台在 INVITE 中给出的推流参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOffer {
    pub target: SocketAddr,
    pub ssrc: Option<String>,
    pub format: Option<String>,
}

/// 解析 INVITE 的 SDP，得到推流目标
///
/// # 错误
///
/// 没有消息体或 `c=` 中没有可用 IP 时返回 `MalformedPayload`
pub fn parse_session_initiation(body: Option<&str>) -> Result<SessionOffer> {
    let body = body
        .filter(|b| !b.trim().is_empty())
        .ok_or_else(|| SimError::malformed("INVITE without SDP body"))?;
    let sdp = SdpSession::from_string(body);

    let ip: IpAddr = sdp
        .connection
        .as_deref()
        .ok_or_else(|| SimError::malformed("SDP has no connection address"))?
        .parse()
        .map_err(|_| SimError::malformed("SDP connection address is not an IP"))?;

    Ok(SessionOffer {
        target: SocketAddr::new(ip, sdp.target_port()),
        ssrc: sdp.ssrc,
        format: sdp.format,
    })
}

/// 生成设备应答 SDP（PS/90000，sendonly）
pub fn build_answer(device_id: &str, contact_ip: &str, media_port: u16, ssrc: &str, format: Option<&str>) -> String {
    let mut sdp = String::with_capacity(256);
    sdp.push_str("v=0\r\n");
    sdp.push_str(&format!("o={} 0 0 IN IP4 {}\r\n", device_id, contact_ip));
    sdp.push_str("s=Play\r\n");
    sdp.push_str(&format!("c=IN IP4 {}\r\n", contact_ip));
    sdp.push_str("t=0 0\r\n");
    sdp.push_str(&format!("m=video {} RTP/AVP 96\r\n", media_port));
    sdp.push_str("a=rtpmap:96 PS/90000\r\n");
    sdp.push_str("a=sendonly\r\n");
    sdp.push_str(&format!("y={}\r\n", ssrc));
    if let Some(f) = format {
        sdp.push_str(&format!("f={}\r\n", f));
    }
    sdp
}

/// 对端未给出 SSRC 时按时钟生成
pub fn generate_ssrc() -> String {
    (chrono::Utc::now().timestamp_millis() % 100_000_000).to_string()
}

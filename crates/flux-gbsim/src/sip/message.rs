// SIP 消息解析和生成
// 设备侧只需要 GB28181 用到的方法子集，头部保持原始顺序

use crate::{Result, SimError};
use std::fmt;

/// SIP 方法
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Message,
    Subscribe,
    Notify,
    Info,
    Options,
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Message => "MESSAGE",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Info => "INFO",
            SipMethod::Options => "OPTIONS",
        };
        f.write_str(s)
    }
}

impl SipMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "REGISTER" => Some(SipMethod::Register),
            "INVITE" => Some(SipMethod::Invite),
            "ACK" => Some(SipMethod::Ack),
            "BYE" => Some(SipMethod::Bye),
            "CANCEL" => Some(SipMethod::Cancel),
            "MESSAGE" => Some(SipMethod::Message),
            "SUBSCRIBE" => Some(SipMethod::Subscribe),
            "NOTIFY" => Some(SipMethod::Notify),
            "INFO" => Some(SipMethod::Info),
            "OPTIONS" => Some(SipMethod::Options),
            _ => None,
        }
    }
}

/// 有序头部列表（查找不区分大小写，紧凑形式在解析时展开）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// 第一个同名头部的值
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// 紧凑头部名展开（RFC 3261 §7.3.3）
fn expand_compact(name: &str) -> &str {
    match name {
        "i" | "I" => "Call-ID",
        "v" | "V" => "Via",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "m" | "M" => "Contact",
        "l" | "L" => "Content-Length",
        "c" | "C" => "Content-Type",
        "o" | "O" => "Event",
        other => other,
    }
}

/// SIP 请求
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: String,
    pub version: String,
    pub headers: Headers,
    pub body: Option<String>,
}

impl SipRequest {
    pub fn new(method: SipMethod, uri: String) -> Self {
        Self {
            method,
            uri,
            version: "SIP/2.0".to_string(),
            headers: Headers::new(),
            body: None,
        }
    }

    /// 添加头部
    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.push(key, value);
    }

    /// 设置消息体
    pub fn set_body(&mut self, body: String) {
        self.body = Some(body);
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    /// Request-URI 的用户部分（GB28181 中为设备或通道编码）
    pub fn uri_user(&self) -> Option<&str> {
        uri_user(&self.uri)
    }

    /// 生成 SIP 请求字符串
    pub fn to_string(&self) -> String {
        let start = format!("{} {} {}", self.method, self.uri, self.version);
        render(&start, &self.headers, self.body.as_deref())
    }
}

/// SIP 响应
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub version: String,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Headers,
    pub body: Option<String>,
}

impl SipResponse {
    pub fn new(status_code: u16, reason_phrase: impl Into<String>) -> Self {
        Self {
            version: "SIP/2.0".to_string(),
            status_code,
            reason_phrase: reason_phrase.into(),
            headers: Headers::new(),
            body: None,
        }
    }

    /// 添加头部
    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.push(key, value);
    }

    /// 设置消息体
    pub fn set_body(&mut self, body: String) {
        self.body = Some(body);
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    /// CSeq 中的方法（用于把响应对应到请求）
    pub fn cseq_method(&self) -> Option<SipMethod> {
        self.headers
            .get("CSeq")
            .and_then(|v| v.split_whitespace().nth(1))
            .and_then(SipMethod::parse)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// 生成 SIP 响应字符串
    pub fn to_string(&self) -> String {
        let start = format!("{} {} {}", self.version, self.status_code, self.reason_phrase);
        render(&start, &self.headers, self.body.as_deref())
    }
}

/// SIP 消息（请求或响应）
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    /// 从 UDP 数据报解析 SIP 消息
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| SimError::malformed(format!("SIP message is not UTF-8: {}", e)))?;
        Self::from_string(text)
    }

    /// 从字符串解析 SIP 消息
    pub fn from_string(s: &str) -> Result<Self> {
        let (head, rest) = match s.find("\r\n\r\n") {
            Some(pos) => (&s[..pos], Some(&s[pos + 4..])),
            None => (s.trim_end_matches("\r\n"), None),
        };

        let mut lines = head.split("\r\n");
        let start_line = lines
            .next()
            .filter(|l| !l.trim().is_empty())
            .ok_or_else(|| SimError::malformed("Empty SIP message"))?;

        let mut headers = Headers::new();
        for line in lines {
            // 折行续接到上一个头部
            if line.starts_with(' ') || line.starts_with('\t') {
                if let Some(last) = headers.0.last_mut() {
                    last.1.push(' ');
                    last.1.push_str(line.trim());
                }
                continue;
            }
            let pos = line
                .find(':')
                .ok_or_else(|| SimError::malformed(format!("Invalid header line: {}", line)))?;
            let key = expand_compact(line[..pos].trim()).to_string();
            let value = line[pos + 1..].trim().to_string();
            headers.push(key, value);
        }

        let body = rest.and_then(|raw| {
            let declared = headers
                .get("Content-Length")
                .and_then(|v| v.parse::<usize>().ok());
            let body = match declared {
                Some(len) if len <= raw.len() && raw.is_char_boundary(len) => &raw[..len],
                _ => raw,
            };
            if body.is_empty() {
                None
            } else {
                Some(body.to_string())
            }
        });

        if start_line.starts_with("SIP/") {
            let parts: Vec<&str> = start_line.splitn(3, ' ').collect();
            if parts.len() < 2 {
                return Err(SimError::malformed("Invalid status line"));
            }
            let status_code = parts[1]
                .parse::<u16>()
                .map_err(|_| SimError::malformed("Invalid status code"))?;
            Ok(SipMessage::Response(SipResponse {
                version: parts[0].to_string(),
                status_code,
                reason_phrase: parts.get(2).copied().unwrap_or_default().to_string(),
                headers,
                body,
            }))
        } else {
            let parts: Vec<&str> = start_line.split_whitespace().collect();
            if parts.len() != 3 {
                return Err(SimError::malformed("Invalid request line"));
            }
            let method = SipMethod::parse(parts[0])
                .ok_or_else(|| SimError::malformed(format!("Unknown method: {}", parts[0])))?;
            Ok(SipMessage::Request(SipRequest {
                method,
                uri: parts[1].to_string(),
                version: parts[2].to_string(),
                headers,
                body,
            }))
        }
    }

    pub fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(req) => &req.headers,
            SipMessage::Response(resp) => &resp.headers,
        }
    }

    /// 转换为字符串
    pub fn to_string(&self) -> String {
        match self {
            SipMessage::Request(req) => req.to_string(),
            SipMessage::Response(resp) => resp.to_string(),
        }
    }
}

fn render(start_line: &str, headers: &Headers, body: Option<&str>) -> String {
    let mut result = String::with_capacity(512);
    result.push_str(start_line);
    result.push_str("\r\n");

    for (key, value) in headers.iter() {
        if key.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        result.push_str(key);
        result.push_str(": ");
        result.push_str(value);
        result.push_str("\r\n");
    }

    let body = body.unwrap_or_default();
    result.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
    result.push_str(body);
    result
}

/// `sip:user@host:port` / `<sip:user@host>;tag=x` 中的用户部分
pub fn uri_user(value: &str) -> Option<&str> {
    let start = value.find("sip:")? + 4;
    let rest = &value[start..];
    let end = rest.find('@')?;
    let user = &rest[..end];
    if user.is_empty() {
        None
    } else {
        Some(user)
    }
}

/// From/To 头部中的 tag 参数
pub fn header_tag(value: &str) -> Option<&str> {
    let pos = value.find(";tag=")?;
    let tag = &value[pos + 5..];
    let end = tag.find([';', ' ', '>']).unwrap_or(tag.len());
    if end == 0 {
        None
    } else {
        Some(&tag[..end])
    }
}

// SIP Digest 鉴权（单轮、无 qop）

use std::collections::HashMap;

/// 一次 REGISTER 鉴权所需的凭据
#[derive(Debug, Clone)]
pub struct DigestCredentials<'a> {
    pub username: &'a str,
    pub realm: &'a str,
    pub password: &'a str,
}

/// 平台在 401 中下发的挑战参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: Option<String>,
    pub nonce: String,
}

impl DigestChallenge {
    /// 解析 `WWW-Authenticate` / `Proxy-Authenticate` 头部
    pub fn parse(value: &str) -> Option<Self> {
        let params = parse_digest_params(value)?;
        let nonce = params.get("nonce")?.clone();
        Some(Self {
            realm: params.get("realm").cloned(),
            nonce,
        })
    }
}

/// 计算 HTTP Digest 响应（简化版，不使用 qop）
///
/// `HA1 = MD5(username:realm:password)`，`HA2 = MD5(method:uri)`，
/// `response = MD5(HA1:nonce:HA2)`
pub fn compute_digest_response(
    creds: &DigestCredentials<'_>,
    method: &str,
    uri: &str,
    nonce: &str,
) -> String {
    let ha1_source = format!("{}:{}:{}", creds.username, creds.realm, creds.password);
    let ha1 = format!("{:x}", md5::compute(ha1_source));

    let ha2_source = format!("{}:{}", method, uri);
    let ha2 = format!("{:x}", md5::compute(ha2_source));

    let resp_source = format!("{}:{}:{}", ha1, nonce, ha2);
    format!("{:x}", md5::compute(resp_source))
}

/// 生成 Authorization 头部的值
pub fn authorization_header(
    creds: &DigestCredentials<'_>,
    method: &str,
    uri: &str,
    nonce: &str,
) -> String {
    let response = compute_digest_response(creds, method, uri, nonce);
    format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
        creds.username, creds.realm, nonce, uri, response
    )
}

/// 本地生成的 nonce：当前 Unix 秒
pub fn local_nonce() -> String {
    chrono::Utc::now().timestamp().to_string()
}

fn parse_digest_params(value: &str) -> Option<HashMap<String, String>> {
    let rest = value.trim();
    let rest = rest.strip_prefix("Digest ").unwrap_or(rest);

    let mut map = HashMap::new();
    for part in rest.split(',') {
        let trimmed = part.trim();
        if let Some(eq_idx) = trimmed.find('=') {
            let key = trimmed[..eq_idx].trim().to_ascii_lowercase();
            let val = trimmed[eq_idx + 1..].trim();
            let val = val
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(val);
            map.insert(key, val.to_string());
        }
    }

    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn md5_hex(s: &str) -> String {
        format!("{:x}", md5::compute(s))
    }

    #[test]
    fn test_digest_response_matches_manual_computation() {
        let creds = DigestCredentials {
            username: "34020000001320000001",
            realm: "3402000000",
            password: "123456",
        };
        let uri = "sip:127.0.0.1:8809";
        let nonce = "1700000000";

        let ha1 = md5_hex("34020000001320000001:3402000000:123456");
        let ha2 = md5_hex("REGISTER:sip:127.0.0.1:8809");
        let expected = md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2));

        assert_eq!(compute_digest_response(&creds, "REGISTER", uri, nonce), expected);
        assert_eq!(expected.len(), 32);
    }

    #[test]
    fn test_authorization_header_format() {
        let creds = DigestCredentials {
            username: "dev",
            realm: "3402000000",
            password: "pw",
        };
        let header = authorization_header(&creds, "REGISTER", "sip:1.2.3.4:5060", "42");
        assert!(header.starts_with("Digest username=\"dev\", realm=\"3402000000\", nonce=\"42\""));
        assert!(header.contains("uri=\"sip:1.2.3.4:5060\""));
        assert!(header.contains("response=\""));
    }

    #[test]
    fn test_parse_challenge() {
        let ch = DigestChallenge::parse(
            "Digest realm=\"3402000000\", nonce=\"abcdef\", algorithm=MD5",
        )
        .unwrap();
        assert_eq!(ch.realm.as_deref(), Some("3402000000"));
        assert_eq!(ch.nonce, "abcdef");

        assert!(DigestChallenge::parse("Digest realm=\"x\"").is_none());
        assert!(DigestChallenge::parse("").is_none());
    }

    #[test]
    fn test_local_nonce_is_numeric() {
        assert!(local_nonce().parse::<i64>().unwrap() > 0);
    }
}

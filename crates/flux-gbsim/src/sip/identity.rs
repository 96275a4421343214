// 会话标识生成：Call-ID、branch、tag、CSeq、SN

use std::sync::atomic::{AtomicU32, Ordering};

/// Via branch 的 RFC 3261 magic cookie
pub const BRANCH_MAGIC: &str = "z9hG4bK";

/// 设备级标识生成器
///
/// tag 与 Call-ID 前缀在构造时生成一次，设备生命周期内不变；
/// CSeq 和心跳 SN 单调递增。
#[derive(Debug)]
pub struct IdentityGenerator {
    call_id_prefix: String,
    tag: String,
    cseq: AtomicU32,
    sn: AtomicU32,
}

impl IdentityGenerator {
    pub fn new() -> Self {
        let call_id_prefix = random_hex(8);
        Self {
            call_id_prefix,
            tag: random_hex(32),
            cseq: AtomicU32::new(0),
            sn: AtomicU32::new(0),
        }
    }

    /// 设备固定的对话 tag
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// 设备发起请求使用的 Call-ID（`前缀@主机`，同一设备保持一致）
    pub fn call_id(&self, host: &str) -> String {
        format!("{}@{}", self.call_id_prefix, host)
    }

    /// 下一个 CSeq
    pub fn next_cseq(&self) -> u32 {
        self.cseq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// 下一个 MANSCDP SN（心跳等设备主动消息）
    pub fn next_sn(&self) -> u32 {
        self.sn.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// 新的 Via branch
    pub fn branch(&self) -> String {
        format!("{}{}", BRANCH_MAGIC, random_hex(20))
    }
}

impl Default for IdentityGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// 取 uuid v4 的前 `len` 个十六进制字符（最多 32 个）
pub fn random_hex(len: usize) -> String {
    let mut s = uuid::Uuid::new_v4().simple().to_string();
    s.truncate(len.min(32));
    s
}

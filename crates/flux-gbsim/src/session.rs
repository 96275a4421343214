// 会话登记
// Call-ID 到中继会话键的映射，BYE 与空闲超时据此决定停哪些中继

use dashmap::DashMap;
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

/// 会话键：`通道@目标IP:目标端口`，唯一标识一个中继实例
///
/// 同一通道可以有多个不同目标端口的会话并发存在。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub channel_id: String,
    pub target: SocketAddr,
}

impl SessionKey {
    pub fn new(channel_id: impl Into<String>, target: SocketAddr) -> Self {
        Self {
            channel_id: channel_id.into(),
            target,
        }
    }

    pub fn belongs_to(&self, channel_id: &str) -> bool {
        self.channel_id == channel_id
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.channel_id, self.target)
    }
}

/// 对话标识（Call-ID）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId(String);

impl DialogId {
    pub fn new(call_id: impl Into<String>) -> Self {
        Self(call_id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DialogId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// 会话登记表
///
/// 一个会话键最多挂在一个对话下；中继停止时通过 [`SessionRegistry::forget`]
/// 摘除，不会留下指向已停止中继的键。
///
/// 键被摘光的对话仍然保留（空集合），直到 BYE 取走或整表清空，
/// 迟到的 BYE 因此只作用于自己的对话。
#[derive(Debug, Default)]
pub struct SessionRegistry {
    dialogs: DashMap<DialogId, HashSet<SessionKey>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 把会话键登记到对话下
    ///
    /// 键若已挂在其它对话下（同键重启），先从原对话摘除。
    pub fn record(&self, dialog: DialogId, key: SessionKey) {
        for mut entry in self.dialogs.iter_mut() {
            if *entry.key() != dialog {
                entry.value_mut().remove(&key);
            }
        }
        self.dialogs.entry(dialog).or_default().insert(key);
    }

    /// 取出并清除对话下的全部会话键
    ///
    /// 未知对话（或已被取走的对话）返回 `None`；已知但键已摘光的对话返回空集合。
    pub fn resolve_and_clear(&self, dialog: &DialogId) -> Option<HashSet<SessionKey>> {
        self.dialogs.remove(dialog).map(|(_, keys)| keys)
    }

    /// 中继停止后摘除其会话键，对话本身保留
    pub fn forget(&self, key: &SessionKey) {
        for mut entry in self.dialogs.iter_mut() {
            entry.value_mut().remove(key);
        }
    }

    /// 会话键当前所属的对话
    pub fn dialog_of(&self, key: &SessionKey) -> Option<DialogId> {
        self.dialogs
            .iter()
            .find(|entry| entry.value().contains(key))
            .map(|entry| entry.key().clone())
    }

    pub fn contains_dialog(&self, dialog: &DialogId) -> bool {
        self.dialogs.contains_key(dialog)
    }

    pub fn dialog_count(&self) -> usize {
        self.dialogs.len()
    }

    pub fn clear(&self) {
        self.dialogs.clear();
    }
}

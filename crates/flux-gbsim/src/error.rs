use thiserror::Error;

/// 模拟器错误类型
///
/// 核心循环中的任何错误都不会终止进程：调用方记录日志后继续所在的循环。
#[derive(Error, Debug)]
pub enum SimError {
    /// 入站消息或消息体无法解析（丢弃，不回复）
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// 平台拒绝 Digest 鉴权
    #[error("Authentication rejected by platform: {status}")]
    AuthenticationRejected { status: u16 },

    /// 活动 socket 上的收发失败
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    /// 同一会话键已有中继（内部通过先停后启消解，不对外暴露）
    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Media error: {0}")]
    Media(String),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, SimError>;

impl SimError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        SimError::MalformedPayload(msg.into())
    }
}

impl From<config::ConfigError> for SimError {
    fn from(e: config::ConfigError) -> Self {
        SimError::Config(e.to_string())
    }
}

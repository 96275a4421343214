use thiserror::Error;

/// 压测错误类型
///
/// 单路拉流失败只计入失败列表，不会中断整轮压测。
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// 平台返回非 2xx
    #[error("Platform request failed: status={status} url={url}")]
    Status { status: u16, url: String },

    /// 响应体不是预期的分页结构
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// 连接建立后，在读超时内没有收到任何数据
    #[error("Stream stalled: {0}")]
    Stalled(String),
}

pub type Result<T> = std::result::Result<T, LoadError>;

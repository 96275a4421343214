// 平台 HTTP 客户端
// 设备/通道分页查询与 live.mp4 拉流，请求统一带访问令牌

use reqwest::{Client, RequestBuilder, Response};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;

use crate::error::{LoadError, Result};

/// 平台对两种令牌头写法择一识别，两个都带上
const TOKEN_HEADERS: [&str; 2] = ["X-Access-Token", "X_Access_Token"];
const TOKEN_QUERY: &str = ":X_Access_Token";

const DEVICE_QUERY_PATH: &str = "/api/media/device/_query/";

/// 一路待拉取的实时流
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LiveTarget {
    pub device_id: String,
    pub channel_id: String,
}

impl LiveTarget {
    pub fn new(device_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            channel_id: channel_id.into(),
        }
    }

    /// 全局统计里的流标识：`设备/通道`
    pub fn stream_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for LiveTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.channel_id)
    }
}

pub struct PlatformClient {
    base_url: String,
    token: String,
    timeout: Duration,
    client: Client,
}

impl PlatformClient {
    /// # 参数
    ///
    /// * `base_url` - 平台根地址，末尾的 `/` 会被忽略
    /// * `token` - 访问令牌
    /// * `timeout` - 连接超时，同时作为查询请求的整体超时
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().connect_timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            timeout,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        TOKEN_HEADERS
            .iter()
            .fold(builder, |b, name| b.header(*name, self.token.as_str()))
    }

    async fn post_json(&self, path: &str, body: Value) -> Result<Value> {
        let url = self.url(path);
        let resp = self
            .authorized(self.client.post(&url))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(LoadError::Status {
                status: status.as_u16(),
                url,
            });
        }
        Ok(resp.json::<Value>().await?)
    }

    /// 逐页查询直到空页或不足一页
    ///
    /// 请求体：`{pageIndex, pageSize, sorts: [{name, order: "desc"}], terms: []}`，
    /// 条目取自响应的 `result.data`。
    pub async fn paginate(&self, path: &str, sort_by: &str, page_size: usize) -> Result<Vec<Value>> {
        let page_size = page_size.max(1);
        let mut items = Vec::new();
        let mut page_index = 0usize;

        loop {
            let body = json!({
                "pageIndex": page_index,
                "pageSize": page_size,
                "sorts": [{ "name": sort_by, "order": "desc" }],
                "terms": [],
            });
            let data = self.post_json(path, body).await?;
            let page = match data.pointer("/result/data") {
                Some(Value::Array(page)) => page.clone(),
                Some(Value::Null) | None => Vec::new(),
                Some(other) => {
                    return Err(LoadError::UnexpectedResponse(format!(
                        "result.data is not an array: {}",
                        other
                    )))
                }
            };

            let len = page.len();
            if len == 0 {
                break;
            }
            items.extend(page);
            if len < page_size {
                break;
            }
            page_index += 1;
        }

        tracing::debug!(target: "gbload::client", path, pages = page_index + 1, items = items.len(), "Pagination done");
        Ok(items)
    }

    pub async fn devices(&self, page_size: usize) -> Result<Vec<Value>> {
        self.paginate(DEVICE_QUERY_PATH, "createTime", page_size).await
    }

    pub async fn channels(&self, device_id: &str, page_size: usize) -> Result<Vec<Value>> {
        let path = format!("/api/media/device/{}/channel/_query", device_id);
        self.paginate(&path, "modifyTime", page_size).await
    }

    /// 发起 live.mp4 点播，返回尚未读取的流式响应
    ///
    /// 令牌同时放在请求头和 `:X_Access_Token` 查询参数中。
    pub async fn open_live(&self, target: &LiveTarget) -> Result<Response> {
        let url = self.url(&format!(
            "/api/media/device/{}/{}/live.mp4",
            target.device_id, target.channel_id
        ));
        let request = self
            .authorized(self.client.get(&url))
            .query(&[(TOKEN_QUERY, self.token.as_str())])
            .send();
        // 只限制等待响应头的时间，流本身持续读取
        let resp = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| LoadError::Stalled(url.clone()))??;

        let status = resp.status();
        if !status.is_success() {
            return Err(LoadError::Status {
                status: status.as_u16(),
                url,
            });
        }
        Ok(resp)
    }
}

fn first_id(item: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|field| match item.get(*field) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// 设备条目的 ID：依次取 `id`、`deviceId`、`deviceID`
pub fn device_id_of(device: &Value) -> Option<String> {
    first_id(device, &["id", "deviceId", "deviceID"])
}

/// 通道条目的 ID：依次取 `channelId`、`id`
pub fn channel_id_of(channel: &Value) -> Option<String> {
    first_id(channel, &["channelId", "id"])
}

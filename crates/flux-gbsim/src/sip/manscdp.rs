// GB28181 MANSCDP 消息体
// 解析平台下发的查询，生成设备侧的应答/通知 XML

use crate::device::Channel;
use crate::{Result, SimError};
use quick_xml::de::from_str;
use quick_xml::escape::escape;
use serde::Deserialize;

/// MANSCDP 消息体的 Content-Type
pub const MANSCDP_CONTENT_TYPE: &str = "Application/MANSCDP+xml";

const XML_DECL: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\r\n";

/// 平台下发的查询/控制消息（Query、Control 等根节点通用）
#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ManscdpQuery {
    /// 命令类型
    pub cmd_type: String,

    /// 序列号（应答中原样带回）
    #[serde(rename = "SN", default)]
    pub sn: Option<String>,

    /// 目标设备 ID
    #[serde(rename = "DeviceID", default)]
    pub device_id: Option<String>,

    /// 部分平台在 Catalog 查询/订阅中携带
    #[serde(rename = "InfoID", default)]
    pub info_id: Option<String>,
}

/// 已知的查询类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdType {
    DeviceInfo,
    DeviceStatus,
    ConfigDownload,
    Catalog,
    Other,
}

impl ManscdpQuery {
    /// 解析 XML 消息体
    pub fn parse(body: &str) -> Result<Self> {
        let query: ManscdpQuery = from_str(body.trim())
            .map_err(|e| SimError::malformed(format!("Invalid MANSCDP body: {}", e)))?;
        Ok(query)
    }

    /// 命令类型（大小写不敏感）
    pub fn kind(&self) -> CmdType {
        match self.cmd_type.trim().to_ascii_lowercase().as_str() {
            "deviceinfo" => CmdType::DeviceInfo,
            "devicestatus" => CmdType::DeviceStatus,
            "configdownload" => CmdType::ConfigDownload,
            "catalog" => CmdType::Catalog,
            _ => CmdType::Other,
        }
    }

    /// 应答使用的 SN：请求中有则沿用，否则取当前时间
    pub fn sn_or_now(&self) -> String {
        self.sn
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(now_sn)
    }
}

/// 以当前时间生成 SN
pub fn now_sn() -> String {
    (chrono::Utc::now().timestamp_millis() % 100_000_000).to_string()
}

/// 心跳 Keepalive 通知
pub fn keepalive_xml(device_id: &str, sn: u32) -> String {
    format!(
        "{}<Notify><CmdType>Keepalive</CmdType><SN>{}</SN><DeviceID>{}</DeviceID><Status>OK</Status><Info /></Notify>",
        XML_DECL, sn, device_id
    )
}

/// DeviceInfo 应答
pub fn device_info_xml(device_id: &str, device_name: &str, sn: &str) -> String {
    format!(
        "{}<Response><CmdType>DeviceInfo</CmdType><SN>{}</SN><DeviceID>{}</DeviceID>\
<DeviceName>{}</DeviceName><Manufacturer>GB28181-Simulator</Manufacturer>\
<Model>IPC-Simulator-v1.0</Model><Firmware>v1.0.0</Firmware><Result>OK</Result></Response>",
        XML_DECL,
        escape(sn),
        device_id,
        escape(device_name)
    )
}

/// DeviceStatus 应答
pub fn device_status_xml(device_id: &str, sn: &str) -> String {
    let now = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S");
    format!(
        "{}<Response><CmdType>DeviceStatus</CmdType><SN>{}</SN><DeviceID>{}</DeviceID>\
<Result>OK</Result><Online>ONLINE</Online><Status>OK</Status><Encode>ON</Encode>\
<Record>OFF</Record><DeviceTime>{}</DeviceTime><Alarmstatus Num=\"0\" /></Response>",
        XML_DECL,
        escape(sn),
        device_id,
        now
    )
}

/// ConfigDownload 应答需要的设备参数
#[derive(Debug, Clone)]
pub struct BasicParam<'a> {
    pub device_id: &'a str,
    pub name: &'a str,
    pub ip: &'a str,
    pub port: u16,
    pub password: &'a str,
}

/// ConfigDownload 应答
pub fn config_download_xml(param: &BasicParam<'_>, sn: &str) -> String {
    format!(
        "{}<Response><CmdType>ConfigDownload</CmdType><SN>{}</SN><DeviceID>{}</DeviceID>\
<Result>OK</Result><BasicParam><Name>{}</Name><DeviceID>{}</DeviceID><IPAddress>{}</IPAddress>\
<Port>{}</Port><Username>{}</Username><Password>{}</Password></BasicParam></Response>",
        XML_DECL,
        escape(sn),
        param.device_id,
        escape(param.name),
        param.device_id,
        param.ip,
        param.port,
        param.device_id,
        escape(param.password)
    )
}

/// SUBSCRIBE 的 Result=OK 应答体
pub fn subscribe_result_xml(device_id: &str, sn: &str) -> String {
    format!(
        "{}<Response><CmdType>Catalog</CmdType><SN>{}</SN><DeviceID>{}</DeviceID><Result>OK</Result></Response>",
        XML_DECL,
        escape(sn),
        device_id
    )
}

/// Catalog 应答（MESSAGE 或 NOTIFY 携带）
pub fn catalog_xml(device_id: &str, channels: &[Channel], sn: &str, info_id: Option<&str>) -> String {
    let mut xml = String::with_capacity(512 + channels.len() * 512);
    xml.push_str(XML_DECL);
    xml.push_str("<Response><CmdType>Catalog</CmdType>");
    xml.push_str(&format!("<SN>{}</SN><DeviceID>{}</DeviceID>", escape(sn), device_id));
    // 部分平台按 SumNum 控制读取条数
    xml.push_str(&format!("<SumNum>{}</SumNum>", channels.len()));
    if let Some(info_id) = info_id {
        xml.push_str(&format!("<InfoID>{}</InfoID>", escape(info_id)));
    }
    xml.push_str(&format!("<DeviceList Num=\"{}\">", channels.len()));
    for ch in channels {
        xml.push_str("<Item>");
        xml.push_str(&format!("<DeviceID>{}</DeviceID>", ch.id));
        xml.push_str(&format!("<Name>{}</Name>", escape(&ch.name)));
        xml.push_str(&format!("<Manufacturer>{}</Manufacturer>", escape(&ch.manufacturer)));
        xml.push_str(&format!("<Model>{}</Model>", escape(&ch.model)));
        xml.push_str(&format!("<Owner>{}</Owner>", ch.owner));
        xml.push_str(&format!("<CivilCode>{}</CivilCode>", ch.civil_code));
        xml.push_str(&format!("<Address>{}</Address>", escape(&ch.address)));
        xml.push_str(&format!("<Parental>{}</Parental>", ch.parental));
        xml.push_str(&format!("<ParentID>{}</ParentID>", ch.parent_id));
        xml.push_str(&format!("<SafetyWay>{}</SafetyWay>", ch.safety_way));
        xml.push_str(&format!("<RegisterWay>{}</RegisterWay>", ch.register_way));
        xml.push_str(&format!("<Secrecy>{}</Secrecy>", ch.secrecy));
        xml.push_str(&format!("<Status>{}</Status>", ch.status));
        xml.push_str(&format!("<Online>{}</Online>", ch.online));
        xml.push_str(&format!("<AlarmStatus>{}</AlarmStatus>", ch.alarm_status));
        xml.push_str("</Item>");
    }
    xml.push_str("</DeviceList></Response>");
    xml
}

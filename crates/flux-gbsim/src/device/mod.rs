// 模拟设备
//
// - channel: 通道目录
// - registration: 注册/心跳状态机
// - agent: 设备信令循环

pub mod agent;
pub mod channel;
pub mod registration;

pub use agent::SimDevice;
pub use channel::{build_channels, channel_id, Channel};
pub use registration::{RegistrationAction, RegistrationState, RegistrationStatus};

use std::time::Duration;

/// 设备定时参数（构造时可逐台覆盖）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTiming {
    pub heartbeat_interval: Duration,
    pub relay_idle_timeout: Duration,
    pub register_retry: Duration,
    pub register_expires: Duration,
    /// 接收等待上限，即定时检查粒度
    pub poll_interval: Duration,
}

impl Default for DeviceTiming {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            relay_idle_timeout: Duration::from_secs(15),
            register_retry: Duration::from_secs(10),
            register_expires: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// 单台设备配置
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub device_id: String,
    pub name: String,
    pub password: String,
    /// 本地绑定地址
    pub local_ip: String,
    /// 本地信令端口（0 表示由系统分配）
    pub local_port: u16,
    pub platform_ip: String,
    pub platform_port: u16,
    /// 平台 SIP 编码
    pub platform_id: String,
    pub realm: String,
    pub honor_challenge: bool,
    pub channel_count: usize,
    pub timing: DeviceTiming,
}

impl DeviceConfig {
    pub fn new(device_id: impl Into<String>, platform_ip: impl Into<String>, platform_port: u16) -> Self {
        let device_id = device_id.into();
        Self {
            name: device_id.clone(),
            device_id,
            password: "123456".to_string(),
            local_ip: "127.0.0.1".to_string(),
            local_port: 0,
            platform_ip: platform_ip.into(),
            platform_port,
            platform_id: "3402000000".to_string(),
            realm: "3402000000".to_string(),
            honor_challenge: false,
            channel_count: 1,
            timing: DeviceTiming::default(),
        }
    }
}

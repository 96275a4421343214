use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::device::{DeviceConfig, DeviceTiming};
use crate::{Result, SimError};

/// 覆盖推流源文件的环境变量
pub const SOURCE_ENV: &str = "AVCAPTURE_URL";

/// 模拟器配置
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub platform: PlatformConfig,
    pub fleet: FleetConfig,
    pub timing: TimingConfig,
    pub media: MediaConfig,
}

/// 平台（上级 SIP 服务器）配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub ip: String,
    pub port: u16,
    pub realm: String,
    /// 平台 SIP 编码（入站请求 From 中没有时使用）
    pub id: String,
    /// 收到 401 挑战后使用平台下发的 nonce/realm 重新注册
    pub honor_challenge: bool,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: 8809,
            realm: "3402000000".to_string(),
            id: "3402000000".to_string(),
            honor_challenge: false,
        }
    }
}

impl PlatformConfig {
    pub fn is_loopback(&self) -> bool {
        self.ip == "127.0.0.1" || self.ip.eq_ignore_ascii_case("localhost")
    }
}

/// 设备群配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FleetConfig {
    pub count: usize,
    pub channels_per_device: usize,
    /// 设备编码前缀，后接 4 位序号
    pub base_device_id: String,
    pub base_port: u16,
    pub password: String,
    /// 本地绑定地址（未配置时：回环平台用 127.0.0.1，否则 0.0.0.0）
    pub local_ip: Option<String>,
    pub name_prefix: String,
    /// 相邻设备启动间隔
    pub start_stagger_ms: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            count: 3,
            channels_per_device: 1,
            base_device_id: "3402000000132000".to_string(),
            base_port: 15060,
            password: "123456".to_string(),
            local_ip: None,
            name_prefix: "模拟设备".to_string(),
            start_stagger_ms: 500,
        }
    }
}

/// 定时参数
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimingConfig {
    pub heartbeat_interval_secs: u64,
    pub relay_idle_timeout_secs: u64,
    pub register_retry_secs: u64,
    pub register_expires_secs: u64,
    pub poll_interval_ms: u64,
    /// 汇总带宽日志间隔，0 表示关闭
    pub stats_interval_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            relay_idle_timeout_secs: 15,
            register_retry_secs: 10,
            register_expires_secs: 3600,
            poll_interval_ms: 1000,
            stats_interval_secs: 5,
        }
    }
}

impl From<&TimingConfig> for DeviceTiming {
    fn from(t: &TimingConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(t.heartbeat_interval_secs),
            relay_idle_timeout: Duration::from_secs(t.relay_idle_timeout_secs),
            register_retry: Duration::from_secs(t.register_retry_secs),
            register_expires: Duration::from_secs(t.register_expires_secs),
            poll_interval: Duration::from_millis(t.poll_interval_ms),
        }
    }
}

/// 推流配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MediaConfig {
    pub enabled: bool,
    pub ffmpeg: String,
    /// 查找 .mp4 的目录
    pub search_dirs: Vec<PathBuf>,
    /// 显式指定的源文件，排在播放列表最前
    pub source: Option<PathBuf>,
    pub bitrate_kbps: u32,
    pub font_file: Option<PathBuf>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ffmpeg: "ffmpeg".to_string(),
            search_dirs: vec![PathBuf::from(".")],
            source: None,
            bitrate_kbps: 2000,
            font_file: Some(PathBuf::from(
                "/usr/share/fonts/opentype/noto/NotoSansCJK-Regular.ttc",
            )),
        }
    }
}

impl SimulatorConfig {
    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.fleet.count == 0 {
            return Err(SimError::Config("fleet.count must be greater than 0".into()));
        }
        if self.platform.port == 0 {
            return Err(SimError::Config("platform.port must not be 0".into()));
        }
        if self.platform.ip.trim().is_empty() {
            return Err(SimError::Config("platform.ip must not be empty".into()));
        }

        let t = &self.timing;
        for (name, value) in [
            ("heartbeat_interval_secs", t.heartbeat_interval_secs),
            ("relay_idle_timeout_secs", t.relay_idle_timeout_secs),
            ("register_retry_secs", t.register_retry_secs),
            ("register_expires_secs", t.register_expires_secs),
            ("poll_interval_ms", t.poll_interval_ms),
        ] {
            if value == 0 {
                return Err(SimError::Config(format!("timing.{} must be greater than 0", name)));
            }
        }

        let last_port = self.fleet.base_port as usize + self.fleet.count - 1;
        if last_port > u16::MAX as usize {
            return Err(SimError::Config(format!(
                "fleet.base_port ({}) + count ({}) exceeds the port range",
                self.fleet.base_port, self.fleet.count
            )));
        }

        Ok(())
    }

    /// 本地绑定地址
    pub fn local_ip(&self) -> String {
        match &self.fleet.local_ip {
            Some(ip) if !ip.trim().is_empty() => ip.clone(),
            _ if self.platform.is_loopback() => "127.0.0.1".to_string(),
            _ => "0.0.0.0".to_string(),
        }
    }

    /// 展开为每台设备的配置
    pub fn device_configs(&self) -> Vec<DeviceConfig> {
        let local_ip = self.local_ip();
        let timing = DeviceTiming::from(&self.timing);

        (0..self.fleet.count)
            .map(|i| DeviceConfig {
                device_id: format!("{}{:04}", self.fleet.base_device_id, i + 1),
                name: format!("{}{}", self.fleet.name_prefix, i + 1),
                password: self.fleet.password.clone(),
                local_ip: local_ip.clone(),
                local_port: self.fleet.base_port + i as u16,
                platform_ip: self.platform.ip.clone(),
                platform_port: self.platform.port,
                platform_id: self.platform.id.clone(),
                realm: self.platform.realm.clone(),
                honor_challenge: self.platform.honor_challenge,
                channel_count: self.fleet.channels_per_device,
                timing: timing.clone(),
            })
            .collect()
    }
}

/// 配置加载器
///
/// 优先级：默认值 < TOML 文件 < `GBSIM__` 环境变量（如 `GBSIM__PLATFORM__IP`）。
pub struct ConfigLoader {
    path: Option<PathBuf>,
    env_prefix: String,
}

impl ConfigLoader {
    /// 创建配置加载器
    pub fn new<P: AsRef<Path>>(path: Option<P>) -> Self {
        Self {
            path: path.map(|p| p.as_ref().to_path_buf()),
            env_prefix: "GBSIM".to_string(),
        }
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// 加载配置
    ///
    /// 文件不存在时使用默认值。
    pub fn load(&self) -> Result<SimulatorConfig> {
        let mut builder = Config::builder();

        if let Some(path) = self.path.as_ref().filter(|p| p.exists()) {
            let path = path
                .to_str()
                .ok_or_else(|| SimError::Config("Invalid config path".into()))?;
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix(&self.env_prefix)
                .separator("__")
                .try_parsing(true),
        );

        let mut config: SimulatorConfig = builder.build()?.try_deserialize()?;

        if let Ok(source) = std::env::var(SOURCE_ENV) {
            if !source.trim().is_empty() {
                config.media.source = Some(PathBuf::from(source));
            }
        }

        Ok(config)
    }
}

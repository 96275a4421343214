// GB28181 设备模拟器
//
// - sip: 信令编解码、SDP、MANSCDP、Digest 鉴权
// - device: 单台设备的注册状态机与信令循环
// - relay / session: 媒体中继与对话登记
// - pool: 多设备管理

pub mod config;
pub mod contact;
pub mod device;
pub mod error;
pub mod media;
pub mod pool;
pub mod relay;
pub mod session;
pub mod sip;

pub use config::{ConfigLoader, SimulatorConfig};
pub use device::{DeviceConfig, DeviceTiming, RegistrationStatus, SimDevice};
pub use error::{Result, SimError};
pub use media::{FfmpegSource, MediaSource, NullSource};
pub use pool::{DevicePool, PoolStats};
pub use relay::{RelayConfig, RelayEngine};
pub use session::{DialogId, SessionKey, SessionRegistry};

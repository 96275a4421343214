//! GB28181 平台点播压测
//!
//! 通过平台 HTTP 接口分页查询全部设备与通道，并发拉取 `live.mp4`
//! 实时流，每秒汇报全局播放路数与吞吐。

pub mod client;
pub mod error;
pub mod runner;
pub mod stats;

pub use client::{LiveTarget, PlatformClient};
pub use error::{LoadError, Result};
pub use runner::{LoadConfig, LoadReport, LoadTester};
pub use stats::{GlobalStats, StatsSnapshot};

// 注册与心跳状态机
// 纯状态：时间由调用方注入，输出需要发送的动作

use std::time::{Duration, Instant};

use super::DeviceTiming;
use crate::{Result, SimError};

/// 注册状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    Unregistered,
    /// 已发送 REGISTER，等待响应
    Registering,
    Registered,
}

/// 状态机要求的发送动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationAction {
    SendRegister,
    SendHeartbeat,
}

/// 注册状态机
#[derive(Debug, Clone)]
pub struct RegistrationState {
    status: RegistrationStatus,
    last_register: Option<Instant>,
    last_heartbeat: Option<Instant>,
    heartbeat_interval: Duration,
    retry_interval: Duration,
    expires: Duration,
}

impl RegistrationState {
    pub fn new(timing: &DeviceTiming) -> Self {
        Self {
            status: RegistrationStatus::Unregistered,
            last_register: None,
            last_heartbeat: None,
            heartbeat_interval: timing.heartbeat_interval,
            retry_interval: timing.register_retry,
            expires: timing.register_expires,
        }
    }

    pub fn status(&self) -> RegistrationStatus {
        self.status
    }

    pub fn is_registered(&self) -> bool {
        self.status == RegistrationStatus::Registered
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.last_heartbeat
    }

    pub fn last_register(&self) -> Option<Instant> {
        self.last_register
    }

    /// 设备启动：立即注册，心跳与注册计时从此刻开始
    pub fn start(&mut self, now: Instant) -> RegistrationAction {
        self.status = RegistrationStatus::Registering;
        self.last_register = Some(now);
        self.last_heartbeat = Some(now);
        RegistrationAction::SendRegister
    }

    /// 处理 REGISTER 的最终响应
    ///
    /// # 返回
    ///
    /// 状态发生变化时返回 `Ok(true)`
    ///
    /// # 错误
    ///
    /// 401/403/407 返回 `AuthenticationRejected`，状态回到 `Unregistered`
    pub fn on_response(&mut self, status_code: u16, now: Instant) -> Result<bool> {
        match status_code {
            200..=299 => {
                let changed = self.status != RegistrationStatus::Registered;
                self.status = RegistrationStatus::Registered;
                self.last_heartbeat = Some(now);
                Ok(changed)
            }
            401 | 403 | 407 => {
                self.status = RegistrationStatus::Unregistered;
                Err(SimError::AuthenticationRejected { status: status_code })
            }
            _ => Ok(false),
        }
    }

    /// 定时检查
    ///
    /// 已注册且距上次心跳满一个心跳间隔时发心跳；未注册或注册到期时，
    /// 只要距上次 REGISTER 满重试间隔就重发。
    pub fn poll(&mut self, now: Instant) -> Vec<RegistrationAction> {
        let mut actions = Vec::new();

        if self.is_registered() {
            let due = self
                .last_heartbeat
                .map(|t| now.saturating_duration_since(t) >= self.heartbeat_interval)
                .unwrap_or(true);
            if due {
                actions.push(RegistrationAction::SendHeartbeat);
                self.last_heartbeat = Some(now);
            }
        }

        let since_register = self.last_register.map(|t| now.saturating_duration_since(t));
        let expired = since_register.map(|d| d >= self.expires).unwrap_or(true);
        let retry_ok = since_register.map(|d| d >= self.retry_interval).unwrap_or(true);
        if (!self.is_registered() || expired) && retry_ok {
            actions.push(RegistrationAction::SendRegister);
            self.last_register = Some(now);
            if !self.is_registered() {
                self.status = RegistrationStatus::Registering;
            }
        }

        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing() -> DeviceTiming {
        DeviceTiming {
            heartbeat_interval: Duration::from_secs(30),
            register_retry: Duration::from_secs(10),
            register_expires: Duration::from_secs(3600),
            ..DeviceTiming::default()
        }
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_start_sends_register() {
        let mut reg = RegistrationState::new(&timing());
        let t0 = Instant::now();
        assert_eq!(reg.start(t0), RegistrationAction::SendRegister);
        assert_eq!(reg.status(), RegistrationStatus::Registering);
        assert_eq!(reg.last_register(), Some(t0));
    }

    #[test]
    fn test_success_resets_heartbeat_baseline() {
        let mut reg = RegistrationState::new(&timing());
        let t0 = Instant::now();
        reg.start(t0);

        let t1 = t0 + secs(2);
        assert!(reg.on_response(200, t1).unwrap());
        assert!(reg.is_registered());
        assert_eq!(reg.last_heartbeat(), Some(t1));

        // 重复的 200 不改变状态
        assert!(!reg.on_response(200, t1).unwrap());
        // 临时响应被忽略
        assert!(!reg.on_response(100, t1).unwrap());
        assert!(reg.is_registered());
    }

    #[test]
    fn test_one_heartbeat_per_interval() {
        let mut reg = RegistrationState::new(&timing());
        let t0 = Instant::now();
        reg.start(t0);
        reg.on_response(200, t0).unwrap();

        assert!(reg.poll(t0 + secs(29)).is_empty());
        assert_eq!(reg.poll(t0 + secs(30)), vec![RegistrationAction::SendHeartbeat]);
        assert!(reg.poll(t0 + secs(31)).is_empty());
        assert!(reg.poll(t0 + secs(59)).is_empty());
        assert_eq!(reg.poll(t0 + secs(60)), vec![RegistrationAction::SendHeartbeat]);
    }

    #[test]
    fn test_auth_failure_then_reregister_after_retry() {
        let mut reg = RegistrationState::new(&timing());
        let t0 = Instant::now();
        reg.start(t0);
        reg.on_response(200, t0).unwrap();

        let t1 = t0 + secs(3);
        let err = reg.on_response(401, t1).unwrap_err();
        assert!(matches!(err, SimError::AuthenticationRejected { status: 401 }));
        assert_eq!(reg.status(), RegistrationStatus::Unregistered);

        // 距上次 REGISTER 不足重试间隔
        assert!(reg.poll(t0 + secs(9)).is_empty());
        assert_eq!(reg.poll(t0 + secs(10)), vec![RegistrationAction::SendRegister]);
        assert_eq!(reg.status(), RegistrationStatus::Registering);
        // 发送后重新计时
        assert!(reg.poll(t0 + secs(15)).is_empty());
        assert_eq!(reg.poll(t0 + secs(20)), vec![RegistrationAction::SendRegister]);
    }

    #[test]
    fn test_no_response_keeps_retrying() {
        let mut reg = RegistrationState::new(&timing());
        let t0 = Instant::now();
        reg.start(t0);
        assert!(reg.poll(t0 + secs(5)).is_empty());
        assert_eq!(reg.poll(t0 + secs(11)), vec![RegistrationAction::SendRegister]);
    }

    #[test]
    fn test_refresh_when_expired() {
        let t = DeviceTiming {
            register_expires: secs(100),
            ..timing()
        };
        let mut reg = RegistrationState::new(&t);
        let t0 = Instant::now();
        reg.start(t0);
        reg.on_response(200, t0).unwrap();

        let actions = reg.poll(t0 + secs(100));
        assert_eq!(
            actions,
            vec![RegistrationAction::SendHeartbeat, RegistrationAction::SendRegister]
        );
        // 刷新期间仍视为已注册
        assert!(reg.is_registered());
    }

    #[test]
    fn test_poll_before_start_registers() {
        let mut reg = RegistrationState::new(&timing());
        assert_eq!(reg.poll(Instant::now()), vec![RegistrationAction::SendRegister]);
    }
}

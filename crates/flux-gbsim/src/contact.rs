// Contact 地址选择
// 设备绑定通配地址时，Via/Contact/SDP 里需要一个平台可达的地址

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

/// Contact 地址解析策略
pub trait ContactResolver: Send + Sync {
    /// # 参数
    ///
    /// * `bound` - 设备信令 socket 实际绑定的地址
    /// * `platform` - 平台地址
    fn resolve(&self, bound: SocketAddr, platform: SocketAddr) -> IpAddr;
}

/// 默认解析链：
/// 1. 绑定地址不是通配地址时直接使用；
/// 2. 向平台 connect 一个 UDP socket，取内核选路后的本地地址；
/// 3. 最后退回平台地址本身。
#[derive(Debug, Default, Clone, Copy)]
pub struct RouteProbeResolver;

impl RouteProbeResolver {
    fn probe(platform: SocketAddr) -> std::io::Result<IpAddr> {
        let any: SocketAddr = match platform {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        // UDP connect 只选路，不发包
        let socket = UdpSocket::bind(any)?;
        socket.connect(platform)?;
        Ok(socket.local_addr()?.ip())
    }
}

impl ContactResolver for RouteProbeResolver {
    fn resolve(&self, bound: SocketAddr, platform: SocketAddr) -> IpAddr {
        if !bound.ip().is_unspecified() {
            return bound.ip();
        }

        match Self::probe(platform) {
            Ok(ip) if !ip.is_unspecified() => ip,
            Ok(_) => platform.ip(),
            Err(e) => {
                tracing::warn!(
                    target: "gbsim::device",
                    platform = %platform,
                    error = %e,
                    "Route probe failed, advertising the platform address"
                );
                platform.ip()
            }
        }
    }
}

/// 固定 Contact 地址
#[derive(Debug, Clone, Copy)]
pub struct StaticContact(pub IpAddr);

impl ContactResolver for StaticContact {
    fn resolve(&self, _bound: SocketAddr, _platform: SocketAddr) -> IpAddr {
        self.0
    }
}

/// 信令 socket 的绑定地址
///
/// 配置为回环地址而平台不在本机时改绑通配地址，否则无法向外发包。
pub fn bind_ip(local: IpAddr, platform: IpAddr) -> IpAddr {
    if local.is_loopback() && !platform.is_loopback() {
        match local {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    } else {
        local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bound_address_wins() {
        let ip = RouteProbeResolver.resolve(
            "10.1.2.3:15060".parse().unwrap(),
            "10.0.0.1:5060".parse().unwrap(),
        );
        assert_eq!(ip, "10.1.2.3".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_probe_loopback_platform() {
        let ip = RouteProbeResolver.resolve(
            "0.0.0.0:15060".parse().unwrap(),
            "127.0.0.1:5060".parse().unwrap(),
        );
        assert!(ip.is_loopback());
    }

    #[test]
    fn test_bind_ip() {
        let lo: IpAddr = "127.0.0.1".parse().unwrap();
        let ext: IpAddr = "192.168.32.84".parse().unwrap();
        assert_eq!(bind_ip(lo, ext), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(bind_ip(lo, lo), lo);
        assert_eq!(bind_ip(ext, ext), ext);
    }

    #[test]
    fn test_static_contact() {
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        assert_eq!(
            StaticContact(ip).resolve("0.0.0.0:1".parse().unwrap(), "5.6.7.8:9".parse().unwrap()),
            ip
        );
    }
}

// 设备通道目录

/// 通道描述（Catalog 中的一个 Item）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub owner: String,
    /// 行政区域（设备 ID 前 6 位）
    pub civil_code: String,
    pub address: String,
    /// 是否有子设备（0/1）
    pub parental: u8,
    pub parent_id: String,
    pub safety_way: u8,
    pub register_way: u8,
    pub secrecy: u8,
    pub status: String,
    pub online: String,
    pub alarm_status: String,
}

/// 通道编码
///
/// 数字型设备 ID：`设备 ID + 100 + 序号`，补零到 20 位；
/// 否则（或相加溢出时）把最后两位替换为 `10 + 序号`。
pub fn channel_id(device_id: &str, index: usize) -> String {
    let numeric = device_id
        .parse::<u128>()
        .ok()
        .and_then(|base| base.checked_add(100))
        .and_then(|n| n.checked_add(index as u128));

    match numeric {
        Some(n) => format!("{:020}", n),
        None => {
            let cut = device_id
                .char_indices()
                .rev()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(device_id.len());
            format!("{}{:02}", &device_id[..cut], 10 + index)
        }
    }
}

/// 为设备生成固定的 IPC 通道目录
pub fn build_channels(device_id: &str, device_name: &str, count: usize) -> Vec<Channel> {
    let civil_code = device_id
        .get(..6)
        .unwrap_or("340200")
        .to_string();

    (0..count)
        .map(|i| Channel {
            id: channel_id(device_id, i),
            name: format!("{}-通道{}", device_name, i + 1),
            manufacturer: "IPC".to_string(),
            model: "IPC".to_string(),
            owner: device_id.to_string(),
            civil_code: civil_code.clone(),
            address: "Address".to_string(),
            parental: 0,
            parent_id: device_id.to_string(),
            safety_way: 0,
            register_way: 1,
            secrecy: 0,
            status: "ON".to_string(),
            online: "ON".to_string(),
            alarm_status: "READY".to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_channel_id() {
        assert_eq!(channel_id("34020000001320000001", 0), "34020000001320000101");
        assert_eq!(channel_id("34020000001320000001", 1), "34020000001320000102");
        // 短 ID 同样补零到 20 位
        assert_eq!(channel_id("1", 0), "00000000000000000101");
    }

    #[test]
    fn test_non_numeric_channel_id() {
        assert_eq!(channel_id("DEV-01", 0), "DEV-10");
        assert_eq!(channel_id("DEV-01", 3), "DEV-13");
        assert_eq!(channel_id("x", 0), "x10");
    }

    #[test]
    fn test_overflowing_numeric_id_uses_suffix() {
        let max = u128::MAX.to_string();
        let prefix = &max[..max.len() - 2];
        assert_eq!(channel_id(&max, 0), format!("{}10", prefix));
        assert_eq!(channel_id(&max, 2), format!("{}12", prefix));

        // 刚好不溢出时仍按数值相加
        let near = (u128::MAX - 101).to_string();
        assert_eq!(channel_id(&near, 1), u128::MAX.to_string());
    }

    #[test]
    fn test_build_channels() {
        let chans = build_channels("34020000001320000001", "模拟设备1", 3);
        assert_eq!(chans.len(), 3);
        assert_eq!(chans[2].name, "模拟设备1-通道3");
        assert_eq!(chans[0].civil_code, "340200");
        assert_eq!(chans[0].parent_id, "34020000001320000001");
        assert_eq!(chans[0].register_way, 1);
        assert_eq!(chans[0].alarm_status, "READY");

        let short = build_channels("abc", "d", 1);
        assert_eq!(short[0].civil_code, "340200");
    }
}

/// 工具函数集合

use uuid::Uuid;

/// 1 GiB
pub const GIB: u64 = 1024 * 1024 * 1024;

/// 生成唯一 ID
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// 格式化字节大小
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// 按粒度向上取整
///
/// 粒度为 0 时原样返回，结果超出 u64 时返回 None
pub fn round_up_to_granularity(bytes: u64, granularity: u64) -> Option<u64> {
    if granularity == 0 {
        return Some(bytes);
    }
    bytes.div_ceil(granularity).checked_mul(granularity)
}

/// 临时对象名称：`<name>_<毫秒时间戳>.TMP`
pub fn temp_object_name(name: &str) -> String {
    format!("{}_{}.TMP", name, chrono::Utc::now().timestamp_millis())
}

/// Prometheus 指标
///
/// 迁移过程结果与存储池锁等待超时，由 `/metrics` 导出

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// 迁移过程执行次数
///
/// Labels:
/// - `procedure`: copy, copy_vm, resize
/// - `outcome`: success, failure
pub static PROCEDURE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("datamotion_procedure_total", "迁移过程执行次数"),
        &["procedure", "outcome"],
    )
    .expect("指标定义有效");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("指标只注册一次");
    counter
});

/// 存储池锁等待超时次数
pub static LOCK_TIMEOUTS: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("datamotion_pool_lock_timeouts_total", "存储池锁等待超时次数")
        .expect("指标定义有效");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("指标只注册一次");
    counter
});

pub fn record_procedure(procedure: &str, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    PROCEDURE_TOTAL.with_label_values(&[procedure, outcome]).inc();
}

/// 文本格式的全部指标
pub fn gather() -> String {
    // 确保指标在第一次导出前已注册
    Lazy::force(&PROCEDURE_TOTAL);
    Lazy::force(&LOCK_TIMEOUTS);

    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!("导出指标失败: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_contains_counters() {
        record_procedure("resize", true);
        LOCK_TIMEOUTS.inc();

        let text = gather();
        assert!(text.contains("datamotion_procedure_total"));
        assert!(text.contains("datamotion_pool_lock_timeouts_total"));
    }
}

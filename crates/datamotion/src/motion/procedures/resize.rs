use common::utils::{format_bytes, round_up_to_granularity};
use common::{Error, Result};
use tracing::{error, info};

use crate::motion::context::MotionContext;
use crate::motion::object::Volume;
use crate::motion::state_machine::ObjectEvent;

use super::conclude;

/// 扩容卷，目标大小按驱动粒度向上取整
pub async fn resize_volume(ctx: &MotionContext, volume_id: &str, new_size: u64) -> Result<Volume> {
    let mut volume = ctx.repo.get_volume(volume_id).await?;
    if new_size < volume.size {
        return Err(Error::InvalidArgument(format!(
            "卷 {} 只能扩容: 当前 {}，请求 {}",
            volume.id,
            format_bytes(volume.size),
            format_bytes(new_size)
        )));
    }

    let store = ctx.repo.get_store(&volume.store_id).await?;
    let driver = ctx.driver_for(&store).await?;
    let granularity = driver.size_granularity().unwrap_or(0);
    let size = round_up_to_granularity(new_size, granularity).ok_or_else(|| {
        Error::InvalidArgument(format!(
            "卷 {} 的目标大小 {} 按粒度 {} 取整后溢出",
            volume.id, new_size, granularity
        ))
    })?;

    ctx.fire(&mut volume, ObjectEvent::ResizeRequested).await?;
    match driver.resize(&volume, size).await {
        Ok(()) => {
            volume.size = size;
            ctx.repo.save_volume(&volume).await?;
            conclude(ctx, &mut volume, true).await;
            info!("✅ 卷 {} 已扩容到 {}", volume.id, format_bytes(size));
            Ok(volume)
        }
        Err(e) => {
            error!("卷 {} 扩容失败: {}", volume.id, e);
            conclude(ctx, &mut volume, false).await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::state_machine::ObjectState;
    use crate::motion::testing::{primary_store, volume, FakeAgent, FakeDriver, Harness};
    use common::utils::GIB;

    #[tokio::test]
    async fn test_resize_rounds_to_granularity() {
        let h = Harness::new(FakeDriver::new("fake").with_granularity(8 * GIB), FakeAgent::new()).await;
        h.repo.insert_store(primary_store("pool-1", true)).await;
        h.repo.insert_volume(volume("vol-1", "pool-1")).await;

        let resized = resize_volume(&h.ctx, "vol-1", 33 * GIB).await.unwrap();
        assert_eq!(resized.size, 40 * GIB);
        assert_eq!(h.driver.resizes(), vec![("vol-1".to_string(), 40 * GIB)]);

        let stored = h.volume("vol-1").await;
        assert_eq!(stored.size, 40 * GIB);
        assert_eq!(stored.state, ObjectState::Ready);
    }

    #[tokio::test]
    async fn test_shrink_rejected() {
        let h = Harness::new(FakeDriver::new("fake"), FakeAgent::new()).await;
        h.repo.insert_store(primary_store("pool-1", true)).await;
        h.repo.insert_volume(volume("vol-1", "pool-1")).await;

        assert!(matches!(
            resize_volume(&h.ctx, "vol-1", GIB).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(h.driver.resizes().is_empty());
        assert_eq!(h.volume("vol-1").await.state, ObjectState::Ready);
    }

    #[tokio::test]
    async fn test_oversized_request_rejected() {
        let h = Harness::new(FakeDriver::new("fake").with_granularity(8 * GIB), FakeAgent::new()).await;
        h.repo.insert_store(primary_store("pool-1", true)).await;
        h.repo.insert_volume(volume("vol-1", "pool-1")).await;

        assert!(matches!(
            resize_volume(&h.ctx, "vol-1", u64::MAX - 1).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(h.driver.resizes().is_empty());
        assert_eq!(h.volume("vol-1").await.state, ObjectState::Ready);
    }
}

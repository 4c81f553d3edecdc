/// 模板相关过程：同一存储系统内由模板创建卷、由托管卷生成模板

use common::models::{capabilities, details, HypervisorType, ImageFormat};
use common::ws_rpc::{CopyCommand, DataTo};
use common::{Error, Result};
use std::collections::HashMap;
use tracing::{error, info};

use super::{conclude, conclude_created_volume};
use crate::motion::context::{verify_format, volume_details, wait, MotionContext, Releases};
use crate::motion::object::{DataObject, DataStore, Host, Template, Volume};
use crate::motion::state_machine::ObjectEvent;

pub(super) async fn create_volume_from_template(
    ctx: &MotionContext,
    template: Template,
    mut volume: Volume,
    src_store: DataStore,
    dest_store: DataStore,
) -> Result<Option<DataTo>> {
    let src = DataObject::Template(template.clone());
    if src_store.id != dest_store.id
        || !(ctx.supports(&src, &src_store).await
            || ctx.supports(&DataObject::Volume(volume.clone()), &dest_store).await)
    {
        return Err(Error::Unsupported(format!(
            "模板 {} 和卷 {} 不在同一个受支持的存储系统上",
            template.id, volume.id
        )));
    }

    let pool_type = if src_store.is_primary() { src_store.pool_type } else { None };
    verify_format(Some(template.format), pool_type)?;

    if ctx
        .drivers
        .has_capability(&src_store, capabilities::CAN_CLONE_VOLUME_FROM_TEMPLATE)
        .await
    {
        return clone_on_backend(ctx, &template, volume, &src_store).await;
    }

    let host = match template.format {
        ImageFormat::Vhd => ctx
            .hosts
            .select_host(&volume.zone_id, &dest_store, HypervisorType::XenServer, true)
            .await?
            .ok_or_else(|| Error::NoHostAvailable("没有支持重签名的 XenServer 主机".to_string()))?,
        ImageFormat::Ova => ctx
            .hosts
            .select_host(&volume.zone_id, &dest_store, HypervisorType::VMware, false)
            .await?
            .ok_or_else(|| Error::NoHostAvailable("没有可用的 VMware 主机".to_string()))?,
        _ => ctx
            .hosts
            .select_host(&volume.zone_id, &dest_store, HypervisorType::Kvm, false)
            .await?
            .ok_or_else(|| Error::NoHostAvailable("没有可用的 KVM 主机".to_string()))?,
    };

    let outcome = clone_and_resign(ctx, &template, &mut volume, &dest_store, &host).await;
    conclude_created_volume(ctx, &mut volume, outcome, true).await
}

/// 驱动直接从模板克隆卷
async fn clone_on_backend(
    ctx: &MotionContext,
    template: &Template,
    mut volume: Volume,
    store: &DataStore,
) -> Result<Option<DataTo>> {
    let outcome: Result<()> = async {
        ctx.provision_volume(&mut volume).await?;
        let driver = ctx.driver_for(store).await?;
        let created = driver
            .copy_async(
                &DataObject::Template(template.clone()),
                &DataObject::Volume(volume.clone()),
            )
            .await?;
        if let Some(path) = created.path {
            volume.path = Some(path);
        }
        if volume.format.is_none() {
            volume.format = Some(template.format);
        }
        ctx.repo.save_volume(&volume).await
    }
    .await;
    conclude_created_volume(ctx, &mut volume, outcome, true).await
}

async fn clone_and_resign(
    ctx: &MotionContext,
    template: &Template,
    volume: &mut Volume,
    store: &DataStore,
    host: &Host,
) -> Result<()> {
    volume
        .details
        .insert(details::CLONE_OF_TEMPLATE.to_string(), template.id.clone());
    let created = ctx.provision_volume(volume).await;
    volume.details.remove(details::CLONE_OF_TEMPLATE);
    ctx.repo.save_volume(volume).await?;
    created?;

    if volume.format.is_none() {
        volume.format = Some(template.format);
    }

    match host.hypervisor {
        HypervisorType::XenServer | HypervisorType::VMware => {
            let mut extra = HashMap::new();
            if template.format == ImageFormat::Ova {
                extra.insert(details::TEMPLATE_RESIGN.to_string(), "true".to_string());
                extra.insert(details::VMDK.to_string(), template.unique_name.clone());
            }
            let object = DataObject::Volume(volume.clone());
            let (answer, _) = ctx
                .perform_resignature(&object, store, host, extra, false)
                .await?;
            let path = answer
                .path
                .ok_or_else(|| Error::Agent("重签名应答缺少路径".to_string()))?;
            volume.path = Some(path);
        }
        _ => volume.path = volume.iscsi_name.clone(),
    }
    ctx.repo.save_volume(volume).await
}

pub(super) async fn create_template_from_volume(
    ctx: &MotionContext,
    mut volume: Volume,
    mut template: Template,
    src_store: DataStore,
    dest_store: DataStore,
) -> Result<Option<DataTo>> {
    if !src_store.managed {
        return Err(Error::Unsupported(format!(
            "卷 {} 不在托管存储上，无法生成模板",
            volume.id
        )));
    }
    match volume.format {
        Some(ImageFormat::Qcow2) => {}
        Some(ImageFormat::Raw) if src_store.allows_raw() => {}
        other => {
            return Err(Error::Precondition(format!(
                "卷 {} 的格式 {:?} 不能生成模板 (存储池类型 {:?})",
                volume.id, other, src_store.pool_type
            )))
        }
    }

    let host = ctx
        .hosts
        .select_host(&volume.zone_id, &src_store, HypervisorType::Kvm, false)
        .await?
        .ok_or_else(|| Error::NoHostAvailable(format!("存储池 {} 没有可用的 KVM 主机", src_store.id)))?;

    ctx.fire(&mut volume, ObjectEvent::MigrationRequested).await?;
    if let Err(e) = ctx.fire(&mut template, ObjectEvent::CreateOnlyRequested).await {
        conclude(ctx, &mut volume, false).await;
        return Err(e);
    }

    let mut releases = Releases::default();
    let outcome: Result<()> = async {
        releases.qos(ctx.raise_qos(&volume, &src_store).await?);
        if volume.attached_vm.is_none() || src_store.allows_raw() {
            releases.grant(ctx.grant(&DataObject::Volume(volume.clone()), &host, &src_store).await?);
        }

        let command = CopyCommand {
            src: DataObject::Volume(volume.clone()).to_data_to(&src_store),
            dest: DataObject::Template(template.clone()).to_data_to(&dest_store),
            wait_secs: ctx.settings.primary_storage_download_wait,
            execute_in_sequence: ctx.settings.execute_in_sequence,
            options: volume_details(&volume, &src_store),
            options2: HashMap::new(),
        };
        let answer = ctx
            .gateway
            .send_checked(
                &host,
                &command,
                wait(ctx.settings.primary_storage_download_wait),
                "无法由卷生成模板",
            )
            .await?;

        template.hypervisor = Some(HypervisorType::Kvm);
        if let Some(path) = answer.new_data.and_then(|d| d.path) {
            template.install_path = Some(path);
        }
        ctx.repo.save_template(&template).await
    }
    .await;

    releases.release_all().await;
    conclude(ctx, &mut volume, outcome.is_ok()).await;
    conclude(ctx, &mut template, outcome.is_ok()).await;

    match outcome {
        Ok(()) => {
            info!("✅ 已由卷 {} 生成模板 {}", volume.id, template.id);
            Ok(Some(DataObject::Template(template).to_data_to(&dest_store)))
        }
        Err(e) => {
            error!("由卷 {} 生成模板失败: {}", volume.id, e);
            Err(e)
        }
    }
}

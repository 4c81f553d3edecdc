/// Agent 命令网关
///
/// 把强类型命令发往主机上的 Agent 并解析应答

use async_trait::async_trait;
use common::ws_rpc::{AgentAnswer, AgentCommand, RpcError, RpcMessage};
use common::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::object::Host;

/// 与 Agent 通信的底层通道
#[async_trait]
pub trait AgentTransport: Send + Sync + 'static {
    async fn call(
        &self,
        node_id: &str,
        method: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> std::result::Result<RpcMessage, RpcError>;
}

#[derive(Clone)]
pub struct AgentGateway {
    transport: Arc<dyn AgentTransport>,
}

impl AgentGateway {
    pub fn new(transport: Arc<dyn AgentTransport>) -> Self {
        Self { transport }
    }

    /// 发送命令并返回应答（不检查应答是否成功）
    ///
    /// 主机无连接返回 `NoEndpoint`，超时返回 `AgentTimeout`
    pub async fn send<C: AgentCommand>(
        &self,
        host: &Host,
        command: &C,
        timeout: Duration,
    ) -> Result<C::Answer> {
        let payload = serde_json::to_value(command)?;
        debug!("下发命令 {} 到主机 {}", C::METHOD, host.id);

        let response = self
            .transport
            .call(&host.id, C::METHOD, payload, timeout)
            .await
            .map_err(|e| {
                warn!("命令 {} 发送到主机 {} 失败: {}", C::METHOD, host.id, e);
                Error::from(e)
            })?;

        Ok(response.into_payload::<C::Answer>()?)
    }

    /// 发送命令并要求应答成功
    ///
    /// 失败应答转换为 `Error::Agent`，Agent 没有给出原因时使用 `fallback`
    pub async fn send_checked<C: AgentCommand>(
        &self,
        host: &Host,
        command: &C,
        timeout: Duration,
        fallback: &str,
    ) -> Result<C::Answer> {
        let answer = self.send(host, command, timeout).await?;
        if !answer.success() {
            let details = answer.details();
            let message = if details.is_empty() { fallback } else { details };
            return Err(Error::Agent(message.to_string()));
        }
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::testing::{host, FakeAgent};
    use common::models::{HypervisorType, PowerState};
    use common::ws_rpc::{
        CheckVirtualMachineAnswer, CheckVirtualMachineCommand, MigrateAnswer, MigrateCommand,
    };
    use std::collections::HashMap;

    fn migrate_command() -> MigrateCommand {
        MigrateCommand {
            vm_name: "i-2-10-VM".to_string(),
            dest_ip: "10.0.0.2".to_string(),
            is_windows: false,
            vm: common::ws_rpc::VirtualMachineTo {
                id: "vm-1".to_string(),
                name: "i-2-10-VM".to_string(),
                state: None,
                disks: Vec::new(),
            },
            execute_in_sequence: true,
            wait_secs: 10,
            migrate_storage: HashMap::new(),
            migrate_storage_managed: true,
            migrate_non_shared_inc: false,
            auto_convergence: false,
            new_vm_cpu_shares: None,
        }
    }

    #[tokio::test]
    async fn test_no_endpoint() {
        let agent = Arc::new(FakeAgent::new());
        let gateway = AgentGateway::new(agent);
        let h = host("h1", "c1", HypervisorType::Kvm);

        let err = gateway
            .send(&h, &CheckVirtualMachineCommand { vm_name: "vm".to_string() }, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoEndpoint(_)));
    }

    #[tokio::test]
    async fn test_failed_answer_carries_details() {
        let agent = Arc::new(FakeAgent::new().connect("h1"));
        agent
            .router()
            .register_command(|_cmd: MigrateCommand| async move {
                Ok(MigrateAnswer {
                    success: false,
                    message: "libvirt: unable to connect".to_string(),
                })
            })
            .await;
        let gateway = AgentGateway::new(agent.clone());
        let h = host("h1", "c1", HypervisorType::Kvm);

        // send 不检查 success
        let answer = gateway.send(&h, &migrate_command(), Duration::from_secs(1)).await.unwrap();
        assert!(!answer.success);

        let err = gateway
            .send_checked(&h, &migrate_command(), Duration::from_secs(1), "迁移失败")
            .await
            .unwrap_err();
        match err {
            Error::Agent(detail) => assert_eq!(detail, "libvirt: unable to connect"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(agent.methods(), vec!["migrate", "migrate"]);
    }

    #[tokio::test]
    async fn test_fallback_message() {
        let agent = Arc::new(FakeAgent::new().connect("h1"));
        agent
            .router()
            .register_command(|_cmd: MigrateCommand| async move {
                Ok(MigrateAnswer {
                    success: false,
                    message: String::new(),
                })
            })
            .await;
        let gateway = AgentGateway::new(agent);
        let h = host("h1", "c1", HypervisorType::Kvm);

        let err = gateway
            .send_checked(&h, &migrate_command(), Duration::from_secs(1), "迁移失败")
            .await
            .unwrap_err();
        assert_eq!(err.detail(), "迁移失败");
    }

    #[tokio::test]
    async fn test_successful_answer() {
        let agent = Arc::new(FakeAgent::new().connect("h1"));
        agent
            .router()
            .register_command(|_cmd: CheckVirtualMachineCommand| async move {
                Ok(CheckVirtualMachineAnswer {
                    success: true,
                    message: String::new(),
                    power_state: Some(PowerState::PowerOn),
                })
            })
            .await;
        let gateway = AgentGateway::new(agent);
        let h = host("h1", "c1", HypervisorType::Kvm);

        let answer = gateway
            .send_checked(
                &h,
                &CheckVirtualMachineCommand { vm_name: "vm".to_string() },
                Duration::from_secs(1),
                "检查失败",
            )
            .await
            .unwrap();
        assert_eq!(answer.power_state, Some(PowerState::PowerOn));
    }

    #[tokio::test]
    async fn test_timeout() {
        let agent = Arc::new(FakeAgent::new().connect("h1"));
        agent
            .router()
            .register_command(|_cmd: CheckVirtualMachineCommand| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(CheckVirtualMachineAnswer {
                    success: true,
                    message: String::new(),
                    power_state: None,
                })
            })
            .await;
        let gateway = AgentGateway::new(agent);
        let h = host("h1", "c1", HypervisorType::Kvm);

        let err = gateway
            .send(
                &h,
                &CheckVirtualMachineCommand { vm_name: "vm".to_string() },
                Duration::from_millis(20),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AgentTimeout(_)));
    }
}

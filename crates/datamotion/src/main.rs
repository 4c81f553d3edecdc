/// 存储数据迁移编排器 - Server
///
/// 提供 Agent WebSocket 端点、健康检查和 Prometheus 指标

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use datamotion::app_state::AppState;
use datamotion::config::Config;
use datamotion::db::establish_connection;
use datamotion::motion::cache::InMemoryCacheStorage;
use datamotion::motion::driver::DriverRegistry;
use datamotion::motion::lock::{DbPoolLock, InProcessPoolLock, PoolLock};
use datamotion::motion::repository::{InMemoryRepository, MotionRepository};
use datamotion::motion::{DataMotionService, MotionContext};
use datamotion::ws::{self, AgentConnectionManager};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// 心跳检查间隔（秒）
const HEARTBEAT_CHECK_INTERVAL_SECS: u64 = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载环境变量
    dotenvy::dotenv().ok();

    let cfg = Config::from_env()?;

    // 初始化日志
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.log_level)),
        )
        .init();

    info!("🚀 启动存储数据迁移编排器...");
    info!("✅ 配置加载成功");

    // 配置了数据库时使用跨进程的存储池锁
    let lock: Arc<dyn PoolLock> = match cfg.database_url.as_deref() {
        Some(url) => {
            let db = establish_connection(url).await?;
            info!("✅ 使用数据库存储池锁");
            Arc::new(DbPoolLock::new(db))
        }
        None => {
            info!("✅ 使用进程内存储池锁");
            Arc::new(InProcessPoolLock::new())
        }
    };

    let agent_manager = AgentConnectionManager::new();
    info!("✅ Agent 连接管理器初始化成功");

    let repo: Arc<dyn MotionRepository> = Arc::new(InMemoryRepository::new());
    let ctx = Arc::new(MotionContext::new(
        repo.clone(),
        DriverRegistry::new(),
        Arc::new(agent_manager.clone()),
        lock,
        Arc::new(InMemoryCacheStorage::new()),
        cfg.motion_settings(),
    ));
    let app_state = AppState::new(agent_manager.clone(), DataMotionService::new(ctx), repo);

    agent_manager.start_heartbeat_monitor(cfg.agent_heartbeat_timeout_secs, HEARTBEAT_CHECK_INTERVAL_SECS);
    info!(
        "✅ 心跳监控任务已启动（{}秒超时检测）",
        cfg.agent_heartbeat_timeout_secs
    );

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws/agent", get(ws::handle_agent_websocket))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.server_port));
    info!("🎯 服务器监听在 http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "agents": state.agent_manager.count().await,
    }))
}

async fn metrics_handler() -> String {
    datamotion::metrics::gather()
}

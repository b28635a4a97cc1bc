//! HTTP服务器生命周期管理

use super::{
    middleware::{create_middleware_stack, request_logger},
    routes::create_router,
    AccessTokens, AppState,
};
use crate::commands::cli::ServeArgs;
use axum::middleware;
use moegen_core::api::{AppConfig, BackendService, CliError, EventBus, ServicesFactory};
use moegen_plugins::services::PluginServicesFactory;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

/// HTTP服务器配置
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// CLI 参数优先，其次是配置文件 / 环境变量
pub fn apply_serve_args(cfg: &mut AppConfig, args: &ServeArgs) {
    if let Some(host) = args.host.as_deref().filter(|h| !h.trim().is_empty()) {
        cfg.server.host = host.trim().to_string();
    }
    if let Some(port) = args.port {
        cfg.server.port = port;
    }
    if let Some(dir) = args.data_dir.as_deref().filter(|d| !d.trim().is_empty()) {
        cfg.storage.data_dir = dir.trim().to_string();
    }
}

/// 构建后端服务与共享状态
pub async fn build_state(cfg: AppConfig) -> Result<AppState, CliError> {
    let services = PluginServicesFactory
        .build_services(&cfg)
        .await
        .map_err(CliError::Gen)?;
    let service = BackendService::open(
        &cfg.storage.data_dir,
        EventBus::default(),
        services,
        &cfg.scheduler,
    )
    .await?;

    let tokens = AccessTokens::new(cfg.auth.tokens.iter().cloned());
    if tokens.is_empty() {
        let token = Uuid::new_v4().simple().to_string();
        tokens.insert(token.clone());
        warn!(
            target: "moegen.http",
            "No access tokens configured; generated one for this session: {}",
            token
        );
    }

    let (shutdown_tx, _) = broadcast::channel(1);
    Ok(AppState::new(service, tokens, cfg, shutdown_tx))
}

/// 处理 serve 命令
pub async fn handle_serve(args: ServeArgs, mut cfg: AppConfig) -> Result<(), CliError> {
    apply_serve_args(&mut cfg, &args);
    let config = ServerConfig {
        host: cfg.server.host.clone(),
        port: cfg.server.port,
    };
    let state = build_state(cfg).await?;

    // 启动时清理孤立图片
    match state.service.sweep_orphans().await {
        Ok(removed) => info!(target: "moegen.gc", removed, "Startup orphan sweep finished"),
        Err(e) => warn!(target: "moegen.gc", error = %e, "Startup orphan sweep failed"),
    }

    start_server_with_config(config, state)
        .await
        .map_err(|e: Box<dyn std::error::Error + Send + Sync>| CliError::Server(e.to_string()))
}

/// 使用自定义配置启动HTTP服务器
pub async fn start_server_with_config(
    config: ServerConfig,
    state: AppState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(&addr).await?;
    serve(listener, state).await
}

/// 在已绑定的 listener 上运行，直到收到关闭信号
pub async fn serve(
    listener: TcpListener,
    state: AppState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = create_router(state.clone())
        .layer(middleware::from_fn_with_state(state.clone(), request_logger))
        .layer(create_middleware_stack());

    info!(
        target: "moegen.http",
        "HTTP server listening on http://{}",
        listener.local_addr()?
    );

    let mut shutdown_rx = state.shutdown_tx.subscribe();

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl+C signal");
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                }
                _ = wait_for_sigterm() => {
                    info!("Received SIGTERM signal");
                }
            }

            info!("Starting graceful shutdown...");
        })
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// 等待 SIGTERM 信号（Unix系统）
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await
        }
    }
}

/// Windows 系统不支持 SIGTERM，使用空操作
#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_args_override_config() {
        let mut cfg = AppConfig::default();
        apply_serve_args(
            &mut cfg,
            &ServeArgs {
                host: Some("0.0.0.0".into()),
                port: Some(9000),
                data_dir: Some(" /srv/data ".into()),
            },
        );
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.storage.data_dir, "/srv/data");

        apply_serve_args(&mut cfg, &ServeArgs::default());
        assert_eq!(cfg.server.port, 9000);
    }
}

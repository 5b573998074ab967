// ==========================================
// 血液履约编排核心 - 主入口
// ==========================================
// 启动: 日志 → AppState → 监控/清道夫
// 停止: Ctrl-C → 取消后台任务并等待退出
// ==========================================

use anyhow::Context;
use blood_fulfillment::app::{get_default_db_path, AppState};
use blood_fulfillment::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    tracing::info!("==================================================");
    tracing::info!("{} - 系统版本: {}", blood_fulfillment::APP_NAME, blood_fulfillment::VERSION);
    tracing::info!("==================================================");

    let db_path = get_default_db_path();
    tracing::info!("使用数据库: {}", db_path);

    let state = AppState::new(&db_path).context("无法初始化AppState")?;
    state.start_background_services().await;
    tracing::info!("后台任务已启动，按 Ctrl-C 退出");

    tokio::signal::ctrl_c()
        .await
        .context("监听退出信号失败")?;

    tracing::info!("收到退出信号，正在停止...");
    state.shutdown().await;
    Ok(())
}

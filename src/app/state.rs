// ==========================================
// 血液履约编排核心 - 应用状态
// ==========================================
// 职责: 组装仓储/引擎/API，管理后台任务（监控 + 清道夫）的启停
// 外部协作方（地理、运输、通知、时钟）通过 Collaborators 注入
// ==========================================

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiError, ApiResult, FulfillmentApi};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigManager, FulfillmentConfig};
use crate::engine::{
    AntiWastageReaper, BackgroundService, CascadeEngine, CollegeEscalator, DonorMobilizer,
    EscalationService, FulfillmentMonitor, MobilizationService, RequestLifecycle, RequestLocks,
    ReservationManager, ReservationService, Schedule, SweepJob,
};
use crate::integration::{
    AuditSink, GeoProvider, LocalGeoProvider, LocalTransportScheduler, Notifier,
    ResilientGeoProvider, TracingNotifier, TransportScheduler,
};
use crate::repository::{
    ActionLogRepository, DonorRepository, FacilityRepository, InventoryRepository,
    RepositoryError, RequestRepository,
};

/// 默认数据库文件
const DEFAULT_DB_FILE: &str = "./blood_fulfillment.db";

// ==========================================
// Collaborators - 外部协作方
// ==========================================
pub struct Collaborators {
    /// 外部地理服务；None 时直接使用本地机构注册表
    pub geo: Option<Arc<dyn GeoProvider>>,
    pub transport: Arc<dyn TransportScheduler>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// 单机部署：本地地理 + 本地运输调度
    pub fn local(clock: Arc<dyn Clock>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            geo: None,
            transport: Arc::new(LocalTransportScheduler),
            notifier,
            clock,
        }
    }

    pub fn with_geo(mut self, geo: Arc<dyn GeoProvider>) -> Self {
        self.geo = Some(geo);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn TransportScheduler>) -> Self {
        self.transport = transport;
        self
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self::local(Arc::new(SystemClock::new()), Arc::new(TracingNotifier))
    }
}

// ==========================================
// AppState
// ==========================================

/// 应用状态
///
/// 持有共享连接、全部仓储与引擎实例；后台任务通过
/// `start_background_services` / `shutdown` 显式启停
pub struct AppState {
    pub conn: Arc<Mutex<Connection>>,
    pub config: FulfillmentConfig,
    pub config_manager: Arc<ConfigManager>,
    pub clock: Arc<dyn Clock>,
    pub notifier: Arc<dyn Notifier>,

    // 仓储
    pub request_repo: Arc<RequestRepository>,
    pub inventory_repo: Arc<InventoryRepository>,
    pub donor_repo: Arc<DonorRepository>,
    pub facility_repo: Arc<FacilityRepository>,
    pub action_log_repo: Arc<ActionLogRepository>,

    // 引擎
    pub reservations: Arc<ReservationManager>,
    pub mobilizer: Arc<DonorMobilizer>,
    pub escalator: Arc<CollegeEscalator>,
    pub lifecycle: Arc<RequestLifecycle>,
    pub engine: Arc<CascadeEngine>,
    pub monitor: Arc<FulfillmentMonitor>,
    pub reaper: Arc<AntiWastageReaper>,
    pub locks: Arc<RequestLocks>,

    // API
    pub api: Arc<FulfillmentApi>,

    shutdown: CancellationToken,
    services: tokio::sync::Mutex<Vec<BackgroundService>>,
}

impl AppState {
    /// 打开数据库文件并按 config_kv 中的阈值组装
    pub fn new(db_path: &str) -> ApiResult<Self> {
        tracing::info!("初始化AppState，数据库路径: {}", db_path);

        let conn = Connection::open(db_path)
            .map_err(|e| ApiError::DatabaseConnectionError(format!("无法打开数据库: {}", e)))?;
        let conn = prepare_connection(conn)?;

        let config_manager = ConfigManager::from_connection(conn.clone())?;
        let config = config_manager.load_fulfillment_config()?;
        tracing::info!(
            snapshot = %config_manager.get_config_snapshot().unwrap_or_default(),
            "履约配置已加载"
        );

        Self::assemble(conn, config, Collaborators::default())
    }

    /// 内存数据库（测试 / 仿真）
    pub fn in_memory(config: FulfillmentConfig, collaborators: Collaborators) -> ApiResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ApiError::DatabaseConnectionError(format!("无法打开内存数据库: {}", e)))?;
        Self::with_connection(conn, config, collaborators)
    }

    /// 使用已有连接（显式配置，不读取 config_kv）
    pub fn with_connection(
        conn: Connection,
        config: FulfillmentConfig,
        collaborators: Collaborators,
    ) -> ApiResult<Self> {
        let conn = prepare_connection(conn)?;
        Self::assemble(conn, config, collaborators)
    }

    fn assemble(
        conn: Arc<Mutex<Connection>>,
        config: FulfillmentConfig,
        collaborators: Collaborators,
    ) -> ApiResult<Self> {
        let Collaborators {
            geo,
            transport,
            notifier,
            clock,
        } = collaborators;

        // ==========================================
        // 初始化Repository层
        // ==========================================
        let config_manager = Arc::new(ConfigManager::from_connection(conn.clone())?);
        let request_repo = Arc::new(RequestRepository::new(conn.clone()));
        let inventory_repo = Arc::new(InventoryRepository::new(conn.clone()));
        let donor_repo = Arc::new(DonorRepository::new(conn.clone()));
        let facility_repo = Arc::new(FacilityRepository::new(conn.clone()));
        let action_log_repo = Arc::new(ActionLogRepository::new(conn.clone()));
        let audit: Arc<dyn AuditSink> = action_log_repo.clone();

        // 地理: 外部服务带超时，失败降级到本地注册表 + 直线估算
        let local_geo: Arc<dyn GeoProvider> = Arc::new(LocalGeoProvider::new(
            facility_repo.clone(),
            config.average_speed_kmh,
        ));
        let geo: Arc<dyn GeoProvider> = match geo {
            Some(primary) => Arc::new(ResilientGeoProvider::new(
                primary,
                local_geo,
                config.external_timeout(),
                config.average_speed_kmh,
            )),
            None => local_geo,
        };

        // ==========================================
        // 初始化Engine层
        // ==========================================
        let locks = Arc::new(RequestLocks::new());

        let reservations = Arc::new(ReservationManager::new(
            inventory_repo.clone(),
            request_repo.clone(),
            audit.clone(),
            clock.clone(),
            config.reservation_ttl_minutes,
        ));
        let reservation_service: Arc<dyn ReservationService> = reservations.clone();

        let mobilizer = Arc::new(DonorMobilizer::new(
            donor_repo.clone(),
            request_repo.clone(),
            notifier.clone(),
            audit.clone(),
            clock.clone(),
            config.clone(),
        ));
        let mobilization_service: Arc<dyn MobilizationService> = mobilizer.clone();

        let escalator = Arc::new(CollegeEscalator::new(
            request_repo.clone(),
            facility_repo.clone(),
            geo.clone(),
            mobilization_service.clone(),
            notifier.clone(),
            audit.clone(),
            clock.clone(),
            config.clone(),
        ));
        let escalation_service: Arc<dyn EscalationService> = escalator.clone();

        let lifecycle = Arc::new(RequestLifecycle::new(
            request_repo.clone(),
            reservation_service.clone(),
            mobilization_service.clone(),
            notifier.clone(),
            audit.clone(),
            clock.clone(),
        ));

        let engine = Arc::new(CascadeEngine::new(
            request_repo.clone(),
            facility_repo.clone(),
            geo,
            transport,
            reservation_service.clone(),
            mobilization_service.clone(),
            lifecycle.clone(),
            notifier.clone(),
            audit.clone(),
            clock.clone(),
            locks.clone(),
            config.clone(),
        ));

        let monitor = Arc::new(FulfillmentMonitor::new(
            request_repo.clone(),
            reservation_service.clone(),
            mobilization_service.clone(),
            escalation_service.clone(),
            lifecycle.clone(),
            locks.clone(),
            clock.clone(),
            config.clone(),
        ));

        let reaper = Arc::new(AntiWastageReaper::new(
            inventory_repo.clone(),
            request_repo.clone(),
            facility_repo.clone(),
            notifier.clone(),
            audit.clone(),
            clock.clone(),
            config.clone(),
        ));

        // ==========================================
        // 初始化API层
        // ==========================================
        let api = Arc::new(FulfillmentApi::new(
            engine.clone(),
            lifecycle.clone(),
            mobilization_service,
            escalation_service,
            reservation_service,
            request_repo.clone(),
            donor_repo.clone(),
            inventory_repo.clone(),
            locks.clone(),
            notifier.clone(),
            audit,
            clock.clone(),
            config.clone(),
        ));

        tracing::info!("AppState初始化完成");

        Ok(Self {
            conn,
            config,
            config_manager,
            clock,
            notifier,
            request_repo,
            inventory_repo,
            donor_repo,
            facility_repo,
            action_log_repo,
            reservations,
            mobilizer,
            escalator,
            lifecycle,
            engine,
            monitor,
            reaper,
            locks,
            api,
            shutdown: CancellationToken::new(),
            services: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    // ==========================================
    // 后台任务
    // ==========================================

    /// 启动监控与清道夫（重复调用无效）
    pub async fn start_background_services(&self) {
        let mut services = self.services.lock().await;
        if !services.is_empty() {
            tracing::warn!("后台任务已在运行，忽略重复启动");
            return;
        }

        let monitor: Arc<dyn SweepJob> = self.monitor.clone();
        services.push(BackgroundService::spawn(
            monitor,
            Schedule {
                initial_delay: Duration::ZERO,
                interval: Duration::from_secs(self.config.monitor_interval_secs),
            },
            &self.shutdown,
        ));

        let reaper: Arc<dyn SweepJob> = self.reaper.clone();
        services.push(BackgroundService::spawn(
            reaper,
            Schedule {
                initial_delay: Duration::from_secs(self.config.reaper_start_delay_secs),
                interval: Duration::from_secs(self.config.reaper_interval_secs),
            },
            &self.shutdown,
        ));
    }

    /// 后台任务运行数
    pub async fn running_services(&self) -> usize {
        self.services
            .lock()
            .await
            .iter()
            .filter(|s| s.is_running())
            .count()
    }

    /// 停止所有后台任务并等待退出
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let services: Vec<BackgroundService> = self.services.lock().await.drain(..).collect();
        for service in services {
            service.stop().await;
        }
        tracing::info!("后台任务已全部停止");
    }
}

/// 统一 PRAGMA + 建表（幂等）
fn prepare_connection(conn: Connection) -> ApiResult<Arc<Mutex<Connection>>> {
    crate::db::configure_sqlite_connection(&conn).map_err(RepositoryError::from)?;
    crate::db::init_schema(&conn).map_err(RepositoryError::from)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// 获取默认数据库路径
///
/// 优先读取环境变量 BLOOD_FULFILLMENT_DB
pub fn get_default_db_path() -> String {
    match std::env::var("BLOOD_FULFILLMENT_DB") {
        Ok(path) if !path.trim().is_empty() => path.trim().to_string(),
        _ => DEFAULT_DB_FILE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::integration::RecordingNotifier;
    use chrono::{TimeZone, Utc};

    fn state() -> AppState {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap()));
        AppState::in_memory(
            FulfillmentConfig::default(),
            Collaborators::local(clock, Arc::new(RecordingNotifier::new())),
        )
        .unwrap()
    }

    #[test]
    fn test_get_default_db_path() {
        let path = get_default_db_path();
        assert!(!path.is_empty());
    }

    #[test]
    fn test_in_memory_state_has_schema() {
        let state = state();
        assert!(state.request_repo.find_by_id("missing").unwrap().is_none());
        assert!(state.locks.is_empty());
    }

    #[tokio::test]
    async fn test_background_services_start_once_and_stop() {
        let state = state();
        state.start_background_services().await;
        state.start_background_services().await;
        assert_eq!(state.running_services().await, 2);

        state.shutdown().await;
        assert_eq!(state.running_services().await, 0);
    }
}

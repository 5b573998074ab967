// ==========================================
// 血液履约编排核心 - 数据仓储层
// ==========================================
// 红线: Repository 不含业务逻辑
// ==========================================
// 职责: 提供数据访问接口,屏蔽数据库细节
// 约束: 所有查询使用参数化,状态变更使用 CAS
// ==========================================

pub mod action_log_repo;
pub mod donor_repo;
pub mod error;
pub mod facility_repo;
pub mod inventory_repo;
pub mod request_repo;
pub(crate) mod row_mapping;

// 重导出核心仓储
pub use action_log_repo::ActionLogRepository;
pub use donor_repo::DonorRepository;
pub use error::{RepositoryError, RepositoryResult};
pub use facility_repo::FacilityRepository;
pub use inventory_repo::{InventoryRepository, ReservationStep};
pub use request_repo::{DeliveryRecord, RequestRepository};

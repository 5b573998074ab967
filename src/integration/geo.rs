// ==========================================
// 血液履约编排核心 - 地理/ETA 接口
// ==========================================
// 职责: 附近机构检索 + 行程时间矩阵
// 降级: 外部服务超时/失败 → 直线距离 ÷ 平均车速
// ==========================================

use crate::domain::facility::{College, Facility};
use crate::domain::request::GeoPoint;
use crate::domain::types::FacilityKind;
use crate::integration::error::{IntegrationError, IntegrationResult};
use crate::repository::FacilityRepository;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// 附近地点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyPlace {
    pub id: String,
    pub location: GeoPoint,
    pub distance_km: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TravelStatus {
    Ok,
    /// 本地估算（非路网结果）
    Estimated,
    Unreachable,
}

/// 单个目的地的行程估计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TravelEstimate {
    pub destination_id: String,
    pub distance_meters: f64,
    pub duration_seconds: u64,
    pub status: TravelStatus,
}

impl TravelEstimate {
    /// 向上取整的分钟数，超出 u32 时饱和
    pub fn eta_minutes(&self) -> u32 {
        u32::try_from(self.duration_seconds.div_ceil(60)).unwrap_or(u32::MAX)
    }
}

#[async_trait]
pub trait GeoProvider: Send + Sync {
    async fn find_nearby(
        &self,
        origin: GeoPoint,
        kind: FacilityKind,
        radius_km: f64,
    ) -> IntegrationResult<Vec<NearbyPlace>>;

    /// 返回顺序与 destinations 一致
    async fn travel_time(
        &self,
        origin: GeoPoint,
        destinations: &[NearbyPlace],
    ) -> IntegrationResult<Vec<TravelEstimate>>;
}

/// 直线距离估算行程
pub fn estimate_travel(
    origin: GeoPoint,
    destination: &NearbyPlace,
    average_speed_kmh: f64,
) -> TravelEstimate {
    let distance_km = origin.distance_km(&destination.location);
    let speed = if average_speed_kmh > 0.0 { average_speed_kmh } else { 40.0 };
    TravelEstimate {
        destination_id: destination.id.clone(),
        distance_meters: distance_km * 1000.0,
        duration_seconds: (distance_km / speed * 3600.0).ceil() as u64,
        status: TravelStatus::Estimated,
    }
}

// ==========================================
// LocalGeoProvider - 基于本地机构注册表
// ==========================================
pub struct LocalGeoProvider {
    facility_repo: Arc<FacilityRepository>,
    average_speed_kmh: f64,
}

impl LocalGeoProvider {
    pub fn new(facility_repo: Arc<FacilityRepository>, average_speed_kmh: f64) -> Self {
        Self {
            facility_repo,
            average_speed_kmh,
        }
    }

    fn unavailable(e: impl std::fmt::Display) -> IntegrationError {
        IntegrationError::Unavailable {
            service: "local_registry".to_string(),
            message: e.to_string(),
        }
    }
}

fn within_radius<'a>(
    origin: GeoPoint,
    radius_km: f64,
    points: impl Iterator<Item = (&'a str, GeoPoint)>,
) -> Vec<NearbyPlace> {
    let mut places: Vec<NearbyPlace> = points
        .map(|(id, location)| NearbyPlace {
            id: id.to_string(),
            location,
            distance_km: origin.distance_km(&location),
        })
        .filter(|p| p.distance_km <= radius_km)
        .collect();
    places.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
    places
}

#[async_trait]
impl GeoProvider for LocalGeoProvider {
    async fn find_nearby(
        &self,
        origin: GeoPoint,
        kind: FacilityKind,
        radius_km: f64,
    ) -> IntegrationResult<Vec<NearbyPlace>> {
        let places = match kind {
            FacilityKind::College => {
                let colleges: Vec<College> = self
                    .facility_repo
                    .list_active_colleges()
                    .map_err(Self::unavailable)?;
                within_radius(
                    origin,
                    radius_km,
                    colleges.iter().map(|c| (c.college_id.as_str(), c.location)),
                )
            }
            kind => {
                let facilities: Vec<Facility> = self
                    .facility_repo
                    .list_active_by_kind(kind)
                    .map_err(Self::unavailable)?;
                within_radius(
                    origin,
                    radius_km,
                    facilities.iter().map(|f| (f.facility_id.as_str(), f.location)),
                )
            }
        };
        Ok(places)
    }

    async fn travel_time(
        &self,
        origin: GeoPoint,
        destinations: &[NearbyPlace],
    ) -> IntegrationResult<Vec<TravelEstimate>> {
        Ok(destinations
            .iter()
            .map(|d| estimate_travel(origin, d, self.average_speed_kmh))
            .collect())
    }
}

// ==========================================
// ResilientGeoProvider - 超时 + 降级
// ==========================================
pub struct ResilientGeoProvider {
    primary: Arc<dyn GeoProvider>,
    fallback: Arc<dyn GeoProvider>,
    timeout: Duration,
    average_speed_kmh: f64,
}

impl ResilientGeoProvider {
    pub fn new(
        primary: Arc<dyn GeoProvider>,
        fallback: Arc<dyn GeoProvider>,
        timeout: Duration,
        average_speed_kmh: f64,
    ) -> Self {
        Self {
            primary,
            fallback,
            timeout,
            average_speed_kmh,
        }
    }

    async fn guarded<T, F>(&self, op: &'static str, fut: F) -> IntegrationResult<T>
    where
        F: std::future::Future<Output = IntegrationResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(IntegrationError::Timeout {
                service: op.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

#[async_trait]
impl GeoProvider for ResilientGeoProvider {
    async fn find_nearby(
        &self,
        origin: GeoPoint,
        kind: FacilityKind,
        radius_km: f64,
    ) -> IntegrationResult<Vec<NearbyPlace>> {
        let primary = self.primary.find_nearby(origin, kind, radius_km);
        match self.guarded("geo.find_nearby", primary).await {
            Ok(places) => Ok(places),
            Err(e) => {
                tracing::warn!(
                    kind = kind.as_str(),
                    radius_km,
                    error = %e,
                    "附近机构检索失败，降级为本地注册表"
                );
                self.fallback.find_nearby(origin, kind, radius_km).await
            }
        }
    }

    async fn travel_time(
        &self,
        origin: GeoPoint,
        destinations: &[NearbyPlace],
    ) -> IntegrationResult<Vec<TravelEstimate>> {
        let primary = self.primary.travel_time(origin, destinations);
        let estimates = match self.guarded("geo.travel_time", primary).await {
            Ok(estimates) if estimates.len() == destinations.len() => estimates,
            Ok(estimates) => {
                tracing::warn!(
                    expected = destinations.len(),
                    actual = estimates.len(),
                    "行程矩阵条目数不匹配，降级为直线估算"
                );
                return Ok(self.haversine_all(origin, destinations));
            }
            Err(e) => {
                tracing::warn!(
                    destinations = destinations.len(),
                    error = %e,
                    "行程时间查询失败，降级为直线估算"
                );
                return Ok(self.haversine_all(origin, destinations));
            }
        };

        // 单条不可达时按直线估算补齐
        Ok(estimates
            .into_iter()
            .zip(destinations)
            .map(|(estimate, dest)| match estimate.status {
                TravelStatus::Unreachable => estimate_travel(origin, dest, self.average_speed_kmh),
                _ => estimate,
            })
            .collect())
    }
}

impl ResilientGeoProvider {
    fn haversine_all(&self, origin: GeoPoint, destinations: &[NearbyPlace]) -> Vec<TravelEstimate> {
        destinations
            .iter()
            .map(|d| estimate_travel(origin, d, self.average_speed_kmh))
            .collect()
    }
}
